// Smoldot
// Copyright (C) 2023  Pierre Krieger
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Tracking of the blocks pinned by a `chainHead_v1_follow` subscription.
//!
//! A `chainHead_v1_follow` subscription reports the tree of blocks known to the server through
//! an ordered stream of events. Every block reported by the server is *pinned*, meaning that the
//! server keeps it in memory and allows the client to query its body, storage or runtime, until
//! the client unpins it.
//!
//! The [`PinnedBlocks`] struct is the state machine that applies these events. It maintains the
//! list of pinned blocks, the current best and finalized blocks, and decides which blocks must be
//! unpinned. It verifies that the server respects the protocol: a block can only be referenced
//! as best or finalized after it has been reported, the finalized block only ever moves towards
//! descendants of the previous finalized block, and the finalized block is always an ancestor of
//! or equal to the best block. Any violation is reported as a [`ProtocolError`], after which the
//! state can't be trusted anymore and the subscription must be re-created.
//!
//! In order to make sure that a block isn't unpinned while a query is in progress against it,
//! each block counts the operations in progress against it. See
//! [`PinnedBlocks::operation_started`] and [`PinnedBlocks::operation_finished`]. Unpinning a
//! block that has operations in progress is deferred until the last of them finishes.
//!
//! The [`operations`] module tracks the operations themselves.
//!
//! # Usage
//!
//! The state machine starts uninitialized. Call [`PinnedBlocks::initialize`] when the
//! `initialized` event is received, then the other methods for the other events. Each method
//! returns an [`Outcome`] containing the events to report to the user of the client and the
//! list of blocks for which a `chainHead_v1_unpin` request must be sent. Once such a request has
//! succeeded, call [`PinnedBlocks::unpin_confirmed`].
//!
//! When the subscription is stopped or re-created, call [`PinnedBlocks::reset`]. The last best
//! and finalized blocks reported to the user are remembered across resets, so that a new
//! `initialized` event only generates events if the chain has progressed in the meantime.

use crate::informant::HashDisplay;

use alloc::{collections::VecDeque, vec::Vec};

pub mod operations;

mod tests;

/// Configuration for a new [`PinnedBlocks`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of finalized blocks, including the current finalized block, that stay pinned.
    /// Older finalized blocks are unpinned.
    ///
    /// A value of 0 is treated like 1, as the current finalized block is never unpinned.
    pub finalized_blocks_retention: usize,

    /// Number of blocks to pre-allocate space for.
    pub blocks_capacity: usize,
}

/// Block pinned by the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedBlock<TRt> {
    /// Hash of the block.
    pub hash: [u8; 32],
    /// Height of the block.
    pub number: u64,
    /// Hash of the parent of the block. `None` for the oldest block of the `initialized` event,
    /// whose parent is unknown.
    pub parent_hash: Option<[u8; 32]>,
    /// Runtime of the block. Reported by the event that has pinned the block, or inherited from
    /// the parent block.
    pub runtime: Option<TRt>,
}

/// Event to report to the user of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent<TRt> {
    /// A new block has been pinned.
    NewBlock(PinnedBlock<TRt>),
    /// The best block has changed.
    BestBlock(PinnedBlock<TRt>),
    /// The new best block isn't a descendant of the previous best block. Always reported after
    /// the corresponding [`BlockEvent::BestBlock`].
    BestChainChanged(PinnedBlock<TRt>),
    /// A block has been finalized.
    FinalizedBlock(PinnedBlock<TRt>),
}

impl<TRt> BlockEvent<TRt> {
    /// Returns the block the event relates to.
    pub fn block(&self) -> &PinnedBlock<TRt> {
        match self {
            BlockEvent::NewBlock(b)
            | BlockEvent::BestBlock(b)
            | BlockEvent::BestChainChanged(b)
            | BlockEvent::FinalizedBlock(b) => b,
        }
    }
}

/// Output of the methods of [`PinnedBlocks`] that apply an event.
#[derive(Debug)]
pub struct Outcome<TRt> {
    /// Events to report, in order.
    pub events: Vec<BlockEvent<TRt>>,
    /// Blocks for which a `chainHead_v1_unpin` request must be sent.
    pub unpin: Vec<[u8; 32]>,
}

impl<TRt> Outcome<TRt> {
    fn empty() -> Self {
        Outcome {
            events: Vec::new(),
            unpin: Vec::new(),
        }
    }
}

/// See [the module-level documentation](..).
pub struct PinnedBlocks<TRt> {
    /// All the pinned blocks, including the ones being unpinned.
    blocks: hashbrown::HashMap<[u8; 32], BlockEntry<TRt>, fnv::FnvBuildHasher>,

    /// `None` if the state machine isn't initialized.
    pointers: Option<Pointers>,

    /// Finalized blocks that are still pinned, from the oldest to the newest. The last entry is
    /// the current finalized block.
    finalized_chain: VecDeque<[u8; 32]>,

    /// See [`Config::finalized_blocks_retention`].
    finalized_blocks_retention: usize,

    /// Last best block reported through [`BlockEvent::BestBlock`]. Preserved across resets.
    last_reported_best: Option<[u8; 32]>,

    /// Hash and number of the last finalized block reported through
    /// [`BlockEvent::FinalizedBlock`]. Preserved across resets.
    last_reported_finalized: Option<([u8; 32], u64)>,
}

#[derive(Debug, Copy, Clone)]
struct Pointers {
    best: [u8; 32],
    finalized: [u8; 32],
}

struct BlockEntry<TRt> {
    block: PinnedBlock<TRt>,
    /// Number of operations in progress against this block.
    pending_operations: usize,
    unpin: UnpinState,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum UnpinState {
    /// Block is pinned and can be queried.
    Pinned,
    /// Block must be unpinned once its operations are finished.
    Deferred,
    /// A `chainHead_v1_unpin` request has been or must be sent.
    InProgress,
}

impl<TRt: Clone> PinnedBlocks<TRt> {
    /// Creates a new uninitialized state machine.
    pub fn new(config: Config) -> Self {
        PinnedBlocks {
            blocks: hashbrown::HashMap::with_capacity_and_hasher(
                config.blocks_capacity,
                Default::default(),
            ),
            pointers: None,
            finalized_chain: VecDeque::new(),
            finalized_blocks_retention: config.finalized_blocks_retention.max(1),
            last_reported_best: None,
            last_reported_finalized: None,
        }
    }

    /// Returns `true` if [`PinnedBlocks::initialize`] has been called since the creation or the
    /// last reset.
    pub fn is_initialized(&self) -> bool {
        self.pointers.is_some()
    }

    /// Applies an `initialized` event.
    ///
    /// `finalized_hashes` are the hashes reported by the event, from the oldest to the newest.
    /// `newest_number` and `newest_parent_hash` are found in the header of the newest block.
    ///
    /// After a [`PinnedBlocks::reset`], a [`BlockEvent::FinalizedBlock`] is generated for each
    /// of the hashes that is more recent than the last reported finalized block.
    pub fn initialize(
        &mut self,
        finalized_hashes: &[[u8; 32]],
        newest_number: u64,
        newest_parent_hash: [u8; 32],
        runtime: Option<TRt>,
    ) -> Result<Outcome<TRt>, ProtocolError> {
        if self.pointers.is_some() {
            return Err(ProtocolError::AlreadyInitialized);
        }

        let Some((newest, older)) = finalized_hashes.split_last() else {
            return Err(ProtocolError::EmptyInitialized);
        };

        let Some(oldest_number) = newest_number.checked_sub(older.len() as u64) else {
            return Err(ProtocolError::InconsistentInitialized);
        };
        if older.last().map_or(false, |parent| *parent != newest_parent_hash) {
            return Err(ProtocolError::InconsistentInitialized);
        }

        for (index, hash) in finalized_hashes.iter().enumerate() {
            let is_newest = index == older.len();
            let parent_hash = if is_newest {
                Some(newest_parent_hash)
            } else if index == 0 {
                None
            } else {
                Some(finalized_hashes[index - 1])
            };

            let entry = BlockEntry {
                block: PinnedBlock {
                    hash: *hash,
                    number: oldest_number + index as u64,
                    parent_hash,
                    runtime: if is_newest { runtime.clone() } else { None },
                },
                pending_operations: 0,
                unpin: UnpinState::Pinned,
            };

            if self.blocks.insert(*hash, entry).is_some() {
                self.blocks.clear();
                return Err(ProtocolError::DuplicateBlock(*hash));
            }
        }

        self.pointers = Some(Pointers {
            best: *newest,
            finalized: *newest,
        });
        self.finalized_chain = finalized_hashes.iter().copied().collect();

        let mut outcome = Outcome::empty();
        let newest_block = self.blocks[newest].block.clone();
        if self.last_reported_best != Some(*newest) {
            self.last_reported_best = Some(*newest);
            outcome
                .events
                .push(BlockEvent::BestBlock(newest_block.clone()));
        }

        // After a reset, the listed blocks that are more recent than the last reported finalized
        // block have been finalized in the meantime. They are reported from the oldest to the
        // newest.
        let first_newly_finalized = match self.last_reported_finalized {
            None => older.len(),
            Some((hash, number)) => match finalized_hashes.iter().position(|h| *h == hash) {
                Some(position) => position + 1,
                None => usize::try_from(
                    number.saturating_add(1).saturating_sub(oldest_number),
                )
                .unwrap_or(usize::MAX)
                .min(older.len()),
            },
        };
        for hash in &finalized_hashes[first_newly_finalized..] {
            outcome
                .events
                .push(BlockEvent::FinalizedBlock(self.blocks[hash].block.clone()));
        }
        self.last_reported_finalized = Some((*newest, newest_block.number));

        self.apply_retention(&mut outcome.unpin);
        Ok(outcome)
    }

    /// Applies a `newBlock` event.
    pub fn new_block(
        &mut self,
        hash: [u8; 32],
        parent_hash: [u8; 32],
        new_runtime: Option<TRt>,
    ) -> Result<Outcome<TRt>, ProtocolError> {
        if self.pointers.is_none() {
            return Err(ProtocolError::NotInitialized);
        }

        if self.blocks.contains_key(&hash) {
            return Err(ProtocolError::DuplicateBlock(hash));
        }

        let Some(parent) = self.blocks.get(&parent_hash) else {
            return Err(ProtocolError::UnknownParent {
                block: hash,
                parent: parent_hash,
            });
        };

        let block = PinnedBlock {
            hash,
            number: parent.block.number + 1,
            parent_hash: Some(parent_hash),
            runtime: new_runtime.or_else(|| parent.block.runtime.clone()),
        };

        self.blocks.insert(
            hash,
            BlockEntry {
                block: block.clone(),
                pending_operations: 0,
                unpin: UnpinState::Pinned,
            },
        );

        let mut outcome = Outcome::empty();
        outcome.events.push(BlockEvent::NewBlock(block));
        Ok(outcome)
    }

    /// Applies a `bestBlockChanged` event.
    pub fn best_block_changed(&mut self, hash: [u8; 32]) -> Result<Outcome<TRt>, ProtocolError> {
        let Some(pointers) = self.pointers else {
            return Err(ProtocolError::NotInitialized);
        };

        if !self.is_usable(&hash) {
            return Err(ProtocolError::UnknownBlock(hash));
        }

        if hash == pointers.best {
            return Ok(Outcome::empty());
        }

        if hash != pointers.finalized && !self.is_strict_descendant(&hash, &pointers.finalized) {
            return Err(ProtocolError::BestBlockNotDescendantOfFinalized(hash));
        }

        let chain_changed = !self.is_strict_descendant(&hash, &pointers.best);
        self.pointers = Some(Pointers {
            best: hash,
            ..pointers
        });
        self.last_reported_best = Some(hash);

        let block = self.blocks[&hash].block.clone();
        let mut outcome = Outcome::empty();
        outcome.events.push(BlockEvent::BestBlock(block.clone()));
        if chain_changed {
            outcome.events.push(BlockEvent::BestChainChanged(block));
        }
        Ok(outcome)
    }

    /// Applies a `finalized` event.
    ///
    /// `finalized_hashes` must be ordered from the oldest to the newest.
    pub fn finalized(
        &mut self,
        finalized_hashes: &[[u8; 32]],
        pruned_hashes: &[[u8; 32]],
    ) -> Result<Outcome<TRt>, ProtocolError> {
        let Some(mut pointers) = self.pointers else {
            return Err(ProtocolError::NotInitialized);
        };

        let mut outcome = Outcome::empty();

        for hash in finalized_hashes {
            if !self.is_usable(hash) {
                return Err(ProtocolError::UnknownBlock(*hash));
            }
            if !self.is_strict_descendant(hash, &pointers.finalized) {
                return Err(ProtocolError::FinalizedNotDescendant(*hash));
            }

            pointers.finalized = *hash;
            self.pointers = Some(pointers);
            self.finalized_chain.push_back(*hash);
            self.last_reported_finalized = Some((*hash, self.blocks[hash].block.number));
            outcome
                .events
                .push(BlockEvent::FinalizedBlock(self.blocks[hash].block.clone()));
        }

        for hash in pruned_hashes {
            if *hash == pointers.best || *hash == pointers.finalized {
                return Err(ProtocolError::PrunedBlockInUse(*hash));
            }
            if !self.blocks.contains_key(hash) {
                return Err(ProtocolError::UnknownBlock(*hash));
            }
            self.request_unpin(hash, &mut outcome.unpin);
        }

        if pointers.best != pointers.finalized
            && !self.is_strict_descendant(&pointers.best, &pointers.finalized)
        {
            return Err(ProtocolError::BestBlockNotDescendantOfFinalized(
                pointers.best,
            ));
        }

        self.apply_retention(&mut outcome.unpin);
        Ok(outcome)
    }

    /// Requests a block to be unpinned. The current best and finalized blocks can't be unpinned.
    ///
    /// Returns `true` if a `chainHead_v1_unpin` request must be sent now. Returns `false` if the
    /// unpinning is deferred until the operations in progress against this block are finished,
    /// or if the block is already being unpinned.
    pub fn unpin(&mut self, hash: &[u8; 32]) -> Result<bool, UnpinError> {
        let pointers = self.pointers.ok_or(UnpinError::UnknownBlock)?;
        if !self.blocks.contains_key(hash) {
            return Err(UnpinError::UnknownBlock);
        }
        if *hash == pointers.best || *hash == pointers.finalized {
            return Err(UnpinError::BestOrFinalized);
        }

        let mut unpin = Vec::new();
        self.request_unpin(hash, &mut unpin);
        self.finalized_chain.retain(|h| h != hash);
        Ok(!unpin.is_empty())
    }

    /// Must be called after a `chainHead_v1_unpin` request for the given block has succeeded.
    /// Removes the block from the state machine.
    ///
    /// Returns `false` if the block wasn't being unpinned, in which case nothing happens.
    pub fn unpin_confirmed(&mut self, hash: &[u8; 32]) -> bool {
        match self.blocks.get(hash) {
            Some(entry) if entry.unpin == UnpinState::InProgress => {
                self.blocks.remove(hash);
                true
            }
            _ => false,
        }
    }

    /// Registers the start of an operation against the given block.
    ///
    /// Fails if the block isn't pinned or is being unpinned.
    pub fn operation_started(&mut self, hash: &[u8; 32]) -> Result<(), BlockNotAvailable> {
        match self.blocks.get_mut(hash) {
            Some(entry) if entry.unpin == UnpinState::Pinned => {
                entry.pending_operations += 1;
                Ok(())
            }
            _ => Err(BlockNotAvailable(*hash)),
        }
    }

    /// Registers the end of an operation against the given block.
    ///
    /// Returns `true` if the block had a deferred unpinning and a `chainHead_v1_unpin` request
    /// must now be sent.
    pub fn operation_finished(&mut self, hash: &[u8; 32]) -> bool {
        let Some(entry) = self.blocks.get_mut(hash) else {
            return false;
        };

        debug_assert!(entry.pending_operations > 0);
        entry.pending_operations = entry.pending_operations.saturating_sub(1);
        if entry.pending_operations == 0 && entry.unpin == UnpinState::Deferred {
            entry.unpin = UnpinState::InProgress;
            true
        } else {
            false
        }
    }

    /// Returns the number of operations in progress against the given block.
    pub fn pending_operations(&self, hash: &[u8; 32]) -> Option<usize> {
        self.blocks.get(hash).map(|e| e.pending_operations)
    }

    /// Puts the state machine back to the uninitialized state and forgets all the blocks.
    ///
    /// Returns the number of blocks that were pinned.
    pub fn reset(&mut self) -> usize {
        let num_blocks = self.blocks.len();
        self.blocks.clear();
        self.pointers = None;
        self.finalized_chain.clear();
        num_blocks
    }

    /// Returns the current best block. `None` if not initialized.
    pub fn best_block(&self) -> Option<&PinnedBlock<TRt>> {
        let pointers = self.pointers.as_ref()?;
        Some(&self.blocks[&pointers.best].block)
    }

    /// Returns the current finalized block. `None` if not initialized.
    pub fn finalized_block(&self) -> Option<&PinnedBlock<TRt>> {
        let pointers = self.pointers.as_ref()?;
        Some(&self.blocks[&pointers.finalized].block)
    }

    /// Returns a block, if it is pinned and not being unpinned.
    pub fn block(&self, hash: &[u8; 32]) -> Option<&PinnedBlock<TRt>> {
        self.blocks
            .get(hash)
            .filter(|e| e.unpin == UnpinState::Pinned)
            .map(|e| &e.block)
    }

    /// Returns the list of blocks that are pinned and not being unpinned, in no specific order.
    pub fn iter(&self) -> impl Iterator<Item = &PinnedBlock<TRt>> {
        self.blocks
            .values()
            .filter(|e| e.unpin == UnpinState::Pinned)
            .map(|e| &e.block)
    }

    /// Returns the number of blocks in the state machine, including the ones being unpinned.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if there isn't any block in the state machine.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the last best block that has been reported through [`BlockEvent::BestBlock`],
    /// including before the last reset.
    pub fn last_reported_best(&self) -> Option<&[u8; 32]> {
        self.last_reported_best.as_ref()
    }

    fn is_usable(&self, hash: &[u8; 32]) -> bool {
        self.blocks
            .get(hash)
            .map_or(false, |e| e.unpin == UnpinState::Pinned)
    }

    /// Returns `true` if `block` is a strict descendant of `ancestor`, by walking the parents of
    /// `block` through the pinned blocks.
    fn is_strict_descendant(&self, block: &[u8; 32], ancestor: &[u8; 32]) -> bool {
        let Some(ancestor_number) = self.blocks.get(ancestor).map(|e| e.block.number) else {
            return false;
        };

        let mut current = *block;
        loop {
            let Some(entry) = self.blocks.get(&current) else {
                return false;
            };
            if entry.block.number <= ancestor_number {
                return false;
            }
            match entry.block.parent_hash {
                Some(parent) if parent == *ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn request_unpin(&mut self, hash: &[u8; 32], out: &mut Vec<[u8; 32]>) {
        let Some(entry) = self.blocks.get_mut(hash) else {
            return;
        };
        if entry.unpin != UnpinState::Pinned {
            return;
        }

        if entry.pending_operations == 0 {
            entry.unpin = UnpinState::InProgress;
            out.push(*hash);
        } else {
            entry.unpin = UnpinState::Deferred;
        }
    }

    fn apply_retention(&mut self, out: &mut Vec<[u8; 32]>) {
        while self.finalized_chain.len() > self.finalized_blocks_retention {
            let Some(old) = self.finalized_chain.pop_front() else {
                break;
            };
            self.request_unpin(&old, out);
        }
    }
}

/// Violation of the `chainHead_v1_follow` protocol by the server.
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Event received before the `initialized` event.
    #[display("Event received before initialization")]
    NotInitialized,
    /// Multiple `initialized` events received.
    #[display("Duplicate initialized event")]
    AlreadyInitialized,
    /// The `initialized` event doesn't contain any block.
    #[display("Initialized event without any block")]
    EmptyInitialized,
    /// The header of the newest finalized block doesn't match the `initialized` event.
    #[display("Initialized event inconsistent with the header of the finalized block")]
    InconsistentInitialized,
    /// A block has been reported twice.
    #[display("Block {} reported twice", HashDisplay(_0))]
    DuplicateBlock(#[error(not(source))] [u8; 32]),
    /// A new block has a parent that isn't pinned.
    #[display("Parent {} of block {} isn't pinned", HashDisplay(parent), HashDisplay(block))]
    UnknownParent { block: [u8; 32], parent: [u8; 32] },
    /// An event references a block that isn't pinned or that has been pruned.
    #[display("Block {} isn't pinned", HashDisplay(_0))]
    UnknownBlock(#[error(not(source))] [u8; 32]),
    /// A newly-finalized block isn't a descendant of the previous finalized block.
    #[display("Finalized block {} isn't a descendant of the previous finalized block", HashDisplay(_0))]
    FinalizedNotDescendant(#[error(not(source))] [u8; 32]),
    /// The best block isn't a descendant of the finalized block.
    #[display("Best block {} isn't a descendant of the finalized block", HashDisplay(_0))]
    BestBlockNotDescendantOfFinalized(#[error(not(source))] [u8; 32]),
    /// The current best or finalized block has been pruned.
    #[display("Current best or finalized block {} has been pruned", HashDisplay(_0))]
    PrunedBlockInUse(#[error(not(source))] [u8; 32]),
}

/// Error potentially returned by [`PinnedBlocks::unpin`].
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
pub enum UnpinError {
    /// Block isn't pinned.
    #[display("Block isn't pinned")]
    UnknownBlock,
    /// The current best and finalized blocks can't be unpinned.
    #[display("Can't unpin the current best or finalized block")]
    BestOrFinalized,
}

/// Error returned by [`PinnedBlocks::operation_started`].
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
#[display("Block {} isn't available", HashDisplay(_0))]
pub struct BlockNotAvailable(#[error(not(source))] pub [u8; 32]);
