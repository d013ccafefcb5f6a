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

//! Status of a transaction that has been broadcast.
//!
//! The [`TransactionWatch`] state machine is fed with the bodies of the blocks that become the
//! new best block or that get finalized, and reports the status changes of the transaction.
//!
//! The statuses are reported in a fixed order: a transaction is always reported as included in
//! the best chain before being reported as finalized. If a transaction is found for the first
//! time in a finalized block, both statuses are reported at once, in that order. Inclusion in the
//! best chain is reported at most once, even if the best chain later changes.
//!
//! # Example
//!
//! ```
//! use chain_head::transactions::watch::{Status, TransactionWatch};
//!
//! let transaction = vec![0x10, 1, 2, 3, 4];
//! let mut watch = TransactionWatch::new(&transaction);
//!
//! let body = vec![vec![0x04, 9], transaction.clone()];
//! let statuses = watch.finalized_block_body([1; 32], body.iter());
//! assert!(matches!(statuses[0], Status::BestChainBlockIncluded(_)));
//! assert!(matches!(statuses[1], Status::Finalized(_)));
//! assert!(watch.is_finished());
//! ```

use crate::util;

use alloc::vec::Vec;

/// Where a transaction has been found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    /// Hash of the block containing the transaction.
    pub block_hash: [u8; 32],
    /// Index of the transaction within the body of the block.
    pub index: u32,
}

/// Status change of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// The transaction has been found in a block of the best chain.
    BestChainBlockIncluded(Inclusion),
    /// The transaction has been found in a finalized block. This is the last status.
    Finalized(Inclusion),
}

/// State machine tracking a single transaction.
#[derive(Debug, Clone)]
pub struct TransactionWatch {
    hash: [u8; 32],
    reported_best_chain: bool,
    finished: bool,
}

impl TransactionWatch {
    /// Initializes a new watch for the given SCALE-encoded transaction.
    pub fn new(scale_encoded_transaction: &[u8]) -> Self {
        TransactionWatch {
            hash: util::blake2_256(scale_encoded_transaction),
            reported_best_chain: false,
            finished: false,
        }
    }

    /// Returns the hash of the transaction.
    pub fn transaction_hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Returns `true` if the transaction has been reported as finalized. No further status is
    /// reported afterwards.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the index of the transaction within the given block body, if any.
    pub fn find_in_body(
        &self,
        body: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Option<u32> {
        body.into_iter()
            .position(|extrinsic| util::blake2_256(extrinsic.as_ref()) == self.hash)
            .and_then(|index| u32::try_from(index).ok())
    }

    /// Injects the body of a block that has become the new best block.
    ///
    /// Returns [`Status::BestChainBlockIncluded`] the first time the transaction is found.
    pub fn best_block_body(
        &mut self,
        block_hash: [u8; 32],
        body: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Option<Status> {
        if self.finished || self.reported_best_chain {
            return None;
        }

        let index = self.find_in_body(body)?;
        self.reported_best_chain = true;
        Some(Status::BestChainBlockIncluded(Inclusion { block_hash, index }))
    }

    /// Injects the body of a block that has been finalized.
    ///
    /// Returns the list of statuses to report, in order. This list is empty if the transaction
    /// isn't in the block.
    pub fn finalized_block_body(
        &mut self,
        block_hash: [u8; 32],
        body: impl IntoIterator<Item = impl AsRef<[u8]>>,
    ) -> Vec<Status> {
        if self.finished {
            return Vec::new();
        }

        let Some(index) = self.find_in_body(body) else {
            return Vec::new();
        };

        let mut out = Vec::with_capacity(2);
        if !self.reported_best_chain {
            self.reported_best_chain = true;
            out.push(Status::BestChainBlockIncluded(Inclusion { block_hash, index }));
        }
        out.push(Status::Finalized(Inclusion { block_hash, index }));
        self.finished = true;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{Inclusion, Status, TransactionWatch};

    const TX: &[u8] = &[0x0c, 0xde, 0xad, 0x00];

    fn body_with_tx_at(index: usize) -> Vec<Vec<u8>> {
        let mut body = vec![vec![0x04, 0x01], vec![0x04, 0x02], vec![0x04, 0x03]];
        body.insert(index, TX.to_vec());
        body
    }

    #[test]
    fn best_then_finalized() {
        let mut watch = TransactionWatch::new(TX);
        assert!(watch.best_block_body([1; 32], body_with_tx_at(0).iter().skip(1)).is_none());
        assert_eq!(
            watch.best_block_body([2; 32], body_with_tx_at(1).iter()),
            Some(Status::BestChainBlockIncluded(Inclusion {
                block_hash: [2; 32],
                index: 1
            }))
        );

        // Best chain inclusion is reported once.
        assert!(watch.best_block_body([3; 32], body_with_tx_at(2).iter()).is_none());

        assert_eq!(
            watch.finalized_block_body([2; 32], body_with_tx_at(1).iter()),
            vec![Status::Finalized(Inclusion {
                block_hash: [2; 32],
                index: 1
            })]
        );
        assert!(watch.is_finished());
    }

    #[test]
    fn first_seen_in_finalized_block() {
        let mut watch = TransactionWatch::new(TX);
        let statuses = watch.finalized_block_body([5; 32], body_with_tx_at(3).iter());
        assert_eq!(statuses.len(), 2);
        assert!(matches!(&statuses[0], Status::BestChainBlockIncluded(i) if i.index == 3));
        assert!(matches!(&statuses[1], Status::Finalized(i) if i.index == 3));
    }

    #[test]
    fn nothing_after_finalized() {
        let mut watch = TransactionWatch::new(TX);
        assert_eq!(
            watch
                .finalized_block_body([5; 32], body_with_tx_at(0).iter())
                .len(),
            2
        );
        assert!(watch.best_block_body([6; 32], body_with_tx_at(0).iter()).is_none());
        assert!(watch
            .finalized_block_body([6; 32], body_with_tx_at(0).iter())
            .is_empty());
    }

    #[test]
    fn finalized_block_without_tx() {
        let mut watch = TransactionWatch::new(TX);
        let body: Vec<Vec<u8>> = vec![vec![0x04, 0x01]];
        assert!(watch.finalized_block_body([1; 32], body.iter()).is_empty());
        assert!(!watch.is_finished());
    }
}
