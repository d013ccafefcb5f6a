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

#![cfg(test)]

use super::{
    operations::{
        OperationEventError, OperationKind, OperationOutput, OperationResult, Operations,
    },
    BlockEvent, BlockNotAvailable, Config, PinnedBlocks, ProtocolError,
};
use crate::json_rpc::methods::{FollowEvent, HexString, StorageResultItem};

fn h(n: u8) -> [u8; 32] {
    [n; 32]
}

fn new_registry() -> PinnedBlocks<u32> {
    PinnedBlocks::new(Config {
        finalized_blocks_retention: 4,
        blocks_capacity: 16,
    })
}

/// Builds a registry initialized with block 1 (number 10) as finalized, and a chain
/// 1 <- 2 <- 3 plus a fork 1 <- 4.
fn initialized_registry() -> PinnedBlocks<u32> {
    let mut registry = new_registry();
    registry.initialize(&[h(1)], 10, h(0), Some(7)).unwrap();
    registry.new_block(h(2), h(1), None).unwrap();
    registry.new_block(h(3), h(2), Some(8)).unwrap();
    registry.new_block(h(4), h(1), None).unwrap();
    registry
}

#[test]
fn initialize_reports_best_and_finalized() {
    let mut registry = new_registry();
    assert!(!registry.is_initialized());
    let outcome = registry
        .initialize(&[h(1), h(2), h(3)], 100, h(2), Some(1))
        .unwrap();

    assert_eq!(outcome.events.len(), 2);
    assert!(matches!(&outcome.events[0], BlockEvent::BestBlock(b) if b.hash == h(3)));
    assert!(matches!(&outcome.events[1], BlockEvent::FinalizedBlock(b) if b.hash == h(3)));
    assert_eq!(registry.best_block().unwrap().number, 100);
    assert_eq!(registry.block(&h(1)).unwrap().number, 98);
    assert_eq!(registry.block(&h(1)).unwrap().parent_hash, None);
    assert_eq!(registry.block(&h(2)).unwrap().parent_hash, Some(h(1)));
    assert_eq!(registry.finalized_block().unwrap().runtime, Some(1));
}

#[test]
fn initialize_inconsistent_header() {
    let mut registry = new_registry();
    assert_eq!(
        registry
            .initialize(&[h(1), h(2)], 100, h(9), None)
            .unwrap_err(),
        ProtocolError::InconsistentInitialized
    );
    assert!(!registry.is_initialized());
}

#[test]
fn new_block_number_and_runtime_inheritance() {
    let registry = initialized_registry();
    let block2 = registry.block(&h(2)).unwrap();
    assert_eq!(block2.number, 11);
    assert_eq!(block2.runtime, Some(7));
    let block3 = registry.block(&h(3)).unwrap();
    assert_eq!(block3.number, 12);
    assert_eq!(block3.runtime, Some(8));
}

#[test]
fn new_block_unknown_parent_is_error() {
    let mut registry = initialized_registry();
    assert_eq!(
        registry.new_block(h(6), h(5), None).unwrap_err(),
        ProtocolError::UnknownParent {
            block: h(6),
            parent: h(5)
        }
    );
}

#[test]
fn events_before_initialized_are_errors() {
    let mut registry = new_registry();
    assert_eq!(
        registry.new_block(h(2), h(1), None).unwrap_err(),
        ProtocolError::NotInitialized
    );
    assert_eq!(
        registry.best_block_changed(h(1)).unwrap_err(),
        ProtocolError::NotInitialized
    );
    assert_eq!(
        registry.finalized(&[h(1)], &[]).unwrap_err(),
        ProtocolError::NotInitialized
    );
}

#[test]
fn best_block_must_be_pinned() {
    let mut registry = initialized_registry();
    assert_eq!(
        registry.best_block_changed(h(9)).unwrap_err(),
        ProtocolError::UnknownBlock(h(9))
    );
}

#[test]
fn finalized_block_must_be_pinned() {
    let mut registry = initialized_registry();
    assert_eq!(
        registry.finalized(&[h(9)], &[]).unwrap_err(),
        ProtocolError::UnknownBlock(h(9))
    );
}

#[test]
fn best_chain_changed_on_fork() {
    let mut registry = initialized_registry();

    let outcome = registry.best_block_changed(h(2)).unwrap();
    assert_eq!(outcome.events.len(), 1);
    assert!(matches!(&outcome.events[0], BlockEvent::BestBlock(b) if b.hash == h(2)));

    // Descendant of the previous best: no chain change.
    let outcome = registry.best_block_changed(h(3)).unwrap();
    assert_eq!(outcome.events.len(), 1);

    // Fork: chain change.
    let outcome = registry.best_block_changed(h(4)).unwrap();
    assert_eq!(outcome.events.len(), 2);
    assert!(matches!(&outcome.events[0], BlockEvent::BestBlock(b) if b.hash == h(4)));
    assert!(matches!(&outcome.events[1], BlockEvent::BestChainChanged(b) if b.hash == h(4)));
}

#[test]
fn finalized_monotonic() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();

    let outcome = registry.finalized(&[h(2)], &[h(4)]).unwrap();
    assert!(matches!(&outcome.events[..], [BlockEvent::FinalizedBlock(b)] if b.hash == h(2)));
    assert_eq!(outcome.unpin, vec![h(4)]);
    assert_eq!(registry.finalized_block().unwrap().hash, h(2));

    // Going back to the previous finalized block isn't allowed.
    assert_eq!(
        registry.finalized(&[h(1)], &[]).unwrap_err(),
        ProtocolError::FinalizedNotDescendant(h(1))
    );
    // Finalizing the same block again isn't allowed either.
    assert_eq!(
        registry.finalized(&[h(2)], &[]).unwrap_err(),
        ProtocolError::FinalizedNotDescendant(h(2))
    );
    assert_eq!(registry.finalized_block().unwrap().hash, h(2));
}

#[test]
fn finalized_sideways_is_error() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();
    registry.finalized(&[h(2)], &[]).unwrap();
    // Block 4 is a sibling of block 2.
    assert_eq!(
        registry.finalized(&[h(4)], &[]).unwrap_err(),
        ProtocolError::FinalizedNotDescendant(h(4))
    );
}

#[test]
fn finalized_multiple_in_order() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();
    let outcome = registry.finalized(&[h(2), h(3)], &[h(4)]).unwrap();
    let finalized = outcome
        .events
        .iter()
        .map(|ev| ev.block().hash)
        .collect::<Vec<_>>();
    assert_eq!(finalized, vec![h(2), h(3)]);
}

#[test]
fn pruning_best_block_is_error() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(4)).unwrap();
    assert_eq!(
        registry.finalized(&[h(2)], &[h(4)]).unwrap_err(),
        ProtocolError::PrunedBlockInUse(h(4))
    );
}

#[test]
fn finalized_must_stay_ancestor_of_best() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(4)).unwrap();
    assert_eq!(
        registry.finalized(&[h(2)], &[]).unwrap_err(),
        ProtocolError::BestBlockNotDescendantOfFinalized(h(4))
    );
}

#[test]
fn unpin_deferred_while_operation_pending() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();
    registry.operation_started(&h(4)).unwrap();

    let outcome = registry.finalized(&[h(2)], &[h(4)]).unwrap();
    assert!(outcome.unpin.is_empty());
    assert_eq!(registry.pending_operations(&h(4)), Some(1));

    // No new operation can start against a block being unpinned.
    assert_eq!(
        registry.operation_started(&h(4)),
        Err(BlockNotAvailable(h(4)))
    );
    assert!(registry.block(&h(4)).is_none());

    // The unpinning happens once the operation is finished.
    assert!(registry.operation_finished(&h(4)));
    assert!(registry.unpin_confirmed(&h(4)));
    assert_eq!(registry.pending_operations(&h(4)), None);
}

#[test]
fn unpin_confirmed_removes_block() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();
    let outcome = registry.finalized(&[h(2)], &[h(4)]).unwrap();
    assert_eq!(outcome.unpin, vec![h(4)]);
    let len_before = registry.len();
    assert!(registry.unpin_confirmed(&h(4)));
    assert_eq!(registry.len(), len_before - 1);
    assert!(!registry.unpin_confirmed(&h(4)));
}

#[test]
fn finalized_retention() {
    let mut registry = PinnedBlocks::<u32>::new(Config {
        finalized_blocks_retention: 2,
        blocks_capacity: 16,
    });
    registry.initialize(&[h(1)], 0, h(0), None).unwrap();
    for n in 2..=5 {
        registry.new_block(h(n), h(n - 1), None).unwrap();
    }
    registry.best_block_changed(h(5)).unwrap();

    let outcome = registry.finalized(&[h(2), h(3), h(4)], &[]).unwrap();
    assert_eq!(outcome.unpin, vec![h(1), h(2)]);
    assert!(registry.block(&h(3)).is_some());
    assert!(registry.block(&h(4)).is_some());
}

#[test]
fn reset_and_reinitialize() {
    let mut registry = initialized_registry();
    registry.best_block_changed(h(3)).unwrap();
    assert_eq!(registry.reset(), 4);
    assert!(!registry.is_initialized());
    assert!(registry.best_block().is_none());

    // Re-initializing on the same finalized block reports the new best block, as it differs
    // from the last reported one, but not the finalized block.
    let outcome = registry.initialize(&[h(1)], 10, h(0), None).unwrap();
    assert!(matches!(&outcome.events[..], [BlockEvent::BestBlock(b)] if b.hash == h(1)));

    // Re-initializing after the chain has progressed reports both.
    registry.reset();
    let outcome = registry.initialize(&[h(9)], 20, h(8), None).unwrap();
    assert_eq!(outcome.events.len(), 2);

    // Operations of the previous session are ignored.
    assert!(!registry.operation_finished(&h(3)));
}

#[test]
fn reinitialize_reports_blocks_finalized_in_between() {
    let mut registry = initialized_registry();
    registry.reset();

    // `h(1)` is number 10 and was the last reported finalized block. The new follow reports
    // its two children as finalized.
    let outcome = registry
        .initialize(&[h(1), h(2), h(3)], 12, h(2), None)
        .unwrap();
    let finalized = outcome
        .events
        .iter()
        .filter_map(|ev| match ev {
            BlockEvent::FinalizedBlock(b) => Some((b.hash, b.number)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(finalized, vec![(h(2), 11), (h(3), 12)]);

    // The last reported finalized block isn't in the list of the next follow.
    registry.reset();
    let outcome = registry.initialize(&[h(4), h(5)], 14, h(4), None).unwrap();
    let finalized = outcome
        .events
        .iter()
        .filter_map(|ev| match ev {
            BlockEvent::FinalizedBlock(b) => Some(b.hash),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(finalized, vec![h(4), h(5)]);

    // Nothing new has been finalized.
    registry.reset();
    let outcome = registry.initialize(&[h(4), h(5)], 14, h(4), None).unwrap();
    assert!(
        !outcome
            .events
            .iter()
            .any(|ev| matches!(ev, BlockEvent::FinalizedBlock(_)))
    );
}

#[test]
fn unpin_best_refused() {
    let mut registry = initialized_registry();
    assert!(registry.unpin(&h(1)).is_err());
    assert!(registry.unpin(&h(4)).unwrap());
    assert!(!registry.unpin(&h(4)).unwrap());
}

fn storage_items(op: &str, keys: &[u8]) -> FollowEvent {
    FollowEvent::OperationStorageItems {
        operation_id: op.into(),
        items: keys
            .iter()
            .map(|k| StorageResultItem {
                key: HexString(vec![*k]),
                value: Some(HexString(vec![*k, *k])),
                hash: None,
                closest_descendant_merkle_value: None,
            })
            .collect(),
    }
}

#[test]
fn storage_items_accumulated_in_order() {
    let mut operations = Operations::<&'static str>::new();
    operations.start_requested();
    assert!(operations
        .insert("op".into(), OperationKind::Storage, h(1), "user")
        .unwrap()
        .is_empty());

    assert!(operations
        .inject_event(storage_items("op", &[1, 2]))
        .unwrap()
        .is_none());
    match operations
        .inject_event(FollowEvent::OperationWaitingForContinue {
            operation_id: "op".into(),
        })
        .unwrap()
    {
        Some(OperationOutput::WaitingForContinue { operation_id }) => assert_eq!(operation_id, "op"),
        _ => panic!(),
    }
    assert!(operations
        .inject_event(storage_items("op", &[3]))
        .unwrap()
        .is_none());

    match operations
        .inject_event(FollowEvent::OperationStorageDone {
            operation_id: "op".into(),
        })
        .unwrap()
    {
        Some(OperationOutput::Finished {
            user_data,
            block_hash,
            result: OperationResult::Storage(items),
            ..
        }) => {
            assert_eq!(user_data, "user");
            assert_eq!(block_hash, h(1));
            let keys = items.iter().map(|i| i.key.0[0]).collect::<Vec<_>>();
            assert_eq!(keys, vec![1, 2, 3]);
        }
        _ => panic!(),
    }
    assert!(operations.is_empty());
}

#[test]
fn concurrent_operations_same_block() {
    let mut operations = Operations::<u32>::new();
    operations.start_requested();
    operations.start_requested();
    operations
        .insert("a".into(), OperationKind::Body, h(1), 1)
        .unwrap();
    operations
        .insert("b".into(), OperationKind::Call, h(1), 2)
        .unwrap();

    let out = operations
        .inject_event(FollowEvent::OperationCallDone {
            operation_id: "b".into(),
            output: HexString(vec![5]),
        })
        .unwrap();
    assert!(matches!(
        out,
        Some(OperationOutput::Finished { user_data: 2, result: OperationResult::Call(ref v), .. }) if *v == [5]
    ));
    assert_eq!(operations.len(), 1);

    let out = operations
        .inject_event(FollowEvent::OperationError {
            operation_id: "a".into(),
            error: "oops".into(),
        })
        .unwrap();
    assert!(matches!(
        out,
        Some(OperationOutput::Finished { user_data: 1, result: OperationResult::Error(ref e), .. }) if e == "oops"
    ));
}

#[test]
fn early_events_buffered_while_start_in_flight() {
    let mut operations = Operations::<()>::new();
    operations.start_requested();

    // The body arrives before the response to the start request.
    assert!(operations
        .inject_event(FollowEvent::OperationBodyDone {
            operation_id: "x".into(),
            value: vec![HexString(vec![1])],
        })
        .unwrap()
        .is_none());

    let outputs = operations
        .insert("x".into(), OperationKind::Body, h(2), ())
        .unwrap();
    assert!(matches!(
        &outputs[..],
        [OperationOutput::Finished { result: OperationResult::Body(b), .. }] if *b == vec![vec![1u8]]
    ));
}

#[test]
fn unknown_operation_is_error() {
    let mut operations = Operations::<()>::new();
    assert_eq!(
        operations
            .inject_event(FollowEvent::OperationStorageDone {
                operation_id: "nope".into()
            })
            .unwrap_err(),
        OperationEventError::UnknownOperation
    );
}

#[test]
fn kind_mismatch_is_error() {
    let mut operations = Operations::<()>::new();
    operations.start_requested();
    operations
        .insert("a".into(), OperationKind::Body, h(1), ())
        .unwrap();
    assert_eq!(
        operations
            .inject_event(FollowEvent::OperationStorageDone {
                operation_id: "a".into()
            })
            .unwrap_err(),
        OperationEventError::KindMismatch
    );
}

#[test]
fn drain_returns_everything() {
    let mut operations = Operations::<u32>::new();
    operations.start_requested();
    operations
        .insert("a".into(), OperationKind::Storage, h(1), 5)
        .unwrap();
    operations.start_requested();
    let drained = operations.drain().collect::<Vec<_>>();
    assert_eq!(drained, vec![(String::from("a"), h(1), 5)]);
    assert!(operations.is_empty());
}

#[test]
fn operation_and_registry_no_dangling() {
    // An operation started against a block that then gets pruned completes and the block is
    // unpinned afterwards.
    let mut registry = initialized_registry();
    let mut operations = Operations::<()>::new();
    registry.best_block_changed(h(3)).unwrap();

    registry.operation_started(&h(4)).unwrap();
    operations.start_requested();
    operations
        .insert("op".into(), OperationKind::Body, h(4), ())
        .unwrap();

    let outcome = registry.finalized(&[h(2)], &[h(4)]).unwrap();
    assert!(outcome.unpin.is_empty());

    let Some(OperationOutput::Finished { block_hash, .. }) = operations
        .inject_event(FollowEvent::OperationBodyDone {
            operation_id: "op".into(),
            value: Vec::new(),
        })
        .unwrap()
    else {
        panic!()
    };
    assert!(registry.operation_finished(&block_hash));
}
