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

mod common;

use chain_head_client::{
    storage::{DecodeError, QueryMultiError, StorageDescriptor},
    JsonRpcVersion,
};
use common::{parse_hash, run, start, within, TestBlock};
use std::time::Duration;

/// Balance of an account, stored as a little-endian `u32` under `[0x10, account]`.
struct Balance(u8);

impl StorageDescriptor for Balance {
    type Output = Option<u32>;

    fn storage_key(&self) -> Vec<u8> {
        vec![0x10, self.0]
    }

    fn decode(&self, value: Option<&[u8]>) -> Result<Self::Output, DecodeError> {
        let Some(value) = value else {
            return Ok(None);
        };
        <[u8; 4]>::try_from(value)
            .map(|bytes| Some(u32::from_le_bytes(bytes)))
            .map_err(|_| DecodeError {
                message: "invalid balance length".to_owned(),
            })
    }
}

/// Storage of the test chain: accounts 1 and 3 have a balance, account 4 is corrupted.
fn balances(_: &[u8; 32], key: &[u8]) -> Option<Vec<u8>> {
    match key {
        [0x10, 1] => Some(100u32.to_le_bytes().to_vec()),
        [0x10, 3] => Some(300u32.to_le_bytes().to_vec()),
        [0x10, 4] => Some(vec![1, 2]),
        _ => None,
    }
}

#[test]
fn query_at_best_block_preserves_order() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;

        let keys = vec![vec![0x10, 3], vec![0x10, 2], vec![0x10, 1]];
        let (values, request) = smol::future::zip(client.query(&keys, None), async {
            server.answer_storage("sub", balances).await
        })
        .await;

        assert_eq!(parse_hash(&request.params[1]), genesis.hash);
        assert_eq!(
            values.unwrap(),
            vec![
                (vec![0x10, 3], Some(300u32.to_le_bytes().to_vec())),
                (vec![0x10, 2], None),
                (vec![0x10, 1], Some(100u32.to_le_bytes().to_vec())),
            ]
        );
    });
}

#[test]
fn query_multi_matches_individual_queries() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;

        let (multi, _) = smol::future::zip(
            client.query_multi(&[Balance(1), Balance(2), Balance(3)], None),
            async { server.answer_storage("sub", balances).await },
        )
        .await;
        let multi = multi.unwrap();
        assert_eq!(server.count_received("chainHead_v1_storage"), 0);

        let mut individual = Vec::new();
        for account in [1, 2, 3] {
            let (value, _) = smol::future::zip(
                client.query_multi(&[Balance(account)], None),
                async { server.answer_storage("sub", balances).await },
            )
            .await;
            individual.extend(value.unwrap());
        }

        assert_eq!(multi, individual);
        assert_eq!(multi, vec![Some(100), None, Some(300)]);
    });
}

#[test]
fn query_multi_empty_input_sends_nothing() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);

        // The server isn't even connected.
        let values = client.query_multi::<Balance>(&[], None).await.unwrap();
        assert!(values.is_empty());
        assert!(client.query(&[], None).await.unwrap().is_empty());

        smol::Timer::after(Duration::from_millis(50)).await;
        assert_eq!(server.count_received("chainHead_v1_storage"), 0);
        assert_eq!(server.count_received("chainHead_v1_follow"), 0);
    });
}

#[test]
fn query_multi_reports_decode_errors() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;

        let (result, _) = smol::future::zip(
            client.query_multi(&[Balance(1), Balance(4)], Some(genesis.hash)),
            async { server.answer_storage("sub", balances).await },
        )
        .await;
        assert!(matches!(result, Err(QueryMultiError::Decode(_))));
    });
}

#[test]
fn unchanged_values_are_not_delivered_again() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let mut subscription = client.subscribe_storage(vec![vec![0x10, 1]]);

        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;
        server.answer_storage("sub", balances).await;
        assert_eq!(
            subscription.next().await.unwrap(),
            vec![(vec![0x10, 1], Some(100u32.to_le_bytes().to_vec()))]
        );

        let mut parent = genesis.clone();
        for _ in 0..3 {
            let block = parent.child(0);
            server.new_best_block("sub", &block).await;
            let request = server.answer_storage("sub", balances).await;
            assert_eq!(parse_hash(&request.params[1]), block.hash);
            parent = block;
        }

        assert!(within(Duration::from_millis(300), subscription.next())
            .await
            .is_none());

        let block = parent.child(0);
        server.new_best_block("sub", &block).await;
        server
            .answer_storage("sub", |_, _| Some(vec![0, 0, 0, 0]))
            .await;
        assert_eq!(
            subscription.next().await.unwrap(),
            vec![(vec![0x10, 1], Some(vec![0, 0, 0, 0]))]
        );
    });
}

#[test]
fn pulls_are_collapsed_when_blocks_arrive_faster() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let mut subscription = client.subscribe_storage(vec![vec![0x20]]);

        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;

        // The first pull stays in progress while three best blocks are produced.
        let (_, operation_id) = server.start_operation("chainHead_v1_storage").await;
        let block1 = genesis.child(0);
        let block2 = block1.child(0);
        let block3 = block2.child(0);
        for block in [&block1, &block2, &block3] {
            server.new_best_block("sub", block).await;
        }
        smol::Timer::after(Duration::from_millis(200)).await;

        server
            .follow_event(
                "sub",
                serde_json::json!({ "event": "operationStorageDone", "operationId": operation_id }),
            )
            .await;
        assert_eq!(subscription.next().await.unwrap(), vec![(vec![0x20], None)]);

        // Only the newest block is read afterwards.
        let request = server
            .answer_storage("sub", |block_hash, _| Some(block_hash.to_vec()))
            .await;
        assert_eq!(parse_hash(&request.params[1]), block3.hash);
        assert_eq!(
            subscription.next().await.unwrap(),
            vec![(vec![0x20], Some(block3.hash.to_vec()))]
        );

        smol::Timer::after(Duration::from_millis(200)).await;
        assert_eq!(server.count_received("chainHead_v1_storage"), 0);
    });
}

#[test]
fn storage_subscription_survives_reconnection() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let mut subscription = client.subscribe_storage(vec![vec![0x30]]);
        let by_block = |block_hash: &[u8; 32], _: &[u8]| Some(block_hash.to_vec());

        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub-1", &genesis).await;
        server.answer_storage("sub-1", by_block).await;
        assert_eq!(
            subscription.next().await.unwrap()[0].1,
            Some(genesis.hash.to_vec())
        );

        let mut parent = genesis.clone();
        for _ in 0..3 {
            let block = parent.child(0);
            server.new_best_block("sub-1", &block).await;
            server.answer_storage("sub-1", by_block).await;
            assert_eq!(
                subscription.next().await.unwrap()[0].1,
                Some(block.hash.to_vec())
            );
            parent = block;
        }

        server.disconnect().await;
        server.connect().await;
        server.accept_follow("sub-2", &parent).await;

        let block = parent.child(0);
        server.new_best_block("sub-2", &block).await;
        server.answer_storage("sub-2", by_block).await;
        assert_eq!(
            subscription.next().await.unwrap()[0].1,
            Some(block.hash.to_vec())
        );
    });
}

#[test]
fn unsubscribe_stops_pull_in_progress() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let subscription = client.subscribe_storage(vec![vec![0x40]]);

        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub", &genesis).await;
        let (_, operation_id) = server.start_operation("chainHead_v1_storage").await;

        subscription.unsubscribe();
        let stop = server.expect("chainHead_v1_stopOperation").await;
        assert_eq!(stop.params, serde_json::json!(["sub", operation_id]));
    });
}

#[test]
fn pull_of_block_lost_in_reset_is_retried_at_best() {
    run(async {
        let (client, mut server) = start(JsonRpcVersion::ChainHeadV1);
        let mut subscription = client.subscribe_storage(vec![vec![0x50]]);
        let by_block = |block_hash: &[u8; 32], _: &[u8]| Some(block_hash.to_vec());

        let genesis = TestBlock::root(0);
        server.initialize_chain_head("sub-1", &genesis).await;

        // A pull of block 1 is queued behind the initial pull.
        let _ = server.start_operation("chainHead_v1_storage").await;
        let block1 = genesis.child(0);
        server.new_best_block("sub-1", &block1).await;
        smol::Timer::after(Duration::from_millis(100)).await;

        // The pull of block 1 starts while the new follow subscription isn't initialized yet.
        server
            .follow_event("sub-1", serde_json::json!({ "event": "stop" }))
            .await;
        smol::Timer::after(Duration::from_millis(100)).await;

        // Block 1 is still the best block, so no best block event is generated.
        server.accept_follow("sub-2", &block1).await;
        let request = server.answer_storage("sub-2", by_block).await;
        assert_eq!(parse_hash(&request.params[1]), block1.hash);
        assert_eq!(
            subscription.next().await.unwrap()[0].1,
            Some(block1.hash.to_vec())
        );
    });
}
