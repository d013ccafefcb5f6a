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

//! Scripted JSON-RPC server used by the integration tests.
//!
//! The tests drive the server explicitly: they wait for a specific request, then answer it and
//! push notifications. Requests that the tests don't wait for are either answered
//! automatically (unpinning, unsubscribing, stopping operations) or kept aside until a test
//! asks for them.

#![allow(dead_code)]

use chain_head::json_rpc::methods;
use chain_head_client::{
    platform::DefaultPlatform,
    transport::{self, TransportEvent},
    Client, Config, JsonRpcVersion,
};
use serde_json::{json, Value};
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

/// Maximum duration of a test before it is considered as stuck.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a test to completion, panicking if it takes too long.
pub fn run<T>(test: impl Future<Output = T>) -> T {
    let _ = env_logger::try_init();
    smol::block_on(smol::future::or(test, async {
        smol::Timer::after(TEST_TIMEOUT).await;
        panic!("test timed out")
    }))
}

/// Starts a client connected to a new [`MockServer`].
pub fn start(json_rpc_version: JsonRpcVersion) -> (Client<Arc<DefaultPlatform>>, MockServer) {
    start_with(json_rpc_version, None)
}

/// Same as [`start`], with an operation timeout.
pub fn start_with(
    json_rpc_version: JsonRpcVersion,
    operation_timeout: Option<Duration>,
) -> (Client<Arc<DefaultPlatform>>, MockServer) {
    start_configured(json_rpc_version, |config| {
        config.operation_timeout = operation_timeout
    })
}

/// Same as [`start`], with a configuration modified by the given function.
pub fn start_configured(
    json_rpc_version: JsonRpcVersion,
    modify: impl FnOnce(&mut Config<Arc<DefaultPlatform>>),
) -> (Client<Arc<DefaultPlatform>>, MockServer) {
    let (transport, end) = transport::channel(256);
    let mut config = Config {
        platform: DefaultPlatform::new(),
        log_name: "test".to_owned(),
        transport,
        json_rpc_version,
        with_runtime: false,
        finalized_blocks_retention: 1,
        operation_timeout: None,
        block_events_buffer: 256,
    };
    modify(&mut config);
    let client = Client::new(config);

    (
        client,
        MockServer {
            end,
            backlog: VecDeque::new(),
            next_operation_id: 0,
        },
    )
}

/// Request received by the [`MockServer`].
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

pub struct MockServer {
    end: transport::TransportEnd,
    /// Requests received while waiting for another one.
    backlog: VecDeque<Request>,
    next_operation_id: u64,
}

impl MockServer {
    pub async fn connect(&self) {
        self.send_event(TransportEvent::Connected).await;
    }

    pub async fn disconnect(&mut self) {
        self.send_event(TransportEvent::Disconnected).await;
        // Requests sent before the disconnection are lost.
        self.backlog.clear();
        while self.end.from_client.try_recv().is_ok() {}
    }

    pub async fn send_event(&self, event: TransportEvent) {
        self.end.to_client.send(event).await.unwrap();
    }

    /// Waits for a request with the given method.
    pub async fn expect(&mut self, method: &str) -> Request {
        if let Some(position) = self.backlog.iter().position(|r| r.method == method) {
            return self.backlog.remove(position).unwrap();
        }

        loop {
            let request = self.next_request().await;
            if request.method == method {
                return request;
            }
            if !self.answer_automatically(&request).await {
                self.backlog.push_back(request);
            }
        }
    }

    /// Waits for the next request that isn't answered automatically, whatever its method.
    pub async fn next(&mut self) -> Request {
        if let Some(request) = self.backlog.pop_front() {
            return request;
        }

        loop {
            let request = self.next_request().await;
            if !self.answer_automatically(&request).await {
                return request;
            }
        }
    }

    async fn answer_automatically(&self, request: &Request) -> bool {
        match request.method.as_str() {
            "chainHead_v1_unpin"
            | "chainHead_v1_unfollow"
            | "chainHead_v1_stopOperation"
            | "chainHead_v1_continue"
            | "transaction_v1_stop" => self.respond(request, Value::Null).await,
            "chain_unsubscribeNewHeads"
            | "chain_unsubscribeFinalizedHeads"
            | "state_unsubscribeStorage"
            | "author_unwatchExtrinsic" => self.respond(request, json!(true)).await,
            _ => return false,
        }
        true
    }

    /// Returns the number of requests with the given method received so far, without waiting.
    pub fn count_received(&mut self, method: &str) -> usize {
        while let Ok(raw) = self.end.from_client.try_recv() {
            self.backlog.push_back(parse_request(&raw));
        }
        self.backlog.iter().filter(|r| r.method == method).count()
    }

    async fn next_request(&mut self) -> Request {
        let raw = self.end.from_client.recv().await.unwrap();
        parse_request(&raw)
    }

    pub async fn respond(&self, request: &Request, result: Value) {
        let response = json!({ "jsonrpc": "2.0", "id": request.id, "result": result });
        self.send_event(TransportEvent::Message(response.to_string()))
            .await;
    }

    pub async fn respond_error(&self, request: &Request, code: i64, message: &str) {
        let response = json!({
            "jsonrpc": "2.0",
            "id": request.id,
            "error": { "code": code, "message": message },
        });
        self.send_event(TransportEvent::Message(response.to_string()))
            .await;
    }

    pub async fn notify(&self, method: &str, subscription: &str, result: Value) {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": { "subscription": subscription, "result": result },
        });
        self.send_event(TransportEvent::Message(notification.to_string()))
            .await;
    }

    pub async fn follow_event(&self, subscription: &str, event: Value) {
        self.notify("chainHead_v1_followEvent", subscription, event)
            .await;
    }

    /// Connects, accepts the `chainHead_v1_follow` subscription, and initializes it with the
    /// given finalized block.
    pub async fn initialize_chain_head(&mut self, subscription: &str, finalized: &TestBlock) {
        self.connect().await;
        self.accept_follow(subscription, finalized).await;
    }

    /// Accepts a `chainHead_v1_follow` subscription and initializes it with the given finalized
    /// block.
    pub async fn accept_follow(&mut self, subscription: &str, finalized: &TestBlock) {
        let follow = self.expect("chainHead_v1_follow").await;
        self.respond(&follow, json!(subscription)).await;
        self.follow_event(
            subscription,
            json!({ "event": "initialized", "finalizedBlockHashes": [finalized.hash_hex()] }),
        )
        .await;

        let header = self.expect("chainHead_v1_header").await;
        assert_eq!(header.params[1], json!(finalized.hash_hex()));
        self.respond(&header, json!(finalized.scale_header_hex()))
            .await;
    }

    /// Connects and answers the requests that initialize the legacy JSON-RPC functions.
    /// The new heads subscription is `"new-heads"` and the finalized heads subscription is
    /// `"finalized-heads"`.
    pub async fn initialize_legacy(&mut self, finalized: &TestBlock, best: &TestBlock) {
        self.connect().await;

        let request = self.expect("chain_subscribeNewHeads").await;
        self.respond(&request, json!("new-heads")).await;
        let request = self.expect("chain_subscribeFinalizedHeads").await;
        self.respond(&request, json!("finalized-heads")).await;

        let request = self.expect("chain_getFinalizedHead").await;
        self.respond(&request, json!(finalized.hash_hex())).await;
        let request = self.expect("chain_getHeader").await;
        assert_eq!(request.params[0], json!(finalized.hash_hex()));
        self.respond(&request, finalized.json_header()).await;

        let request = self.expect("chain_getBlockHash").await;
        self.respond(&request, json!(best.hash_hex())).await;
        if best.hash != finalized.hash {
            let request = self.expect("chain_getHeader").await;
            assert_eq!(request.params[0], json!(best.hash_hex()));
            self.respond(&request, best.json_header()).await;
        }
    }

    /// Reports a new block, and makes it the best block.
    pub async fn new_best_block(&self, subscription: &str, block: &TestBlock) {
        self.follow_event(
            subscription,
            json!({
                "event": "newBlock",
                "blockHash": block.hash_hex(),
                "parentBlockHash": to_hex(&block.header.parent_hash.0),
            }),
        )
        .await;
        self.follow_event(
            subscription,
            json!({ "event": "bestBlockChanged", "bestBlockHash": block.hash_hex() }),
        )
        .await;
    }

    /// Waits for an operation request and answers that it has started. Returns the request and
    /// the operation ID.
    pub async fn start_operation(&mut self, method: &str) -> (Request, String) {
        let request = self.expect(method).await;
        let operation_id = self.accept_operation(&request).await;
        (request, operation_id)
    }

    /// Answers that the operation requested by the given request has started. Returns the
    /// operation ID.
    pub async fn accept_operation(&mut self, request: &Request) -> String {
        self.next_operation_id += 1;
        let operation_id = format!("op-{}", self.next_operation_id);
        self.respond(
            request,
            json!({ "result": "started", "operationId": operation_id }),
        )
        .await;
        operation_id
    }

    /// Answers a `chainHead_v1_storage` request with one value per key, computed by the given
    /// function.
    pub async fn answer_storage(
        &mut self,
        subscription: &str,
        value: impl FnMut(&[u8; 32], &[u8]) -> Option<Vec<u8>>,
    ) -> Request {
        let request = self.expect("chainHead_v1_storage").await;
        self.answer_storage_request(subscription, &request, value)
            .await;
        request
    }

    /// Same as [`MockServer::answer_storage`], for a request that has already been received.
    pub async fn answer_storage_request(
        &mut self,
        subscription: &str,
        request: &Request,
        mut value: impl FnMut(&[u8; 32], &[u8]) -> Option<Vec<u8>>,
    ) {
        let operation_id = self.accept_operation(request).await;
        let block_hash = parse_hash(&request.params[1]);

        let items = request.params[2]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|item| {
                let key = from_hex(item["key"].as_str().unwrap());
                let value = value(&block_hash, &key)?;
                Some(json!({ "key": to_hex(&key), "value": to_hex(&value) }))
            })
            .collect::<Vec<_>>();

        self.follow_event(
            subscription,
            json!({ "event": "operationStorageItems", "operationId": operation_id, "items": items }),
        )
        .await;
        self.follow_event(
            subscription,
            json!({ "event": "operationStorageDone", "operationId": operation_id }),
        )
        .await;
    }
}

fn parse_request(raw: &str) -> Request {
    let value = serde_json::from_str::<Value>(raw).unwrap();
    Request {
        id: value["id"].clone(),
        method: value["method"].as_str().unwrap().to_owned(),
        params: value["params"].clone(),
    }
}

/// Block built by the tests.
#[derive(Debug, Clone)]
pub struct TestBlock {
    pub hash: [u8; 32],
    pub number: u64,
    pub header: methods::Header,
}

impl TestBlock {
    /// Builds a block whose parent isn't known.
    pub fn root(number: u64) -> Self {
        Self::new([0xff; 32], number, 0)
    }

    /// Builds a child of this block. Children with a different `fork` have a different hash.
    pub fn child(&self, fork: u8) -> Self {
        Self::new(self.hash, self.number + 1, fork)
    }

    fn new(parent_hash: [u8; 32], number: u64, fork: u8) -> Self {
        let header = methods::Header {
            parent_hash: methods::HashHexString(parent_hash),
            number,
            state_root: methods::HashHexString([fork; 32]),
            extrinsics_root: methods::HashHexString([0; 32]),
            digest: methods::HeaderDigest { logs: Vec::new() },
        };

        TestBlock {
            hash: header.hash(),
            number,
            header,
        }
    }

    pub fn hash_hex(&self) -> String {
        to_hex(&self.hash)
    }

    pub fn scale_header_hex(&self) -> String {
        to_hex(&self.header.scale_encoding_vec())
    }

    pub fn json_header(&self) -> Value {
        serde_json::to_value(&self.header).unwrap()
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(string: &str) -> Vec<u8> {
    hex::decode(string.trim_start_matches("0x")).unwrap()
}

pub fn parse_hash(value: &Value) -> [u8; 32] {
    <[u8; 32]>::try_from(from_hex(value.as_str().unwrap())).unwrap()
}

/// Waits for the given future, or returns `None` if it doesn't finish in time.
pub async fn within<T>(duration: Duration, future: impl Future<Output = T>) -> Option<T> {
    smol::future::or(async { Some(future.await) }, async {
        smol::Timer::after(duration).await;
        None
    })
    .await
}
