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

//! Background service that follows the chain through a `chainHead_v1_follow` subscription.
//!
//! The [`ChainHeadService`] spawns a background task that owns the follow subscription, the
//! [`PinnedBlocks`] registry and the [`Operations`] in progress. The frontend communicates with
//! it through channels.
//!
//! # Reconnections
//!
//! Whenever the connection to the server is lost, the follow subscription is dead as well. The
//! service then forgets all its pinned blocks, rejects the operations in progress with
//! [`OperationError::SubscriptionReset`], and subscribes again once the connection is back. The
//! same happens when the server sends a `stop` event or violates the protocol. The channels
//! returned by [`ChainHeadService::subscribe_blocks`] are unaffected: after the new
//! subscription is initialized, a [`BlockEvent::BestBlock`] is reported if the best block
//! differs from the last one that was reported, and a [`BlockEvent::FinalizedBlock`] is
//! reported for each block of the `initialized` event that is more recent than the last
//! reported finalized block.
//!
//! # Operations
//!
//! [`ChainHeadService::body`], [`ChainHeadService::call`] and [`ChainHeadService::storage`]
//! start an operation against a pinned block and wait for its events. If the future is dropped
//! before the operation is finished, for example because of [`Config::operation_timeout`], the
//! operation is stopped with `chainHead_v1_stopOperation`. A block that has operations in
//! progress is never unpinned.

use crate::{
    json_rpc_connection::{ConnectionEvent, JsonRpcConnection, RequestError, Subscription},
    log,
    platform::PlatformRef,
    to_json_string, Block, BlockEvent, OperationError,
};

use alloc::{
    borrow::ToOwned as _,
    boxed::Box,
    collections::VecDeque,
    format,
    string::{String, ToString as _},
    sync::Arc,
    vec::Vec,
};
use chain_head::{
    follow::{
        self,
        operations::{OperationEventError, OperationKind, OperationOutput, OperationResult, Operations},
        Outcome, PinnedBlocks, ProtocolError,
    },
    header,
    informant::HashDisplay,
    json_rpc::methods,
};
use core::{
    future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use futures_channel::oneshot;
use futures_lite::FutureExt as _;
use futures_util::{future::BoxFuture, stream::FuturesUnordered, StreamExt as _};

/// Delay before subscribing again after the server has refused a follow subscription.
const FOLLOW_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Number of follow notifications that can be queued before the subscription is considered
/// as too slow and is restarted.
const FOLLOW_NOTIFICATIONS_BUFFER: usize = 1024;

/// Number of stopped operations whose late events are silently ignored.
const STOPPED_OPERATIONS_MEMORY: usize = 64;

/// Configuration for a new [`ChainHeadService`].
pub struct Config<TPlat> {
    /// Access to the platform's capabilities.
    pub platform: TPlat,

    /// Name of the chain, for logging purposes.
    pub log_name: String,

    /// Connection to the server.
    pub connection: JsonRpcConnection,

    /// Value of the `withRuntime` parameter of `chainHead_v1_follow`. If `true`, the runtime of
    /// each block is reported in [`Block::runtime`].
    pub with_runtime: bool,

    /// Number of finalized blocks, including the current finalized block, that stay pinned.
    pub finalized_blocks_retention: usize,

    /// Maximum duration of an operation. `None` for no limit.
    pub operation_timeout: Option<Duration>,

    /// Capacity of the channels returned by [`ChainHeadService::subscribe_blocks`]. A channel
    /// that is full when an event must be delivered is closed.
    pub block_events_buffer: usize,
}

/// See [the module-level documentation](..).
pub struct ChainHeadService<TPlat> {
    platform: TPlat,

    to_background: async_channel::Sender<ToBackground>,

    /// Identifiers of the operations whose future has been dropped before they finished.
    abandon_tx: async_channel::Sender<u64>,

    /// Identifier to assign to the next operation. Local to this service, unrelated to the
    /// operation IDs assigned by the server.
    next_operation_id: AtomicU64,

    operation_timeout: Option<Duration>,
    block_events_buffer: usize,
}

enum ToBackground {
    SubscribeBlocks {
        events_tx: async_channel::Sender<BlockEvent>,
        /// Notified once the subscriber is registered.
        registered_tx: oneshot::Sender<()>,
    },
    BestBlock {
        result_tx: oneshot::Sender<Block>,
    },
    FinalizedBlock {
        result_tx: oneshot::Sender<Block>,
    },
    Header {
        block_hash: [u8; 32],
        result_tx: oneshot::Sender<Result<Option<Vec<u8>>, OperationError>>,
    },
    StartOperation {
        local_id: u64,
        block_hash: [u8; 32],
        request: OperationRequest,
        result_tx: oneshot::Sender<Result<OperationSuccess, OperationError>>,
    },
}

enum OperationRequest {
    Body,
    Call {
        function: String,
        call_parameters: Vec<u8>,
    },
    Storage {
        items: Vec<methods::StorageQueryItem>,
        child_trie: Option<Vec<u8>>,
    },
}

impl OperationRequest {
    fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Body => OperationKind::Body,
            OperationRequest::Call { .. } => OperationKind::Call,
            OperationRequest::Storage { .. } => OperationKind::Storage,
        }
    }
}

struct OperationSuccess {
    result: OperationResult,
    /// Number of trailing items of a storage request that the server has refused.
    discarded_items: usize,
}

impl<TPlat: PlatformRef> ChainHeadService<TPlat> {
    /// Spawns the background task of the service.
    pub fn new(config: Config<TPlat>) -> Self {
        let (to_background, from_frontend) = async_channel::bounded(32);
        let (abandon_tx, abandon_rx) = async_channel::unbounded();
        let log_target = format!("chain-head-{}", config.log_name);

        let platform = config.platform.clone();
        let connection = config.connection;
        let with_runtime = config.with_runtime;
        let finalized_blocks_retention = config.finalized_blocks_retention;
        let task_platform = config.platform.clone();
        let task_name = log_target.clone();

        config.platform.spawn_task(task_name.into(), async move {
            let connection_events = connection.connection_events().await;
            let task = Background {
                platform: task_platform,
                log_target,
                connection,
                with_runtime,
                from_frontend,
                abandon_rx,
                connection_events,
                connected: false,
                follow: Follow::NotSubscribed { retry: None },
                generation: 0,
                blocks: PinnedBlocks::new(follow::Config {
                    finalized_blocks_retention,
                    blocks_capacity: 32,
                }),
                operations: Operations::new(),
                local_operations: hashbrown::HashMap::with_capacity_and_hasher(
                    8,
                    Default::default(),
                ),
                stopped_operations: VecDeque::with_capacity(STOPPED_OPERATIONS_MEMORY),
                block_subscribers: Vec::with_capacity(8),
                best_block_waiters: Vec::new(),
                finalized_block_waiters: Vec::new(),
                requests: FuturesUnordered::new(),
            };
            run_background(task).await;
        });

        ChainHeadService {
            platform,
            to_background,
            abandon_tx,
            next_operation_id: AtomicU64::new(0),
            operation_timeout: config.operation_timeout,
            block_events_buffer: config.block_events_buffer,
        }
    }

    /// Returns a channel that receives the [`BlockEvent`]s, in order. All the events that happen
    /// after this function has returned are delivered.
    ///
    /// The channel is closed if it is full when an event must be delivered. Dropping the
    /// receiver unsubscribes.
    pub async fn subscribe_blocks(&self) -> async_channel::Receiver<BlockEvent> {
        let (events_tx, events_rx) = async_channel::bounded(self.block_events_buffer.max(1));
        let (registered_tx, registered_rx) = oneshot::channel();
        let _ = self
            .to_background
            .send(ToBackground::SubscribeBlocks {
                events_tx,
                registered_tx,
            })
            .await;
        let _ = registered_rx.await;
        events_rx
    }

    /// Returns the current best block. Waits until the follow subscription is initialized.
    pub async fn best_block(&self) -> Result<Block, OperationError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.to_background
            .send(ToBackground::BestBlock { result_tx })
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))?;
        result_rx
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))
    }

    /// Returns the current finalized block. Waits until the follow subscription is initialized.
    pub async fn finalized_block(&self) -> Result<Block, OperationError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.to_background
            .send(ToBackground::FinalizedBlock { result_tx })
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))?;
        result_rx
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))
    }

    /// Returns the SCALE-encoded header of a pinned block. `None` if the server doesn't know
    /// the header.
    pub async fn header(&self, block_hash: [u8; 32]) -> Result<Option<Vec<u8>>, OperationError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.to_background
            .send(ToBackground::Header {
                block_hash,
                result_tx,
            })
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))?;
        result_rx
            .await
            .unwrap_or(Err(OperationError::Request(RequestError::Disconnected)))
    }

    /// Returns the list of SCALE-encoded extrinsics of a pinned block.
    pub async fn body(&self, block_hash: [u8; 32]) -> Result<Vec<Vec<u8>>, OperationError> {
        match self.operation(block_hash, OperationRequest::Body).await? {
            OperationSuccess {
                result: OperationResult::Body(body),
                ..
            } => Ok(body),
            _ => Err(OperationError::InvalidResponse("unexpected result kind".to_owned())),
        }
    }

    /// Calls a runtime function at a pinned block and returns its output.
    pub async fn call(
        &self,
        block_hash: [u8; 32],
        function: &str,
        call_parameters: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        let request = OperationRequest::Call {
            function: function.to_owned(),
            call_parameters: call_parameters.to_vec(),
        };
        match self.operation(block_hash, request).await? {
            OperationSuccess {
                result: OperationResult::Call(output),
                ..
            } => Ok(output),
            _ => Err(OperationError::InvalidResponse("unexpected result kind".to_owned())),
        }
    }

    /// Queries the storage of a pinned block.
    ///
    /// The items are returned in the order in which the server has sent them. If the server
    /// refuses to process some of the items, they are queried again in follow-up operations.
    pub async fn storage(
        &self,
        block_hash: [u8; 32],
        items: Vec<methods::StorageQueryItem>,
        child_trie: Option<&[u8]>,
    ) -> Result<Vec<methods::StorageResultItem>, OperationError> {
        let mut remaining = items;
        let mut output = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let request = OperationRequest::Storage {
                items: remaining.clone(),
                child_trie: child_trie.map(|c| c.to_vec()),
            };

            let (items, discarded_items) = match self.operation(block_hash, request).await? {
                OperationSuccess {
                    result: OperationResult::Storage(items),
                    discarded_items,
                } => (items, discarded_items),
                _ => {
                    return Err(OperationError::InvalidResponse(
                        "unexpected result kind".to_owned(),
                    ))
                }
            };

            output.extend(items);

            if discarded_items >= remaining.len() {
                // The server has refused to process anything.
                if discarded_items != 0 {
                    return Err(OperationError::LimitReached);
                }
                break;
            }

            let processed = remaining.len() - discarded_items;
            remaining.drain(..processed);
        }

        Ok(output)
    }

    async fn operation(
        &self,
        block_hash: [u8; 32],
        request: OperationRequest,
    ) -> Result<OperationSuccess, OperationError> {
        let local_id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();

        self.to_background
            .send(ToBackground::StartOperation {
                local_id,
                block_hash,
                request,
                result_tx,
            })
            .await
            .map_err(|_| OperationError::Request(RequestError::Disconnected))?;

        // From now on, dropping this future abandons the operation.
        let mut guard = AbandonGuard {
            abandon_tx: &self.abandon_tx,
            local_id,
            armed: true,
        };

        let result = async {
            let result = result_rx
                .await
                .unwrap_or(Err(OperationError::Request(RequestError::Disconnected)));
            guard.armed = false;
            result
        };

        match self.operation_timeout {
            Some(timeout) => {
                let timeout = self.platform.sleep(timeout);
                result
                    .or(async move {
                        timeout.await;
                        Err(OperationError::Timeout)
                    })
                    .await
            }
            None => result.await,
        }
    }
}

struct AbandonGuard<'a> {
    abandon_tx: &'a async_channel::Sender<u64>,
    local_id: u64,
    armed: bool,
}

impl<'a> Drop for AbandonGuard<'a> {
    fn drop(&mut self) {
        if self.armed {
            // The channel is unbounded, and an error means that the background task is gone.
            let _ = self.abandon_tx.try_send(self.local_id);
        }
    }
}

struct Background<TPlat: PlatformRef> {
    platform: TPlat,
    log_target: String,

    connection: JsonRpcConnection,
    with_runtime: bool,

    from_frontend: async_channel::Receiver<ToBackground>,
    abandon_rx: async_channel::Receiver<u64>,
    connection_events: async_channel::Receiver<ConnectionEvent>,

    /// `true` if the connection to the server is established.
    connected: bool,

    follow: Follow<TPlat>,

    /// Incremented every time the follow subscription is reset. Responses to requests sent
    /// with a different generation concern a dead subscription.
    generation: u64,

    blocks: PinnedBlocks<Arc<methods::MaybeRuntimeSpec>>,

    /// Operations that have been started on the server. The user data is the local
    /// identifier of the operation.
    operations: Operations<u64>,

    /// Operations requested by the frontend, indexed by local identifier.
    local_operations: hashbrown::HashMap<u64, LocalOperation, fnv::FnvBuildHasher>,

    /// Server-side identifiers of the operations that have been stopped recently. The server
    /// might still send events about them.
    stopped_operations: VecDeque<String>,

    block_subscribers: Vec<async_channel::Sender<BlockEvent>>,
    best_block_waiters: Vec<oneshot::Sender<Block>>,
    finalized_block_waiters: Vec<oneshot::Sender<Block>>,

    /// Requests sent to the server and whose response hasn't been processed yet.
    requests: FuturesUnordered<BoxFuture<'static, RequestOutcome>>,
}

enum Follow<TPlat: PlatformRef> {
    NotSubscribed {
        /// If `Some`, the subscription must be attempted again when the delay is over.
        retry: Option<Pin<Box<TPlat::Delay>>>,
    },
    Subscribing,
    Active {
        subscription: Subscription,
        initialization: Initialization,
    },
}

enum Initialization {
    WaitingEvent,
    /// An `initialized` event has been received. The header of the newest finalized block is
    /// being fetched, and the events received in the meantime are buffered.
    FetchingHeader {
        finalized_hashes: Vec<[u8; 32]>,
        runtime: Option<methods::MaybeRuntimeSpec>,
        buffered_events: VecDeque<methods::FollowEvent>,
    },
    Done,
}

struct LocalOperation {
    block_hash: [u8; 32],
    /// `None` while the start request is in flight.
    operation_id: Option<String>,
    discarded_items: usize,
    result_tx: oneshot::Sender<Result<OperationSuccess, OperationError>>,
}

enum RequestOutcome {
    Follow {
        generation: u64,
        result: Result<Subscription, RequestError>,
    },
    InitializedHeader {
        generation: u64,
        result: Result<String, RequestError>,
    },
    Header {
        generation: u64,
        block_hash: [u8; 32],
        result: Result<String, RequestError>,
        result_tx: oneshot::Sender<Result<Option<Vec<u8>>, OperationError>>,
    },
    OperationStart {
        generation: u64,
        local_id: u64,
        block_hash: [u8; 32],
        kind: OperationKind,
        result: Result<String, RequestError>,
    },
    Unpin {
        generation: u64,
        block_hashes: Vec<[u8; 32]>,
        result: Result<String, RequestError>,
    },
    /// Request whose response only matters for logging purposes.
    Other {
        method: &'static str,
        result: Result<String, RequestError>,
    },
}

/// Reason why the follow subscription is restarted.
#[derive(Debug, derive_more::Display)]
enum RestartReason {
    #[display("disconnected")]
    Disconnected,
    #[display("stop event")]
    Stop,
    #[display("subscription closed")]
    SubscriptionClosed,
    #[display("invalid event: {_0}")]
    InvalidEvent(serde_json::Error),
    #[display("{_0}")]
    Protocol(ProtocolError),
    #[display("{_0}")]
    Operation(OperationEventError),
    #[display("failed to fetch initial header: {_0}")]
    InitialHeader(String),
}

async fn run_background<TPlat: PlatformRef>(mut task: Background<TPlat>) {
    loop {
        // Start the follow subscription if necessary.
        if task.connected && matches!(task.follow, Follow::NotSubscribed { retry: None }) {
            log!(&task.platform, Debug, &task.log_target, "follow-start");
            task.follow = Follow::Subscribing;
            let connection = task.connection.clone();
            let params = format!("[{}]", task.with_runtime);
            let generation = task.generation;
            task.requests.push(Box::pin(async move {
                let result = connection
                    .subscribe(
                        methods::CHAIN_HEAD_FOLLOW,
                        params,
                        methods::CHAIN_HEAD_UNFOLLOW,
                        FOLLOW_NOTIFICATIONS_BUFFER,
                    )
                    .await;
                RequestOutcome::Follow { generation, result }
            }));
        }

        enum WakeUpReason {
            FollowNotification(Option<String>),
            FollowRetry,
            Frontend(ToBackground),
            FrontendClosed,
            Abandon(u64),
            Connection(ConnectionEvent),
            RequestFinished(RequestOutcome),
        }

        let wake_up_reason = {
            let follow = &mut task.follow;
            let requests = &mut task.requests;
            let from_frontend = &task.from_frontend;
            let abandon_rx = &task.abandon_rx;
            let connection_events = &task.connection_events;

            async move {
                match follow {
                    Follow::Active { subscription, .. } => {
                        WakeUpReason::FollowNotification(subscription.next().await)
                    }
                    Follow::NotSubscribed { retry: Some(retry) } => {
                        retry.as_mut().await;
                        WakeUpReason::FollowRetry
                    }
                    _ => future::pending().await,
                }
            }
            .or(async move {
                match connection_events.recv().await {
                    Ok(event) => WakeUpReason::Connection(event),
                    Err(_) => future::pending().await,
                }
            })
            .or(async move {
                if requests.is_empty() {
                    future::pending().await
                } else {
                    match requests.next().await {
                        Some(outcome) => WakeUpReason::RequestFinished(outcome),
                        None => future::pending().await,
                    }
                }
            })
            .or(async move {
                match abandon_rx.recv().await {
                    Ok(local_id) => WakeUpReason::Abandon(local_id),
                    Err(_) => future::pending().await,
                }
            })
            .or(async move {
                from_frontend
                    .recv()
                    .await
                    .map_or(WakeUpReason::FrontendClosed, WakeUpReason::Frontend)
            })
            .await
        };

        match wake_up_reason {
            WakeUpReason::FrontendClosed => {
                log!(&task.platform, Debug, &task.log_target, "shutdown");
                return;
            }

            WakeUpReason::FollowNotification(Some(notification)) => {
                match serde_json::from_str::<methods::FollowEvent>(&notification) {
                    Ok(event) => {
                        if let Err(reason) = task.on_follow_event(event) {
                            task.restart_follow(reason);
                        }
                    }
                    Err(err) => task.restart_follow(RestartReason::InvalidEvent(err)),
                }
            }

            WakeUpReason::FollowNotification(None) => {
                task.restart_follow(RestartReason::SubscriptionClosed);
            }

            WakeUpReason::FollowRetry => {
                task.follow = Follow::NotSubscribed { retry: None };
            }

            WakeUpReason::Connection(ConnectionEvent::Connected) => {
                task.connected = true;
                if let Follow::NotSubscribed { retry } = &mut task.follow {
                    *retry = None;
                }
            }

            WakeUpReason::Connection(ConnectionEvent::Disconnected) => {
                task.connected = false;
                task.restart_follow(RestartReason::Disconnected);
            }

            WakeUpReason::Connection(ConnectionEvent::Reconnecting)
            | WakeUpReason::Connection(ConnectionEvent::Error(_)) => {}

            WakeUpReason::Frontend(ToBackground::SubscribeBlocks {
                events_tx,
                registered_tx,
            }) => {
                task.block_subscribers.push(events_tx);
                let _ = registered_tx.send(());
            }

            WakeUpReason::Frontend(ToBackground::BestBlock { result_tx }) => {
                match task.blocks.best_block() {
                    Some(block) => {
                        let _ = result_tx.send(block.clone());
                    }
                    None => task.best_block_waiters.push(result_tx),
                }
            }

            WakeUpReason::Frontend(ToBackground::FinalizedBlock { result_tx }) => {
                match task.blocks.finalized_block() {
                    Some(block) => {
                        let _ = result_tx.send(block.clone());
                    }
                    None => task.finalized_block_waiters.push(result_tx),
                }
            }

            WakeUpReason::Frontend(ToBackground::Header {
                block_hash,
                result_tx,
            }) => {
                let Some(subscription_id) = task.ready_subscription_id() else {
                    let _ = result_tx.send(Err(OperationError::BlockNotAvailable(block_hash)));
                    continue;
                };
                if let Err(err) = task.blocks.operation_started(&block_hash) {
                    let _ = result_tx.send(Err(OperationError::BlockNotAvailable(err.0)));
                    continue;
                }

                let generation = task.generation;
                let params = format!(
                    "[{},{}]",
                    subscription_id,
                    to_json_string(&methods::HashHexString(block_hash))
                );
                task.send_request(methods::CHAIN_HEAD_HEADER, params, move |result| {
                    RequestOutcome::Header {
                        generation,
                        block_hash,
                        result,
                        result_tx,
                    }
                });
            }

            WakeUpReason::Frontend(ToBackground::StartOperation {
                local_id,
                block_hash,
                request,
                result_tx,
            }) => {
                task.start_operation(local_id, block_hash, request, result_tx);
            }

            WakeUpReason::Abandon(local_id) => {
                let Some(operation) = task.local_operations.remove(&local_id) else {
                    continue;
                };

                log!(
                    &task.platform,
                    Debug,
                    &task.log_target,
                    "operation-abandoned",
                    block = HashDisplay(&operation.block_hash)
                );

                // If the start request is still in flight, the operation is stopped once its
                // identifier is known.
                if let Some(operation_id) = operation.operation_id {
                    if let Some((block_hash, _)) = task.operations.remove(&operation_id) {
                        task.operation_finished(block_hash);
                        task.stop_operation(operation_id);
                    }
                }
            }

            WakeUpReason::RequestFinished(outcome) => task.on_request_finished(outcome),
        }
    }
}

impl<TPlat: PlatformRef> Background<TPlat> {
    /// Returns the JSON-encoded ID of the follow subscription, if it is initialized.
    fn ready_subscription_id(&self) -> Option<String> {
        match &self.follow {
            Follow::Active {
                subscription,
                initialization: Initialization::Done,
            } => Some(subscription.id_json().to_owned()),
            _ => None,
        }
    }

    fn send_request(
        &mut self,
        method: &'static str,
        params_json: String,
        outcome: impl FnOnce(Result<String, RequestError>) -> RequestOutcome + Send + 'static,
    ) {
        let connection = self.connection.clone();
        self.requests.push(Box::pin(async move {
            outcome(connection.request(method, params_json).await)
        }));
    }

    fn start_operation(
        &mut self,
        local_id: u64,
        block_hash: [u8; 32],
        request: OperationRequest,
        result_tx: oneshot::Sender<Result<OperationSuccess, OperationError>>,
    ) {
        let Some(subscription_id) = self.ready_subscription_id() else {
            let _ = result_tx.send(Err(OperationError::BlockNotAvailable(block_hash)));
            return;
        };
        if let Err(err) = self.blocks.operation_started(&block_hash) {
            let _ = result_tx.send(Err(OperationError::BlockNotAvailable(err.0)));
            return;
        }

        let hash_json = to_json_string(&methods::HashHexString(block_hash));
        let kind = request.kind();
        let (method, params) = match request {
            OperationRequest::Body => (
                methods::CHAIN_HEAD_BODY,
                format!("[{},{}]", subscription_id, hash_json),
            ),
            OperationRequest::Call {
                function,
                call_parameters,
            } => (
                methods::CHAIN_HEAD_CALL,
                format!(
                    "[{},{},{},{}]",
                    subscription_id,
                    hash_json,
                    to_json_string(&function),
                    to_json_string(&methods::HexString(call_parameters))
                ),
            ),
            OperationRequest::Storage { items, child_trie } => (
                methods::CHAIN_HEAD_STORAGE,
                format!(
                    "[{},{},{},{}]",
                    subscription_id,
                    hash_json,
                    to_json_string(&items),
                    to_json_string(&child_trie.map(methods::HexString))
                ),
            ),
        };

        log!(
            &self.platform,
            Trace,
            &self.log_target,
            "operation-start",
            method,
            block = HashDisplay(&block_hash)
        );

        self.operations.start_requested();
        self.local_operations.insert(
            local_id,
            LocalOperation {
                block_hash,
                operation_id: None,
                discarded_items: 0,
                result_tx,
            },
        );

        let generation = self.generation;
        self.send_request(method, params, move |result| RequestOutcome::OperationStart {
            generation,
            local_id,
            block_hash,
            kind,
            result,
        });
    }

    fn on_request_finished(&mut self, outcome: RequestOutcome) {
        match outcome {
            RequestOutcome::Follow { generation, .. } if generation != self.generation => {}
            RequestOutcome::Follow { result: Ok(subscription), .. } => {
                if !matches!(self.follow, Follow::Subscribing) {
                    return;
                }
                log!(
                    &self.platform,
                    Debug,
                    &self.log_target,
                    "follow-subscribed",
                    subscription = subscription.id_json()
                );
                self.follow = Follow::Active {
                    subscription,
                    initialization: Initialization::WaitingEvent,
                };
            }
            RequestOutcome::Follow { result: Err(err), .. } => {
                log!(
                    &self.platform,
                    Warn,
                    &self.log_target,
                    "follow-failed",
                    error = err
                );
                self.follow = Follow::NotSubscribed {
                    retry: Some(Box::pin(self.platform.sleep(FOLLOW_RETRY_DELAY))),
                };
            }

            RequestOutcome::InitializedHeader { generation, .. } if generation != self.generation => {}
            RequestOutcome::InitializedHeader { result, .. } => {
                if let Err(reason) = self.on_initialized_header(result) {
                    self.restart_follow(reason);
                }
            }

            RequestOutcome::Header {
                generation,
                block_hash,
                result,
                result_tx,
            } => {
                if generation == self.generation {
                    self.operation_finished(block_hash);
                }
                let result = result.map_err(OperationError::Request).and_then(|result| {
                    serde_json::from_str::<Option<methods::HexString>>(&result)
                        .map(|header| header.map(|h| h.0))
                        .map_err(|err| OperationError::InvalidResponse(err.to_string()))
                });
                let _ = result_tx.send(result);
            }

            RequestOutcome::OperationStart { generation, .. } if generation != self.generation => {
                // The subscription is gone, and so are the operations.
            }
            RequestOutcome::OperationStart {
                local_id,
                block_hash,
                kind,
                result,
                ..
            } => {
                let response = result.map_err(OperationError::Request).and_then(|result| {
                    serde_json::from_str::<methods::MethodResponse>(&result)
                        .map_err(|err| OperationError::InvalidResponse(err.to_string()))
                });

                match response {
                    Ok(methods::MethodResponse::Started {
                        operation_id,
                        discarded_items,
                    }) => {
                        let Some(local) = self.local_operations.get_mut(&local_id) else {
                            // Abandoned while the request was in flight.
                            self.operations.discard(&operation_id);
                            self.operation_finished(block_hash);
                            self.stop_operation(operation_id);
                            return;
                        };

                        local.operation_id = Some(operation_id.clone());
                        local.discarded_items = discarded_items.unwrap_or(0);

                        match self
                            .operations
                            .insert(operation_id, kind, block_hash, local_id)
                        {
                            Ok(outputs) => {
                                for output in outputs {
                                    self.on_operation_output(output);
                                }
                            }
                            Err(err) => self.restart_follow(RestartReason::Operation(err)),
                        }
                    }
                    Ok(methods::MethodResponse::LimitReached {}) => {
                        self.operations.start_failed();
                        self.operation_finished(block_hash);
                        if let Some(local) = self.local_operations.remove(&local_id) {
                            let _ = local.result_tx.send(Err(OperationError::LimitReached));
                        }
                    }
                    Err(err) => {
                        self.operations.start_failed();
                        self.operation_finished(block_hash);
                        if let Some(local) = self.local_operations.remove(&local_id) {
                            let _ = local.result_tx.send(Err(err));
                        }
                    }
                }
            }

            RequestOutcome::Unpin {
                generation,
                block_hashes,
                result,
            } => match result {
                Ok(_) if generation == self.generation => {
                    for block_hash in &block_hashes {
                        self.blocks.unpin_confirmed(block_hash);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    log!(
                        &self.platform,
                        Warn,
                        &self.log_target,
                        "unpin-failed",
                        blocks = block_hashes.len(),
                        error = err
                    );
                }
            },

            RequestOutcome::Other {
                method,
                result: Err(err),
            } => {
                log!(
                    &self.platform,
                    Warn,
                    &self.log_target,
                    "request-failed",
                    method,
                    error = err
                );
            }
            RequestOutcome::Other { result: Ok(_), .. } => {}
        }
    }

    fn on_follow_event(&mut self, event: methods::FollowEvent) -> Result<(), RestartReason> {
        let Follow::Active { initialization, .. } = &mut self.follow else {
            return Ok(());
        };

        match initialization {
            Initialization::FetchingHeader {
                buffered_events, ..
            } => {
                buffered_events.push_back(event);
                Ok(())
            }
            Initialization::Done => self.on_initialized_follow_event(event),
            Initialization::WaitingEvent => {
                let (finalized_block_hashes, finalized_block_runtime) = match event {
                    methods::FollowEvent::Initialized {
                        finalized_block_hashes,
                        finalized_block_runtime,
                    } => (finalized_block_hashes, finalized_block_runtime),
                    methods::FollowEvent::Stop {} => return Err(RestartReason::Stop),
                    _ => return Err(RestartReason::Protocol(ProtocolError::NotInitialized)),
                };

                let finalized_hashes = finalized_block_hashes
                    .into_iter()
                    .map(|h| h.0)
                    .collect::<Vec<_>>();
                let Some(newest) = finalized_hashes.last().copied() else {
                    return Err(RestartReason::Protocol(ProtocolError::EmptyInitialized));
                };

                *initialization = Initialization::FetchingHeader {
                    finalized_hashes,
                    runtime: finalized_block_runtime,
                    buffered_events: VecDeque::new(),
                };

                let Some(subscription_id) = self.subscription_id() else {
                    return Ok(());
                };
                let generation = self.generation;
                let params = format!(
                    "[{},{}]",
                    subscription_id,
                    to_json_string(&methods::HashHexString(newest))
                );
                self.send_request(methods::CHAIN_HEAD_HEADER, params, move |result| {
                    RequestOutcome::InitializedHeader { generation, result }
                });
                Ok(())
            }
        }
    }

    fn on_initialized_follow_event(
        &mut self,
        event: methods::FollowEvent,
    ) -> Result<(), RestartReason> {
        match event {
            methods::FollowEvent::Initialized { .. } => {
                Err(RestartReason::Protocol(ProtocolError::AlreadyInitialized))
            }
            methods::FollowEvent::NewBlock {
                block_hash,
                parent_block_hash,
                new_runtime,
            } => {
                let outcome = self
                    .blocks
                    .new_block(block_hash.0, parent_block_hash.0, new_runtime.map(Arc::new))
                    .map_err(RestartReason::Protocol)?;
                self.dispatch(outcome);
                Ok(())
            }
            methods::FollowEvent::BestBlockChanged { best_block_hash } => {
                let outcome = self
                    .blocks
                    .best_block_changed(best_block_hash.0)
                    .map_err(RestartReason::Protocol)?;
                self.dispatch(outcome);
                Ok(())
            }
            methods::FollowEvent::Finalized {
                finalized_blocks_hashes,
                pruned_blocks_hashes,
            } => {
                let finalized = finalized_blocks_hashes
                    .iter()
                    .map(|h| h.0)
                    .collect::<Vec<_>>();
                let pruned = pruned_blocks_hashes.iter().map(|h| h.0).collect::<Vec<_>>();
                let outcome = self
                    .blocks
                    .finalized(&finalized, &pruned)
                    .map_err(RestartReason::Protocol)?;
                self.dispatch(outcome);
                Ok(())
            }
            methods::FollowEvent::Stop {} => Err(RestartReason::Stop),
            event => {
                let Some(operation_id) = event.operation_id() else {
                    return Ok(());
                };
                if self.stopped_operations.iter().any(|id| id == operation_id) {
                    return Ok(());
                }

                match self.operations.inject_event(event) {
                    Ok(Some(output)) => {
                        self.on_operation_output(output);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => Err(RestartReason::Operation(err)),
                }
            }
        }
    }

    fn on_initialized_header(
        &mut self,
        result: Result<String, RequestError>,
    ) -> Result<(), RestartReason> {
        let Follow::Active { initialization, .. } = &mut self.follow else {
            return Ok(());
        };
        if !matches!(initialization, Initialization::FetchingHeader { .. }) {
            return Ok(());
        }
        let Initialization::FetchingHeader {
            finalized_hashes,
            runtime,
            buffered_events,
        } = core::mem::replace(initialization, Initialization::Done)
        else {
            return Ok(());
        };

        let header = result
            .map_err(|err| RestartReason::InitialHeader(err.to_string()))?;
        let header = serde_json::from_str::<Option<methods::HexString>>(&header)
            .map_err(|err| RestartReason::InitialHeader(err.to_string()))?
            .ok_or_else(|| RestartReason::InitialHeader("unknown block".to_owned()))?;

        let newest = finalized_hashes.last().copied().unwrap_or_default();
        if header::hash_from_scale_encoded_header(&header.0) != newest {
            return Err(RestartReason::InitialHeader("hash mismatch".to_owned()));
        }

        let decoded = header::decode(&header.0)
            .map_err(|err| RestartReason::InitialHeader(err.to_string()))?;

        let outcome = self
            .blocks
            .initialize(
                &finalized_hashes,
                decoded.number,
                *decoded.parent_hash,
                runtime.map(Arc::new),
            )
            .map_err(RestartReason::Protocol)?;

        log!(
            &self.platform,
            Debug,
            &self.log_target,
            "follow-initialized",
            finalized = HashDisplay(&newest),
            number = decoded.number,
            buffered_events = buffered_events.len()
        );

        self.dispatch(outcome);

        for event in buffered_events {
            self.on_initialized_follow_event(event)?;
        }

        Ok(())
    }

    fn on_operation_output(&mut self, output: OperationOutput<u64>) {
        match output {
            OperationOutput::Finished {
                block_hash,
                user_data: local_id,
                result,
                ..
            } => {
                self.operation_finished(block_hash);

                let Some(local) = self.local_operations.remove(&local_id) else {
                    return;
                };

                let result = match result {
                    OperationResult::Error(error) => Err(OperationError::Operation(error)),
                    OperationResult::Inaccessible => Err(OperationError::Inaccessible),
                    result => Ok(OperationSuccess {
                        result,
                        discarded_items: local.discarded_items,
                    }),
                };
                let _ = local.result_tx.send(result);
            }
            OperationOutput::WaitingForContinue { operation_id } => {
                let Some(subscription_id) = self.subscription_id() else {
                    return;
                };
                let params = format!("[{},{}]", subscription_id, to_json_string(&operation_id));
                self.send_request(methods::CHAIN_HEAD_CONTINUE, params, |result| {
                    RequestOutcome::Other {
                        method: methods::CHAIN_HEAD_CONTINUE,
                        result,
                    }
                });
            }
        }
    }

    fn subscription_id(&self) -> Option<String> {
        match &self.follow {
            Follow::Active { subscription, .. } => Some(subscription.id_json().to_owned()),
            _ => None,
        }
    }

    /// Must be called when an operation against the given block is over.
    fn operation_finished(&mut self, block_hash: [u8; 32]) {
        if self.blocks.operation_finished(&block_hash) {
            self.unpin(Vec::from([block_hash]));
        }
    }

    fn stop_operation(&mut self, operation_id: String) {
        let Some(subscription_id) = self.subscription_id() else {
            return;
        };

        let params = format!("[{},{}]", subscription_id, to_json_string(&operation_id));
        if self.stopped_operations.len() >= STOPPED_OPERATIONS_MEMORY {
            self.stopped_operations.pop_front();
        }
        self.stopped_operations.push_back(operation_id);

        self.send_request(methods::CHAIN_HEAD_STOP_OPERATION, params, |result| {
            RequestOutcome::Other {
                method: methods::CHAIN_HEAD_STOP_OPERATION,
                result,
            }
        });
    }

    fn unpin(&mut self, block_hashes: Vec<[u8; 32]>) {
        let Some(subscription_id) = self.subscription_id() else {
            return;
        };

        log!(
            &self.platform,
            Debug,
            &self.log_target,
            "unpin",
            blocks = block_hashes.len()
        );

        let generation = self.generation;
        let params = format!(
            "[{},{}]",
            subscription_id,
            to_json_string(
                &block_hashes
                    .iter()
                    .map(|h| methods::HashHexString(*h))
                    .collect::<Vec<_>>()
            )
        );
        self.send_request(methods::CHAIN_HEAD_UNPIN, params, move |result| {
            RequestOutcome::Unpin {
                generation,
                block_hashes,
                result,
            }
        });
    }

    /// Reports the events of an outcome to the subscribers, and sends the unpin requests.
    fn dispatch(&mut self, outcome: Outcome<Arc<methods::MaybeRuntimeSpec>>) {
        for event in outcome.events {
            let num_before = self.block_subscribers.len();
            self.block_subscribers
                .retain(|tx| tx.try_send(event.clone()).is_ok());
            if self.block_subscribers.len() != num_before {
                log!(
                    &self.platform,
                    Debug,
                    &self.log_target,
                    "block-subscribers-removed",
                    num = num_before - self.block_subscribers.len()
                );
            }
        }

        if !outcome.unpin.is_empty() {
            self.unpin(outcome.unpin);
        }

        if let Some(best) = self.blocks.best_block() {
            for waiter in self.best_block_waiters.drain(..) {
                let _ = waiter.send(best.clone());
            }
        }
        if let Some(finalized) = self.blocks.finalized_block() {
            for waiter in self.finalized_block_waiters.drain(..) {
                let _ = waiter.send(finalized.clone());
            }
        }
    }

    /// Drops the follow subscription, which unsubscribes, and forgets everything related to it.
    fn restart_follow(&mut self, reason: RestartReason) {
        match reason {
            RestartReason::Disconnected | RestartReason::Stop => {
                log!(
                    &self.platform,
                    Debug,
                    &self.log_target,
                    "follow-reset",
                    reason
                );
            }
            _ => {
                log!(
                    &self.platform,
                    Warn,
                    &self.log_target,
                    "follow-reset",
                    reason
                );
            }
        }

        self.generation += 1;
        let num_blocks = self.blocks.reset();
        let num_operations = self.operations.drain().count();
        for (_, operation) in self.local_operations.drain() {
            let _ = operation
                .result_tx
                .send(Err(OperationError::SubscriptionReset));
        }
        self.stopped_operations.clear();
        self.follow = Follow::NotSubscribed { retry: None };

        log!(
            &self.platform,
            Trace,
            &self.log_target,
            "follow-reset-done",
            blocks = num_blocks,
            operations = num_operations
        );
    }
}
