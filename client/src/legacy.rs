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

//! Fallback on the legacy JSON-RPC API, for servers that don't support `chainHead_v1_*`.
//!
//! The [`LegacyService`] produces the same [`BlockEvent`]s as the
//! [`ChainHeadService`](crate::chain_head::ChainHeadService). The best block is tracked through
//! `chain_subscribeNewHeads` and the finalized block through `chain_subscribeFinalizedHeads`.
//! Since these subscriptions only report headers, the hash of each block is computed by
//! re-encoding its header. Recent headers are kept in a cache, which is used to fill the gaps
//! between two finalized blocks and to detect changes of best chain.
//!
//! Blocks aren't pinned. Querying a block that the server has discarded fails with an error
//! returned by the server.

use crate::{
    json_rpc_connection::{ConnectionEvent, JsonRpcConnection, RequestError, Subscription},
    log,
    platform::PlatformRef,
    to_json_string, Block, BlockEvent, OperationError,
};

use alloc::{
    borrow::ToOwned as _,
    boxed::Box,
    format,
    string::{String, ToString as _},
    vec::Vec,
};
use chain_head::{informant::HashDisplay, json_rpc::methods};
use core::{future, num::NonZeroUsize, pin::Pin, time::Duration};
use futures_channel::oneshot;
use futures_lite::FutureExt as _;

/// Delay before trying again to initialize after a failure.
const INITIALIZATION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Number of notifications of the heads subscriptions that can be queued.
const HEADS_NOTIFICATIONS_BUFFER: usize = 256;

/// Maximum number of finalized blocks fetched after a reconnection in order to report the
/// blocks finalized while disconnected. Beyond that, only the new finalized block is reported.
const MAX_FINALIZED_CATCH_UP: u64 = 256;

/// Configuration for a new [`LegacyService`].
pub struct Config<TPlat> {
    /// Access to the platform's capabilities.
    pub platform: TPlat,

    /// Name of the chain, for logging purposes.
    pub log_name: String,

    /// Connection to the server.
    pub connection: JsonRpcConnection,

    /// Capacity of the channels returned by [`LegacyService::subscribe_blocks`].
    pub block_events_buffer: usize,

    /// Number of recent headers kept in cache.
    pub headers_cache_size: NonZeroUsize,
}

/// See [the module-level documentation](..).
pub struct LegacyService {
    connection: JsonRpcConnection,
    to_background: async_channel::Sender<ToBackground>,
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
}

impl LegacyService {
    /// Spawns the background task of the service.
    pub fn new<TPlat: PlatformRef>(config: Config<TPlat>) -> Self {
        let (to_background, from_frontend) = async_channel::bounded(32);
        let log_target = format!("legacy-{}", config.log_name);
        let connection = config.connection.clone();
        let task_platform = config.platform.clone();
        let headers_cache_size = config.headers_cache_size;

        config.platform.spawn_task(log_target.clone().into(), async move {
            let connection_events = connection.connection_events().await;
            let task = Background {
                platform: task_platform,
                log_target,
                connection,
                from_frontend,
                connection_events,
                connected: false,
                heads: None,
                retry: None,
                best: None,
                finalized: None,
                last_reported_best: None,
                last_reported_finalized: None,
                headers: lru::LruCache::with_hasher(headers_cache_size, Default::default()),
                block_subscribers: Vec::with_capacity(8),
                best_block_waiters: Vec::new(),
                finalized_block_waiters: Vec::new(),
            };
            run_background(task).await;
        });

        LegacyService {
            connection: config.connection,
            to_background,
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

    /// Returns the current best block. Waits until the service is initialized.
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

    /// Returns the current finalized block. Waits until the service is initialized.
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

    /// Returns the SCALE-encoded header of a block, or `None` if the server doesn't know it.
    pub async fn header(&self, block_hash: [u8; 32]) -> Result<Option<Vec<u8>>, OperationError> {
        Ok(fetch_header(&self.connection, block_hash)
            .await?
            .map(|header| header.scale_encoding_vec()))
    }

    /// Returns the list of SCALE-encoded extrinsics of a block.
    pub async fn body(&self, block_hash: [u8; 32]) -> Result<Vec<Vec<u8>>, OperationError> {
        let result = self
            .connection
            .request(
                methods::CHAIN_GET_BLOCK,
                format!("[{}]", to_json_string(&methods::HashHexString(block_hash))),
            )
            .await
            .map_err(OperationError::Request)?;

        match serde_json::from_str::<Option<methods::SignedBlock>>(&result) {
            Ok(Some(block)) => Ok(block
                .block
                .extrinsics
                .into_iter()
                .map(|extrinsic| extrinsic.0)
                .collect()),
            Ok(None) => Err(OperationError::BlockNotAvailable(block_hash)),
            Err(err) => Err(OperationError::InvalidResponse(err.to_string())),
        }
    }

    /// Calls a runtime function at a block and returns its output.
    pub async fn call(
        &self,
        block_hash: [u8; 32],
        function: &str,
        call_parameters: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        let params = format!(
            "[{},{},{}]",
            to_json_string(function),
            to_json_string(&methods::HexString(call_parameters.to_vec())),
            to_json_string(&methods::HashHexString(block_hash))
        );
        let result = self
            .connection
            .request(methods::STATE_CALL, params)
            .await
            .map_err(OperationError::Request)?;
        serde_json::from_str::<methods::HexString>(&result)
            .map(|output| output.0)
            .map_err(|err| OperationError::InvalidResponse(err.to_string()))
    }

    /// Reads the values of storage items at a block. The output is in the same order as the
    /// input. `None` means that there is no value.
    pub async fn storage_values(
        &self,
        block_hash: [u8; 32],
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, OperationError> {
        let hash_json = to_json_string(&methods::HashHexString(block_hash));
        let requests = keys.iter().map(|key| {
            let params = format!(
                "[{},{}]",
                to_json_string(&methods::HexString(key.clone())),
                hash_json
            );
            async move {
                let result = self
                    .connection
                    .request(methods::STATE_GET_STORAGE, params)
                    .await
                    .map_err(OperationError::Request)?;
                serde_json::from_str::<Option<methods::HexString>>(&result)
                    .map(|value| value.map(|v| v.0))
                    .map_err(|err| OperationError::InvalidResponse(err.to_string()))
            }
        });

        futures_util::future::join_all(requests)
            .await
            .into_iter()
            .collect()
    }

    /// Queries the storage of a block. Only [`methods::StorageQueryType::Value`] items are
    /// supported by the legacy API.
    pub async fn storage(
        &self,
        block_hash: [u8; 32],
        items: Vec<methods::StorageQueryItem>,
        child_trie: Option<&[u8]>,
    ) -> Result<Vec<methods::StorageResultItem>, OperationError> {
        if child_trie.is_some()
            || items
                .iter()
                .any(|item| item.ty != methods::StorageQueryType::Value)
        {
            return Err(OperationError::NotSupported);
        }

        let keys = items.into_iter().map(|item| item.key.0).collect::<Vec<_>>();
        let values = self.storage_values(block_hash, &keys).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| {
                Some(methods::StorageResultItem {
                    key: methods::HexString(key),
                    value: Some(methods::HexString(value?)),
                    hash: None,
                    closest_descendant_merkle_value: None,
                })
            })
            .collect())
    }

    /// Subscribes to the changes of the given storage items through `state_subscribeStorage`.
    /// The notifications are JSON-encoded [`methods::StorageChangeSet`]s.
    pub async fn subscribe_storage(
        &self,
        keys: &[Vec<u8>],
        buffer_size: usize,
    ) -> Result<Subscription, RequestError> {
        let keys = keys
            .iter()
            .map(|key| methods::HexString(key.clone()))
            .collect::<Vec<_>>();
        self.connection
            .subscribe(
                methods::STATE_SUBSCRIBE_STORAGE,
                format!("[{}]", to_json_string(&keys)),
                methods::STATE_UNSUBSCRIBE_STORAGE,
                buffer_size,
            )
            .await
    }
}

async fn fetch_header(
    connection: &JsonRpcConnection,
    block_hash: [u8; 32],
) -> Result<Option<methods::Header>, OperationError> {
    let result = connection
        .request(
            methods::CHAIN_GET_HEADER,
            format!("[{}]", to_json_string(&methods::HashHexString(block_hash))),
        )
        .await
        .map_err(OperationError::Request)?;
    serde_json::from_str::<Option<methods::Header>>(&result)
        .map_err(|err| OperationError::InvalidResponse(err.to_string()))
}

struct Background<TPlat: PlatformRef> {
    platform: TPlat,
    log_target: String,
    connection: JsonRpcConnection,

    from_frontend: async_channel::Receiver<ToBackground>,
    connection_events: async_channel::Receiver<ConnectionEvent>,

    connected: bool,

    /// Subscriptions to the new heads and to the finalized heads. `None` if not initialized.
    heads: Option<(Subscription, Subscription)>,

    /// If `Some`, the initialization must be attempted again when the delay is over.
    retry: Option<Pin<Box<TPlat::Delay>>>,

    /// Current best block. `None` if not initialized.
    best: Option<Block>,
    /// Current finalized block. `None` if not initialized.
    finalized: Option<Block>,

    /// Preserved across reconnections.
    last_reported_best: Option<[u8; 32]>,
    last_reported_finalized: Option<([u8; 32], u64)>,

    /// Recent blocks, indexed by hash.
    headers: lru::LruCache<[u8; 32], Block, fnv::FnvBuildHasher>,

    block_subscribers: Vec<async_channel::Sender<BlockEvent>>,
    best_block_waiters: Vec<oneshot::Sender<Block>>,
    finalized_block_waiters: Vec<oneshot::Sender<Block>>,
}

#[derive(Debug, derive_more::Display)]
enum InitError {
    #[display("{_0}")]
    Request(RequestError),
    #[display("{_0}")]
    Operation(OperationError),
    #[display("unknown block")]
    UnknownBlock,
    #[display("finalized block doesn't descend from the previous finalized block")]
    FinalizedNotDescendant,
    #[display("invalid response: {_0}")]
    InvalidResponse(serde_json::Error),
}

async fn run_background<TPlat: PlatformRef>(mut task: Background<TPlat>) {
    loop {
        if task.connected && task.heads.is_none() && task.retry.is_none() {
            match task.initialize().await {
                Ok(()) => {}
                Err(error) => {
                    log!(
                        &task.platform,
                        Warn,
                        &task.log_target,
                        "initialization-failed",
                        error
                    );
                    task.retry = Some(Box::pin(task.platform.sleep(INITIALIZATION_RETRY_DELAY)));
                }
            }
        }

        enum WakeUpReason {
            NewHead(Option<String>),
            FinalizedHead(Option<String>),
            Retry,
            Frontend(ToBackground),
            FrontendClosed,
            Connection(ConnectionEvent),
        }

        let wake_up_reason = {
            let heads = &mut task.heads;
            let retry = &mut task.retry;
            let from_frontend = &task.from_frontend;
            let connection_events = &task.connection_events;

            async move {
                match heads {
                    Some((new_heads, finalized_heads)) => {
                        async { WakeUpReason::FinalizedHead(finalized_heads.next().await) }
                            .or(async { WakeUpReason::NewHead(new_heads.next().await) })
                            .await
                    }
                    None => future::pending().await,
                }
            }
            .or(async move {
                match connection_events.recv().await {
                    Ok(event) => WakeUpReason::Connection(event),
                    Err(_) => future::pending().await,
                }
            })
            .or(async move {
                match retry {
                    Some(retry) => {
                        retry.as_mut().await;
                        WakeUpReason::Retry
                    }
                    None => future::pending().await,
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

            WakeUpReason::NewHead(Some(notification)) => {
                match serde_json::from_str::<methods::Header>(&notification) {
                    Ok(header) => task.on_new_head(header),
                    Err(err) => task.reset(&format!("invalid new head: {err}")),
                }
            }

            WakeUpReason::FinalizedHead(Some(notification)) => {
                match serde_json::from_str::<methods::Header>(&notification) {
                    Ok(header) => {
                        if let Err(err) = task.on_finalized_head(header).await {
                            task.reset(&err.to_string());
                        }
                    }
                    Err(err) => task.reset(&format!("invalid finalized head: {err}")),
                }
            }

            WakeUpReason::NewHead(None) | WakeUpReason::FinalizedHead(None) => {
                task.reset("subscription closed");
            }

            WakeUpReason::Retry => task.retry = None,

            WakeUpReason::Connection(ConnectionEvent::Connected) => {
                task.connected = true;
                task.retry = None;
            }

            WakeUpReason::Connection(ConnectionEvent::Disconnected) => {
                task.connected = false;
                task.reset("disconnected");
            }

            WakeUpReason::Connection(_) => {}

            WakeUpReason::Frontend(ToBackground::SubscribeBlocks {
                events_tx,
                registered_tx,
            }) => {
                task.block_subscribers.push(events_tx);
                let _ = registered_tx.send(());
            }

            WakeUpReason::Frontend(ToBackground::BestBlock { result_tx }) => {
                match (&task.heads, &task.best) {
                    (Some(_), Some(best)) => {
                        let _ = result_tx.send(best.clone());
                    }
                    _ => task.best_block_waiters.push(result_tx),
                }
            }

            WakeUpReason::Frontend(ToBackground::FinalizedBlock { result_tx }) => {
                match (&task.heads, &task.finalized) {
                    (Some(_), Some(finalized)) => {
                        let _ = result_tx.send(finalized.clone());
                    }
                    _ => task.finalized_block_waiters.push(result_tx),
                }
            }
        }
    }
}

impl<TPlat: PlatformRef> Background<TPlat> {
    async fn initialize(&mut self) -> Result<(), InitError> {
        let new_heads = self
            .connection
            .subscribe(
                methods::CHAIN_SUBSCRIBE_NEW_HEADS,
                "[]".to_owned(),
                methods::CHAIN_UNSUBSCRIBE_NEW_HEADS,
                HEADS_NOTIFICATIONS_BUFFER,
            )
            .await
            .map_err(InitError::Request)?;
        let finalized_heads = self
            .connection
            .subscribe(
                methods::CHAIN_SUBSCRIBE_FINALIZED_HEADS,
                "[]".to_owned(),
                methods::CHAIN_UNSUBSCRIBE_FINALIZED_HEADS,
                HEADS_NOTIFICATIONS_BUFFER,
            )
            .await
            .map_err(InitError::Request)?;

        let finalized_hash = self
            .connection
            .request(methods::CHAIN_GET_FINALIZED_HEAD, "[]".to_owned())
            .await
            .map_err(InitError::Request)?;
        let finalized_hash = serde_json::from_str::<methods::HashHexString>(&finalized_hash)
            .map_err(InitError::InvalidResponse)?;
        let finalized = self.block(finalized_hash.0).await?;

        let best_hash = self
            .connection
            .request(methods::CHAIN_GET_BLOCK_HASH, "[]".to_owned())
            .await
            .map_err(InitError::Request)?;
        let best_hash = serde_json::from_str::<methods::HashHexString>(&best_hash)
            .map_err(InitError::InvalidResponse)?;
        let best = self.block(best_hash.0).await?;

        log!(
            &self.platform,
            Debug,
            &self.log_target,
            "initialized",
            best = HashDisplay(&best.hash),
            finalized = HashDisplay(&finalized.hash)
        );

        // The best block is normally a descendant of the finalized block, but the two requests
        // above aren't atomic.
        let best = if best.number < finalized.number {
            finalized.clone()
        } else {
            best
        };

        // Blocks finalized while disconnected are reported from the oldest to the newest.
        let newly_finalized = match self.last_reported_finalized {
            Some((hash, _)) if hash == finalized.hash => Vec::new(),
            Some((_, number))
                if number < finalized.number
                    && finalized.number - number <= MAX_FINALIZED_CATCH_UP =>
            {
                self.finalized_chain(finalized.clone(), number).await?
            }
            _ => Vec::from([finalized.clone()]),
        };

        self.heads = Some((new_heads, finalized_heads));
        self.best = Some(best.clone());
        self.finalized = Some(finalized.clone());

        let mut events = Vec::with_capacity(newly_finalized.len() + 1);
        if self.last_reported_best != Some(best.hash) {
            self.last_reported_best = Some(best.hash);
            events.push(BlockEvent::BestBlock(best.clone()));
        }
        self.last_reported_finalized = Some((finalized.hash, finalized.number));
        events.extend(newly_finalized.into_iter().map(BlockEvent::FinalizedBlock));
        self.dispatch(events);

        for waiter in self.best_block_waiters.drain(..) {
            let _ = waiter.send(best.clone());
        }
        for waiter in self.finalized_block_waiters.drain(..) {
            let _ = waiter.send(finalized.clone());
        }

        Ok(())
    }

    /// Returns the block with the given hash, from the cache or from the server.
    async fn block(&mut self, hash: [u8; 32]) -> Result<Block, InitError> {
        if let Some(block) = self.headers.get(&hash) {
            return Ok(block.clone());
        }

        let header = fetch_header(&self.connection, hash)
            .await
            .map_err(InitError::Operation)?
            .ok_or(InitError::UnknownBlock)?;
        let block = Block {
            hash,
            number: header.number,
            parent_hash: Some(header.parent_hash.0),
            runtime: None,
        };
        self.headers.put(hash, block.clone());
        Ok(block)
    }

    fn on_new_head(&mut self, header: methods::Header) {
        let block = Block {
            hash: header.hash(),
            number: header.number,
            parent_hash: Some(header.parent_hash.0),
            runtime: None,
        };

        let mut events = Vec::with_capacity(3);
        if self.headers.put(block.hash, block.clone()).is_none() {
            events.push(BlockEvent::NewBlock(block.clone()));
        }

        let previous_best = self.best.as_ref().map(|b| b.hash);
        if previous_best != Some(block.hash) {
            let chain_changed = previous_best.map_or(false, |previous| {
                !self.is_strict_descendant(&block.hash, &previous)
            });

            self.best = Some(block.clone());
            self.last_reported_best = Some(block.hash);
            events.push(BlockEvent::BestBlock(block.clone()));
            if chain_changed {
                events.push(BlockEvent::BestChainChanged(block));
            }
        }

        self.dispatch(events);
    }

    async fn on_finalized_head(&mut self, header: methods::Header) -> Result<(), InitError> {
        let Some(previous) = self.finalized.clone() else {
            return Ok(());
        };
        if header.number <= previous.number {
            return Ok(());
        }

        let newest = Block {
            hash: header.hash(),
            number: header.number,
            parent_hash: Some(header.parent_hash.0),
            runtime: None,
        };
        self.headers.put(newest.hash, newest.clone());

        let chain = self.finalized_chain(newest, previous.number).await?;
        if chain.first().and_then(|b| b.parent_hash) != Some(previous.hash) {
            log!(
                &self.platform,
                Warn,
                &self.log_target,
                "finalized-not-descendant",
                previous = HashDisplay(&previous.hash)
            );
            return Err(InitError::FinalizedNotDescendant);
        }

        let mut events = Vec::with_capacity(chain.len() + 1);
        for block in chain {
            self.last_reported_finalized = Some((block.hash, block.number));
            self.finalized = Some(block.clone());
            events.push(BlockEvent::FinalizedBlock(block));
        }

        // The best block must always descend from the finalized block.
        if let (Some(best), Some(finalized)) = (self.best.clone(), self.finalized.clone()) {
            if best.number <= finalized.number && best.hash != finalized.hash {
                let chain_changed = !self.is_strict_descendant(&finalized.hash, &best.hash);
                self.best = Some(finalized.clone());
                self.last_reported_best = Some(finalized.hash);
                events.push(BlockEvent::BestBlock(finalized.clone()));
                if chain_changed {
                    events.push(BlockEvent::BestChainChanged(finalized));
                }
            }
        }

        self.dispatch(events);
        Ok(())
    }

    /// Returns `newest` and its ancestors down to the block whose number is
    /// `previous_number + 1`, from the oldest to the newest.
    async fn finalized_chain(
        &mut self,
        newest: Block,
        previous_number: u64,
    ) -> Result<Vec<Block>, InitError> {
        let mut chain = Vec::from([newest]);
        loop {
            let oldest = &chain[chain.len() - 1];
            if oldest.number <= previous_number + 1 {
                break;
            }
            let Some(parent_hash) = oldest.parent_hash else {
                break;
            };
            let parent = self.block(parent_hash).await?;
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Returns `true` if `block` is a strict descendant of `ancestor`, by walking the parents
    /// of `block` through the cache. Returns `false` if the cache doesn't contain enough
    /// blocks.
    fn is_strict_descendant(&self, block: &[u8; 32], ancestor: &[u8; 32]) -> bool {
        let Some(ancestor_number) = self.headers.peek(ancestor).map(|b| b.number) else {
            return false;
        };

        let mut current = *block;
        loop {
            let Some(entry) = self.headers.peek(&current) else {
                return false;
            };
            if entry.number <= ancestor_number {
                return false;
            }
            match entry.parent_hash {
                Some(parent) if parent == *ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    fn dispatch(&mut self, events: Vec<BlockEvent>) {
        for event in events {
            self.block_subscribers
                .retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    /// Drops the subscriptions. The service initializes itself again once connected.
    fn reset(&mut self, reason: &str) {
        if self.heads.is_none() {
            return;
        }

        log!(&self.platform, Debug, &self.log_target, "reset", reason);
        self.heads = None;
        self.best = None;
        self.finalized = None;
    }
}
