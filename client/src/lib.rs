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

//! Client of the JSON-RPC API of Substrate-based blockchains.
//!
//! This crate builds on top of the state machines of the `chain-head` crate and connects them
//! to a JSON-RPC server through a [`transport::Transport`]. All the work happens in background
//! tasks spawned through a [`platform::PlatformRef`].
//!
//! # Usage
//!
//! Create a [`Client`] by passing a [`Config`]. The client follows the chain as soon as the
//! transport reports that it is connected, and reconnects transparently.
//!
//! - [`Client::subscribe_blocks`] reports the new blocks and the changes of best and finalized
//!   blocks.
//! - [`Client::query`] and [`Client::subscribe_storage`] read the storage of the chain, and
//!   [`Client::query_multi`] and [`Client::subscribe_multi`] do the same while decoding the
//!   values through a [`storage::StorageDescriptor`].
//! - [`Client::submit_and_watch`] and [`Client::send`] submit a transaction and follow its
//!   inclusion in the chain.
//!
//! The `chainHead_v1_*` JSON-RPC functions are used by default. Servers that don't support them
//! can be accessed with [`JsonRpcVersion::Legacy`].
//!

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use ::chain_head::{follow, json_rpc::methods};
use core::{num::NonZeroUsize, time::Duration};

pub mod chain_head;
pub mod json_rpc_connection;
pub mod legacy;
pub mod platform;
pub mod storage;
pub mod transactions;
pub mod transport;

pub use json_rpc_connection::{ConnectionEvent, RequestError};

/// Emits a log line through a [`platform::PlatformRef`].
///
/// ```ignore
/// log!(&platform, Debug, &log_target, "message", key = value, other_key);
/// ```
///
/// Parameters passed without a value are logged under their own name.
#[macro_export]
macro_rules! log {
    (@kv $ctx:tt [$($acc:tt)*] $key:ident = $value:expr $(, $($rest:tt)*)?) => {
        $crate::log!(@kv $ctx [$($acc)* (stringify!($key), &$value as &dyn ::core::fmt::Display),] $($($rest)*)?)
    };
    (@kv $ctx:tt [$($acc:tt)*] $key:ident $(, $($rest:tt)*)?) => {
        $crate::log!(@kv $ctx [$($acc)* (stringify!($key), &$key as &dyn ::core::fmt::Display),] $($($rest)*)?)
    };
    (@kv [$plat:expr, $level:ident, $target:expr, $message:expr] [$($acc:tt)*]) => {
        $crate::platform::PlatformRef::log(
            $plat,
            $crate::platform::LogLevel::$level,
            $target,
            ::core::convert::AsRef::<str>::as_ref(&$message),
            &[$($acc)*],
        )
    };
    ($plat:expr, $level:ident, $target:expr, $message:expr $(, $($rest:tt)*)?) => {
        $crate::log!(@kv [$plat, $level, $target, $message] [] $($($rest)*)?)
    };
}

/// Block reported by the client.
pub type Block = follow::PinnedBlock<Arc<methods::MaybeRuntimeSpec>>;

/// Event concerning the blocks of the chain. See [`Client::subscribe_blocks`].
pub type BlockEvent = follow::BlockEvent<Arc<methods::MaybeRuntimeSpec>>;

/// Configuration for a new [`Client`].
pub struct Config<TPlat> {
    /// Access to the platform's capabilities.
    pub platform: TPlat,

    /// Name of the chain, used in the log targets.
    pub log_name: String,

    /// Channels connected to the JSON-RPC server.
    pub transport: transport::Transport,

    /// Set of JSON-RPC functions to use.
    pub json_rpc_version: JsonRpcVersion,

    /// If `true`, the runtime of each block is reported in [`Block::runtime`]. Ignored with
    /// [`JsonRpcVersion::Legacy`].
    pub with_runtime: bool,

    /// Number of finalized blocks, including the current finalized block, that stay pinned.
    /// Ignored with [`JsonRpcVersion::Legacy`].
    pub finalized_blocks_retention: usize,

    /// Maximum duration of a `chainHead_v1_body`, `chainHead_v1_call` or `chainHead_v1_storage`
    /// operation. `None` for no limit.
    pub operation_timeout: Option<Duration>,

    /// Capacity of the channels returned by [`Client::subscribe_blocks`].
    pub block_events_buffer: usize,
}

/// Set of JSON-RPC functions used by the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JsonRpcVersion {
    /// `chainHead_v1_*` and `transaction_v1_*`.
    ChainHeadV1,
    /// `chain_*`, `state_*` and `author_*`.
    Legacy,
}

/// Error potentially returned when querying a block.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum OperationError {
    /// The block isn't pinned, or is being unpinned.
    #[display("Block 0x{} isn't available", hex::encode(_0))]
    BlockNotAvailable(#[error(not(source))] [u8; 32]),
    /// The server refuses to start more operations at the moment.
    #[display("Server has reached its limit of operations")]
    LimitReached,
    /// The server has reported an error.
    #[display("Operation failed: {_0}")]
    Operation(#[error(not(source))] String),
    /// The server couldn't access the requested information. The operation can be retried.
    #[display("Server couldn't access the requested information")]
    Inaccessible,
    /// The follow subscription has been reset while the operation was in progress.
    #[display("Follow subscription has been reset")]
    SubscriptionReset,
    /// The operation didn't finish in time.
    #[display("Operation timed out")]
    Timeout,
    /// The request can't be expressed with the JSON-RPC functions in use.
    #[display("Operation isn't supported by the server")]
    NotSupported,
    /// Failed to send a request.
    #[display("{_0}")]
    Request(RequestError),
    /// The server has sent a response that can't be interpreted.
    #[display("Invalid response from the server: {_0}")]
    InvalidResponse(#[error(not(source))] String),
}

/// Client connected to a JSON-RPC server.
pub struct Client<TPlat: platform::PlatformRef> {
    platform: TPlat,
    log_name: String,
    connection: json_rpc_connection::JsonRpcConnection,
    backend: Backend<TPlat>,
}

/// Number of recent headers kept in cache by the legacy backend.
const LEGACY_HEADERS_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

impl<TPlat: platform::PlatformRef> Client<TPlat> {
    /// Spawns the background tasks of the client.
    pub fn new(config: Config<TPlat>) -> Self {
        let connection =
            json_rpc_connection::JsonRpcConnection::new(json_rpc_connection::Config {
                platform: config.platform.clone(),
                log_name: config.log_name.clone(),
                transport: config.transport,
            });

        let backend = match config.json_rpc_version {
            JsonRpcVersion::ChainHeadV1 => Backend::ChainHead(Arc::new(
                crate::chain_head::ChainHeadService::new(crate::chain_head::Config {
                    platform: config.platform.clone(),
                    log_name: config.log_name.clone(),
                    connection: connection.clone(),
                    with_runtime: config.with_runtime,
                    finalized_blocks_retention: config.finalized_blocks_retention,
                    operation_timeout: config.operation_timeout,
                    block_events_buffer: config.block_events_buffer,
                }),
            )),
            JsonRpcVersion::Legacy => {
                Backend::Legacy(Arc::new(legacy::LegacyService::new(legacy::Config {
                    platform: config.platform.clone(),
                    log_name: config.log_name.clone(),
                    connection: connection.clone(),
                    block_events_buffer: config.block_events_buffer,
                    headers_cache_size: LEGACY_HEADERS_CACHE_SIZE,
                })))
            }
        };

        log!(
            &config.platform,
            Debug,
            &config.log_name,
            "client-started",
            json_rpc_version = match config.json_rpc_version {
                JsonRpcVersion::ChainHeadV1 => "chainHead_v1",
                JsonRpcVersion::Legacy => "legacy",
            }
        );

        Client {
            platform: config.platform,
            log_name: config.log_name,
            connection,
            backend,
        }
    }

    /// Returns the set of JSON-RPC functions in use.
    pub fn json_rpc_version(&self) -> JsonRpcVersion {
        match self.backend {
            Backend::ChainHead(_) => JsonRpcVersion::ChainHeadV1,
            Backend::Legacy(_) => JsonRpcVersion::Legacy,
        }
    }

    /// Returns a channel that receives the lifecycle events of the connection.
    pub async fn connection_events(&self) -> async_channel::Receiver<ConnectionEvent> {
        self.connection.connection_events().await
    }

    /// Returns a channel that receives the [`BlockEvent`]s, in order. All the events that happen
    /// after this function has returned are delivered.
    ///
    /// The subscription survives reconnections. After a reconnection, a
    /// [`BlockEvent::BestBlock`] is reported if the best block differs from the last reported
    /// one, and the blocks finalized in the meantime are reported as
    /// [`BlockEvent::FinalizedBlock`]s.
    ///
    /// The channel is closed if it is full when an event must be delivered. Dropping the
    /// receiver unsubscribes.
    pub async fn subscribe_blocks(&self) -> async_channel::Receiver<BlockEvent> {
        self.backend.subscribe_blocks().await
    }

    /// Returns the current best block. Waits until the client is connected and initialized.
    pub async fn best_block(&self) -> Result<Block, OperationError> {
        self.backend.best_block().await
    }

    /// Returns the current finalized block. Waits until the client is connected and
    /// initialized.
    pub async fn finalized_block(&self) -> Result<Block, OperationError> {
        self.backend.finalized_block().await
    }

    /// Returns the SCALE-encoded header of a block, or `None` if the server doesn't know it.
    pub async fn block_header(
        &self,
        block_hash: [u8; 32],
    ) -> Result<Option<Vec<u8>>, OperationError> {
        self.backend.header(block_hash).await
    }

    /// Returns the list of SCALE-encoded extrinsics of a block.
    pub async fn block_body(&self, block_hash: [u8; 32]) -> Result<Vec<Vec<u8>>, OperationError> {
        self.backend.body(block_hash).await
    }

    /// Calls a runtime function at a block and returns its output.
    pub async fn runtime_call(
        &self,
        block_hash: [u8; 32],
        function: &str,
        call_parameters: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        self.backend
            .call(block_hash, function, call_parameters)
            .await
    }

    /// Queries the storage of a block with arbitrary query items.
    ///
    /// The legacy JSON-RPC API only supports [`methods::StorageQueryType::Value`] items in the
    /// main trie.
    pub async fn storage(
        &self,
        block_hash: [u8; 32],
        items: Vec<methods::StorageQueryItem>,
        child_trie: Option<&[u8]>,
    ) -> Result<Vec<methods::StorageResultItem>, OperationError> {
        match &self.backend {
            Backend::ChainHead(service) => service.storage(block_hash, items, child_trie).await,
            Backend::Legacy(service) => service.storage(block_hash, items, child_trie).await,
        }
    }
}

/// Services doing the actual work. Cloned into the tasks of the storage subscriptions and of
/// the transaction watches.
enum Backend<TPlat> {
    ChainHead(Arc<crate::chain_head::ChainHeadService<TPlat>>),
    Legacy(Arc<legacy::LegacyService>),
}

impl<TPlat> Clone for Backend<TPlat> {
    fn clone(&self) -> Self {
        match self {
            Backend::ChainHead(service) => Backend::ChainHead(service.clone()),
            Backend::Legacy(service) => Backend::Legacy(service.clone()),
        }
    }
}

impl<TPlat: platform::PlatformRef> Backend<TPlat> {
    async fn subscribe_blocks(&self) -> async_channel::Receiver<BlockEvent> {
        match self {
            Backend::ChainHead(service) => service.subscribe_blocks().await,
            Backend::Legacy(service) => service.subscribe_blocks().await,
        }
    }

    async fn best_block(&self) -> Result<Block, OperationError> {
        match self {
            Backend::ChainHead(service) => service.best_block().await,
            Backend::Legacy(service) => service.best_block().await,
        }
    }

    async fn finalized_block(&self) -> Result<Block, OperationError> {
        match self {
            Backend::ChainHead(service) => service.finalized_block().await,
            Backend::Legacy(service) => service.finalized_block().await,
        }
    }

    async fn header(&self, block_hash: [u8; 32]) -> Result<Option<Vec<u8>>, OperationError> {
        match self {
            Backend::ChainHead(service) => service.header(block_hash).await,
            Backend::Legacy(service) => service.header(block_hash).await,
        }
    }

    async fn body(&self, block_hash: [u8; 32]) -> Result<Vec<Vec<u8>>, OperationError> {
        match self {
            Backend::ChainHead(service) => service.body(block_hash).await,
            Backend::Legacy(service) => service.body(block_hash).await,
        }
    }

    async fn call(
        &self,
        block_hash: [u8; 32],
        function: &str,
        call_parameters: &[u8],
    ) -> Result<Vec<u8>, OperationError> {
        match self {
            Backend::ChainHead(service) => {
                service.call(block_hash, function, call_parameters).await
            }
            Backend::Legacy(service) => service.call(block_hash, function, call_parameters).await,
        }
    }

    /// Reads the values of storage items at a block. The output is in the same order as the
    /// input, and `None` means that there is no value.
    async fn storage_values(
        &self,
        block_hash: [u8; 32],
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Vec<u8>>>, OperationError> {
        match self {
            Backend::ChainHead(service) => {
                let items = keys
                    .iter()
                    .map(|key| methods::StorageQueryItem {
                        key: methods::HexString(key.clone()),
                        ty: methods::StorageQueryType::Value,
                    })
                    .collect();
                let results = service.storage(block_hash, items, None).await?;

                let mut values = hashbrown::HashMap::<_, _, fnv::FnvBuildHasher>::with_capacity_and_hasher(
                    results.len(),
                    Default::default(),
                );
                for item in results {
                    if let Some(value) = item.value {
                        values.insert(item.key.0, value.0);
                    }
                }

                Ok(keys.iter().map(|key| values.get(key).cloned()).collect())
            }
            Backend::Legacy(service) => service.storage_values(block_hash, keys).await,
        }
    }
}

/// Serializes a value that can't fail to be serialized.
pub(crate) fn to_json_string<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| unreachable!())
}
