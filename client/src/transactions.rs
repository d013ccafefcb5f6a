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

//! Submitting transactions and following their inclusion in the chain.
//!
//! A transaction is first validated against the current best block with the
//! `TaggedTransactionQueue_validate_transaction` runtime function. If valid, it is broadcast
//! (`transaction_v1_broadcast`, or `author_submitAndWatchExtrinsic` with the legacy functions),
//! then a background task looks for it in the body of every new best block and every newly
//! finalized block.
//!
//! The status reported by the server through `author_extrinsicUpdate` isn't used. The blocks
//! are the only source of truth, which makes both sets of JSON-RPC functions behave the same.

use crate::{
    json_rpc_connection::{RequestError, Subscription},
    log,
    platform::PlatformRef,
    to_json_string, Backend, BlockEvent, Client, OperationError,
};

use alloc::{format, string::String, vec::Vec};
use chain_head::{
    informant::HashDisplay,
    json_rpc::methods,
    transactions::{
        validate::{self, TransactionSource, TransactionValidityError},
        watch::{self, TransactionWatch},
    },
};
use core::future;
use futures_channel::oneshot;
use futures_lite::FutureExt as _;

pub use crate::storage::DecodeError;

/// Storage key of the `System.Events` storage item, which contains the events of all the
/// extrinsics of a block.
pub const SYSTEM_EVENTS_KEY: [u8; 32] = [
    0x26, 0xaa, 0x39, 0x4e, 0xea, 0x56, 0x30, 0xe0, 0x7c, 0x48, 0xae, 0x0c, 0x95, 0x58, 0xce, 0xf7,
    0x80, 0xd4, 0x1e, 0x5e, 0x16, 0x05, 0x67, 0x65, 0xbc, 0x84, 0x61, 0x85, 0x10, 0x72, 0xc9, 0xd7,
];

/// Number of `author_extrinsicUpdate` notifications that can be buffered.
const LEGACY_UPDATES_BUFFER: usize = 16;

/// Extracts the events of a specific extrinsic from the `System.Events` storage item.
///
/// Implemented by the API user, typically on top of the metadata of the chain.
pub trait EventsDecoder: Send + Sync + 'static {
    /// Events of one extrinsic.
    type Events: Send + 'static;

    /// Decodes the events of the extrinsic found at `extrinsic_index` in the block body.
    /// `system_events` is `None` if the storage item has no value.
    fn decode_events(
        &self,
        system_events: Option<&[u8]>,
        extrinsic_index: u32,
    ) -> Result<Self::Events, DecodeError>;
}

/// Status of a transaction reported by a [`TransactionWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus<E> {
    /// The transaction has been validated and broadcast. Always the first status.
    Validated,
    /// The transaction has been found in a block of the best chain. Reported at most once.
    BestChainBlockIncluded {
        /// Hash of the block containing the transaction.
        block_hash: [u8; 32],
        /// Index of the transaction within the body of the block.
        index: u32,
        /// Events generated by the transaction.
        events: Result<E, EventsError>,
    },
    /// The transaction has been found in a finalized block. Always the last status.
    Finalized {
        /// Hash of the block containing the transaction.
        block_hash: [u8; 32],
        /// Index of the transaction within the body of the block.
        index: u32,
        /// Events generated by the transaction.
        events: Result<E, EventsError>,
    },
}

/// Failed to obtain the events of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum EventsError {
    /// Failed to read `System.Events`.
    #[display("Failed to fetch the events: {_0}")]
    Fetch(OperationError),
    /// Failed to decode `System.Events`.
    #[display("{_0}")]
    Decode(DecodeError),
}

/// Error potentially returned by [`Client::submit_and_watch`] and [`Client::send`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum SubmitError {
    /// The runtime considers the transaction as invalid.
    #[display("{_0}")]
    Invalid(TransactionValidityError),
    /// The output of the validation runtime call couldn't be decoded.
    #[display("{_0}")]
    ValidationDecode(validate::DecodeError),
    /// Failed to validate the transaction.
    #[display("Validation failed: {_0}")]
    Operation(OperationError),
    /// Failed to broadcast the transaction.
    #[display("Broadcast failed: {_0}")]
    Broadcast(RequestError),
    /// The watch has ended before the transaction was included in a block.
    #[display("Transaction watch ended before inclusion")]
    WatchEnded,
}

/// Transaction being watched, returned by [`Client::submit_and_watch`].
///
/// Dropping this object stops the broadcast of the transaction.
pub struct TransactionWatcher<E> {
    statuses: async_channel::Receiver<TransactionStatus<E>>,
    /// Dropping this sender stops the background task.
    _stop: oneshot::Sender<()>,
}

impl<E> TransactionWatcher<E> {
    /// Waits for the next status. Returns `None` once [`TransactionStatus::Finalized`] has
    /// been returned, or if the client is gone.
    pub async fn next(&mut self) -> Option<TransactionStatus<E>> {
        self.statuses.recv().await.ok()
    }
}

impl<TPlat: PlatformRef> Client<TPlat> {
    /// Validates the transaction at the current best block, broadcasts it, and watches the
    /// chain for its inclusion.
    ///
    /// `transaction` is the SCALE-encoded transaction.
    pub async fn submit_and_watch<D: EventsDecoder>(
        &self,
        transaction: Vec<u8>,
        decoder: D,
    ) -> Result<TransactionWatcher<D::Events>, SubmitError> {
        let log_target = format!("tx-{}", self.log_name);

        let best_block = self
            .backend
            .best_block()
            .await
            .map_err(SubmitError::Operation)?;
        let validation_output = self
            .backend
            .call(
                best_block.hash,
                validate::VALIDATION_FUNCTION_NAME,
                &validate::validate_transaction_runtime_parameters_v3(
                    &transaction,
                    TransactionSource::External,
                    &best_block.hash,
                ),
            )
            .await
            .map_err(SubmitError::Operation)?;
        match validate::decode_validate_transaction_return_value(&validation_output) {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                log!(
                    &self.platform,
                    Debug,
                    &log_target,
                    "invalid",
                    block = HashDisplay(&best_block.hash),
                    error
                );
                return Err(SubmitError::Invalid(error));
            }
            Err(error) => return Err(SubmitError::ValidationDecode(error)),
        }

        // Subscribing before the broadcast guarantees that no block containing the transaction
        // is missed.
        let blocks = self.backend.subscribe_blocks().await;

        let params = format!(
            "[{}]",
            to_json_string(&methods::HexString(transaction.clone()))
        );
        let broadcast = match &self.backend {
            Backend::ChainHead(_) => {
                let response = self
                    .connection
                    .request(methods::TRANSACTION_BROADCAST, params)
                    .await
                    .map_err(SubmitError::Broadcast)?;
                match serde_json::from_str::<Option<String>>(&response) {
                    Ok(operation_id) => Broadcast::ChainHead { operation_id },
                    Err(error) => {
                        return Err(SubmitError::Broadcast(RequestError::InvalidResponse(
                            format!("{error}"),
                        )))
                    }
                }
            }
            Backend::Legacy(_) => Broadcast::Legacy {
                subscription: Some(
                    self.connection
                        .subscribe(
                            methods::AUTHOR_SUBMIT_AND_WATCH_EXTRINSIC,
                            params,
                            methods::AUTHOR_UNWATCH_EXTRINSIC,
                            LEGACY_UPDATES_BUFFER,
                        )
                        .await
                        .map_err(SubmitError::Broadcast)?,
                ),
            },
        };

        let watch = TransactionWatch::new(&transaction);
        log!(
            &self.platform,
            Debug,
            &log_target,
            "broadcast",
            transaction = HashDisplay(watch.transaction_hash())
        );

        let (statuses_tx, statuses) = async_channel::unbounded();
        let _ = statuses_tx.try_send(TransactionStatus::Validated);
        let (stop_tx, stop_rx) = oneshot::channel();

        self.platform.spawn_task(
            log_target.clone().into(),
            run_watch(WatchTask {
                platform: self.platform.clone(),
                log_target,
                backend: self.backend.clone(),
                connection: self.connection.clone(),
                blocks,
                broadcast,
                watch,
                decoder,
                statuses_tx,
                stop_rx,
            }),
        );

        Ok(TransactionWatcher {
            statuses,
            _stop: stop_tx,
        })
    }

    /// Same as [`Client::submit_and_watch`], but resolves as soon as the transaction has been
    /// included in a block, either of the best chain or finalized.
    ///
    /// The returned status is either [`TransactionStatus::BestChainBlockIncluded`] or
    /// [`TransactionStatus::Finalized`].
    pub async fn send<D: EventsDecoder>(
        &self,
        transaction: Vec<u8>,
        decoder: D,
    ) -> Result<TransactionStatus<D::Events>, SubmitError> {
        let mut watcher = self.submit_and_watch(transaction, decoder).await?;
        loop {
            match watcher.next().await {
                Some(TransactionStatus::Validated) => {}
                Some(status) => return Ok(status),
                None => return Err(SubmitError::WatchEnded),
            }
        }
    }
}

enum Broadcast {
    ChainHead {
        /// `None` if the server has refused to broadcast the transaction.
        operation_id: Option<String>,
    },
    Legacy {
        /// Dropping the subscription sends `author_unwatchExtrinsic`.
        subscription: Option<Subscription>,
    },
}

struct WatchTask<TPlat, D: EventsDecoder> {
    platform: TPlat,
    log_target: String,
    backend: Backend<TPlat>,
    connection: crate::json_rpc_connection::JsonRpcConnection,
    blocks: async_channel::Receiver<BlockEvent>,
    broadcast: Broadcast,
    watch: TransactionWatch,
    decoder: D,
    statuses_tx: async_channel::Sender<TransactionStatus<D::Events>>,
    stop_rx: oneshot::Receiver<()>,
}

async fn run_watch<TPlat: PlatformRef, D: EventsDecoder>(mut task: WatchTask<TPlat, D>) {
    loop {
        enum WakeUpReason {
            Stop,
            BlockEvent(Option<BlockEvent>),
            LegacyUpdate(Option<String>),
        }

        let wake_up_reason = {
            let stop_rx = &mut task.stop_rx;
            let blocks = &task.blocks;
            let legacy_subscription = match &mut task.broadcast {
                Broadcast::Legacy { subscription } => subscription.as_mut(),
                Broadcast::ChainHead { .. } => None,
            };

            async move {
                let _ = stop_rx.await;
                WakeUpReason::Stop
            }
            .or(async move { WakeUpReason::BlockEvent(blocks.recv().await.ok()) })
            .or(async move {
                match legacy_subscription {
                    Some(subscription) => WakeUpReason::LegacyUpdate(subscription.next().await),
                    None => future::pending().await,
                }
            })
            .await
        };

        match wake_up_reason {
            WakeUpReason::Stop => {
                log!(&task.platform, Debug, &task.log_target, "watch-dropped");
                break;
            }

            WakeUpReason::BlockEvent(Some(BlockEvent::BestBlock(block))) => {
                let Some(body) = task.fetch_body(block.hash).await else {
                    continue;
                };
                if let Some(status) = task.watch.best_block_body(block.hash, &body) {
                    task.report(status).await;
                }
            }

            WakeUpReason::BlockEvent(Some(BlockEvent::FinalizedBlock(block))) => {
                let Some(body) = task.fetch_body(block.hash).await else {
                    continue;
                };
                for status in task.watch.finalized_block_body(block.hash, &body) {
                    task.report(status).await;
                }
                if task.watch.is_finished() {
                    break;
                }
            }

            WakeUpReason::BlockEvent(Some(_)) => {}

            WakeUpReason::BlockEvent(None) => {
                // The channel is closed if it was full. Blocks that were in the channel are
                // lost, and the current best and finalized blocks are inspected instead.
                log!(&task.platform, Debug, &task.log_target, "block-events-lost");
                task.blocks = task.backend.subscribe_blocks().await;
                task.catch_up().await;
                if task.watch.is_finished() {
                    break;
                }
            }

            WakeUpReason::LegacyUpdate(Some(update)) => {
                match serde_json::from_str::<methods::TransactionStatus>(&update) {
                    Ok(update) => log!(
                        &task.platform,
                        Trace,
                        &task.log_target,
                        "server-update",
                        update = format!("{update:?}")
                    ),
                    Err(error) => log!(
                        &task.platform,
                        Warn,
                        &task.log_target,
                        "invalid-update",
                        error
                    ),
                }
            }

            WakeUpReason::LegacyUpdate(None) => {
                if let Broadcast::Legacy { subscription } = &mut task.broadcast {
                    *subscription = None;
                }
            }
        }
    }

    task.stop_broadcast().await;
}

impl<TPlat: PlatformRef, D: EventsDecoder> WatchTask<TPlat, D> {
    /// Looks for the transaction in the current finalized block, then in the current best block.
    async fn catch_up(&mut self) {
        let finalized = match self.backend.finalized_block().await {
            Ok(finalized) => {
                if let Some(body) = self.fetch_body(finalized.hash).await {
                    for status in self.watch.finalized_block_body(finalized.hash, &body) {
                        self.report(status).await;
                    }
                }
                Some(finalized.hash)
            }
            Err(_) => None,
        };

        if self.watch.is_finished() {
            return;
        }

        let Ok(best) = self.backend.best_block().await else {
            return;
        };
        if Some(best.hash) == finalized {
            return;
        }
        if let Some(body) = self.fetch_body(best.hash).await {
            if let Some(status) = self.watch.best_block_body(best.hash, &body) {
                self.report(status).await;
            }
        }
    }

    async fn fetch_body(&self, block_hash: [u8; 32]) -> Option<Vec<Vec<u8>>> {
        match self.backend.body(block_hash).await {
            Ok(body) => Some(body),
            Err(error) => {
                log!(
                    &self.platform,
                    Debug,
                    &self.log_target,
                    "body-fetch-failed",
                    block = HashDisplay(&block_hash),
                    error
                );
                None
            }
        }
    }

    /// Fetches the events of the transaction and sends the status to the watcher.
    async fn report(&mut self, status: watch::Status) {
        let (inclusion, finalized) = match status {
            watch::Status::BestChainBlockIncluded(inclusion) => (inclusion, false),
            watch::Status::Finalized(inclusion) => (inclusion, true),
        };

        let events = match self
            .backend
            .storage_values(inclusion.block_hash, &[SYSTEM_EVENTS_KEY.to_vec()])
            .await
        {
            Ok(mut values) => self
                .decoder
                .decode_events(values.pop().flatten().as_deref(), inclusion.index)
                .map_err(EventsError::Decode),
            Err(error) => Err(EventsError::Fetch(error)),
        };

        log!(
            &self.platform,
            Debug,
            &self.log_target,
            if finalized { "finalized" } else { "best-chain-included" },
            block = HashDisplay(&inclusion.block_hash),
            index = inclusion.index
        );

        let status = if finalized {
            TransactionStatus::Finalized {
                block_hash: inclusion.block_hash,
                index: inclusion.index,
                events,
            }
        } else {
            TransactionStatus::BestChainBlockIncluded {
                block_hash: inclusion.block_hash,
                index: inclusion.index,
                events,
            }
        };

        let _ = self.statuses_tx.try_send(status);
    }

    async fn stop_broadcast(&mut self) {
        match &mut self.broadcast {
            Broadcast::ChainHead {
                operation_id: Some(operation_id),
            } => {
                let params = format!("[{}]", to_json_string(&*operation_id));
                if let Err(error) = self
                    .connection
                    .request(methods::TRANSACTION_STOP, params)
                    .await
                {
                    log!(
                        &self.platform,
                        Warn,
                        &self.log_target,
                        "broadcast-stop-failed",
                        error
                    );
                }
            }
            Broadcast::ChainHead { operation_id: None } => {}
            Broadcast::Legacy { subscription } => {
                *subscription = None;
            }
        }
    }
}
