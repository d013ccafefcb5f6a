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

//! Storage queries and storage subscriptions.
//!
//! # Subscriptions
//!
//! With the `chainHead_v1_*` functions, a storage subscription is a background task that reads
//! the storage items at the current best block, then again every time the best block changes.
//! These reads are serialized. If the best block changes faster than the reads complete, the
//! pending reads are collapsed through a [`PullQueue`] so that the subscription catches up with
//! the head of the chain instead of lagging behind.
//!
//! With the legacy functions, a storage subscription relies on `state_subscribeStorage`.
//!
//! In both cases, a new snapshot is delivered only if at least one value differs from the
//! previously delivered snapshot. Each delivery contains the values of all the items, in the
//! order in which they have been passed.

use crate::{
    log,
    platform::PlatformRef,
    Backend, BlockEvent, Client, OperationError,
};

use alloc::{borrow::ToOwned as _, format, string::String, vec, vec::Vec};
use chain_head::{
    json_rpc::methods,
    storage::{diff::ValuesTracker, pull_queue::PullQueue},
};
use core::{future, time::Duration};
use futures_channel::oneshot;
use futures_lite::FutureExt as _;
use futures_util::future::BoxFuture;

/// Values of storage items, in the same order as the keys that have been queried. `None`
/// means that there is no value, which is different from an empty value.
pub type StorageSnapshot = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// Number of attempts of a query at the current best block, when this best block disappears
/// before the query could start.
const BEST_BLOCK_QUERY_ATTEMPTS: usize = 3;

/// Delay before a legacy storage subscription is created again after a failure.
const LEGACY_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Storage item that knows how to decode its own value.
///
/// Implemented by the API user, typically on top of the metadata of the chain.
pub trait StorageDescriptor {
    /// Decoded value.
    type Output;

    /// Returns the key of the storage item.
    fn storage_key(&self) -> Vec<u8>;

    /// Decodes the value of the storage item. `None` if the storage item has no value.
    fn decode(&self, value: Option<&[u8]>) -> Result<Self::Output, DecodeError>;
}

impl<'a, T: StorageDescriptor + ?Sized> StorageDescriptor for &'a T {
    type Output = T::Output;

    fn storage_key(&self) -> Vec<u8> {
        (**self).storage_key()
    }

    fn decode(&self, value: Option<&[u8]>) -> Result<Self::Output, DecodeError> {
        (**self).decode(value)
    }
}

/// Error returned by [`StorageDescriptor::decode`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("Failed to decode storage value: {message}")]
pub struct DecodeError {
    /// Human-readable description of the problem.
    pub message: String,
}

/// Error potentially returned by [`Client::query_multi`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum QueryMultiError {
    /// Failed to read the storage.
    #[display("{_0}")]
    Operation(OperationError),
    /// One of the values couldn't be decoded.
    #[display("{_0}")]
    Decode(DecodeError),
}

/// Subscription created with [`Client::subscribe_storage`].
///
/// Dropping this object, or calling [`StorageSubscription::unsubscribe`], stops the
/// subscription. A read in progress is stopped and its result discarded.
pub struct StorageSubscription {
    snapshots: async_channel::Receiver<StorageSnapshot>,
    /// Dropping this sender stops the background task.
    _stop: oneshot::Sender<()>,
}

impl StorageSubscription {
    /// Waits for the next snapshot. Returns `None` if the client is gone.
    pub async fn next(&mut self) -> Option<StorageSnapshot> {
        self.snapshots.recv().await.ok()
    }

    /// Stops the subscription. Equivalent to dropping the object.
    pub fn unsubscribe(self) {}
}

/// Subscription created with [`Client::subscribe_multi`].
pub struct MultiSubscription<D> {
    inner: StorageSubscription,
    descriptors: Vec<D>,
}

impl<D: StorageDescriptor> MultiSubscription<D> {
    /// Waits for the next snapshot and decodes it. The output is in the same order as the
    /// descriptors. Returns `None` if the client is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<D::Output>, DecodeError>> {
        let snapshot = self.inner.next().await?;
        Some(decode_snapshot(&self.descriptors, snapshot))
    }

    /// Stops the subscription. Equivalent to dropping the object.
    pub fn unsubscribe(self) {}
}

fn decode_snapshot<D: StorageDescriptor>(
    descriptors: &[D],
    snapshot: StorageSnapshot,
) -> Result<Vec<D::Output>, DecodeError> {
    descriptors
        .iter()
        .zip(snapshot)
        .map(|(descriptor, (_, value))| descriptor.decode(value.as_deref()))
        .collect()
}

impl<TPlat: PlatformRef> Client<TPlat> {
    /// Reads the values of storage items at the given block, or at the current best block if
    /// `None`.
    ///
    /// The output is in the same order as `keys`. An empty list of keys returns immediately.
    pub async fn query(
        &self,
        keys: &[Vec<u8>],
        at: Option<[u8; 32]>,
    ) -> Result<StorageSnapshot, OperationError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = match at {
            Some(block_hash) => self.backend.storage_values(block_hash, keys).await?,
            None => {
                let mut attempt = 1;
                loop {
                    let best = self.backend.best_block().await?;
                    match self.backend.storage_values(best.hash, keys).await {
                        Ok(values) => break values,
                        Err(OperationError::BlockNotAvailable(_))
                        | Err(OperationError::SubscriptionReset)
                            if attempt < BEST_BLOCK_QUERY_ATTEMPTS =>
                        {
                            attempt += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        };

        Ok(keys.iter().cloned().zip(values).collect())
    }

    /// Reads and decodes storage items at the given block, or at the current best block if
    /// `None`, in a single query.
    ///
    /// The output is in the same order as `descriptors`. An empty list of descriptors returns
    /// immediately.
    pub async fn query_multi<D: StorageDescriptor>(
        &self,
        descriptors: &[D],
        at: Option<[u8; 32]>,
    ) -> Result<Vec<D::Output>, QueryMultiError> {
        if descriptors.is_empty() {
            return Ok(Vec::new());
        }

        let keys = descriptors
            .iter()
            .map(|d| d.storage_key())
            .collect::<Vec<_>>();
        let snapshot = self
            .query(&keys, at)
            .await
            .map_err(QueryMultiError::Operation)?;
        decode_snapshot(descriptors, snapshot).map_err(QueryMultiError::Decode)
    }

    /// Subscribes to the values of storage items.
    ///
    /// A first snapshot is delivered as soon as possible, then a new snapshot every time one of
    /// the values changes.
    pub fn subscribe_storage(&self, keys: Vec<Vec<u8>>) -> StorageSubscription {
        let (snapshots_tx, snapshots) = async_channel::unbounded();
        let (stop_tx, stop_rx) = oneshot::channel();
        let log_target = format!("storage-sub-{}", self.log_name);

        let task = SubscriptionTask {
            platform: self.platform.clone(),
            log_target: log_target.clone(),
            backend: self.backend.clone(),
            keys,
            snapshots_tx,
            stop_rx,
            values: ValuesTracker::new(),
        };

        match &self.backend {
            Backend::ChainHead(_) => self
                .platform
                .spawn_task(log_target.into(), run_chain_head_subscription(task)),
            Backend::Legacy(_) => self
                .platform
                .spawn_task(log_target.into(), run_legacy_subscription(task)),
        }

        StorageSubscription {
            snapshots,
            _stop: stop_tx,
        }
    }

    /// Same as [`Client::subscribe_storage`], but decodes the values with the given
    /// descriptors.
    pub fn subscribe_multi<D: StorageDescriptor>(&self, descriptors: Vec<D>) -> MultiSubscription<D> {
        let keys = descriptors.iter().map(|d| d.storage_key()).collect();
        MultiSubscription {
            inner: self.subscribe_storage(keys),
            descriptors,
        }
    }
}

struct SubscriptionTask<TPlat> {
    platform: TPlat,
    log_target: String,
    backend: Backend<TPlat>,
    keys: Vec<Vec<u8>>,
    snapshots_tx: async_channel::Sender<StorageSnapshot>,
    stop_rx: oneshot::Receiver<()>,
    values: ValuesTracker<(Vec<u8>, Option<Vec<u8>>)>,
}

impl<TPlat: PlatformRef> SubscriptionTask<TPlat> {
    /// Delivers a snapshot if it differs from the previous one. Returns `false` if the
    /// subscription is gone.
    fn deliver(&mut self, snapshot: StorageSnapshot) -> bool {
        match self.values.update(snapshot) {
            Some(changed) => {
                log!(
                    &self.platform,
                    Trace,
                    &self.log_target,
                    "snapshot",
                    items = changed.len()
                );
                self.snapshots_tx.try_send(changed.to_vec()).is_ok()
            }
            None => true,
        }
    }
}

/// Pull of the storage items.
#[derive(Debug, Copy, Clone)]
enum Pull {
    /// At the current best block, whatever it is. Used after the follow subscription has been
    /// reset, as the best block might not change afterwards.
    CurrentBest,
    /// At a specific block.
    At([u8; 32]),
}

async fn run_chain_head_subscription<TPlat: PlatformRef>(mut task: SubscriptionTask<TPlat>) {
    let backend = task.backend.clone();
    let keys = task.keys.clone();

    // Subscribing to the block events before reading the best block guarantees that no best
    // block change is missed.
    let mut blocks = backend.subscribe_blocks().await;
    let initial_best = {
        let stop_rx = &mut task.stop_rx;
        let backend = &backend;
        match async move {
            let _ = stop_rx.await;
            None
        }
        .or(async move { Some(backend.best_block().await) })
        .await
        {
            Some(Ok(best)) => best.hash,
            Some(Err(_)) | None => return,
        }
    };

    let mut queue = PullQueue::new();
    queue.push(Pull::At(initial_best));
    // Block of the most recently queued pull. Used to ignore a best block event about a block
    // that is already going to be read.
    let mut latest_queued = Some(initial_best);

    let mut in_flight: Option<BoxFuture<'_, Result<StorageSnapshot, OperationError>>> = None;

    loop {
        if in_flight.is_none() {
            if let Some(pull) = queue.pop() {
                let backend = &backend;
                let keys = &keys;
                in_flight = Some(Box::pin(async move {
                    let block_hash = match pull {
                        Pull::CurrentBest => backend.best_block().await?.hash,
                        Pull::At(block_hash) => block_hash,
                    };
                    let values = backend.storage_values(block_hash, keys).await?;
                    Ok::<StorageSnapshot, OperationError>(keys.iter().cloned().zip(values).collect())
                }));
            }
        }

        enum WakeUpReason {
            Stop,
            BlockEvent(Option<BlockEvent>),
            PullDone(Result<StorageSnapshot, OperationError>),
        }

        let wake_up_reason = {
            let stop_rx = &mut task.stop_rx;
            let blocks = &blocks;
            let in_flight = &mut in_flight;

            async move {
                let _ = stop_rx.await;
                WakeUpReason::Stop
            }
            .or(async move { WakeUpReason::BlockEvent(blocks.recv().await.ok()) })
            .or(async move {
                match in_flight {
                    Some(pull) => WakeUpReason::PullDone(pull.await),
                    None => future::pending().await,
                }
            })
            .await
        };

        match wake_up_reason {
            WakeUpReason::Stop => {
                // Dropping the pull in progress stops the corresponding operation.
                log!(&task.platform, Trace, &task.log_target, "unsubscribed");
                return;
            }

            WakeUpReason::BlockEvent(Some(BlockEvent::BestBlock(block))) => {
                if latest_queued == Some(block.hash) {
                    continue;
                }
                latest_queued = Some(block.hash);
                let dropped = queue.push(Pull::At(block.hash));
                if dropped != 0 {
                    log!(
                        &task.platform,
                        Debug,
                        &task.log_target,
                        "pulls-collapsed",
                        dropped
                    );
                }
            }

            WakeUpReason::BlockEvent(Some(_)) => {}

            WakeUpReason::BlockEvent(None) => {
                // The channel is closed if it was full. Subscribe again and catch up with the
                // current best block.
                log!(&task.platform, Debug, &task.log_target, "block-events-lost");
                blocks = backend.subscribe_blocks().await;
                queue.clear();
                queue.push(Pull::CurrentBest);
                latest_queued = None;
            }

            WakeUpReason::PullDone(Ok(snapshot)) => {
                in_flight = None;
                if !task.deliver(snapshot) {
                    return;
                }
            }

            WakeUpReason::PullDone(Err(error)) => {
                in_flight = None;
                log!(
                    &task.platform,
                    Debug,
                    &task.log_target,
                    "pull-failed",
                    error
                );

                // After a reset, the values must be read again even if the best block doesn't
                // change. The block of the pull might also have disappeared with the reset.
                if queue.is_empty()
                    && matches!(
                        error,
                        OperationError::SubscriptionReset
                            | OperationError::BlockNotAvailable(_)
                            | OperationError::Request(_)
                    )
                {
                    queue.push(Pull::CurrentBest);
                    latest_queued = None;
                }
            }
        }
    }
}

async fn run_legacy_subscription<TPlat: PlatformRef>(mut task: SubscriptionTask<TPlat>) {
    let Backend::Legacy(service) = task.backend.clone() else {
        return;
    };

    loop {
        enum WakeUpReason<T> {
            Stop,
            Ready(T),
        }

        let subscription = {
            let stop_rx = &mut task.stop_rx;
            let keys = &task.keys;
            let service = &service;
            let subscribe = async move {
                // Waits until the service is initialized.
                service.best_block().await?;
                service
                    .subscribe_storage(keys, 64)
                    .await
                    .map_err(OperationError::Request)
            };

            match async move {
                let _ = stop_rx.await;
                WakeUpReason::Stop
            }
            .or(async move { WakeUpReason::Ready(subscribe.await) })
            .await
            {
                WakeUpReason::Stop => return,
                WakeUpReason::Ready(result) => result,
            }
        };

        let mut subscription = match subscription {
            Ok(subscription) => subscription,
            Err(error) => {
                log!(
                    &task.platform,
                    Debug,
                    &task.log_target,
                    "subscribe-failed",
                    error
                );
                let delay = task.platform.sleep(LEGACY_RESUBSCRIBE_DELAY);
                let stop_rx = &mut task.stop_rx;
                match async move {
                    let _ = stop_rx.await;
                    WakeUpReason::Stop
                }
                .or(async move {
                    delay.await;
                    WakeUpReason::Ready(())
                })
                .await
                {
                    WakeUpReason::Stop => return,
                    WakeUpReason::Ready(()) => continue,
                }
            }
        };

        let mut values = vec![None; task.keys.len()];

        loop {
            let notification = {
                let stop_rx = &mut task.stop_rx;
                let subscription = &mut subscription;
                match async move {
                    let _ = stop_rx.await;
                    WakeUpReason::Stop
                }
                .or(async move { WakeUpReason::Ready(subscription.next().await) })
                .await
                {
                    WakeUpReason::Stop => return,
                    WakeUpReason::Ready(notification) => notification,
                }
            };

            let Some(notification) = notification else {
                log!(&task.platform, Debug, &task.log_target, "subscription-closed");
                break;
            };

            let change_set = match serde_json::from_str::<methods::StorageChangeSet>(&notification)
            {
                Ok(change_set) => change_set,
                Err(error) => {
                    log!(
                        &task.platform,
                        Warn,
                        &task.log_target,
                        "invalid-notification",
                        error
                    );
                    continue;
                }
            };

            for (key, value) in change_set.changes {
                for (index, _) in task.keys.iter().enumerate().filter(|(_, k)| **k == key.0) {
                    values[index] = value.as_ref().map(|v| v.0.to_owned());
                }
            }

            let snapshot = task
                .keys
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect();
            if !task.deliver(snapshot) {
                return;
            }
        }
    }
}
