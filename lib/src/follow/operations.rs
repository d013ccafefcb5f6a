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

//! Operations in progress against the blocks pinned by a `chainHead_v1_follow` subscription.
//!
//! The `chainHead_v1_body`, `chainHead_v1_call` and `chainHead_v1_storage` requests don't
//! directly return their result. Instead, the server answers with an *operation ID*, and later
//! reports the progress and the result of the operation through `operation*` events of the
//! follow subscription.
//!
//! The [`Operations`] struct holds the operations in progress, keyed by operation ID, and turns
//! the `operation*` events into results. Storage items are accumulated in the order in which
//! they are received.
//!
//! Because the response to the request that starts an operation and the events of the follow
//! subscription can be processed in any order relative to each other, events concerning an
//! unknown operation are buffered as long as at least one start request is in flight. Call
//! [`Operations::start_requested`] before sending a start request, and then exactly one of
//! [`Operations::insert`], [`Operations::discard`] or [`Operations::start_failed`] once the
//! request has been answered.

use crate::json_rpc::methods::{FollowEvent, StorageResultItem};

use alloc::{string::String, vec::Vec};

/// Maximum number of events buffered while waiting for operations to be registered.
const MAX_BUFFERED_EVENTS: usize = 256;

/// Kind of operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// `chainHead_v1_body`.
    Body,
    /// `chainHead_v1_call`.
    Call,
    /// `chainHead_v1_storage`.
    Storage,
}

/// Result of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Body of the block. Each item is a SCALE-encoded extrinsic.
    Body(Vec<Vec<u8>>),
    /// Output of the runtime call.
    Call(Vec<u8>),
    /// Storage items, in the order in which they have been received.
    Storage(Vec<StorageResultItem>),
    /// The server has reported an error.
    Error(String),
    /// The server couldn't access the requested information, for example due to networking
    /// issues. The operation can be retried.
    Inaccessible,
}

/// Output of [`Operations::inject_event`] and [`Operations::insert`].
#[derive(Debug)]
pub enum OperationOutput<T> {
    /// The operation is finished and has been removed.
    Finished {
        operation_id: String,
        /// Block the operation was targeting.
        block_hash: [u8; 32],
        /// User data passed to [`Operations::insert`].
        user_data: T,
        result: OperationResult,
    },
    /// A `chainHead_v1_continue` request must be sent for this operation.
    WaitingForContinue { operation_id: String },
}

/// See [the module-level documentation](..).
pub struct Operations<T> {
    operations: hashbrown::HashMap<String, Operation<T>, fnv::FnvBuildHasher>,

    /// Events for operations that aren't registered yet, in order of arrival.
    early_events: Vec<FollowEvent>,

    /// Number of start requests that haven't been answered yet.
    starts_in_flight: usize,
}

struct Operation<T> {
    kind: OperationKind,
    block_hash: [u8; 32],
    user_data: T,
    storage_items: Vec<StorageResultItem>,
    waiting_for_continue: bool,
}

impl<T> Operations<T> {
    /// Creates a new empty collection.
    pub fn new() -> Self {
        Operations {
            operations: hashbrown::HashMap::with_capacity_and_hasher(8, Default::default()),
            early_events: Vec::new(),
            starts_in_flight: 0,
        }
    }

    /// Must be called before sending a request that starts an operation.
    pub fn start_requested(&mut self) {
        self.starts_in_flight += 1;
    }

    /// Must be called when a start request has failed or the server has answered with
    /// `limitReached`.
    pub fn start_failed(&mut self) {
        self.start_answered();
    }

    /// Must be called when a start request has succeeded but the operation is no longer
    /// wanted. The caller is responsible for sending `chainHead_v1_stopOperation`.
    pub fn discard(&mut self, operation_id: &str) {
        self.early_events
            .retain(|ev| ev.operation_id() != Some(operation_id));
        self.start_answered();
    }

    /// Registers an operation whose start request has succeeded.
    ///
    /// Returns the outputs generated by the events concerning this operation that have been
    /// received before it was registered.
    pub fn insert(
        &mut self,
        operation_id: String,
        kind: OperationKind,
        block_hash: [u8; 32],
        user_data: T,
    ) -> Result<Vec<OperationOutput<T>>, OperationEventError> {
        self.operations.insert(
            operation_id.clone(),
            Operation {
                kind,
                block_hash,
                user_data,
                storage_items: Vec::new(),
                waiting_for_continue: false,
            },
        );

        let (replay, keep) = core::mem::take(&mut self.early_events)
            .into_iter()
            .partition::<Vec<_>, _>(|ev| ev.operation_id() == Some(&operation_id));
        self.early_events = keep;
        self.start_answered();

        let mut outputs = Vec::new();
        for event in replay {
            if let Some(output) = self.inject_event(event)? {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    /// Injects an `operation*` event.
    ///
    /// Returns `Ok(None)` if the event doesn't generate any output, which includes the case where
    /// it has been buffered.
    ///
    /// # Panic
    ///
    /// Panics if the event isn't an `operation*` event.
    ///
    pub fn inject_event(
        &mut self,
        event: FollowEvent,
    ) -> Result<Option<OperationOutput<T>>, OperationEventError> {
        let Some(operation_id) = event.operation_id().map(String::from) else {
            panic!("not an operation event")
        };

        let Some(operation) = self.operations.get_mut(&operation_id) else {
            if self.starts_in_flight == 0 {
                return Err(OperationEventError::UnknownOperation);
            }
            if self.early_events.len() >= MAX_BUFFERED_EVENTS {
                return Err(OperationEventError::TooManyBufferedEvents);
            }
            self.early_events.push(event);
            return Ok(None);
        };

        let result = match (event, operation.kind) {
            (FollowEvent::OperationBodyDone { value, .. }, OperationKind::Body) => {
                OperationResult::Body(value.into_iter().map(|v| v.0).collect())
            }
            (FollowEvent::OperationCallDone { output, .. }, OperationKind::Call) => {
                OperationResult::Call(output.0)
            }
            (FollowEvent::OperationStorageItems { items, .. }, OperationKind::Storage) => {
                operation.waiting_for_continue = false;
                operation.storage_items.extend(items);
                return Ok(None);
            }
            (FollowEvent::OperationWaitingForContinue { .. }, OperationKind::Storage) => {
                if operation.waiting_for_continue {
                    return Err(OperationEventError::DuplicateWaitingForContinue);
                }
                operation.waiting_for_continue = true;
                return Ok(Some(OperationOutput::WaitingForContinue { operation_id }));
            }
            (FollowEvent::OperationStorageDone { .. }, OperationKind::Storage) => {
                OperationResult::Storage(core::mem::take(&mut operation.storage_items))
            }
            (FollowEvent::OperationError { error, .. }, _) => OperationResult::Error(error),
            (FollowEvent::OperationInaccessible { .. }, _) => OperationResult::Inaccessible,
            _ => return Err(OperationEventError::KindMismatch),
        };

        let operation = self
            .operations
            .remove(&operation_id)
            .unwrap_or_else(|| unreachable!());
        Ok(Some(OperationOutput::Finished {
            operation_id,
            block_hash: operation.block_hash,
            user_data: operation.user_data,
            result,
        }))
    }

    /// Removes an operation, for example because it has been abandoned and must be stopped.
    ///
    /// Returns the block it was targeting and its user data, or `None` if it wasn't in
    /// progress.
    pub fn remove(&mut self, operation_id: &str) -> Option<([u8; 32], T)> {
        self.operations
            .remove(operation_id)
            .map(|op| (op.block_hash, op.user_data))
    }

    /// Returns the number of operations in progress.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` if no operation is in progress.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Removes all the operations, for example because the follow subscription is gone. Start
    /// requests in flight are forgotten as well.
    pub fn drain(&mut self) -> impl Iterator<Item = (String, [u8; 32], T)> + '_ {
        self.early_events.clear();
        self.starts_in_flight = 0;
        self.operations
            .drain()
            .map(|(id, op)| (id, op.block_hash, op.user_data))
    }

    fn start_answered(&mut self) {
        debug_assert!(self.starts_in_flight > 0);
        self.starts_in_flight = self.starts_in_flight.saturating_sub(1);
        if self.starts_in_flight == 0 {
            self.early_events.clear();
        }
    }
}

impl<T> Default for Operations<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error potentially returned when injecting an event.
#[derive(Debug, derive_more::Display, derive_more::Error, Clone, PartialEq, Eq)]
pub enum OperationEventError {
    /// The event concerns an operation that isn't in progress.
    #[display("Event for an unknown operation")]
    UnknownOperation,
    /// Too many events have been received for operations that aren't registered yet.
    #[display("Too many events for unknown operations")]
    TooManyBufferedEvents,
    /// The event doesn't match the kind of operation.
    #[display("Event doesn't match the kind of operation")]
    KindMismatch,
    /// Two `operationWaitingForContinue` events have been received in a row.
    #[display("Duplicate operationWaitingForContinue event")]
    DuplicateWaitingForContinue,
}
