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

//! Primitives to build a client of the `chainHead` JSON-RPC API of Substrate-based blockchains.
//!
//! This library doesn't perform any I/O and doesn't spawn any task. It only contains state
//! machines and data types. Plugging these state machines to an actual JSON-RPC server is the
//! responsibility of the upper layers.
//!
//! # Overview
//!
//! - The [`json_rpc`] module contains everything related to the JSON-RPC protocol: building
//!   requests, parsing responses and notifications, and the types of the methods and
//!   notifications that are used.
//! - The [`follow`] module contains [`follow::PinnedBlocks`], which tracks the tree of pinned
//!   blocks reported by a `chainHead_v1_follow` subscription, and [`follow::operations`], which
//!   tracks the operations (`body`, `call`, `storage`) in progress against these blocks.
//! - The [`storage`] module contains the utilities used to implement storage subscriptions:
//!   a queue of pulls that collapses its backlog, and change detection on storage values.
//! - The [`transactions`] module contains the runtime call used to validate a transaction and
//!   a state machine that determines the status of a transaction from the blocks it appears in.
//! - The [`header`] module decodes the small part of block headers that is needed.
//!

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod follow;
pub mod header;
pub mod informant;
pub mod json_rpc;
pub mod storage;
pub mod transactions;

mod util;
