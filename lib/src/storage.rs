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

//! Utilities for storage subscriptions.
//!
//! A storage subscription re-reads a fixed list of storage keys every time the best block
//! changes, and notifies its user when at least one of the values has changed.
//!
//! Reading the storage takes time, and new best blocks can be reported faster than the storage
//! reads complete. The [`pull_queue::PullQueue`] holds the reads waiting to be started, and
//! collapses its backlog so that a subscription always catches up with the latest block rather
//! than processing a growing list of outdated ones. The [`diff::ValuesTracker`] compares each
//! read with the previously-delivered values.

pub mod diff;
pub mod pull_queue;
