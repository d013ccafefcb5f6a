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

//! Transactions handling.
//!
//! Submitting a transaction consists of two steps: validating it against the runtime of the
//! current best block (see [`validate`]), then broadcasting it and watching the blocks that
//! appear in order to determine whether and where it has been included (see [`watch`]).
//!
//! Transactions are opaque SCALE-encoded byte sequences. Their content is never decoded by this
//! crate. They are identified by their hash, which is the BLAKE2b-256 hash of their encoding.

pub mod validate;
pub mod watch;
