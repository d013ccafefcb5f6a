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

//! JSON-RPC protocol.
//!
//! The client communicates with a JSON-RPC server by sending requests and receiving responses
//! and subscription notifications. See [the JSON-RPC 2.0 specification](https://www.jsonrpc.org/specification).
//!
//! - [`parse`] builds and parses the individual messages.
//! - [`methods`] contains the names and the parameter and return types of the functions used by
//!   the client.
//! - [`requests`] matches the messages of the server with the requests and subscriptions of the
//!   client.

pub mod methods;
pub mod parse;
pub mod requests;
