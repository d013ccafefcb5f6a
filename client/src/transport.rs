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

//! Channels connecting the client to a JSON-RPC server.
//!
//! The client doesn't open any connection by itself. Instead, the API user provides a
//! [`Transport`], which is a pair of channels: one carrying the JSON-RPC requests towards the
//! server, and one carrying the responses and notifications of the server together with the
//! lifecycle events of the connection.
//!
//! The component that sits at the other end of these channels, for example a WebSocket client,
//! is responsible for reconnecting. After a [`TransportEvent::Disconnected`] event, the client
//! considers that all the requests in progress and all the subscriptions are lost. After a
//! [`TransportEvent::Connected`] event, it starts sending requests again.
//!
//! The [`channel`] function builds both ends at once, which is handy for embedding a server in
//! the same process or for testing purposes.

use alloc::string::String;

/// Client side of the connection to a JSON-RPC server.
pub struct Transport {
    /// Channel where the client sends JSON-RPC requests.
    ///
    /// Requests sent while the server isn't connected can be discarded by the other end.
    pub to_server: async_channel::Sender<String>,

    /// Channel where the client receives the messages of the server and the lifecycle events
    /// of the connection.
    ///
    /// If this channel is closed, the connection is considered as permanently lost.
    pub from_server: async_channel::Receiver<TransportEvent>,
}

/// Event generated by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection to the server is established. Must be the first event, and must be
    /// repeated after each reconnection.
    Connected,
    /// The connection to the server has been lost. All the requests in progress and all the
    /// subscriptions are considered dead.
    Disconnected,
    /// The transport is trying to reconnect.
    Reconnecting,
    /// Message sent by the server. Must only be sent while connected.
    Message(String),
    /// The transport has encountered an error. The message is meant to be shown to the user.
    Error(String),
}

/// Server side of a [`Transport`] built with [`channel`].
pub struct TransportEnd {
    /// Requests sent by the client.
    pub from_client: async_channel::Receiver<String>,
    /// Messages and events to deliver to the client.
    pub to_client: async_channel::Sender<TransportEvent>,
}

/// Builds a [`Transport`] and the opposite end of its channels.
///
/// `buffer_size` is the capacity of each of the two channels.
pub fn channel(buffer_size: usize) -> (Transport, TransportEnd) {
    let (to_server, from_client) = async_channel::bounded(buffer_size);
    let (to_client, from_server) = async_channel::bounded(buffer_size);
    (
        Transport {
            to_server,
            from_server,
        },
        TransportEnd {
            from_client,
            to_client,
        },
    )
}
