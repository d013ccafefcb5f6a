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

//! Client-side tracking of the JSON-RPC requests in progress and of the active subscriptions.
//!
//! The [`RequestsTracker`] allocates the identifiers of the requests sent to the server, and
//! matches the messages sent back by the server with either a request in progress or an active
//! subscription. Each request and subscription holds an opaque user data.
//!
//! Subscription identifiers are chosen by the server and can be either JSON strings or JSON
//! numbers. They are stored in a normalized way, see [`normalize_subscription_id`].

use super::parse;
use alloc::{
    borrow::Cow,
    string::{String, ToString as _},
};

/// See [the module-level documentation](..).
pub struct RequestsTracker<TRq, TSub> {
    /// Identifier to assign to the next request.
    next_request_id: u64,

    /// Requests that have been sent and are waiting for a response. Keys are request IDs.
    requests: hashbrown::HashMap<u64, TRq, fnv::FnvBuildHasher>,

    /// Active subscriptions. Keys are normalized subscription IDs.
    subscriptions: hashbrown::HashMap<String, TSub, fnv::FnvBuildHasher>,
}

impl<TRq, TSub> RequestsTracker<TRq, TSub> {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        RequestsTracker {
            next_request_id: 1,
            requests: hashbrown::HashMap::with_capacity_and_hasher(16, Default::default()),
            subscriptions: hashbrown::HashMap::with_capacity_and_hasher(8, Default::default()),
        }
    }

    /// Registers a new request, and returns the JSON-encoded request to send to the server.
    ///
    /// # Panic
    ///
    /// Panics if `params_json` isn't valid JSON.
    ///
    pub fn build_request(&mut self, method: &str, params_json: &str, user_data: TRq) -> String {
        let id = self.next_request_id;
        self.next_request_id += 1;

        let id_json = id.to_string();
        let request = parse::build_request(&parse::Request {
            id_json: Some(&id_json),
            method,
            params_json: Some(params_json),
        });

        let _prev = self.requests.insert(id, user_data);
        debug_assert!(_prev.is_none());
        request
    }

    /// Registers a new subscription.
    ///
    /// Returns the normalized subscription ID, or an error if the ID isn't a string or a number.
    /// If a subscription with the same ID already exists, it is replaced.
    pub fn insert_subscription(
        &mut self,
        subscription_id_json: &str,
        user_data: TSub,
    ) -> Result<String, parse::ParseError> {
        let key = normalize_subscription_id(subscription_id_json)?;
        self.subscriptions.insert(key.clone(), user_data);
        Ok(key)
    }

    /// Returns the user data of a subscription.
    pub fn subscription_mut(&mut self, subscription_id: &str) -> Option<&mut TSub> {
        self.subscriptions.get_mut(subscription_id)
    }

    /// Removes a subscription.
    pub fn remove_subscription(&mut self, subscription_id: &str) -> Option<TSub> {
        self.subscriptions.remove(subscription_id)
    }

    /// Returns the number of requests waiting for a response.
    pub fn num_pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Returns the number of active subscriptions.
    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Removes all the requests and subscriptions, for example after the connection to the
    /// server has been lost.
    pub fn clear(
        &mut self,
    ) -> (
        impl Iterator<Item = TRq> + '_,
        impl Iterator<Item = (String, TSub)> + '_,
    ) {
        (
            self.requests.drain().map(|(_, rq)| rq),
            self.subscriptions.drain(),
        )
    }

    /// Injects a message sent by the server.
    pub fn inject_message<'a>(
        &mut self,
        message: &'a str,
    ) -> Result<InjectedMessage<'a, TRq>, InjectError> {
        match parse::parse_server_message(message).map_err(InjectError::Parse)? {
            parse::ServerMessage::Response(parse::Response::ParseError {
                error_code,
                error_message,
            }) => Err(InjectError::ParseErrorResponse {
                code: error_code,
                message: error_message.to_string(),
            }),
            parse::ServerMessage::Response(response) => {
                let (id_json, result) = match response {
                    parse::Response::Success {
                        id_json,
                        result_json,
                    } => (id_json, Ok(result_json)),
                    parse::Response::Error {
                        id_json,
                        error_code,
                        error_message,
                        ..
                    } => (
                        id_json,
                        Err(ErrorResponse {
                            code: error_code,
                            message: error_message,
                        }),
                    ),
                    parse::Response::ParseError { .. } => unreachable!(),
                };

                let user_data = serde_json::from_str::<u64>(id_json)
                    .ok()
                    .and_then(|id| self.requests.remove(&id))
                    .ok_or(InjectError::UnknownRequest)?;

                Ok(InjectedMessage::Response { user_data, result })
            }
            parse::ServerMessage::Notification(notification) => {
                let subscription_id = normalize_subscription_id(notification.subscription_id_json)
                    .map_err(InjectError::Parse)?;
                Ok(InjectedMessage::Notification {
                    is_known_subscription: self.subscriptions.contains_key(&subscription_id),
                    subscription_id,
                    method: notification.method,
                    result_json: notification.result_json,
                })
            }
        }
    }
}

impl<TRq, TSub> Default for RequestsTracker<TRq, TSub> {
    fn default() -> Self {
        Self::new()
    }
}

/// Message sent by the server, after it has been matched with the local state.
#[derive(Debug)]
pub enum InjectedMessage<'a, TRq> {
    /// Response to a request.
    Response {
        /// User data that was passed to [`RequestsTracker::build_request`].
        user_data: TRq,
        /// JSON-formatted result of the request, or error returned by the server.
        result: Result<&'a str, ErrorResponse<'a>>,
    },
    /// Subscription notification.
    Notification {
        /// Normalized subscription ID, usable with [`RequestsTracker::subscription_mut`].
        subscription_id: String,
        /// `true` if the subscription is registered.
        is_known_subscription: bool,
        /// Name of the notification method.
        method: &'a str,
        /// JSON-formatted content of the notification.
        result_json: &'a str,
    },
}

/// Error response sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse<'a> {
    /// Integer indicating the nature of the error.
    pub code: i64,
    /// Short description of the error.
    pub message: &'a str,
}

/// Error potentially returned by [`RequestsTracker::inject_message`].
#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum InjectError {
    /// Failed to parse the message.
    #[display("Failed to parse server message: {_0}")]
    Parse(parse::ParseError),
    /// The message is a response to a request that isn't in progress.
    #[display("Response to an unknown request")]
    UnknownRequest,
    /// The server indicates that it couldn't parse one of the requests.
    #[display("Server failed to parse a request: {message} (code: {code})")]
    ParseErrorResponse { code: i64, message: String },
}

/// Turns a JSON-formatted subscription ID into a normalized string.
///
/// Numbers are turned into their decimal representation, and strings are re-encoded as JSON
/// strings without any superfluous escape sequence.
pub fn normalize_subscription_id(subscription_id_json: &str) -> Result<String, parse::ParseError> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum SerdeId<'a> {
        Num(u64),
        Str(Cow<'a, str>),
    }

    match serde_json::from_str::<SerdeId>(subscription_id_json).map_err(parse::ParseError)? {
        SerdeId::Num(n) => Ok(n.to_string()),
        SerdeId::Str(s) => serde_json::to_string(&s).map_err(parse::ParseError),
    }
}

#[cfg(test)]
mod tests {
    use super::{InjectError, InjectedMessage, RequestsTracker};

    #[test]
    fn response_matched_to_request() {
        let mut tracker = RequestsTracker::<u32, ()>::new();
        let request = tracker.build_request("chain_getFinalizedHead", "[]", 7);
        assert_eq!(
            request,
            r#"{"jsonrpc":"2.0","id":1,"method":"chain_getFinalizedHead","params":[]}"#
        );

        match tracker
            .inject_message(r#"{"jsonrpc":"2.0","id":1,"result":"0x00"}"#)
            .unwrap()
        {
            InjectedMessage::Response { user_data, result } => {
                assert_eq!(user_data, 7);
                assert_eq!(result, Ok(r#""0x00""#));
            }
            _ => panic!(),
        }
        assert_eq!(tracker.num_pending_requests(), 0);
    }

    #[test]
    fn unknown_response() {
        let mut tracker = RequestsTracker::<u32, ()>::new();
        assert!(matches!(
            tracker.inject_message(r#"{"jsonrpc":"2.0","id":1,"result":null}"#),
            Err(InjectError::UnknownRequest)
        ));
    }

    #[test]
    fn error_response() {
        let mut tracker = RequestsTracker::<(), ()>::new();
        tracker.build_request("foo", "[]", ());
        match tracker
            .inject_message(
                r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#,
            )
            .unwrap()
        {
            InjectedMessage::Response { result: Err(err), .. } => {
                assert_eq!(err.code, -32601);
                assert_eq!(err.message, "Method not found");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn notification_routing() {
        let mut tracker = RequestsTracker::<(), &'static str>::new();
        let key = tracker.insert_subscription(r#""abc""#, "follow").unwrap();

        match tracker
            .inject_message(
                r#"{"jsonrpc":"2.0","method":"chainHead_v1_followEvent","params":{"subscription":"abc","result":{"event":"stop"}}}"#,
            )
            .unwrap()
        {
            InjectedMessage::Notification {
                subscription_id,
                is_known_subscription,
                method,
                ..
            } => {
                assert_eq!(subscription_id, key);
                assert!(is_known_subscription);
                assert_eq!(method, "chainHead_v1_followEvent");
                assert_eq!(*tracker.subscription_mut(&subscription_id).unwrap(), "follow");
            }
            _ => panic!(),
        }
    }

    #[test]
    fn numeric_subscription_id() {
        let mut tracker = RequestsTracker::<(), ()>::new();
        let key = tracker.insert_subscription("12", ()).unwrap();
        assert_eq!(key, "12");
        assert!(tracker.remove_subscription(&key).is_some());
        assert_eq!(tracker.num_subscriptions(), 0);
    }

    #[test]
    fn clear_drains_everything() {
        let mut tracker = RequestsTracker::<u32, u32>::new();
        tracker.build_request("a", "[]", 1);
        tracker.build_request("b", "[]", 2);
        tracker.insert_subscription(r#""s""#, 3).unwrap();

        let (requests, subscriptions) = tracker.clear();
        let mut requests = requests.collect::<Vec<_>>();
        requests.sort();
        assert_eq!(requests, vec![1, 2]);
        assert_eq!(subscriptions.count(), 1);
        assert_eq!(tracker.num_pending_requests(), 0);
    }
}
