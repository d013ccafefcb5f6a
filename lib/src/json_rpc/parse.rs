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

//! Build JSON-RPC requests, and parse the responses and notifications sent back by a server.
//!
//! The functions that parse messages don't allocate. They return slices of the original message
//! containing the JSON-formatted fields, which can then be deserialized with the types found in
//! the [`methods`](super::methods) module.

use alloc::{borrow::Cow, string::String};

/// Parses a JSON-encoded message sent by a JSON-RPC server, which can be either a response to a
/// request or a subscription notification.
pub fn parse_server_message(message_json: &str) -> Result<ServerMessage, ParseError> {
    match parse_response(message_json) {
        Ok(response) => Ok(ServerMessage::Response(response)),
        Err(response_error) => match parse_notification(message_json) {
            Ok(notification) => Ok(ServerMessage::Notification(notification)),
            // Report the error of the response parsing, as responses are the most common.
            Err(_) => Err(response_error),
        },
    }
}

/// Parses a JSON-encoded subscription notification.
///
/// Notifications have the shape of a JSON-RPC request without an `id`, and whose `params` field
/// is an object containing a `subscription` and a `result` field.
pub fn parse_notification(notification_json: &str) -> Result<Notification, ParseError> {
    let serde_notification: SerdeNotification =
        serde_json::from_str(notification_json).map_err(ParseError)?;
    check_id(serde_notification.params.subscription.get())?;

    Ok(Notification {
        method: serde_notification.method,
        subscription_id_json: serde_notification.params.subscription.get(),
        result_json: serde_notification.params.result.get(),
    })
}

/// Parses a JSON-encoded RPC response.
pub fn parse_response(response_json: &str) -> Result<Response, ParseError> {
    let success_error = match serde_json::from_str::<SerdeSuccess>(response_json) {
        Ok(success) => {
            check_id(success.id.get())?;
            return Ok(Response::Success {
                id_json: success.id.get(),
                result_json: success.result.get(),
            });
        }
        Err(err) => err,
    };

    let Ok(failure) = serde_json::from_str::<SerdeFailure>(response_json) else {
        return Err(ParseError(success_error));
    };

    if failure.id.get() == "null" {
        return Ok(Response::ParseError {
            error_code: failure.error.code.to_num(),
            error_message: failure.error.message,
        });
    }

    check_id(failure.id.get())?;
    Ok(Response::Error {
        id_json: failure.id.get(),
        error_code: failure.error.code.to_num(),
        error_message: failure.error.message,
        error_data_json: failure.error.data.map(|d| d.get()),
    })
}

/// Builds a JSON request.
///
/// # Panic
///
/// Panics if the [`Request::id_json`] or [`Request::params_json`] isn't valid JSON.
///
pub fn build_request(request: &Request) -> String {
    serde_json::to_string(&SerdeRequest {
        jsonrpc: SerdeVersion::V2,
        id: request
            .id_json
            .map(|id| serde_json::from_str(id).expect("invalid id_json")),
        method: request.method,
        params: request
            .params_json
            .map(|p| serde_json::from_str(p).expect("invalid params_json")),
    })
    .unwrap_or_else(|_| unreachable!())
}

/// Message sent by a JSON-RPC server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage<'a> {
    /// Response to a request.
    Response(Response<'a>),
    /// Subscription notification.
    Notification(Notification<'a>),
}

/// JSON-RPC request to pass to [`build_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    /// JSON-formatted identifier of the request. `None` for notifications.
    pub id_json: Option<&'a str>,
    /// Name of the method that is being called.
    pub method: &'a str,
    /// JSON-formatted list of parameters. `None` iff the `params` field is missing.
    pub params_json: Option<&'a str>,
}

/// Decoded subscription notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification<'a> {
    /// Name of the method of the notification, for example `chainHead_v1_followEvent`.
    pub method: &'a str,
    /// JSON-formatted identifier of the subscription, as returned by the server when the
    /// subscription was created.
    pub subscription_id_json: &'a str,
    /// JSON-formatted content of the notification.
    pub result_json: &'a str,
}

/// Decoded JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<'a> {
    /// Successful request.
    Success {
        /// JSON-formatted identifier of the request the response corresponds to.
        id_json: &'a str,
        /// JSON-formatted result.
        result_json: &'a str,
    },

    /// Request has failed.
    Error {
        /// JSON-formatted identifier of the request the response corresponds to.
        id_json: &'a str,
        /// Integer indicating the nature of the error.
        ///
        /// See [the JSON-RPC specification](https://www.jsonrpc.org/specification#error_object)
        /// for reference.
        error_code: i64,
        /// Short description of the error.
        error_message: &'a str,
        /// JSON-formatted data associated with the response. `None` if omitted.
        error_data_json: Option<&'a str>,
    },

    /// The JSON-RPC server indicates that it couldn't parse a request. The identifier of the
    /// request isn't known.
    ParseError {
        /// Integer indicating the nature of the error.
        error_code: i64,
        /// Short description of the error.
        error_message: &'a str,
    },
}

impl<'a> Response<'a> {
    /// Returns the JSON-formatted identifier of the request this response corresponds to, if
    /// known.
    pub fn id_json(&self) -> Option<&'a str> {
        match self {
            Response::Success { id_json, .. } | Response::Error { id_json, .. } => Some(id_json),
            Response::ParseError { .. } => None,
        }
    }

    /// Utility function that returns `Some` if `self` is [`Response::Success`]. If `Some` is
    /// returned, it contains in order the JSON-formatted identifier of the request and the
    /// JSON-formatted content of the `result` field.
    pub fn into_success(self) -> Option<(&'a str, &'a str)> {
        if let Response::Success {
            id_json,
            result_json,
        } = self
        {
            Some((id_json, result_json))
        } else {
            None
        }
    }
}

/// Error while parsing a message.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("{_0}")]
pub struct ParseError(#[error(not(source))] pub(crate) serde_json::Error);

/// Checks that an identifier is either a number or a string.
fn check_id(id_json: &str) -> Result<(), ParseError> {
    // Because of https://github.com/serde-rs/json/issues/742, we can't use ̀`&str`.
    #[derive(serde::Deserialize)]
    #[serde(deny_unknown_fields)]
    #[serde(untagged)]
    enum SerdeId<'a> {
        Num(u64),
        Str(Cow<'a, str>),
    }

    serde_json::from_str::<SerdeId>(id_json)
        .map(|_| ())
        .map_err(ParseError)
}

#[derive(Clone, Debug, serde::Serialize)]
struct SerdeRequest<'a> {
    jsonrpc: SerdeVersion,
    #[serde(borrow, skip_serializing_if = "Option::is_none")]
    id: Option<&'a serde_json::value::RawValue>,
    #[serde(borrow)]
    method: &'a str,
    #[serde(borrow, skip_serializing_if = "Option::is_none")]
    params: Option<&'a serde_json::value::RawValue>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SerdeNotification<'a> {
    jsonrpc: SerdeVersion,
    #[serde(borrow)]
    method: &'a str,
    #[serde(borrow)]
    params: SerdeNotificationParams<'a>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SerdeNotificationParams<'a> {
    #[serde(borrow)]
    subscription: &'a serde_json::value::RawValue,
    #[serde(borrow)]
    result: &'a serde_json::value::RawValue,
}

#[derive(Debug, PartialEq, Clone, Copy, Hash, Eq)]
enum SerdeVersion {
    V2,
}

impl serde::Serialize for SerdeVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match *self {
            SerdeVersion::V2 => "2.0".serialize(serializer),
        }
    }
}

impl<'a> serde::Deserialize<'a> for SerdeVersion {
    fn deserialize<D>(deserializer: D) -> Result<SerdeVersion, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let string = <Cow<'a, str>>::deserialize(deserializer)?;
        if string != "2.0" {
            return Err(serde::de::Error::custom("unknown version"));
        }
        Ok(SerdeVersion::V2)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SerdeSuccess<'a> {
    jsonrpc: SerdeVersion,
    #[serde(borrow)]
    id: &'a serde_json::value::RawValue,
    #[serde(borrow)]
    result: &'a serde_json::value::RawValue,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SerdeFailure<'a> {
    jsonrpc: SerdeVersion,
    #[serde(borrow)]
    id: &'a serde_json::value::RawValue,
    #[serde(borrow)]
    error: SerdeError<'a>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct SerdeError<'a> {
    code: SerdeErrorCode,
    #[serde(borrow)]
    message: &'a str,
    #[serde(borrow)]
    data: Option<&'a serde_json::value::RawValue>,
}

#[derive(Debug, PartialEq, Clone)]
enum SerdeErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError(i64),
    MethodError(i64),
}

impl SerdeErrorCode {
    fn from_num(code: i64) -> Self {
        match code {
            -32700 => SerdeErrorCode::ParseError,
            -32600 => SerdeErrorCode::InvalidRequest,
            -32601 => SerdeErrorCode::MethodNotFound,
            -32602 => SerdeErrorCode::InvalidParams,
            -32603 => SerdeErrorCode::InternalError,
            -32099..=-32000 => SerdeErrorCode::ServerError(code),
            code => SerdeErrorCode::MethodError(code),
        }
    }

    fn to_num(&self) -> i64 {
        match *self {
            SerdeErrorCode::ParseError => -32700,
            SerdeErrorCode::InvalidRequest => -32600,
            SerdeErrorCode::MethodNotFound => -32601,
            SerdeErrorCode::InvalidParams => -32602,
            SerdeErrorCode::InternalError => -32603,
            SerdeErrorCode::ServerError(code) => code,
            SerdeErrorCode::MethodError(code) => code,
        }
    }
}

impl<'a> serde::Deserialize<'a> for SerdeErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<SerdeErrorCode, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let code: i64 = serde::Deserialize::deserialize(deserializer)?;
        Ok(SerdeErrorCode::from_num(code))
    }
}
