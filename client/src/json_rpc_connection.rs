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

//! Background task that owns the [`Transport`].
//!
//! The [`JsonRpcConnection`] is a cheap-to-clone handle to this task. It assigns identifiers to
//! the requests, matches the responses with the requests, and routes the notifications of the
//! server to the corresponding [`Subscription`].
//!
//! When the transport reports a disconnection, all the requests in progress fail with
//! [`RequestError::Disconnected`] and all the subscriptions are closed. Sending a request while
//! disconnected fails immediately. The lifecycle of the connection can be followed with
//! [`JsonRpcConnection::connection_events`].

use crate::{
    log,
    platform::PlatformRef,
    transport::{Transport, TransportEvent},
};

use alloc::{
    borrow::ToOwned as _,
    format,
    string::{String, ToString as _},
    vec::Vec,
};
use chain_head::json_rpc::requests::{InjectError, InjectedMessage, RequestsTracker};
use core::future;
use futures_channel::oneshot;
use futures_lite::FutureExt as _;

/// Configuration for a new [`JsonRpcConnection`].
pub struct Config<TPlat> {
    /// Access to the platform's capabilities.
    pub platform: TPlat,

    /// Name of the chain, for logging purposes.
    pub log_name: String,

    /// Channels connected to the server.
    pub transport: Transport,
}

/// Lifecycle event of the connection to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is established.
    Connected,
    /// The connection has been lost.
    Disconnected,
    /// The transport is trying to reconnect.
    Reconnecting,
    /// The transport has reported an error.
    Error(String),
}

/// Handle to the background task owning the connection.
#[derive(Clone)]
pub struct JsonRpcConnection {
    to_background: async_channel::Sender<ToBackground>,
}

/// Subscription to notifications of the server.
///
/// Dropping this object unsubscribes.
pub struct Subscription {
    /// Subscription ID as returned by the server, JSON-encoded.
    id_json: String,
    /// Normalized subscription ID, as tracked by the background task.
    id: String,
    notifications: async_channel::Receiver<String>,
    unsubscribe: async_channel::Sender<String>,
}

impl Subscription {
    /// Returns the JSON-encoded ID of the subscription, as returned by the server. Can be
    /// inserted as is in the parameters of a request.
    pub fn id_json(&self) -> &str {
        &self.id_json
    }

    /// Waits for the next notification and returns its JSON-encoded `result`.
    ///
    /// Returns `None` if the subscription is dead, for example because the connection has been
    /// lost, or because the notifications weren't consumed quickly enough.
    pub async fn next(&mut self) -> Option<String> {
        self.notifications.recv().await.ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The channel is unbounded, and an error means that the background task is gone.
        let _ = self.unsubscribe.try_send(core::mem::take(&mut self.id));
    }
}

/// Error potentially returned when sending a request.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum RequestError {
    /// Not connected to the server, or the connection has been lost before the response
    /// arrived.
    #[display("Not connected to the server")]
    Disconnected,
    /// The server has answered with an error.
    #[display("Error returned by the server: {message} (code: {code})")]
    Rpc { code: i64, message: String },
    /// The response of the server can't be interpreted.
    #[display("Invalid response from the server: {_0}")]
    InvalidResponse(#[error(not(source))] String),
}

enum ToBackground {
    Request {
        method: &'static str,
        params_json: String,
        result_tx: oneshot::Sender<Result<String, RequestError>>,
    },
    Subscribe {
        method: &'static str,
        params_json: String,
        unsubscribe_method: &'static str,
        buffer_size: usize,
        result_tx: oneshot::Sender<Result<Subscription, RequestError>>,
    },
    ConnectionEvents {
        events_tx: async_channel::Sender<ConnectionEvent>,
    },
}

impl JsonRpcConnection {
    /// Spawns the background task and returns a handle to it.
    pub fn new<TPlat: PlatformRef>(config: Config<TPlat>) -> Self {
        let (to_background, from_frontend) = async_channel::bounded(32);
        let (unsubscribe_tx, unsubscribe_rx) = async_channel::unbounded();
        let log_target = format!("json-rpc-{}", config.log_name);

        let task = Background {
            platform: config.platform.clone(),
            log_target: log_target.clone(),
            to_server: config.transport.to_server,
            from_server: config.transport.from_server,
            from_frontend,
            unsubscribe_tx,
            unsubscribe_rx,
            tracker: RequestsTracker::new(),
            connected: false,
            transport_closed: false,
            events_subscribers: Vec::with_capacity(4),
        };

        config
            .platform
            .spawn_task(log_target.into(), run_background(task));

        JsonRpcConnection { to_background }
    }

    /// Sends a request and waits for its response. Returns the JSON-encoded `result`.
    ///
    /// # Panic
    ///
    /// Panics if `params_json` isn't valid JSON.
    ///
    pub async fn request(
        &self,
        method: &'static str,
        params_json: String,
    ) -> Result<String, RequestError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.to_background
            .send(ToBackground::Request {
                method,
                params_json,
                result_tx,
            })
            .await
            .map_err(|_| RequestError::Disconnected)?;
        result_rx.await.unwrap_or(Err(RequestError::Disconnected))
    }

    /// Sends a subscription request. The response of the server must be the subscription ID.
    ///
    /// `unsubscribe_method` is the method called with the subscription ID as parameter when the
    /// [`Subscription`] is dropped. `buffer_size` is the number of notifications that can be
    /// queued. The subscription is killed if this buffer is full.
    ///
    /// # Panic
    ///
    /// Panics if `params_json` isn't valid JSON.
    ///
    pub async fn subscribe(
        &self,
        method: &'static str,
        params_json: String,
        unsubscribe_method: &'static str,
        buffer_size: usize,
    ) -> Result<Subscription, RequestError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.to_background
            .send(ToBackground::Subscribe {
                method,
                params_json,
                unsubscribe_method,
                buffer_size,
                result_tx,
            })
            .await
            .map_err(|_| RequestError::Disconnected)?;
        result_rx.await.unwrap_or(Err(RequestError::Disconnected))
    }

    /// Returns a channel that receives the lifecycle events of the connection.
    ///
    /// If the connection is currently established, [`ConnectionEvent::Connected`] is
    /// immediately sent. The channel is closed if it is full.
    pub async fn connection_events(&self) -> async_channel::Receiver<ConnectionEvent> {
        let (events_tx, events_rx) = async_channel::bounded(16);
        let _ = self
            .to_background
            .send(ToBackground::ConnectionEvents { events_tx })
            .await;
        events_rx
    }
}

struct Background<TPlat> {
    platform: TPlat,
    log_target: String,

    to_server: async_channel::Sender<String>,
    from_server: async_channel::Receiver<TransportEvent>,
    from_frontend: async_channel::Receiver<ToBackground>,

    /// Sender cloned into each [`Subscription`].
    unsubscribe_tx: async_channel::Sender<String>,
    /// Normalized IDs of the subscriptions that have been dropped.
    unsubscribe_rx: async_channel::Receiver<String>,

    tracker: RequestsTracker<PendingRequest, SubscriptionEntry>,

    /// `true` between a [`TransportEvent::Connected`] and a [`TransportEvent::Disconnected`].
    connected: bool,
    /// `true` if the transport channels are closed. Nothing can be sent anymore.
    transport_closed: bool,

    events_subscribers: Vec<async_channel::Sender<ConnectionEvent>>,
}

enum PendingRequest {
    Request(oneshot::Sender<Result<String, RequestError>>),
    Subscribe {
        unsubscribe_method: &'static str,
        buffer_size: usize,
        result_tx: oneshot::Sender<Result<Subscription, RequestError>>,
    },
    /// Unsubscription request whose response is ignored.
    Unsubscribe,
}

impl PendingRequest {
    fn fail(self, error: RequestError) {
        match self {
            PendingRequest::Request(result_tx) => {
                let _ = result_tx.send(Err(error));
            }
            PendingRequest::Subscribe { result_tx, .. } => {
                let _ = result_tx.send(Err(error));
            }
            PendingRequest::Unsubscribe => {}
        }
    }
}

struct SubscriptionEntry {
    id_json: String,
    unsubscribe_method: &'static str,
    notifications_tx: async_channel::Sender<String>,
}

async fn run_background<TPlat: PlatformRef>(mut task: Background<TPlat>) {
    loop {
        enum WakeUpReason {
            Frontend(ToBackground),
            FrontendClosed,
            Unsubscribe(String),
            Transport(TransportEvent),
            TransportClosed,
        }

        let wake_up_reason = {
            let from_frontend = async {
                task.from_frontend
                    .recv()
                    .await
                    .map_or(WakeUpReason::FrontendClosed, WakeUpReason::Frontend)
            };
            let unsubscribe = async {
                match task.unsubscribe_rx.recv().await {
                    Ok(id) => WakeUpReason::Unsubscribe(id),
                    Err(_) => future::pending().await,
                }
            };
            let from_transport = async {
                if task.transport_closed {
                    future::pending().await
                } else {
                    task.from_server
                        .recv()
                        .await
                        .map_or(WakeUpReason::TransportClosed, WakeUpReason::Transport)
                }
            };

            from_transport.or(unsubscribe).or(from_frontend).await
        };

        match wake_up_reason {
            WakeUpReason::FrontendClosed => {
                log!(&task.platform, Debug, &task.log_target, "shutdown");
                return;
            }

            WakeUpReason::Frontend(ToBackground::Request {
                method,
                params_json,
                result_tx,
            }) => {
                if !task.connected {
                    let _ = result_tx.send(Err(RequestError::Disconnected));
                    continue;
                }

                let request = task.tracker.build_request(
                    method,
                    &params_json,
                    PendingRequest::Request(result_tx),
                );
                task.send_to_server(request).await;
            }

            WakeUpReason::Frontend(ToBackground::Subscribe {
                method,
                params_json,
                unsubscribe_method,
                buffer_size,
                result_tx,
            }) => {
                if !task.connected {
                    let _ = result_tx.send(Err(RequestError::Disconnected));
                    continue;
                }

                let request = task.tracker.build_request(
                    method,
                    &params_json,
                    PendingRequest::Subscribe {
                        unsubscribe_method,
                        buffer_size,
                        result_tx,
                    },
                );
                task.send_to_server(request).await;
            }

            WakeUpReason::Frontend(ToBackground::ConnectionEvents { events_tx }) => {
                if task.connected && events_tx.try_send(ConnectionEvent::Connected).is_err() {
                    continue;
                }
                task.events_subscribers.push(events_tx);
            }

            WakeUpReason::Unsubscribe(id) => {
                let Some(entry) = task.tracker.remove_subscription(&id) else {
                    // Already removed, for example because of a disconnection.
                    continue;
                };

                log!(
                    &task.platform,
                    Trace,
                    &task.log_target,
                    "unsubscribe",
                    subscription = entry.id_json,
                    method = entry.unsubscribe_method
                );

                if task.connected {
                    let request = task.tracker.build_request(
                        entry.unsubscribe_method,
                        &format!("[{}]", entry.id_json),
                        PendingRequest::Unsubscribe,
                    );
                    task.send_to_server(request).await;
                }
            }

            WakeUpReason::Transport(TransportEvent::Connected) => {
                log!(&task.platform, Debug, &task.log_target, "connected");
                task.connected = true;
                task.broadcast(ConnectionEvent::Connected);
            }

            WakeUpReason::Transport(TransportEvent::Disconnected) => {
                log!(
                    &task.platform,
                    Debug,
                    &task.log_target,
                    "disconnected",
                    pending_requests = task.tracker.num_pending_requests(),
                    subscriptions = task.tracker.num_subscriptions()
                );
                task.connection_lost();
                task.broadcast(ConnectionEvent::Disconnected);
            }

            WakeUpReason::Transport(TransportEvent::Reconnecting) => {
                log!(&task.platform, Debug, &task.log_target, "reconnecting");
                task.broadcast(ConnectionEvent::Reconnecting);
            }

            WakeUpReason::Transport(TransportEvent::Error(error)) => {
                log!(
                    &task.platform,
                    Warn,
                    &task.log_target,
                    "transport-error",
                    error
                );
                task.broadcast(ConnectionEvent::Error(error));
            }

            WakeUpReason::Transport(TransportEvent::Message(message)) => {
                task.inject_message(&message);
            }

            WakeUpReason::TransportClosed => {
                log!(&task.platform, Warn, &task.log_target, "transport-closed");
                task.transport_closed = true;
                if task.connected {
                    task.connection_lost();
                    task.broadcast(ConnectionEvent::Disconnected);
                }
                task.broadcast(ConnectionEvent::Error("transport closed".to_owned()));
            }
        }
    }
}

impl<TPlat: PlatformRef> Background<TPlat> {
    async fn send_to_server(&mut self, request: String) {
        log!(
            &self.platform,
            Trace,
            &self.log_target,
            "request",
            request
        );

        if self.to_server.send(request).await.is_err() {
            log!(&self.platform, Warn, &self.log_target, "transport-closed");
            self.transport_closed = true;
            self.connection_lost();
            self.broadcast(ConnectionEvent::Disconnected);
            self.broadcast(ConnectionEvent::Error("transport closed".to_owned()));
        }
    }

    /// Fails all the requests in progress and closes all the subscriptions.
    fn connection_lost(&mut self) {
        self.connected = false;
        let (requests, subscriptions) = self.tracker.clear();
        for request in requests {
            request.fail(RequestError::Disconnected);
        }
        // Dropping the senders closes the subscriptions.
        for _ in subscriptions {}
    }

    fn broadcast(&mut self, event: ConnectionEvent) {
        self.events_subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn inject_message(&mut self, message: &str) {
        match self.tracker.inject_message(message) {
            Ok(InjectedMessage::Response { user_data, result }) => {
                let result = result.map_err(|err| RequestError::Rpc {
                    code: err.code,
                    message: err.message.to_owned(),
                });

                match (user_data, result) {
                    (PendingRequest::Request(result_tx), result) => {
                        let _ = result_tx.send(result.map(|r| r.to_owned()));
                    }
                    (PendingRequest::Subscribe { result_tx, .. }, Err(err)) => {
                        let _ = result_tx.send(Err(err));
                    }
                    (
                        PendingRequest::Subscribe {
                            unsubscribe_method,
                            buffer_size,
                            result_tx,
                        },
                        Ok(subscription_id_json),
                    ) => {
                        let (notifications_tx, notifications) =
                            async_channel::bounded(buffer_size.max(1));
                        let entry = SubscriptionEntry {
                            id_json: subscription_id_json.to_owned(),
                            unsubscribe_method,
                            notifications_tx,
                        };
                        let id = match self.tracker.insert_subscription(subscription_id_json, entry)
                        {
                            Ok(id) => id,
                            Err(err) => {
                                let _ = result_tx
                                    .send(Err(RequestError::InvalidResponse(err.to_string())));
                                return;
                            }
                        };

                        log!(
                            &self.platform,
                            Trace,
                            &self.log_target,
                            "subscribed",
                            subscription = subscription_id_json
                        );

                        // If the frontend is gone, dropping the subscription unsubscribes.
                        let _ = result_tx.send(Ok(Subscription {
                            id_json: subscription_id_json.to_owned(),
                            id,
                            notifications,
                            unsubscribe: self.unsubscribe_tx.clone(),
                        }));
                    }
                    (PendingRequest::Unsubscribe, Err(err)) => {
                        log!(
                            &self.platform,
                            Debug,
                            &self.log_target,
                            "unsubscribe-failed",
                            error = err
                        );
                    }
                    (PendingRequest::Unsubscribe, Ok(_)) => {}
                }
            }

            Ok(InjectedMessage::Notification {
                subscription_id,
                is_known_subscription,
                method,
                result_json,
            }) => {
                if !is_known_subscription {
                    log!(
                        &self.platform,
                        Debug,
                        &self.log_target,
                        "notification-unknown-subscription",
                        subscription = subscription_id,
                        method
                    );
                    return;
                }

                let Some(entry) = self.tracker.subscription_mut(&subscription_id) else {
                    return;
                };

                match entry.notifications_tx.try_send(result_json.to_owned()) {
                    Ok(()) => {}
                    Err(async_channel::TrySendError::Full(_)) => {
                        // Killing the subscription makes its owner notice that notifications
                        // have been missed.
                        entry.notifications_tx.close();
                        log!(
                            &self.platform,
                            Warn,
                            &self.log_target,
                            "subscription-overflow",
                            subscription = subscription_id,
                            method
                        );
                        let _ = self.unsubscribe_tx.try_send(subscription_id);
                    }
                    Err(async_channel::TrySendError::Closed(_)) => {
                        let _ = self.unsubscribe_tx.try_send(subscription_id);
                    }
                }
            }

            Err(InjectError::UnknownRequest) => {
                log!(
                    &self.platform,
                    Debug,
                    &self.log_target,
                    "response-unknown-request",
                    message
                );
            }

            Err(err) => {
                log!(
                    &self.platform,
                    Warn,
                    &self.log_target,
                    "invalid-message",
                    error = err,
                    message
                );
            }
        }
    }
}
