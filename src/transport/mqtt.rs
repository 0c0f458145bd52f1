// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport implementation.
//!
//! Each device gets its own MQTT session against its assigned endpoint,
//! authenticated with the derived credential (username = device id,
//! password = derived key). Telemetry goes out on
//! `devices/<id>/messages/events`; commands arrive on
//! `devices/<id>/messages/commands/#`.
//!
//! Acknowledgements for QoS 1 publishes are matched to pending sends in
//! submission order. That matching is a property of this transport, not a
//! guarantee of the core; callers must not assume cross-message ordering.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{oneshot, watch};

use crate::credential::DerivedCredential;
use crate::error::{SendError, TransportOpenError};

use super::{
    Completion, Disposition, InboundHandler, InboundMessage, LinkState, SendStatus, Transport,
    TransportSession,
};

/// Consecutive event-loop failures tolerated before the link is closed.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Delay before the event loop retries after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Builder for [`MqttTransport`].
#[derive(Debug, Clone)]
pub struct MqttTransportBuilder {
    keep_alive: Duration,
    open_timeout: Duration,
}

impl MqttTransportBuilder {
    /// Default MQTT keep-alive interval.
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// Default budget for the channel to reach `Open`.
    pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
            open_timeout: Self::DEFAULT_OPEN_TIMEOUT,
        }
    }

    /// Sets the MQTT keep-alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the budget for the channel to reach `Open`.
    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Builds the transport.
    #[must_use]
    pub fn build(self) -> MqttTransport {
        MqttTransport {
            keep_alive: self.keep_alive,
            open_timeout: self.open_timeout,
        }
    }
}

impl Default for MqttTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// MQTT-backed [`Transport`].
#[derive(Debug, Clone)]
pub struct MqttTransport {
    keep_alive: Duration,
    open_timeout: Duration,
}

impl MqttTransport {
    /// Creates a transport with default settings.
    #[must_use]
    pub fn new() -> Self {
        MqttTransportBuilder::new().build()
    }
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn open(
        &self,
        endpoint: &str,
        credential: &DerivedCredential,
        handler: InboundHandler,
    ) -> Result<MqttSession, TransportOpenError> {
        let device_id = credential.device_id().to_string();
        let (host, port) = parse_endpoint(endpoint).map_err(|cause| TransportOpenError {
            endpoint: endpoint.to_string(),
            cause,
        })?;

        let mut options = MqttOptions::new(&device_id, host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(&device_id, credential.key_base64());

        let (client, event_loop) = AsyncClient::new(options, 10);
        let (status_tx, status_rx) = watch::channel(LinkState::Opening);
        let pending = Arc::new(PendingCompletions::new());

        // The command subscription is issued by the event loop on every
        // ConnAck; the session is clean, so it must be re-established after
        // each reconnect.
        tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            device_id.clone(),
            format!("devices/{device_id}/messages/commands/#"),
            status_tx,
            Arc::clone(&pending),
            handler,
        ));

        let session = MqttSession {
            device_id: device_id.clone(),
            events_topic: format!("devices/{device_id}/messages/events"),
            client,
            pending,
            status_rx,
        };

        // Wait for the event loop to report the channel usable. The state is
        // copied out so the watch read guard is not held across an await.
        let mut status = session.status_rx.clone();
        let opened =
            tokio::time::timeout(self.open_timeout, status.wait_for(|s| *s != LinkState::Opening))
                .await
                .map(|outcome| outcome.map(|state| *state));

        match opened {
            Ok(Ok(state)) if state.is_open() => Ok(session),
            Ok(Ok(_)) | Ok(Err(_)) => {
                session.close().await;
                Err(TransportOpenError {
                    endpoint: endpoint.to_string(),
                    cause: "channel closed during connect".to_string(),
                })
            }
            Err(_) => {
                session.close().await;
                Err(TransportOpenError {
                    endpoint: endpoint.to_string(),
                    cause: format!(
                        "channel did not open within {} ms",
                        self.open_timeout.as_millis()
                    ),
                })
            }
        }
    }
}

/// One open MQTT channel for one device.
pub struct MqttSession {
    device_id: String,
    events_topic: String,
    client: AsyncClient,
    pending: Arc<PendingCompletions>,
    status_rx: watch::Receiver<LinkState>,
}

impl TransportSession for MqttSession {
    async fn send(
        &self,
        payload: Vec<u8>,
        content_type: &str,
        context: &str,
    ) -> Result<oneshot::Receiver<Completion>, SendError> {
        if self.status_rx.borrow().is_closed() {
            return Err(SendError::LinkClosed);
        }

        tracing::debug!(
            device_id = %self.device_id,
            topic = %self.events_topic,
            content_type,
            context,
            "Sending message"
        );

        let (completion_tx, completion_rx) = oneshot::channel();
        let token = self.pending.push(context.to_string(), completion_tx);

        if let Err(e) = self
            .client
            .publish(&self.events_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.pending.remove(token);
            return Err(SendError::Rejected(e.to_string()));
        }

        Ok(completion_rx)
    }

    fn status(&self) -> watch::Receiver<LinkState> {
        self.status_rx.clone()
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn close(&self) {
        // The event loop observes the disconnect and marks the link Closed.
        let _ = self.client.disconnect().await;
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("device_id", &self.device_id)
            .field("state", &*self.status_rx.borrow())
            .finish_non_exhaustive()
    }
}

/// Sends awaiting acknowledgement, resolved in submission order.
struct PendingCompletions {
    queue: Mutex<VecDeque<(u64, String, oneshot::Sender<Completion>)>>,
    next_token: AtomicU64,
}

impl PendingCompletions {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Registers a pending send and returns its removal token.
    fn push(&self, context: String, tx: oneshot::Sender<Completion>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back((token, context, tx));
        token
    }

    /// Removes a pending send that was never handed to the transport.
    fn remove(&self, token: u64) {
        self.queue.lock().retain(|(t, _, _)| *t != token);
    }

    /// Resolves the oldest pending send.
    fn resolve_next(&self, status: SendStatus) {
        let entry = self.queue.lock().pop_front();
        match entry {
            Some((_, context, tx)) => {
                // Receiver may have been dropped; that is fine.
                let _ = tx.send(Completion { status, context });
            }
            None => tracing::warn!("Acknowledgement received with no pending send"),
        }
    }

    /// Resolves every pending send with the given status.
    fn drain(&self, status: SendStatus) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for (_, context, tx) in drained {
            let _ = tx.send(Completion { status, context });
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Drives the MQTT event loop for one session.
async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    device_id: String,
    commands_topic: String,
    status_tx: watch::Sender<LinkState>,
    pending: Arc<PendingCompletions>,
    handler: InboundHandler,
) {
    let mut consecutive_errors = 0u32;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::debug!(device_id = %device_id, ?ack, "Channel connected");
                consecutive_errors = 0;
                // Clean session: the command subscription does not survive a
                // reconnect and must be re-issued here.
                if let Err(e) = client.try_subscribe(&commands_topic, QoS::AtLeastOnce) {
                    tracing::warn!(
                        device_id = %device_id,
                        error = %e,
                        "Command subscribe failed"
                    );
                }
                status_tx.send_replace(LinkState::Open);
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                pending.resolve_next(SendStatus::Accepted);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    device_id: device_id.clone(),
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                let disposition = dispatch_inbound(&handler, message);
                tracing::debug!(
                    device_id = %device_id,
                    topic = %publish.topic,
                    ?disposition,
                    "Dispatched inbound message"
                );
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!(device_id = %device_id, "Channel disconnected by peer");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                // Client-initiated close is terminal; do not reconnect.
                tracing::info!(device_id = %device_id, "Channel closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!(
                        device_id = %device_id,
                        error = %e,
                        "Giving up on channel after repeated failures"
                    );
                    break;
                }
                tracing::warn!(
                    device_id = %device_id,
                    error = %e,
                    attempt = consecutive_errors,
                    "Channel error, reconnecting"
                );
                status_tx.send_replace(LinkState::Retrying);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    status_tx.send_replace(LinkState::Closed);
    pending.drain(SendStatus::Cancelled);
}

/// Invokes the inbound handler, containing panics.
///
/// A panicking handler must not take the dispatch loop down; the message is
/// treated as abandoned and the loop keeps running.
fn dispatch_inbound(handler: &InboundHandler, message: InboundMessage) -> Disposition {
    let topic = message.topic.clone();
    std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))).unwrap_or_else(|_| {
        tracing::error!(topic = %topic, "Inbound handler panicked, abandoning message");
        Disposition::Abandon
    })
}

/// Parses an endpoint into host and port, defaulting to 1883.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16), String> {
    let trimmed = endpoint
        .strip_prefix("mqtt://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint);

    if trimmed.is_empty() {
        return Err("empty endpoint".to_string());
    }

    if let Some((host, port)) = trimmed.rsplit_once(':') {
        let port = port
            .parse()
            .map_err(|_| format!("invalid port: {port}"))?;
        Ok((host.to_string(), port))
    } else {
        Ok((trimmed.to_string(), 1883))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::credential::derive_device_key;

    // Compile-time check: the open future must be spawnable from multi-threaded
    // callers, so it may not hold a watch read guard across an await.
    #[test]
    fn open_future_is_send() {
        fn require_send<F: Send>(_: &F) {}

        let transport = MqttTransport::new();
        let credential = derive_device_key("c2hhcmVkLWdyb3VwLWtleQ==", "dev-1").unwrap();
        let handler: InboundHandler = Arc::new(|_| Disposition::Complete);

        let fut = transport.open("hub.example.net", &credential, handler);
        require_send(&fut);
        drop(fut);
    }

    #[test]
    fn parse_endpoint_with_scheme() {
        let (host, port) = parse_endpoint("mqtt://hub.example.net:8883").unwrap();
        assert_eq!(host, "hub.example.net");
        assert_eq!(port, 8883);
    }

    #[test]
    fn parse_endpoint_default_port() {
        let (host, port) = parse_endpoint("hub.example.net").unwrap();
        assert_eq!(host, "hub.example.net");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_bad_port() {
        assert!(parse_endpoint("hub.example.net:not-a-port").is_err());
    }

    #[test]
    fn parse_endpoint_rejects_empty() {
        assert!(parse_endpoint("mqtt://").is_err());
    }

    #[test]
    fn pending_completions_resolve_in_order() {
        let pending = PendingCompletions::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.push("first".to_string(), tx1);
        pending.push("second".to_string(), tx2);

        pending.resolve_next(SendStatus::Accepted);
        pending.resolve_next(SendStatus::Accepted);

        let first = rx1.blocking_recv().unwrap();
        let second = rx2.blocking_recv().unwrap();
        assert_eq!(first.context, "first");
        assert_eq!(second.context, "second");
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn pending_completions_remove_by_token() {
        let pending = PendingCompletions::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let token = pending.push("dropped".to_string(), tx1);
        pending.push("kept".to_string(), tx2);

        pending.remove(token);
        assert_eq!(pending.len(), 1);

        pending.resolve_next(SendStatus::Accepted);
        assert_eq!(rx2.blocking_recv().unwrap().context, "kept");
    }

    #[test]
    fn drain_cancels_everything_pending() {
        let pending = PendingCompletions::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.push("a".to_string(), tx1);
        pending.push("b".to_string(), tx2);

        pending.drain(SendStatus::Cancelled);

        assert_eq!(rx1.blocking_recv().unwrap().status, SendStatus::Cancelled);
        assert_eq!(rx2.blocking_recv().unwrap().status, SendStatus::Cancelled);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn dispatch_contains_handler_panic() {
        let handler: InboundHandler = Arc::new(|_| panic!("handler exploded"));
        let message = InboundMessage {
            device_id: "dev-1".to_string(),
            topic: "devices/dev-1/messages/commands/run".to_string(),
            payload: b"{}".to_vec(),
        };

        let disposition = dispatch_inbound(&handler, message);
        assert_eq!(disposition, Disposition::Abandon);
    }

    #[test]
    fn dispatch_returns_handler_disposition() {
        let handler: InboundHandler = Arc::new(|message| {
            assert_eq!(message.device_id, "dev-1");
            Disposition::Complete
        });
        let message = InboundMessage {
            device_id: "dev-1".to_string(),
            topic: "devices/dev-1/messages/commands/run".to_string(),
            payload: b"{}".to_vec(),
        };

        assert_eq!(dispatch_inbound(&handler, message), Disposition::Complete);
    }
}
