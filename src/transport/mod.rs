// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messaging transport abstraction.
//!
//! A transport opens one authenticated, bidirectional session per device.
//! Sends are non-blocking: `send` hands the message to the transport and
//! returns a receiver that resolves with the terminal outcome once the
//! backend acknowledges (or the link closes). Inbound messages are
//! dispatched to a caller-supplied handler that reports a disposition per
//! message; link state transitions are observable through a watch channel.

mod mqtt;

pub use mqtt::{MqttSession, MqttTransport, MqttTransportBuilder};

use std::sync::Arc;

use tokio::sync::{oneshot, watch};

use crate::credential::DerivedCredential;
use crate::error::{SendError, TransportOpenError};

/// Transport state of one device channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Channel is being established.
    Opening,
    /// Channel is connected and usable.
    Open,
    /// Connection was lost and is being re-established.
    Retrying,
    /// Channel is closed and will not recover.
    Closed,
}

impl LinkState {
    /// Returns true if the channel is usable right now.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true if the channel will never recover.
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Terminal status of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The backend acknowledged the message.
    Accepted,
    /// The link closed before the message was acknowledged.
    Cancelled,
}

/// Asynchronous outcome of a send, delivered through the receiver returned
/// by [`TransportSession::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Terminal status of the send.
    pub status: SendStatus,
    /// The context string supplied with the send.
    pub context: String,
}

/// Disposition a handler reports for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Message was handled; settle it.
    Complete,
    /// Message is not acceptable; reject it.
    Reject,
    /// Message was not handled; give it up without settling.
    Abandon,
}

/// One message received from the backend for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The device the message was addressed to.
    pub device_id: String,
    /// The topic or channel the message arrived on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Handler invoked for every inbound message on a session.
///
/// Handlers run on the transport's dispatch task. A panicking handler is
/// contained by the dispatch loop and treated as [`Disposition::Abandon`].
pub type InboundHandler = Arc<dyn Fn(InboundMessage) -> Disposition + Send + Sync>;

/// Opens authenticated sessions to the messaging backend.
pub trait Transport: Send + Sync + 'static {
    /// The session type this transport produces.
    type Session: TransportSession;

    /// Opens a session to `endpoint` authenticated with `credential`.
    ///
    /// The handler receives every inbound message for the device until the
    /// session closes.
    fn open(
        &self,
        endpoint: &str,
        credential: &DerivedCredential,
        handler: InboundHandler,
    ) -> impl Future<Output = Result<Self::Session, TransportOpenError>> + Send;
}

/// One open, authenticated channel for one device.
pub trait TransportSession: Send + Sync + 'static {
    /// Hands a message to the transport.
    ///
    /// Returns immediately after enqueueing; the terminal outcome arrives
    /// through the returned receiver. Completion ordering across messages is
    /// transport-defined and must not be relied on.
    fn send(
        &self,
        payload: Vec<u8>,
        content_type: &str,
        context: &str,
    ) -> impl Future<Output = Result<oneshot::Receiver<Completion>, SendError>> + Send;

    /// Returns a watch receiver observing the link state.
    fn status(&self) -> watch::Receiver<LinkState>;

    /// Returns the device this session belongs to.
    fn device_id(&self) -> &str;

    /// Closes the session. Pending sends resolve with
    /// [`SendStatus::Cancelled`].
    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_checks() {
        assert!(LinkState::Open.is_open());
        assert!(!LinkState::Opening.is_open());
        assert!(!LinkState::Retrying.is_open());
        assert!(!LinkState::Closed.is_open());

        assert!(LinkState::Closed.is_closed());
        assert!(!LinkState::Retrying.is_closed());
    }

    #[test]
    fn completion_carries_context() {
        let completion = Completion {
            status: SendStatus::Accepted,
            context: "dev-1/7".to_string(),
        };
        assert_eq!(completion.status, SendStatus::Accepted);
        assert_eq!(completion.context, "dev-1/7");
    }
}
