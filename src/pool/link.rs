// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pool-owned connection handle for one device.

use tokio::sync::{oneshot, watch};

use crate::error::SendError;
use crate::transport::{Completion, LinkState, TransportSession};

/// A live, authenticated channel for one device.
///
/// Owned by the pool entry for its device; callers hold it through an
/// `Arc` obtained from [`DevicePool::acquire`](super::DevicePool::acquire).
/// The pool evicts the entry once the underlying channel reports
/// [`LinkState::Closed`].
pub struct DeviceLink<S: TransportSession> {
    device_id: String,
    endpoint: String,
    session: S,
}

impl<S: TransportSession> DeviceLink<S> {
    pub(super) fn new(device_id: String, endpoint: String, session: S) -> Self {
        Self {
            device_id,
            endpoint,
            session,
        }
    }

    /// Returns the device this link belongs to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the assigned endpoint this link is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the current transport state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.session.status().borrow()
    }

    /// Returns true if the channel is usable right now.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Returns a watch receiver observing the link state.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<LinkState> {
        self.session.status()
    }

    /// Hands a message to the transport.
    ///
    /// Non-blocking beyond the enqueue; the terminal outcome arrives through
    /// the returned receiver together with the supplied context.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the transport refuses the message.
    pub async fn send(
        &self,
        payload: Vec<u8>,
        content_type: &str,
        context: &str,
    ) -> Result<oneshot::Receiver<Completion>, SendError> {
        self.session.send(payload, content_type, context).await
    }

    /// Closes the underlying channel.
    pub async fn close(&self) {
        self.session.close().await;
    }
}

impl<S: TransportSession> std::fmt::Debug for DeviceLink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("device_id", &self.device_id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
