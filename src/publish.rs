// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound telemetry publisher.

use std::sync::Arc;

use crate::error::{Result, SendError};
use crate::message::{GatewayMessage, MessageIdGenerator};
use crate::pool::DevicePool;
use crate::provision::Provisioner;
use crate::transport::{SendStatus, Transport};

/// Origin marker stamped into pool-published telemetry.
const TELEMETRY_ORIGIN: &str = "DPS";

/// Publishes telemetry on behalf of devices through the connection pool.
///
/// Each publish acquires the device's channel (provisioning it on first
/// use), serializes one [`GatewayMessage`], and hands it to the transport.
/// The send outcome is awaited on a background task and logged; it is not
/// part of the request path.
pub struct TelemetryPublisher<P: Provisioner, T: Transport> {
    pool: Arc<DevicePool<P, T>>,
    ids: MessageIdGenerator,
}

impl<P: Provisioner, T: Transport> TelemetryPublisher<P, T> {
    /// Creates a publisher over `pool`.
    #[must_use]
    pub fn new(pool: Arc<DevicePool<P, T>>) -> Self {
        Self {
            pool,
            ids: MessageIdGenerator::new(),
        }
    }

    /// Publishes one telemetry message of `kind` for `device_id`.
    ///
    /// Returns the message id once the transport has accepted the message.
    /// Failures are surfaced to the caller and never retried here.
    ///
    /// # Errors
    ///
    /// Returns [`Error`](crate::Error) if the channel cannot be acquired or
    /// the transport refuses the message.
    pub async fn publish(&self, kind: &str, device_id: &str) -> Result<String> {
        let link = self.pool.acquire(device_id).await?;

        let id = self.ids.next_id();
        let message = GatewayMessage::new(id.clone(), TELEMETRY_ORIGIN, kind, device_id);
        let payload = serde_json::to_vec(&message).map_err(SendError::from)?;
        let context = format!("{device_id}/{id}");

        let completion = link.send(payload, "application/json", &context).await?;
        tracing::debug!(device_id, message_id = %id, "Telemetry handed to transport");

        tokio::spawn(async move {
            match completion.await {
                Ok(completion) => match completion.status {
                    SendStatus::Accepted => {
                        tracing::info!(context = %completion.context, "Telemetry acknowledged");
                    }
                    SendStatus::Cancelled => {
                        tracing::warn!(
                            context = %completion.context,
                            "Telemetry send cancelled by channel close"
                        );
                    }
                },
                Err(_) => {
                    tracing::warn!("Telemetry completion dropped without a terminal status");
                }
            }
        });

        Ok(id)
    }
}

impl<P: Provisioner, T: Transport> std::fmt::Debug for TelemetryPublisher<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher").finish_non_exhaustive()
    }
}
