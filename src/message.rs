// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message payloads exchanged with the backend.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A telemetry or command message as it goes over the wire.
///
/// Serialization is deterministic: field order is fixed and `ts` is epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Monotonically increasing, process-local message id.
    pub id: String,
    /// Origin marker (`"DPS"` for pool-published telemetry, `"SERVICE"` for
    /// relayed commands).
    pub data: String,
    /// Caller-supplied message type.
    #[serde(rename = "type")]
    pub kind: String,
    /// The device this message concerns.
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Timestamp in epoch milliseconds.
    pub ts: i64,
}

impl GatewayMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        data: impl Into<String>,
        kind: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            kind: kind.into(),
            device_id: device_id.into(),
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Sets an explicit timestamp.
    #[must_use]
    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }
}

/// Generator for process-local message identifiers.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl MessageIdGenerator {
    /// Creates a generator starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next message id.
    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_field_names() {
        let message = GatewayMessage::new("7", "DPS", "t1", "dev-1").with_ts(1_700_000_000_000);
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"id":"7","data":"DPS","type":"t1","deviceId":"dev-1","ts":1700000000000}"#
        );
    }

    #[test]
    fn round_trips_through_json() {
        let message = GatewayMessage::new("1", "SERVICE", "cmd", "dev-9").with_ts(42);
        let json = serde_json::to_string(&message).unwrap();
        let parsed: GatewayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn new_message_has_current_timestamp() {
        let before = chrono::Utc::now().timestamp_millis();
        let message = GatewayMessage::new("0", "DPS", "t1", "dev-1");
        let after = chrono::Utc::now().timestamp_millis();
        assert!(message.ts >= before && message.ts <= after);
    }

    #[test]
    fn id_generator_is_monotonic() {
        let ids = MessageIdGenerator::new();
        assert_eq!(ids.next_id(), "0");
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
    }
}
