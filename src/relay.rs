// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Service-side command relay.
//!
//! Relays back-office commands to devices through the backend's
//! service-facing HTTP endpoint. The relay is stateless: one POST per
//! command, authorized with the gateway's shared access key, no pooling and
//! no retries.

use std::time::Duration;

use crate::config::ServiceConfig;
use crate::error::{ConfigError, Error, SendError};
use crate::message::{GatewayMessage, MessageIdGenerator};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Origin marker stamped into relayed command messages.
const COMMAND_ORIGIN: &str = "SERVICE";

/// Sends cloud-to-device commands through the backend service endpoint.
pub struct CommandRelay {
    client: reqwest::Client,
    endpoint: String,
    access_key: String,
    ids: MessageIdGenerator,
}

impl CommandRelay {
    /// Creates a relay for the configured service endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: ServiceConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid {
                name: "service client".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            access_key: config.access_key,
            ids: MessageIdGenerator::new(),
        })
    }

    /// Relays one command message of `kind` to `device_id`.
    ///
    /// Returns the message id once the backend has accepted the command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`](crate::Error::Send) if the request fails or
    /// the backend answers with a non-success status. Failures are reported
    /// to the caller and never retried.
    pub async fn relay(&self, kind: &str, device_id: &str) -> Result<String, Error> {
        let id = self.ids.next_id();
        let message = GatewayMessage::new(id.clone(), COMMAND_ORIGIN, kind, device_id);
        let url = self.command_url(device_id);

        tracing::debug!(device_id, message_id = %id, "Relaying command");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("SharedAccessKey {}", self.access_key))
            .json(&message)
            .send()
            .await
            .map_err(|e| SendError::Rejected(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SendError::Rejected(format!(
                "service endpoint returned {status}"
            ))
            .into());
        }

        tracing::info!(device_id, message_id = %id, "Command accepted by service endpoint");
        Ok(id)
    }

    fn command_url(&self, device_id: &str) -> String {
        format!(
            "{}/devices/{}/commands",
            self.endpoint,
            urlencoding::encode(device_id)
        )
    }
}

impl std::fmt::Debug for CommandRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRelay")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(endpoint: &str) -> CommandRelay {
        CommandRelay::new(ServiceConfig {
            endpoint: endpoint.to_string(),
            access_key: "service-key".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn construction_surfaces_client_errors_instead_of_defaulting() {
        let relay = CommandRelay::new(ServiceConfig {
            endpoint: "https://hub.example.net".to_string(),
            access_key: "service-key".to_string(),
        });
        assert!(relay.is_ok(), "a plain timeout-only client must build");
    }

    #[test]
    fn command_url_escapes_the_device_id() {
        let relay = relay("https://hub.example.net");
        assert_eq!(
            relay.command_url("dev/1"),
            "https://hub.example.net/devices/dev%2F1/commands"
        );
    }

    #[test]
    fn trailing_slash_on_the_endpoint_is_ignored() {
        let relay = relay("https://hub.example.net/");
        assert_eq!(
            relay.command_url("dev-1"),
            "https://hub.example.net/devices/dev-1/commands"
        );
    }
}
