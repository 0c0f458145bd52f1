// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP-backed provisioning client.
//!
//! Registration is submitted with a PUT; the service answers with an
//! operation id that is polled until the attempt reaches a terminal state.
//! The polling runs on a background driver task that publishes each
//! observed state into a watch channel, so the registering caller waits
//! event-driven on state transitions under a single timeout instead of
//! sleeping between polls. The driver is stopped on every exit path.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::credential::DerivedCredential;
use crate::error::ProvisioningError;

use super::{Assignment, Provisioner, RegistrationState};

/// Header carrying the derived registration key.
const REGISTRATION_KEY_HEADER: &str = "x-registration-key";

/// Builder for [`HttpProvisioner`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use fleetgate::provision::HttpProvisionerBuilder;
///
/// let provisioner = HttpProvisionerBuilder::new("https://dps.example.net", "scope-01")
///     .with_poll_interval(Duration::from_secs(10))
///     .with_max_wait(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HttpProvisionerBuilder {
    endpoint: String,
    scope_id: String,
    poll_interval: Duration,
    max_wait: Duration,
    request_timeout: Duration,
}

impl HttpProvisionerBuilder {
    /// Default interval between status polls.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default total wait budget for one registration.
    pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);
    /// Default per-request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a builder for the given provisioning endpoint and scope.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            scope_id: scope_id.into(),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_wait: Self::DEFAULT_MAX_WAIT,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Sets the interval between status polls.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the total wait budget for one registration.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builds the provisioner.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Faulted`] if the HTTP client cannot be
    /// constructed.
    pub fn build(self) -> Result<HttpProvisioner, ProvisioningError> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ProvisioningError::Faulted {
                device_id: String::new(),
                cause: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(HttpProvisioner {
            client,
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            scope_id: self.scope_id,
            poll_interval: self.poll_interval,
            max_wait: self.max_wait,
        })
    }
}

/// Provisioning client that registers devices over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: Client,
    endpoint: String,
    scope_id: String,
    poll_interval: Duration,
    max_wait: Duration,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    #[serde(rename = "registrationId")]
    registration_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    #[serde(rename = "operationId")]
    operation_id: Option<String>,
    status: String,
    #[serde(rename = "assignedHub")]
    assigned_hub: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl OperationResponse {
    fn into_state(self, fallback_device_id: &str) -> RegistrationState {
        match self.status.as_str() {
            "assigned" => match self.assigned_hub {
                Some(assigned_hub) => RegistrationState::Assigned(Assignment {
                    assigned_hub,
                    device_id: self
                        .device_id
                        .unwrap_or_else(|| fallback_device_id.to_string()),
                }),
                None => RegistrationState::Faulted(
                    "service reported assigned without an endpoint".to_string(),
                ),
            },
            "assigning" | "pending" => RegistrationState::Registering,
            "failed" => RegistrationState::Failed(
                self.error_message
                    .unwrap_or_else(|| "no failure detail reported".to_string()),
            ),
            "disabled" => RegistrationState::Disabled,
            other => RegistrationState::Faulted(format!("unknown registration status {other:?}")),
        }
    }
}

/// Aborts the polling driver when the registration call returns.
struct DriverGuard(JoinHandle<()>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl HttpProvisioner {
    fn registration_url(&self, device_id: &str) -> String {
        format!(
            "{}/{}/registrations/{}/register",
            self.endpoint,
            self.scope_id,
            urlencoding::encode(device_id)
        )
    }

    fn operation_url(&self, operation_id: &str) -> String {
        format!(
            "{}/{}/operations/{}",
            self.endpoint,
            self.scope_id,
            urlencoding::encode(operation_id)
        )
    }

    async fn submit_registration(
        &self,
        credential: &DerivedCredential,
    ) -> Result<OperationResponse, ProvisioningError> {
        let device_id = credential.device_id();
        let faulted = |cause: String| ProvisioningError::Faulted {
            device_id: device_id.to_string(),
            cause,
        };

        let response = self
            .client
            .put(self.registration_url(device_id))
            .header(REGISTRATION_KEY_HEADER, credential.key_base64())
            .json(&RegisterRequest {
                registration_id: device_id,
            })
            .send()
            .await
            .map_err(|e| faulted(e.to_string()))?;

        if !response.status().is_success() {
            return Err(faulted(format!(
                "registration endpoint returned {}",
                response.status()
            )));
        }

        response.json().await.map_err(|e| faulted(e.to_string()))
    }
}

impl Provisioner for HttpProvisioner {
    async fn register(
        &self,
        credential: &DerivedCredential,
    ) -> Result<Assignment, ProvisioningError> {
        let device_id = credential.device_id().to_string();

        tracing::info!(device_id = %device_id, "Registering device");

        let submitted = self.submit_registration(credential).await?;
        let operation_id = submitted.operation_id.clone();
        let state = submitted.into_state(&device_id);

        // Some registrations resolve synchronously.
        if state.is_terminal() {
            return state.into_outcome(&device_id);
        }

        let Some(operation_id) = operation_id else {
            return Err(ProvisioningError::Faulted {
                device_id,
                cause: "service accepted the registration without an operation id".to_string(),
            });
        };

        let (state_tx, mut state_rx) = watch::channel(RegistrationState::Registering);
        let driver = tokio::spawn(poll_operation(
            self.client.clone(),
            self.operation_url(&operation_id),
            credential.key_base64(),
            device_id.clone(),
            self.poll_interval,
            state_tx,
        ));
        let _guard = DriverGuard(driver);

        #[allow(clippy::cast_possible_truncation)]
        let waited_ms = self.max_wait.as_millis() as u64;

        match tokio::time::timeout(self.max_wait, state_rx.wait_for(RegistrationState::is_terminal))
            .await
        {
            Err(_) => {
                tracing::warn!(device_id = %device_id, waited_ms, "Provisioning timed out");
                Err(ProvisioningError::Timeout { device_id, waited_ms })
            }
            Ok(Err(_)) => Err(ProvisioningError::Faulted {
                device_id,
                cause: "provisioning driver stopped unexpectedly".to_string(),
            }),
            Ok(Ok(state)) => {
                let state = state.clone();
                tracing::info!(device_id = %device_id, ?state, "Registration reached terminal state");
                state.into_outcome(&device_id)
            }
        }
    }
}

/// Polls the operation status endpoint and publishes each observed state.
///
/// Stops on the first terminal state or when the caller stops listening.
/// Transient poll errors are logged and retried; the caller's wait budget
/// bounds the loop.
async fn poll_operation(
    client: Client,
    operation_url: String,
    key_base64: String,
    device_id: String,
    interval: Duration,
    state_tx: watch::Sender<RegistrationState>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let state = match fetch_operation(&client, &operation_url, &key_base64).await {
            Ok(response) => response.into_state(&device_id),
            Err(cause) => {
                tracing::warn!(device_id = %device_id, %cause, "Status poll failed, will retry");
                continue;
            }
        };

        tracing::debug!(device_id = %device_id, ?state, "Observed registration state");

        let terminal = state.is_terminal();
        if state_tx.send(state).is_err() || terminal {
            break;
        }
    }
}

async fn fetch_operation(
    client: &Client,
    operation_url: &str,
    key_base64: &str,
) -> Result<OperationResponse, String> {
    let response = client
        .get(operation_url)
        .header(REGISTRATION_KEY_HEADER, key_base64)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("status endpoint returned {}", response.status()));
    }

    response.json().await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: &str) -> OperationResponse {
        OperationResponse {
            operation_id: Some("op-1".to_string()),
            status: status.to_string(),
            assigned_hub: None,
            device_id: None,
            error_message: None,
        }
    }

    #[test]
    fn assigned_response_maps_to_assignment() {
        let mut op = response("assigned");
        op.assigned_hub = Some("hub.example.net".to_string());
        op.device_id = Some("dev-1".to_string());

        let state = op.into_state("dev-1");
        assert_eq!(
            state,
            RegistrationState::Assigned(Assignment {
                assigned_hub: "hub.example.net".to_string(),
                device_id: "dev-1".to_string(),
            })
        );
    }

    #[test]
    fn assigned_without_endpoint_is_a_fault() {
        let state = response("assigned").into_state("dev-1");
        assert!(matches!(state, RegistrationState::Faulted(_)));
    }

    #[test]
    fn assigned_without_device_id_falls_back_to_registration_id() {
        let mut op = response("assigned");
        op.assigned_hub = Some("hub.example.net".to_string());

        let RegistrationState::Assigned(assignment) = op.into_state("dev-7") else {
            panic!("expected assigned state");
        };
        assert_eq!(assignment.device_id, "dev-7");
    }

    #[test]
    fn assigning_is_not_terminal() {
        let state = response("assigning").into_state("dev-1");
        assert_eq!(state, RegistrationState::Registering);
    }

    #[test]
    fn failed_carries_error_message() {
        let mut op = response("failed");
        op.error_message = Some("enrollment quota exceeded".to_string());

        let state = op.into_state("dev-1");
        assert_eq!(
            state,
            RegistrationState::Failed("enrollment quota exceeded".to_string())
        );
    }

    #[test]
    fn disabled_maps_to_disabled() {
        assert_eq!(response("disabled").into_state("dev-1"), RegistrationState::Disabled);
    }

    #[test]
    fn unknown_status_is_a_fault() {
        let state = response("mystery").into_state("dev-1");
        assert!(matches!(state, RegistrationState::Faulted(_)));
    }

    #[test]
    fn urls_escape_identifiers() {
        let provisioner = HttpProvisionerBuilder::new("https://dps.example.net/", "scope-01")
            .build()
            .unwrap();

        assert_eq!(
            provisioner.registration_url("dev 1"),
            "https://dps.example.net/scope-01/registrations/dev%201/register"
        );
        assert_eq!(
            provisioner.operation_url("op/1"),
            "https://dps.example.net/scope-01/operations/op%2F1"
        );
    }
}
