// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway configuration.
//!
//! Loaded once at process start and immutable thereafter. Every component
//! receives the parts it needs by value at construction; nothing reads the
//! environment after startup.

use std::env;

use crate::error::ConfigError;

/// Default address the HTTP boundary listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Settings for the service-side command client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Base URI of the backend's service-facing endpoint.
    pub endpoint: String,
    /// Shared access key authorizing the whole gateway identity.
    pub access_key: String,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Provisioning scope identifier.
    pub scope_id: String,
    /// Global provisioning endpoint URI.
    pub provisioning_endpoint: String,
    /// Group symmetric key (base64) used to derive per-device credentials.
    pub group_key: String,
    /// Registration identity of the gateway itself.
    pub registration_id: String,
    /// Service-side command client settings.
    pub service: ServiceConfig,
    /// Address the HTTP boundary listens on.
    pub listen_addr: String,
}

impl GatewayConfig {
    /// Loads the configuration from environment variables.
    ///
    /// Required: `FLEETGATE_SCOPE_ID`, `FLEETGATE_PROVISIONING_ENDPOINT`,
    /// `FLEETGATE_GROUP_KEY`, `FLEETGATE_REGISTRATION_ID`,
    /// `FLEETGATE_SERVICE_ENDPOINT`, `FLEETGATE_SERVICE_KEY`.
    /// Optional: `FLEETGATE_LISTEN_ADDR` (defaults to `0.0.0.0:8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for any absent required variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads the configuration through an arbitrary lookup function.
    ///
    /// This is the seam `from_env` is built on; tests supply a map instead
    /// of touching process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for any absent required setting.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, ConfigError> {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::Missing(name.to_string()))
        };

        Ok(Self {
            scope_id: required("FLEETGATE_SCOPE_ID")?,
            provisioning_endpoint: required("FLEETGATE_PROVISIONING_ENDPOINT")?,
            group_key: required("FLEETGATE_GROUP_KEY")?,
            registration_id: required("FLEETGATE_REGISTRATION_ID")?,
            service: ServiceConfig {
                endpoint: required("FLEETGATE_SERVICE_ENDPOINT")?,
                access_key: required("FLEETGATE_SERVICE_KEY")?,
            },
            listen_addr: lookup("FLEETGATE_LISTEN_ADDR")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        })
    }
}
