// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the gateway.
//!
//! This module provides the error hierarchy used across the crate: input
//! validation, provisioning, transport channel lifecycle, message sending,
//! and configuration loading. Provisioning and transport-open failures are
//! clonable so that a single failed pool acquisition can be reported to
//! every caller waiting on it.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied input was rejected before any I/O happened.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidInputError),

    /// The registration handshake against the provisioning service failed.
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// The device was provisioned but its messaging channel failed to open.
    #[error("transport error: {0}")]
    TransportOpen(#[from] TransportOpenError),

    /// A message could not be handed to the transport.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Configuration could not be loaded at startup.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors for inputs rejected before any network activity.
///
/// These are caller errors and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidInputError {
    /// The device identifier was empty.
    #[error("device identifier must not be empty")]
    EmptyDeviceId,

    /// The group key could not be decoded.
    #[error("group key is not valid base64: {0}")]
    MalformedGroupKey(String),
}

/// Errors reported by the provisioning handshake.
///
/// All terminal non-success registration states collapse into this type.
/// None of these are retried automatically; a later `acquire` call for the
/// same device starts a fresh registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// The provisioning service reported the registration as failed.
    #[error("registration failed for device {device_id}: {cause}")]
    Failed {
        /// The device that was being registered.
        device_id: String,
        /// Failure detail reported by the service.
        cause: String,
    },

    /// The device enrollment is disabled on the provisioning service.
    #[error("device {device_id} is disabled on the provisioning service")]
    Disabled {
        /// The device that was being registered.
        device_id: String,
    },

    /// The handshake faulted before reaching a terminal registration state.
    #[error("provisioning fault for device {device_id}: {cause}")]
    Faulted {
        /// The device that was being registered.
        device_id: String,
        /// Description of the fault.
        cause: String,
    },

    /// No terminal registration state was reached within the wait budget.
    #[error("provisioning timed out for device {device_id} after {waited_ms} ms")]
    Timeout {
        /// The device that was being registered.
        device_id: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },
}

/// The messaging channel failed to open after successful provisioning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to open channel to {endpoint}: {cause}")]
pub struct TransportOpenError {
    /// The assigned endpoint that was being connected to.
    pub endpoint: String,
    /// Description of the failure.
    pub cause: String,
}

/// Errors raised when handing a message to the transport.
///
/// Send failures are surfaced to the caller and never retried by the core.
/// A successful `send` only means the message was accepted by the transport;
/// the eventual outcome arrives through the completion receiver.
#[derive(Debug, Error)]
pub enum SendError {
    /// The message payload could not be serialized.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport rejected the message.
    #[error("transport rejected the message: {0}")]
    Rejected(String),

    /// The channel for this device is closed.
    #[error("the device channel is closed")]
    LinkClosed,
}

/// Errors raised while loading the gateway configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting was not provided.
    #[error("missing required setting: {0}")]
    Missing(String),

    /// A setting was present but could not be parsed.
    #[error("invalid setting {name}: {message}")]
    Invalid {
        /// The setting name.
        name: String,
        /// Why it was rejected.
        message: String,
    },
}

/// Error returned by [`DevicePool::acquire`](crate::pool::DevicePool::acquire).
///
/// Clonable so the claiming caller's failure can be fanned out to every
/// concurrent caller waiting on the same device identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// The device identifier or group key was rejected.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// The registration handshake failed.
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The messaging channel failed to open.
    #[error(transparent)]
    TransportOpen(#[from] TransportOpenError),
}

impl From<AcquireError> for Error {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::InvalidInput(e) => Self::InvalidInput(e),
            AcquireError::Provisioning(e) => Self::Provisioning(e),
            AcquireError::TransportOpen(e) => Self::TransportOpen(e),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
