// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device provisioning.
//!
//! Registration is an asynchronous handshake: the gateway submits a derived
//! credential and the provisioning service eventually moves the attempt to a
//! terminal state. This module models that state machine
//! (`Created → Registering → {Assigned | Failed | Disabled | Faulted}`),
//! defines the [`Provisioner`] seam the pool drives, and provides the
//! HTTP-backed implementation.

mod http;

pub use http::{HttpProvisioner, HttpProvisionerBuilder};

use crate::credential::DerivedCredential;
use crate::error::ProvisioningError;

/// Endpoint and identity assigned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// URI of the messaging endpoint the device was assigned to.
    pub assigned_hub: String,
    /// The device identity confirmed by the provisioning service.
    pub device_id: String,
}

/// State of one registration attempt.
///
/// `Assigned`, `Failed`, `Disabled`, and `Faulted` are terminal; a
/// registration never leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// Attempt created, handshake not started.
    Created,
    /// Handshake submitted, waiting for the service.
    Registering,
    /// Registration succeeded.
    Assigned(Assignment),
    /// The service reported the registration as failed.
    Failed(String),
    /// The enrollment is disabled on the service.
    Disabled,
    /// The handshake faulted before completing.
    Faulted(String),
}

impl RegistrationState {
    /// Returns true if this state is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Registering)
    }

    /// Consumes a terminal state into the caller-facing outcome.
    ///
    /// # Errors
    ///
    /// Maps every terminal non-success state to a [`ProvisioningError`].
    /// Non-terminal states are reported as a fault; callers only invoke this
    /// after [`is_terminal`](Self::is_terminal) holds.
    pub fn into_outcome(self, device_id: &str) -> Result<Assignment, ProvisioningError> {
        match self {
            Self::Assigned(assignment) => Ok(assignment),
            Self::Failed(cause) => Err(ProvisioningError::Failed {
                device_id: device_id.to_string(),
                cause,
            }),
            Self::Disabled => Err(ProvisioningError::Disabled {
                device_id: device_id.to_string(),
            }),
            Self::Faulted(cause) => Err(ProvisioningError::Faulted {
                device_id: device_id.to_string(),
                cause,
            }),
            Self::Created | Self::Registering => Err(ProvisioningError::Faulted {
                device_id: device_id.to_string(),
                cause: "registration ended in a non-terminal state".to_string(),
            }),
        }
    }
}

/// Executes the registration handshake for one device.
///
/// Implementations must close their provisioning session on every exit
/// path, report all terminal non-success states as [`ProvisioningError`],
/// and never retry internally; retry policy belongs to the pool's caller.
pub trait Provisioner: Send + Sync + 'static {
    /// Registers the device the credential was derived for and resolves to
    /// its assigned endpoint and identity.
    fn register(
        &self,
        credential: &DerivedCredential,
    ) -> impl Future<Output = Result<Assignment, ProvisioningError>> + Send;
}
