// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device credential derivation.
//!
//! Devices authenticate with a key derived from a group symmetric key and
//! their device identifier. The derivation is a keyed hash (HMAC-SHA256),
//! so the same inputs always produce the same credential and different
//! device identifiers produce computationally independent credentials.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::InvalidInputError;

type HmacSha256 = Hmac<Sha256>;

/// A credential derived for one device.
///
/// Produced by [`derive_device_key`] and consumed by provisioning and by
/// the transport when opening the device channel. Never reused across
/// devices and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedCredential {
    device_id: String,
    key: Vec<u8>,
}

impl DerivedCredential {
    /// Returns the device identifier this credential was derived for.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the raw derived key bytes.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Returns the derived key encoded as base64, the form expected by the
    /// provisioning and messaging endpoints.
    #[must_use]
    pub fn key_base64(&self) -> String {
        BASE64.encode(&self.key)
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for DerivedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedCredential")
            .field("device_id", &self.device_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Derives the per-device credential from the group key.
///
/// The group key is expected as base64; the derived key is the HMAC-SHA256
/// of the device identifier keyed by the decoded group key.
///
/// # Errors
///
/// Returns [`InvalidInputError::EmptyDeviceId`] if `device_id` is empty and
/// [`InvalidInputError::MalformedGroupKey`] if the group key is not valid
/// base64.
pub fn derive_device_key(
    group_key_base64: &str,
    device_id: &str,
) -> Result<DerivedCredential, InvalidInputError> {
    if device_id.is_empty() {
        return Err(InvalidInputError::EmptyDeviceId);
    }

    let group_key = BASE64
        .decode(group_key_base64)
        .map_err(|e| InvalidInputError::MalformedGroupKey(e.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(&group_key)
        .map_err(|e| InvalidInputError::MalformedGroupKey(e.to_string()))?;
    mac.update(device_id.as_bytes());
    let key = mac.finalize().into_bytes().to_vec();

    Ok(DerivedCredential {
        device_id: device_id.to_string(),
        key,
    })
}
