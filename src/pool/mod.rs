// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device connection pool with lazy, single-flight provisioning.
//!
//! The pool maps device identifiers to live channels. A lookup hit returns
//! the existing channel with no I/O. On a miss, exactly one caller claims
//! the provisioning slot for that identifier and drives credential
//! derivation, registration, and channel open; every other concurrent
//! caller for the same identifier suspends until the claimant resolves and
//! then shares its outcome. Failures are never cached: a failed attempt
//! leaves no entry behind, so the next `acquire` retries from scratch.
//!
//! Channels that report [`LinkState::Closed`](crate::transport::LinkState)
//! are evicted proactively by a per-link monitor task, so a dead handle is
//! never served again.

mod link;

pub use link::DeviceLink;

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, Notify};

use crate::credential::derive_device_key;
use crate::error::AcquireError;
use crate::provision::Provisioner;
use crate::transport::{InboundHandler, Transport, TransportSession};

/// One in-flight provisioning attempt, shared between the claiming caller
/// and everyone waiting on it.
struct Flight<S: TransportSession> {
    notify: Notify,
    outcome: OnceLock<Result<Arc<DeviceLink<S>>, AcquireError>>,
}

impl<S: TransportSession> Flight<S> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            outcome: OnceLock::new(),
        }
    }
}

/// Pool slot for one device identifier.
enum Slot<S: TransportSession> {
    /// A live channel.
    Ready(Arc<DeviceLink<S>>),
    /// Provisioning is in flight; wait for the claimant.
    Pending(Arc<Flight<S>>),
}

/// Pool of live device channels, keyed by device identifier.
///
/// Constructed once at startup and shared by handle; there is no ambient
/// global. The pool holds the only owning reference to each channel and
/// releases it on eviction or [`close_all`](Self::close_all).
///
/// # Invariants
///
/// At most one live channel and at most one in-flight provisioning attempt
/// exist per device identifier at any time.
pub struct DevicePool<P: Provisioner, T: Transport> {
    provisioner: P,
    transport: T,
    group_key: String,
    inbound: InboundHandler,
    slots: Arc<Mutex<HashMap<String, Slot<T::Session>>>>,
}

impl<P: Provisioner, T: Transport> DevicePool<P, T> {
    /// Creates an empty pool.
    ///
    /// `group_key` is the base64 group symmetric key used to derive
    /// per-device credentials; `inbound` receives every message the backend
    /// sends to any pooled device.
    pub fn new(provisioner: P, transport: T, group_key: String, inbound: InboundHandler) -> Self {
        Self {
            provisioner,
            transport,
            group_key,
            inbound,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the live channel for `device_id`, provisioning one if absent.
    ///
    /// Safe to call concurrently for overlapping identifiers: concurrent
    /// callers for the same identifier share a single provisioning attempt
    /// and its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the identifier is invalid, registration
    /// fails, or the channel cannot be opened. The pool keeps no entry for
    /// the device in any failure case.
    pub async fn acquire(
        &self,
        device_id: &str,
    ) -> Result<Arc<DeviceLink<T::Session>>, AcquireError> {
        let flight = loop {
            let waiting = {
                let mut slots = self.slots.lock().await;
                match slots.get(device_id) {
                    // A Retrying or Opening link is still live (sends queue in
                    // the transport); only Closed invalidates the entry.
                    Some(Slot::Ready(link)) if !link.state().is_closed() => {
                        tracing::debug!(device_id, "Reusing live device channel");
                        return Ok(Arc::clone(link));
                    }
                    Some(Slot::Pending(flight)) => Arc::clone(flight),
                    Some(Slot::Ready(_)) => {
                        // Closed link the monitor has not evicted yet.
                        tracing::debug!(device_id, "Discarding closed channel before retry");
                        let flight = Arc::new(Flight::new());
                        slots.insert(device_id.to_string(), Slot::Pending(Arc::clone(&flight)));
                        break flight;
                    }
                    None => {
                        let flight = Arc::new(Flight::new());
                        slots.insert(device_id.to_string(), Slot::Pending(Arc::clone(&flight)));
                        break flight;
                    }
                }
            };

            // Register interest before checking the outcome so a resolution
            // landing in between cannot be missed.
            let mut notified = pin!(waiting.notify.notified());
            notified.as_mut().enable();
            if let Some(outcome) = waiting.outcome.get() {
                return outcome.clone();
            }
            notified.await;
            match waiting.outcome.get() {
                Some(outcome) => return outcome.clone(),
                None => continue,
            }
        };

        // This caller holds the provisioning slot for the device.
        let result = self.establish(device_id).await;

        {
            let mut slots = self.slots.lock().await;
            match &result {
                Ok(link) => {
                    slots.insert(device_id.to_string(), Slot::Ready(Arc::clone(link)));
                }
                Err(e) => {
                    tracing::warn!(device_id, error = %e, "Provisioning attempt failed");
                    slots.remove(device_id);
                }
            }
        }

        // Publish before waking so every waiter observes the outcome.
        let _ = flight.outcome.set(result.clone());
        flight.notify.notify_waiters();

        result
    }

    /// Derives the credential, registers the device, and opens its channel.
    async fn establish(
        &self,
        device_id: &str,
    ) -> Result<Arc<DeviceLink<T::Session>>, AcquireError> {
        let credential = derive_device_key(&self.group_key, device_id)?;

        tracing::info!(device_id, "Provisioning device");
        let assignment = self.provisioner.register(&credential).await?;
        tracing::info!(device_id, endpoint = %assignment.assigned_hub, "Device assigned");

        let session = self
            .transport
            .open(&assignment.assigned_hub, &credential, Arc::clone(&self.inbound))
            .await?;

        let link = Arc::new(DeviceLink::new(
            device_id.to_string(),
            assignment.assigned_hub,
            session,
        ));
        self.spawn_eviction_monitor(device_id.to_string(), &link);

        Ok(link)
    }

    /// Watches a link and removes its pool entry once it closes.
    ///
    /// The pointer-identity check keeps a stale monitor from evicting a
    /// replacement channel provisioned for the same device.
    fn spawn_eviction_monitor(&self, device_id: String, link: &Arc<DeviceLink<T::Session>>) {
        let mut status = link.status();
        let watched = Arc::downgrade(link);
        let slots = Arc::clone(&self.slots);

        tokio::spawn(async move {
            loop {
                if status.borrow_and_update().is_closed() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }

            let Some(closed) = watched.upgrade() else {
                return;
            };
            let mut slots = slots.lock().await;
            if let Some(Slot::Ready(current)) = slots.get(&device_id)
                && Arc::ptr_eq(current, &closed)
            {
                slots.remove(&device_id);
                tracing::info!(device_id = %device_id, "Evicted closed device channel");
            }
        });
    }

    /// Returns true if the pool holds an entry for `device_id`.
    pub async fn contains(&self, device_id: &str) -> bool {
        self.slots.lock().await.contains_key(device_id)
    }

    /// Returns the number of pooled entries, in-flight attempts included.
    pub async fn device_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Closes every live channel and clears the pool.
    ///
    /// Intended for process shutdown. In-flight provisioning attempts are
    /// left to resolve; their entries are not retained.
    pub async fn close_all(&self) {
        let links: Vec<_> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(link) => Some(link),
                    Slot::Pending(_) => None,
                })
                .collect()
        };

        for link in links {
            link.close().await;
        }
    }
}

impl<P: Provisioner, T: Transport> std::fmt::Debug for DevicePool<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool").finish_non_exhaustive()
    }
}
