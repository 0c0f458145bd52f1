// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! fleetgate - an HTTP gateway to a managed device-messaging backend.
//!
//! The gateway provisions devices on demand against a provisioning service,
//! keeps one live authenticated channel per device in a connection pool,
//! publishes telemetry over those channels, and relays back-office commands
//! through the backend's service endpoint.
//!
//! # Core pieces
//!
//! - **[`pool::DevicePool`]**: lazy, single-flight provisioning keyed by
//!   device identifier. Concurrent requests for the same device share one
//!   provisioning attempt; closed channels are evicted proactively;
//!   failures are never cached.
//! - **[`provision::HttpProvisioner`]**: register-then-poll handshake with
//!   the provisioning service, waited on event-driven under a timeout.
//! - **[`transport::MqttTransport`]**: per-device MQTT sessions with QoS 1
//!   send completions and inbound command dispatch.
//! - **[`api`]**: the axum HTTP boundary.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fleetgate::api::{self, AppState};
//! use fleetgate::config::GatewayConfig;
//! use fleetgate::pool::DevicePool;
//! use fleetgate::provision::HttpProvisionerBuilder;
//! use fleetgate::publish::TelemetryPublisher;
//! use fleetgate::relay::CommandRelay;
//! use fleetgate::transport::{Disposition, MqttTransportBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_env()?;
//!
//!     let provisioner =
//!         HttpProvisionerBuilder::new(&config.provisioning_endpoint, &config.scope_id)
//!             .build()?;
//!     let transport = MqttTransportBuilder::new().build();
//!
//!     let pool = Arc::new(DevicePool::new(
//!         provisioner,
//!         transport,
//!         config.group_key.clone(),
//!         Arc::new(|message| {
//!             println!("command for {}", message.device_id);
//!             Disposition::Complete
//!         }),
//!     ));
//!
//!     let state = AppState {
//!         publisher: Arc::new(TelemetryPublisher::new(pool)),
//!         relay: Arc::new(CommandRelay::new(config.service.clone())?),
//!     };
//!
//!     let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//!     axum::serve(listener, api::router(state)).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod credential;
pub mod error;
pub mod message;
pub mod pool;
pub mod provision;
pub mod publish;
pub mod relay;
pub mod transport;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use message::GatewayMessage;
pub use pool::{DeviceLink, DevicePool};
