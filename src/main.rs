// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway binary: wire configuration, pool, publisher, and relay together
//! and serve the HTTP boundary.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fleetgate::api::{self, AppState};
use fleetgate::config::GatewayConfig;
use fleetgate::pool::DevicePool;
use fleetgate::provision::HttpProvisionerBuilder;
use fleetgate::publish::TelemetryPublisher;
use fleetgate::relay::CommandRelay;
use fleetgate::transport::{Disposition, MqttTransportBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env()?;
    tracing::info!(
        scope_id = %config.scope_id,
        registration_id = %config.registration_id,
        "Starting gateway"
    );

    let provisioner =
        HttpProvisionerBuilder::new(&config.provisioning_endpoint, &config.scope_id).build()?;
    let transport = MqttTransportBuilder::new().build();

    let pool = Arc::new(DevicePool::new(
        provisioner,
        transport,
        config.group_key.clone(),
        Arc::new(|message| {
            tracing::info!(
                device_id = %message.device_id,
                topic = %message.topic,
                bytes = message.payload.len(),
                "Inbound command received"
            );
            Disposition::Complete
        }),
    ));

    let state = AppState {
        publisher: Arc::new(TelemetryPublisher::new(pool)),
        relay: Arc::new(CommandRelay::new(config.service.clone())?),
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(listen_addr = %config.listen_addr, "Gateway listening");
    axum::serve(listener, api::router(state)).await?;

    Ok(())
}
