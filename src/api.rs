// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP boundary.
//!
//! Two routes, both keyed by message kind and device identifier:
//!
//! - `GET /{kind}/{device_id}/message` publishes telemetry through the
//!   device connection pool.
//! - `GET /{kind}/{device_id}/c2d` relays a command through the service
//!   endpoint.
//!
//! Success answers `200 OK` with body `"OK"`; any core error is logged and
//! collapsed into `500`.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::provision::Provisioner;
use crate::publish::TelemetryPublisher;
use crate::relay::CommandRelay;
use crate::transport::Transport;

/// Shared state handed to every request handler.
pub struct AppState<P: Provisioner, T: Transport> {
    /// Publishes telemetry through the pool.
    pub publisher: Arc<TelemetryPublisher<P, T>>,
    /// Relays commands through the service endpoint.
    pub relay: Arc<CommandRelay>,
}

impl<P: Provisioner, T: Transport> Clone for AppState<P, T> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            relay: Arc::clone(&self.relay),
        }
    }
}

/// Builds the gateway router over `state`.
pub fn router<P: Provisioner, T: Transport>(state: AppState<P, T>) -> Router {
    Router::new()
        .route("/{kind}/{device_id}/message", get(publish_message::<P, T>))
        .route("/{kind}/{device_id}/c2d", get(relay_command::<P, T>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn publish_message<P: Provisioner, T: Transport>(
    State(state): State<AppState<P, T>>,
    Path((kind, device_id)): Path<(String, String)>,
) -> (StatusCode, &'static str) {
    match state.publisher.publish(&kind, &device_id).await {
        Ok(id) => {
            tracing::info!(kind, device_id, message_id = %id, "Telemetry published");
            (StatusCode::OK, "OK")
        }
        Err(e) => {
            tracing::error!(kind, device_id, error = %e, "Telemetry publish failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "")
        }
    }
}

async fn relay_command<P: Provisioner, T: Transport>(
    State(state): State<AppState<P, T>>,
    Path((kind, device_id)): Path<(String, String)>,
) -> (StatusCode, &'static str) {
    match state.relay.relay(&kind, &device_id).await {
        Ok(id) => {
            tracing::info!(kind, device_id, message_id = %id, "Command relayed");
            (StatusCode::OK, "OK")
        }
        Err(e) => {
            tracing::error!(kind, device_id, error = %e, "Command relay failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "")
        }
    }
}
