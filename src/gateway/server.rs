/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::{
    config::Config,
    discovery::DiscoveryApi,
    error::SkeletonCrewResult,
    gateway::{InvocationRequest, InvocationResponse},
    model::NodeDescriptor,
    tools::registry::ToolRegistry,
};
use axum::{Json, Router, extract::State, routing::get, routing::post};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

#[derive(Clone)]
struct GatewayState {
    registry: Arc<ToolRegistry>,
    discovery: DiscoveryApi,
}

pub fn start_gateway(
    subsys: &SubsystemHandle,
    config: Config,
    registry: Arc<ToolRegistry>,
    discovery: DiscoveryApi,
    ready_tx: oneshot::Sender<SocketAddr>,
) {
    info!("Starting remote invocation gateway");
    subsys.start(SubsystemBuilder::new("gateway", |subsys| {
        webserver(subsys, config, registry, discovery, ready_tx)
    }));
}

#[instrument(skip_all, err)]
async fn webserver(
    subsys: SubsystemHandle,
    config: Config,
    registry: Arc<ToolRegistry>,
    discovery: DiscoveryApi,
    ready_tx: oneshot::Sender<SocketAddr>,
) -> SkeletonCrewResult<()> {
    let app = Router::new()
        .route("/invoke", post(invoke))
        .route("/node", get(node))
        .with_state(GatewayState {
            registry,
            discovery,
        })
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(format!(
        "{}:{}",
        config.gateway.bind_address, config.gateway.port
    ))
    .await?;
    let local_address = listener.local_addr()?;
    info!("Remote invocation gateway up at http://{local_address}");
    ready_tx.send(local_address).ok();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { subsys.on_shutdown_requested().await })
        .await?;

    Ok(())
}

/// The audit log keeps the remote caller's identity; timeouts on the caller
/// side don't stop the handler here, so both sides end up with a record.
async fn invoke(
    State(state): State<GatewayState>,
    Json(request): Json<InvocationRequest>,
) -> Json<InvocationResponse> {
    let InvocationRequest {
        request_id,
        tool_name,
        args,
        caller_id,
    } = request;
    let response = match state.registry.execute(&tool_name, args, caller_id).await {
        Ok(result) => InvocationResponse::Ok { request_id, result },
        Err(e) => InvocationResponse::Error {
            request_id,
            error_kind: e.kind,
            message: e.message,
            retryable: e.retryable,
        },
    };
    Json(response)
}

async fn node(State(state): State<GatewayState>) -> Json<Option<NodeDescriptor>> {
    Json(state.discovery.node(None).await)
}
