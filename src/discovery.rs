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

pub mod beacon;
pub mod registry;
pub mod services;
pub mod wire;

pub use registry::DiscoveryApi;

use crate::{
    config::Config, events::EventBridge, gateway::client::GatewayClient, model::NodeDescriptor,
    model::NodeStatus,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::info;

/// Starts the whole discovery stack: the node/service registry actor, the
/// beacon sender/listener pair and the service channel. Self-registers the
/// local node so queries work before the first peer shows up.
pub fn start_discovery(
    subsys: &SubsystemHandle,
    config: Config,
    events: EventBridge,
    gateway: GatewayClient,
) -> DiscoveryApi {
    info!("Starting discovery for node '{}' …", config.node_id());

    let local = NodeDescriptor {
        id: config.node_id(),
        name: config.app.instance.name.clone(),
        host: config.host_ip,
        control_port: config.gateway.port,
        roles: config.node.roles.clone(),
        tags: config.node.tags.clone(),
        status: NodeStatus::Online,
        last_seen: Utc::now(),
    };

    let (publish_tx, publish_rx) = mpsc::channel(1024);

    let api = registry::start_node_registry(
        subsys,
        local,
        config.discovery.liveness_window,
        events,
        gateway,
        publish_tx,
    );

    beacon::start_beacon(subsys, config.clone(), api.clone());
    services::start_service_channel(
        subsys,
        config.discovery.clone(),
        api.clone(),
        publish_rx,
        None,
    );

    api
}
