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
    audio::adapter::start_jack_adapter,
    config::Config,
    discovery::{DiscoveryApi, start_discovery},
    error::{SkeletonCrewError, SkeletonCrewResult},
    events::EventBridge,
    gateway::{client::GatewayClient, server::start_gateway},
    model::{
        Availability, Health, NodeRole, ServiceDescriptor, ServiceEndpoint, ServiceType,
    },
    time::Scheduler,
    tools::{
        builtin::{BuiltinToolDeps, register_builtin_tools},
        registry::ToolRegistry,
    },
    transport::{start_transport_agent, start_transport_coordinator},
    voice::{RecognizerFactory, start_voice_pipeline},
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, warn};

/// Assembles the node daemon: every component is a subsystem of the given
/// handle, wired through explicit handles rather than globals.
pub async fn run_daemon(subsys: SubsystemHandle, config: Config) -> SkeletonCrewResult<()> {
    info!(
        "Starting {} node '{}' …",
        config.app.name,
        config.node_id()
    );

    let events = EventBridge::new();
    let scheduler = Scheduler::start();

    let (voice_stream_tx, voice_stream_rx) = mpsc::channel(4);
    let voice_enabled = config.voice.is_some();
    let adapter = start_jack_adapter(
        &subsys,
        config.clone(),
        events.clone(),
        voice_enabled.then_some(voice_stream_tx),
    );

    let registry = Arc::new(ToolRegistry::new(events.clone()));
    let gateway_client = GatewayClient::new(config.node_id(), config.gateway.request_timeout);

    let discovery = start_discovery(
        &subsys,
        config.clone(),
        events.clone(),
        gateway_client.clone(),
    );

    let coordinator = start_transport_coordinator(&subsys, config.transport.clone());

    register_builtin_tools(
        &registry,
        BuiltinToolDeps {
            adapter: adapter.clone(),
            discovery: discovery.clone(),
            coordinator,
            registry: Arc::downgrade(&registry),
            default_pre_roll: config.transport.default_pre_roll,
        },
    )
    .map_err(|e| SkeletonCrewError::Other(format!("tool registration failed: {e}")))?;

    if config.node.roles.contains(&NodeRole::TransportAgent) {
        start_transport_agent(
            &subsys,
            config.clone(),
            adapter.clone(),
            scheduler.clone(),
            events.clone(),
        );
    }

    #[cfg(feature = "persistence")]
    start_store(&subsys, &config, &events, registry.clone());

    let (gateway_ready_tx, gateway_ready_rx) = oneshot::channel();
    start_gateway(
        &subsys,
        config.clone(),
        registry.clone(),
        discovery.clone(),
        gateway_ready_tx,
    );
    let gateway_address = gateway_ready_rx.await?;
    info!("Remote invocation gateway listening on {gateway_address}");

    if let Some(voice_config) = config.voice.clone() {
        match recognizer_factory(&voice_config) {
            Ok(factory) => start_voice_pipeline(
                &subsys,
                voice_config,
                config.node_id(),
                events.clone(),
                registry.clone(),
                discovery.clone(),
                gateway_client.clone(),
                voice_stream_rx,
                factory,
            ),
            Err(e) => warn!("Voice pipeline disabled: {e}"),
        }
    }

    announce_services(&config, &discovery).await;

    subsys.on_shutdown_requested().await;
    // Shutdown: no new invocations, no more scheduled actions; subsystems
    // drain under the toplevel's grace period.
    registry.close();
    scheduler.shutdown();
    info!("Node '{}' shut down.", config.node_id());
    Ok(())
}

#[cfg(feature = "persistence")]
fn start_store(
    subsys: &SubsystemHandle,
    config: &Config,
    events: &EventBridge,
    registry: Arc<ToolRegistry>,
) {
    use crate::store::{Store, start_store_writer};

    let path = config.store.as_ref().and_then(|s| s.path.clone());
    match Store::open(path.as_deref()) {
        Ok(store) => start_store_writer(subsys, Arc::new(store), events, registry),
        Err(e) => warn!("Persistent store unavailable, continuing without it: {e}"),
    }
}

#[cfg(feature = "vosk")]
fn recognizer_factory(
    voice: &crate::config::VoiceConfig,
) -> SkeletonCrewResult<RecognizerFactory> {
    use crate::voice::recognizer::VoskRecognizer;

    let model_path = voice.model_path.clone().ok_or_else(|| {
        SkeletonCrewError::Other("voice.modelPath is required with the vosk feature".to_owned())
    })?;
    Ok(Box::new(move |sample_rate| {
        Ok(Box::new(VoskRecognizer::new(&model_path, sample_rate)?))
    }))
}

#[cfg(not(feature = "vosk"))]
fn recognizer_factory(
    _voice: &crate::config::VoiceConfig,
) -> SkeletonCrewResult<RecognizerFactory> {
    Ok(Box::new(|_| {
        Err(SkeletonCrewError::Other(
            "built without a speech recognizer; enable the 'vosk' feature".to_owned(),
        ))
    }))
}

/// Advertises what this node actually runs on the service channel.
async fn announce_services(config: &Config, discovery: &DiscoveryApi) {
    let node_id = config.node_id();
    let mut services = vec![ServiceDescriptor {
        node_id: node_id.clone(),
        service_type: ServiceType::JackClient,
        name: "jack".to_owned(),
        endpoint: ServiceEndpoint::Local,
        capabilities: Default::default(),
        availability: Availability::Available,
        health: Health::Healthy,
    }];

    services.push(ServiceDescriptor {
        node_id: node_id.clone(),
        service_type: ServiceType::RemoteJack,
        name: "remote-jack".to_owned(),
        endpoint: ServiceEndpoint::Remote {
            host: config.host_ip,
            port: config.gateway.port,
        },
        capabilities: Default::default(),
        availability: Availability::Available,
        health: Health::Healthy,
    });

    if config.node.roles.contains(&NodeRole::TransportAgent) {
        services.push(ServiceDescriptor {
            node_id: node_id.clone(),
            service_type: ServiceType::TransportAgent,
            name: "transport-agent".to_owned(),
            endpoint: ServiceEndpoint::Remote {
                host: config.host_ip,
                port: config.transport.agent_port,
            },
            capabilities: Default::default(),
            availability: Availability::Available,
            health: Health::Healthy,
        });
    }

    if config.node.roles.contains(&NodeRole::TransportCoordinator) {
        services.push(ServiceDescriptor {
            node_id: node_id.clone(),
            service_type: ServiceType::TransportCoordinator,
            name: "transport-coordinator".to_owned(),
            endpoint: ServiceEndpoint::Remote {
                host: config.host_ip,
                port: config.gateway.port,
            },
            capabilities: Default::default(),
            availability: Availability::Available,
            health: Health::Healthy,
        });
    }

    if config.voice.is_some() {
        services.push(ServiceDescriptor {
            node_id: node_id.clone(),
            service_type: ServiceType::VoiceCommand,
            name: "voice-command".to_owned(),
            endpoint: ServiceEndpoint::Local,
            capabilities: Default::default(),
            availability: Availability::Available,
            health: Health::Healthy,
        });
    }

    for service in services {
        discovery.register_service(service).await;
    }
}

/// Used by the binary to decide between a clean start and exit code 3:
/// a node that is supposed to be an audio hub cannot run without JACK.
pub fn probe_jack(config: &Config) -> SkeletonCrewResult<()> {
    match jack::Client::new(&config.jack_client_name(), jack::ClientOptions::default()) {
        Ok((client, _)) => {
            drop(client);
            Ok(())
        }
        Err(e) => Err(SkeletonCrewError::JackError(e)),
    }
}
