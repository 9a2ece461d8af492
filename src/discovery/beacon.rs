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
    discovery::{registry::DiscoveryApi, wire},
    error::SkeletonCrewResult,
    utils::jittered,
};
use chrono::Utc;
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::{net::UdpSocket, select, time::sleep};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

pub fn start_beacon(subsys: &SubsystemHandle, config: Config, api: DiscoveryApi) {
    let sender_config = config.clone();
    subsys.start(SubsystemBuilder::new("beacon-sender", move |s| {
        beacon_sender(s, sender_config)
    }));
    subsys.start(SubsystemBuilder::new("beacon-listener", move |s| {
        beacon_listener(s, config, api)
    }));
}

#[instrument]
fn create_sender_socket() -> SkeletonCrewResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

#[instrument]
fn create_listener_socket(port: u16) -> SkeletonCrewResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&SockAddr::from(addr))?;
    Ok(socket.into())
}

async fn beacon_sender(subsys: SubsystemHandle, config: Config) -> SkeletonCrewResult<()> {
    let socket = UdpSocket::from_std(create_sender_socket()?)?;
    let target = SocketAddr::new(
        config.discovery.beacon_address,
        config.discovery.beacon_port,
    );
    info!(
        "Beacon sender started, announcing '{}' to {target} every {:?}.",
        config.node_id(),
        config.discovery.beacon_interval
    );

    loop {
        let delay = jittered(
            config.discovery.beacon_interval,
            config.discovery.beacon_jitter,
        );
        select! {
            _ = sleep(delay) => {
                let beacon = wire::Beacon {
                    node_id: config.node_id(),
                    node_name: config.app.instance.name.clone(),
                    host: config.host_ip,
                    control_port: config.gateway.port,
                    roles: config.node.roles.clone(),
                    tags: config.node.tags.clone(),
                    timestamp_ms: Utc::now().timestamp_millis() as u64,
                };
                match wire::encode(&beacon) {
                    Ok(frame) => {
                        if let Err(e) = socket.send_to(&frame, target).await {
                            warn!("Could not send beacon: {e}");
                        }
                    }
                    Err(e) => warn!("Could not encode beacon: {e}"),
                }
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Beacon sender stopped.");
    Ok(())
}

async fn beacon_listener(
    subsys: SubsystemHandle,
    config: Config,
    api: DiscoveryApi,
) -> SkeletonCrewResult<()> {
    let socket = UdpSocket::from_std(create_listener_socket(config.discovery.beacon_port)?)?;
    info!(
        "Beacon listener started on port {}.",
        config.discovery.beacon_port
    );

    let mut buf = [0u8; 2048];
    let mut malformed = 0u64;

    loop {
        select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match wire::decode::<wire::Beacon>(&buf[..len]) {
                    Ok(beacon) => api.apply_beacon(beacon).await,
                    Err(e) => {
                        malformed += 1;
                        debug!("Dropping malformed beacon from {from} ({malformed} total): {e}");
                    }
                },
                Err(e) => {
                    warn!("Beacon receive failed: {e}");
                    sleep(std::time::Duration::from_millis(500)).await;
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        }
    }

    info!("Beacon listener stopped.");
    Ok(())
}
