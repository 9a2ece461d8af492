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
    config::DiscoveryConfig,
    discovery::{
        registry::DiscoveryApi,
        wire::{self, ServiceMessage},
    },
    error::{SkeletonCrewError, SkeletonCrewResult},
    model::ServiceType,
    utils::find_network_interface,
};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    collections::HashSet,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, select, sync::mpsc, time::sleep};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

const SEND_RETRIES: u32 = 5;
const SEND_RETRY_BASE: Duration = Duration::from_millis(100);
const REJOIN_DELAY: Duration = Duration::from_secs(1);

/// Topic filter for the service channel: `None` is the wildcard
/// subscription, a set subscribes to those service types only.
pub type TopicFilter = Option<HashSet<ServiceType>>;

pub fn start_service_channel(
    subsys: &SubsystemHandle,
    config: DiscoveryConfig,
    api: DiscoveryApi,
    publish_rx: mpsc::Receiver<ServiceMessage>,
    topics: TopicFilter,
) {
    subsys.start(SubsystemBuilder::new("service-channel", move |s| async move {
        ServiceChannelActor {
            subsys: s,
            config,
            api,
            publish_rx,
            topics,
        }
        .run()
        .await
    }));
}

/// Resolves the configured interface address to the NIC's IPv4 address for
/// multicast membership. A configured address that exists on no local
/// interface is a configuration error, not something to silently ignore.
fn multicast_interface(config: &DiscoveryConfig) -> SkeletonCrewResult<Ipv4Addr> {
    let Some(ip) = config.interface_ip else {
        return Ok(Ipv4Addr::UNSPECIFIED);
    };
    let iface = find_network_interface(ip)?;
    iface
        .ips
        .iter()
        .find_map(|ipn| match ipn.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            SkeletonCrewError::Other(format!(
                "interface {} has no IPv4 address for multicast",
                iface.name
            ))
        })
}

#[instrument(skip(config))]
fn create_rx_socket(config: &DiscoveryConfig) -> SkeletonCrewResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.service_port);
    socket.bind(&SockAddr::from(addr))?;
    let interface = multicast_interface(config)?;
    socket.join_multicast_v4(&config.service_group, &interface)?;
    info!(
        "Joined service channel group {}:{} on interface {interface}",
        config.service_group, config.service_port
    );
    Ok(socket.into())
}

#[instrument(skip(config))]
fn create_tx_socket(config: &DiscoveryConfig) -> SkeletonCrewResult<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProto::UDP))?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&SockAddr::from(addr))?;
    let interface = multicast_interface(config)?;
    if interface != Ipv4Addr::UNSPECIFIED {
        socket.set_multicast_if_v4(&interface)?;
    }
    Ok(socket.into())
}

struct ServiceChannelActor {
    subsys: SubsystemHandle,
    config: DiscoveryConfig,
    api: DiscoveryApi,
    publish_rx: mpsc::Receiver<ServiceMessage>,
    topics: TopicFilter,
}

impl ServiceChannelActor {
    async fn run(mut self) -> SkeletonCrewResult<()> {
        let mut rx_socket = UdpSocket::from_std(create_rx_socket(&self.config)?)?;
        let tx_socket = UdpSocket::from_std(create_tx_socket(&self.config)?)?;
        let group = SocketAddr::new(
            IpAddr::V4(self.config.service_group),
            self.config.service_port,
        );

        info!("Service channel started.");
        let mut buf = [0u8; 8192];

        loop {
            select! {
                Some(message) = self.publish_rx.recv() => {
                    self.send_with_backoff(&tx_socket, group, &message).await;
                }
                received = rx_socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.process_datagram(&buf[..len], from).await,
                    Err(e) => {
                        warn!("Service channel receive failed: {e}, re-joining group");
                        sleep(REJOIN_DELAY).await;
                        match create_rx_socket(&self.config) {
                            Ok(socket) => {
                                rx_socket = UdpSocket::from_std(socket)?;
                                // Deltas may have been lost while the
                                // subscription was down.
                                self.api.resync().await;
                            }
                            Err(e) => warn!("Could not re-join service channel: {e}"),
                        }
                    }
                },
                _ = self.subsys.on_shutdown_requested() => break,
            }
        }

        info!("Service channel stopped.");
        Ok(())
    }

    async fn process_datagram(&self, frame: &[u8], from: SocketAddr) {
        match wire::decode::<ServiceMessage>(frame) {
            Ok(message) => {
                if let Some(topics) = &self.topics
                    && !topics.contains(&message.service.service_type)
                {
                    return;
                }
                self.api.apply_service_message(message).await;
            }
            Err(e) => debug!("Dropping malformed service message from {from}: {e}"),
        }
    }

    /// Bounded exponential back-off; gives up with a warning after the last
    /// attempt so one unreachable network never wedges the publisher.
    async fn send_with_backoff(
        &self,
        socket: &UdpSocket,
        group: SocketAddr,
        message: &ServiceMessage,
    ) {
        let frame = match wire::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not encode service message: {e}");
                return;
            }
        };
        let mut delay = SEND_RETRY_BASE;
        for attempt in 1..=SEND_RETRIES {
            match socket.send_to(&frame, group).await {
                Ok(_) => return,
                Err(e) if attempt == SEND_RETRIES => {
                    warn!("Service message send failed after {attempt} attempts: {e}");
                }
                Err(e) => {
                    debug!("Service message send failed (attempt {attempt}): {e}");
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}
