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
    config::TransportConfig,
    error::SkeletonCrewResult,
    model::TransportState,
    time::{micros_to_wire_seconds, wall_micros},
    transport::wire::{self, TransportMessage},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    select,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

/// Agent membership. Pure: the actor owns one and the rules are testable
/// without sockets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSet {
    agents: BTreeMap<SocketAddr, String>,
}

impl AgentSet {
    /// Idempotent; re-adding an endpoint only refreshes its name.
    pub fn add(&mut self, endpoint: SocketAddr, name: impl Into<String>) {
        self.agents.insert(endpoint, name.into());
    }

    /// Idempotent; removing an unknown endpoint is a no-op.
    pub fn remove(&mut self, endpoint: &SocketAddr) -> bool {
        self.agents.remove(endpoint).is_some()
    }

    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.agents.keys().copied().collect()
    }

    pub fn members(&self) -> Vec<(SocketAddr, String)> {
        self.agents
            .iter()
            .map(|(addr, name)| (*addr, name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Reply collected from one agent by `query_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTransportReport {
    pub name: String,
    pub state: TransportState,
    pub frame: u64,
    pub reported_at: f64,
}

enum CoordinatorApiMessage {
    AddAgent {
        endpoint: SocketAddr,
        name: String,
        tx: oneshot::Sender<()>,
    },
    RemoveAgent {
        endpoint: SocketAddr,
        tx: oneshot::Sender<bool>,
    },
    ListAgents(oneshot::Sender<Vec<(SocketAddr, String)>>),
    StartAll {
        pre_roll: Duration,
        tx: oneshot::Sender<SkeletonCrewResult<f64>>,
    },
    StopAll {
        pre_roll: Duration,
        tx: oneshot::Sender<SkeletonCrewResult<f64>>,
    },
    LocateStartAll {
        frame: u64,
        pre_roll: Duration,
        tx: oneshot::Sender<SkeletonCrewResult<f64>>,
    },
    QueryAll(oneshot::Sender<BTreeMap<SocketAddr, AgentTransportReport>>),
}

/// Multicasts transport intents with a shared target instant to a set of
/// agents. Broadcast is best effort; confirmation is `query_all`.
#[derive(Clone)]
pub struct TransportCoordinatorApi {
    tx: mpsc::Sender<CoordinatorApiMessage>,
}

impl TransportCoordinatorApi {
    #[instrument(skip(self))]
    pub async fn add_agent(&self, endpoint: SocketAddr, name: String) {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::AddAgent { endpoint, name, tx })
            .await
            .ok();
        rx.await.ok();
    }

    #[instrument(skip(self))]
    pub async fn remove_agent(&self, endpoint: SocketAddr) -> bool {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::RemoveAgent { endpoint, tx })
            .await
            .ok();
        rx.await.unwrap_or(false)
    }

    pub async fn list_agents(&self) -> Vec<(SocketAddr, String)> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::ListAgents(tx))
            .await
            .ok();
        rx.await.unwrap_or_default()
    }

    /// Returns the shared target instant (seconds since epoch) that was
    /// broadcast to all agents.
    #[instrument(skip(self))]
    pub async fn start_all(&self, pre_roll: Duration) -> SkeletonCrewResult<f64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::StartAll { pre_roll, tx })
            .await
            .ok();
        rx.await.map_err(crate::error::SkeletonCrewError::from)?
    }

    #[instrument(skip(self))]
    pub async fn stop_all(&self, pre_roll: Duration) -> SkeletonCrewResult<f64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::StopAll { pre_roll, tx })
            .await
            .ok();
        rx.await.map_err(crate::error::SkeletonCrewError::from)?
    }

    #[instrument(skip(self))]
    pub async fn locate_and_start_all(
        &self,
        frame: u64,
        pre_roll: Duration,
    ) -> SkeletonCrewResult<f64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorApiMessage::LocateStartAll { frame, pre_roll, tx })
            .await
            .ok();
        rx.await.map_err(crate::error::SkeletonCrewError::from)?
    }

    #[instrument(skip(self))]
    pub async fn query_all(&self) -> BTreeMap<SocketAddr, AgentTransportReport> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(CoordinatorApiMessage::QueryAll(tx)).await.ok();
        rx.await.unwrap_or_default()
    }
}

pub fn start_transport_coordinator(
    subsys: &SubsystemHandle,
    config: TransportConfig,
) -> TransportCoordinatorApi {
    let (api_tx, api_rx) = mpsc::channel(64);
    subsys.start(SubsystemBuilder::new(
        "transport-coordinator",
        move |s| async move {
            TransportCoordinatorActor {
                subsys: s,
                config,
                agents: AgentSet::default(),
                api_rx,
            }
            .run()
            .await
        },
    ));
    TransportCoordinatorApi { tx: api_tx }
}

struct TransportCoordinatorActor {
    subsys: SubsystemHandle,
    config: TransportConfig,
    agents: AgentSet,
    api_rx: mpsc::Receiver<CoordinatorApiMessage>,
}

impl TransportCoordinatorActor {
    async fn run(mut self) -> SkeletonCrewResult<()> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0,
        ))
        .await?;
        info!("Transport coordinator started.");

        loop {
            select! {
                Some(msg) = self.api_rx.recv() => self.process_message(msg, &socket).await,
                _ = self.subsys.on_shutdown_requested() => break,
            }
        }

        info!("Transport coordinator stopped.");
        Ok(())
    }

    async fn process_message(&mut self, msg: CoordinatorApiMessage, socket: &UdpSocket) {
        match msg {
            CoordinatorApiMessage::AddAgent { endpoint, name, tx } => {
                info!("Adding transport agent '{name}' at {endpoint}");
                self.agents.add(endpoint, name);
                tx.send(()).ok();
            }
            CoordinatorApiMessage::RemoveAgent { endpoint, tx } => {
                let removed = self.agents.remove(&endpoint);
                if removed {
                    info!("Removed transport agent at {endpoint}");
                }
                tx.send(removed).ok();
            }
            CoordinatorApiMessage::ListAgents(tx) => {
                tx.send(self.agents.members()).ok();
            }
            CoordinatorApiMessage::StartAll { pre_roll, tx } => {
                let result = self
                    .broadcast_timed(socket, pre_roll, |instant| TransportMessage::Start {
                        target_instant: Some(instant),
                    })
                    .await;
                tx.send(result).ok();
            }
            CoordinatorApiMessage::StopAll { pre_roll, tx } => {
                let result = self
                    .broadcast_timed(socket, pre_roll, |instant| TransportMessage::Stop {
                        target_instant: Some(instant),
                    })
                    .await;
                tx.send(result).ok();
            }
            CoordinatorApiMessage::LocateStartAll { frame, pre_roll, tx } => {
                let result = self
                    .broadcast_timed(socket, pre_roll, |instant| TransportMessage::LocateStart {
                        frame: frame as i64,
                        target_instant: instant,
                    })
                    .await;
                tx.send(result).ok();
            }
            CoordinatorApiMessage::QueryAll(tx) => {
                tx.send(self.query_all(socket).await).ok();
            }
        }
    }

    /// Computes `now + pre_roll` once so every agent receives the same
    /// target instant. Per-agent send failures are logged and do not abort
    /// the remaining sends.
    async fn broadcast_timed(
        &self,
        socket: &UdpSocket,
        pre_roll: Duration,
        message: impl Fn(f64) -> TransportMessage,
    ) -> SkeletonCrewResult<f64> {
        let now = wall_micros()?;
        let target = micros_to_wire_seconds(now + pre_roll.as_micros() as u64);
        let bytes = wire::encode(&message(target))?;

        for endpoint in self.agents.endpoints() {
            if let Err(e) = socket.send_to(&bytes, endpoint).await {
                warn!("Could not send transport command to {endpoint}: {e}");
            }
        }
        info!(
            "Broadcast transport command to {} agents, target instant {target:.6}",
            self.agents.len()
        );
        Ok(target)
    }

    async fn query_all(&self, socket: &UdpSocket) -> BTreeMap<SocketAddr, AgentTransportReport> {
        let mut replies = BTreeMap::new();
        if self.agents.is_empty() {
            return replies;
        }

        let query = match wire::encode(&TransportMessage::Query) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode transport query: {e}");
                return replies;
            }
        };
        for endpoint in self.agents.endpoints() {
            if let Err(e) = socket.send_to(&query, endpoint).await {
                warn!("Could not query transport agent at {endpoint}: {e}");
            }
        }

        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + self.config.query_timeout;
        while replies.len() < self.agents.len() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => match wire::decode(&buf[..len]) {
                    Ok(TransportMessage::State { state, frame, now }) => {
                        let name = self
                            .agents
                            .members()
                            .into_iter()
                            .find(|(addr, _)| *addr == from)
                            .map(|(_, name)| name)
                            .unwrap_or_else(|| from.to_string());
                        replies.insert(
                            from,
                            AgentTransportReport {
                                name,
                                state,
                                frame: frame.max(0) as u64,
                                reported_at: now,
                            },
                        );
                    }
                    Ok(other) => debug!("Unexpected reply to transport query: {other:?}"),
                    Err(e) => debug!("Malformed reply to transport query from {from}: {e}"),
                },
                Ok(Err(e)) => {
                    warn!("Transport query receive failed: {e}");
                    break;
                }
                Err(_) => break,
            }
        }

        let missing = self.agents.len() - replies.len();
        if missing > 0 {
            debug!("{missing} transport agents did not reply within the timeout");
        }
        replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::new("192.168.32.11".parse().expect("ip"), port)
    }

    #[test]
    fn adding_an_agent_twice_is_idempotent() {
        let mut agents = AgentSet::default();
        agents.add(endpoint(5555), "karate");
        agents.add(endpoint(5555), "karate");
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn re_adding_refreshes_the_name() {
        let mut agents = AgentSet::default();
        agents.add(endpoint(5555), "karate");
        agents.add(endpoint(5555), "karate-2");
        assert_eq!(
            agents.members(),
            vec![(endpoint(5555), "karate-2".to_owned())]
        );
    }

    #[test]
    fn removing_is_idempotent() {
        let mut agents = AgentSet::default();
        agents.add(endpoint(5555), "karate");
        assert!(agents.remove(&endpoint(5555)));
        assert!(!agents.remove(&endpoint(5555)));
        assert!(agents.is_empty());
    }
}
