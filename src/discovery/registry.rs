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
    discovery::wire::{Beacon, ServiceAction, ServiceMessage},
    error::SkeletonCrewResult,
    events::{Event, EventBridge},
    gateway::client::GatewayClient,
    model::{Availability, NodeDescriptor, NodeId, NodeStatus, ServiceDescriptor, ServiceType},
};
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    time::interval,
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, instrument, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Node and service tables with the discovery semantics: liveness windows,
/// later-heartbeat-wins, offline nodes keeping their (unavailable) services.
/// Pure so the rules are testable without sockets or timers.
pub struct RegistryState {
    local_id: NodeId,
    liveness_window: TimeDelta,
    nodes: HashMap<NodeId, NodeDescriptor>,
    services: HashMap<NodeId, HashMap<String, ServiceDescriptor>>,
}

impl RegistryState {
    pub fn new(local: NodeDescriptor, liveness_window: Duration) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(local.id.clone(), local.clone());
        Self {
            local_id: local.id,
            liveness_window: TimeDelta::from_std(liveness_window)
                .unwrap_or_else(|_| TimeDelta::seconds(10)),
            nodes,
            services: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Applies a received beacon and returns the events it caused. Own
    /// beacons and beacons staler than the liveness window are ignored.
    pub fn apply_beacon(&mut self, beacon: Beacon, now: DateTime<Utc>) -> Vec<Event> {
        if beacon.node_id == self.local_id {
            return Vec::new();
        }

        let age = now.timestamp_millis().saturating_sub(beacon.timestamp_ms as i64);
        if age > self.liveness_window.num_milliseconds() {
            debug!(
                "Ignoring stale beacon from '{}' ({age} ms old)",
                beacon.node_id
            );
            return Vec::new();
        }

        let mut events = Vec::new();
        match self.nodes.get_mut(&beacon.node_id) {
            None => {
                let node = NodeDescriptor {
                    id: beacon.node_id,
                    name: beacon.node_name,
                    host: beacon.host,
                    control_port: beacon.control_port,
                    roles: beacon.roles,
                    tags: beacon.tags,
                    status: NodeStatus::Online,
                    last_seen: now,
                };
                self.nodes.insert(node.id.clone(), node.clone());
                events.push(Event::NodeDiscovered(node));
            }
            Some(existing) => {
                if existing.host != beacon.host {
                    // Later heartbeat wins the address, but loudly.
                    events.push(Event::IdCollision {
                        node_id: existing.id.clone(),
                        host: beacon.host,
                    });
                }
                let was_offline = existing.status == NodeStatus::Offline;
                let changed = existing.host != beacon.host
                    || existing.name != beacon.node_name
                    || existing.control_port != beacon.control_port
                    || existing.roles != beacon.roles
                    || existing.tags != beacon.tags;

                existing.host = beacon.host;
                existing.name = beacon.node_name;
                existing.control_port = beacon.control_port;
                existing.roles = beacon.roles;
                existing.tags = beacon.tags;
                existing.status = NodeStatus::Online;
                existing.last_seen = now;

                if changed || was_offline {
                    events.push(Event::NodeUpdated(existing.clone()));
                }
            }
        }
        events
    }

    /// Transitions nodes whose last heartbeat fell out of the liveness
    /// window to offline. Their services stay visible but unavailable.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = Vec::new();
        for node in self.nodes.values_mut() {
            if node.id == self.local_id || node.status == NodeStatus::Offline {
                continue;
            }
            if now - node.last_seen > self.liveness_window {
                node.status = NodeStatus::Offline;
                events.push(Event::NodeLost {
                    node_id: node.id.clone(),
                });
            }
        }
        events
    }

    pub fn apply_service_message(&mut self, message: ServiceMessage) -> Vec<Event> {
        if message.service.node_id == self.local_id {
            // We own our services; channel echoes are not authoritative.
            return Vec::new();
        }
        match message.action {
            ServiceAction::Registered | ServiceAction::Updated => {
                self.upsert_service(message.service)
            }
            ServiceAction::Unregistered => self
                .remove_service(&message.service.node_id.clone(), &message.service.name)
                .map(|s| {
                    vec![Event::ServiceUnregistered {
                        node_id: s.node_id,
                        service_name: s.name,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    /// Replaces knowledge about one peer's services with a full snapshot.
    pub fn apply_snapshot(
        &mut self,
        node_id: &str,
        services: Vec<ServiceDescriptor>,
    ) -> Vec<Event> {
        if node_id == self.local_id {
            return Vec::new();
        }
        let mut events = Vec::new();
        let known: Vec<String> = self
            .services
            .get(node_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        for name in known {
            if !services.iter().any(|s| s.name == name) {
                if let Some(removed) = self.remove_service(node_id, &name) {
                    events.push(Event::ServiceUnregistered {
                        node_id: removed.node_id,
                        service_name: removed.name,
                    });
                }
            }
        }
        for service in services {
            if service.node_id != node_id {
                continue;
            }
            events.extend(self.upsert_service(service));
        }
        events
    }

    fn upsert_service(&mut self, service: ServiceDescriptor) -> Vec<Event> {
        let per_node = self.services.entry(service.node_id.clone()).or_default();
        let event = match per_node.insert(service.name.clone(), service.clone()) {
            None => Event::ServiceRegistered(service),
            Some(previous) if previous != service => Event::ServiceUpdated(service),
            Some(_) => return Vec::new(),
        };
        vec![event]
    }

    fn remove_service(&mut self, node_id: &str, name: &str) -> Option<ServiceDescriptor> {
        self.services.get_mut(node_id)?.remove(name)
    }

    pub fn register_local_service(&mut self, mut service: ServiceDescriptor) -> (ServiceAction, Vec<Event>) {
        service.node_id = self.local_id.clone();
        let per_node = self.services.entry(self.local_id.clone()).or_default();
        let action = if per_node.contains_key(&service.name) {
            ServiceAction::Updated
        } else {
            ServiceAction::Registered
        };
        per_node.insert(service.name.clone(), service.clone());
        let event = match action {
            ServiceAction::Registered => Event::ServiceRegistered(service),
            _ => Event::ServiceUpdated(service),
        };
        (action, vec![event])
    }

    pub fn unregister_local_service(&mut self, name: &str) -> Option<(ServiceDescriptor, Vec<Event>)> {
        let local_id = self.local_id.clone();
        let removed = self.remove_service(&local_id, name)?;
        let events = vec![Event::ServiceUnregistered {
            node_id: removed.node_id.clone(),
            service_name: removed.name.clone(),
        }];
        Some((removed, events))
    }

    pub fn node(&self, id: &str) -> Option<NodeDescriptor> {
        self.nodes.get(id).cloned()
    }

    pub fn list_nodes(&self) -> Vec<NodeDescriptor> {
        let mut nodes: Vec<_> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Services, with availability derived from the owning node's status:
    /// callers see stale-but-labeled data rather than silent loss.
    pub fn list_services(
        &self,
        node: Option<&str>,
        service_type: Option<ServiceType>,
    ) -> Vec<ServiceDescriptor> {
        let mut result = Vec::new();
        for (node_id, services) in &self.services {
            if let Some(filter) = node
                && node_id != filter
            {
                continue;
            }
            let node_offline = self
                .nodes
                .get(node_id)
                .map(|n| n.status == NodeStatus::Offline)
                .unwrap_or(true);
            for service in services.values() {
                if let Some(st) = service_type
                    && service.service_type != st
                {
                    continue;
                }
                let mut service = service.clone();
                if node_offline {
                    service.availability = Availability::Unavailable;
                }
                result.push(service);
            }
        }
        result.sort_by(|a, b| (&a.node_id, &a.name).cmp(&(&b.node_id, &b.name)));
        result
    }
}

enum DiscoveryApiMessage {
    ApplyBeacon(Beacon),
    ApplyServiceMessage(ServiceMessage),
    ApplySnapshot {
        node_id: NodeId,
        services: Vec<ServiceDescriptor>,
    },
    GetNode(Option<NodeId>, oneshot::Sender<Option<NodeDescriptor>>),
    ListNodes(oneshot::Sender<Vec<NodeDescriptor>>),
    ListServices {
        node: Option<NodeId>,
        service_type: Option<ServiceType>,
        tx: oneshot::Sender<Vec<ServiceDescriptor>>,
    },
    RegisterService(ServiceDescriptor, oneshot::Sender<()>),
    UnregisterService(String, oneshot::Sender<bool>),
    Resync,
}

/// Cloneable handle to the node/service registry actor. Point-in-time node
/// snapshots are additionally available without an actor round trip.
#[derive(Clone)]
pub struct DiscoveryApi {
    tx: mpsc::Sender<DiscoveryApiMessage>,
    nodes: watch::Receiver<Arc<Vec<NodeDescriptor>>>,
}

impl DiscoveryApi {
    pub(crate) async fn apply_beacon(&self, beacon: Beacon) {
        self.tx.send(DiscoveryApiMessage::ApplyBeacon(beacon)).await.ok();
    }

    pub(crate) async fn apply_service_message(&self, message: ServiceMessage) {
        self.tx
            .send(DiscoveryApiMessage::ApplyServiceMessage(message))
            .await
            .ok();
    }

    pub(crate) async fn apply_snapshot(&self, node_id: NodeId, services: Vec<ServiceDescriptor>) {
        self.tx
            .send(DiscoveryApiMessage::ApplySnapshot { node_id, services })
            .await
            .ok();
    }

    /// `None` returns the local node.
    pub async fn node(&self, id: Option<NodeId>) -> Option<NodeDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(DiscoveryApiMessage::GetNode(id, tx)).await.ok();
        rx.await.ok().flatten()
    }

    pub async fn list_nodes(&self) -> Vec<NodeDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(DiscoveryApiMessage::ListNodes(tx)).await.ok();
        rx.await.unwrap_or_default()
    }

    pub async fn list_services(
        &self,
        node: Option<NodeId>,
        service_type: Option<ServiceType>,
    ) -> Vec<ServiceDescriptor> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DiscoveryApiMessage::ListServices {
                node,
                service_type,
                tx,
            })
            .await
            .ok();
        rx.await.unwrap_or_default()
    }

    pub async fn register_service(&self, service: ServiceDescriptor) {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DiscoveryApiMessage::RegisterService(service, tx))
            .await
            .ok();
        rx.await.ok();
    }

    pub async fn unregister_service(&self, name: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DiscoveryApiMessage::UnregisterService(name.into(), tx))
            .await
            .ok();
        rx.await.unwrap_or(false)
    }

    /// Re-fetches service snapshots from all live peers, e.g. after the
    /// service channel subscription had to be re-established.
    pub(crate) async fn resync(&self) {
        self.tx.send(DiscoveryApiMessage::Resync).await.ok();
    }

    /// Copy-on-write node snapshot for readers that cannot await.
    pub fn peek_nodes(&self) -> Arc<Vec<NodeDescriptor>> {
        self.nodes.borrow().clone()
    }

    pub fn peek_node(&self, id: &str) -> Option<NodeDescriptor> {
        self.peek_nodes().iter().find(|n| n.id == id).cloned()
    }
}

pub fn start_node_registry(
    subsys: &SubsystemHandle,
    local: NodeDescriptor,
    liveness_window: Duration,
    events: EventBridge,
    gateway: GatewayClient,
    publish_tx: mpsc::Sender<ServiceMessage>,
) -> DiscoveryApi {
    let (api_tx, api_rx) = mpsc::channel(1024);
    let (nodes_tx, nodes_rx) = watch::channel(Arc::new(vec![local.clone()]));
    let api = DiscoveryApi {
        tx: api_tx,
        nodes: nodes_rx,
    };
    let actor_api = api.clone();
    subsys.start(SubsystemBuilder::new("node-registry", move |s| async move {
        NodeRegistryActor {
            subsys: s,
            state: RegistryState::new(local, liveness_window),
            api_rx,
            api: actor_api,
            events,
            gateway,
            publish_tx,
            nodes_tx,
        }
        .run()
        .await
    }));
    api
}

struct NodeRegistryActor {
    subsys: SubsystemHandle,
    state: RegistryState,
    api_rx: mpsc::Receiver<DiscoveryApiMessage>,
    api: DiscoveryApi,
    events: EventBridge,
    gateway: GatewayClient,
    publish_tx: mpsc::Sender<ServiceMessage>,
    nodes_tx: watch::Sender<Arc<Vec<NodeDescriptor>>>,
}

impl NodeRegistryActor {
    async fn run(mut self) -> SkeletonCrewResult<()> {
        info!("Node registry started for '{}'.", self.state.local_id());
        let mut sweep = interval(SWEEP_INTERVAL);

        loop {
            select! {
                Some(msg) = self.api_rx.recv() => self.process_message(msg).await,
                _ = sweep.tick() => self.run_sweep(),
                _ = self.subsys.on_shutdown_requested() => break,
            }
        }

        info!("Node registry stopped.");
        Ok(())
    }

    fn run_sweep(&mut self) {
        let events = self.state.sweep(Utc::now());
        self.publish_all(events);
    }

    fn publish_all(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            if let Event::NodeDiscovered(node) = &event {
                self.spawn_snapshot_fetch(node.clone());
            }
            self.events.publish(event);
        }
        self.nodes_tx
            .send(Arc::new(self.state.list_nodes()))
            .ok();
    }

    /// Warms the service cache from a freshly discovered peer before
    /// relying on channel deltas.
    fn spawn_snapshot_fetch(&self, node: NodeDescriptor) {
        let gateway = self.gateway.clone();
        let api = self.api.clone();
        tokio::spawn(async move {
            match gateway.fetch_services(&node).await {
                Ok(services) => api.apply_snapshot(node.id, services).await,
                Err(e) => debug!("Service snapshot from '{}' failed: {e}", node.id),
            }
        });
    }

    #[instrument(skip(self, msg))]
    async fn process_message(&mut self, msg: DiscoveryApiMessage) {
        match msg {
            DiscoveryApiMessage::ApplyBeacon(beacon) => {
                let events = self.state.apply_beacon(beacon, Utc::now());
                self.publish_all(events);
            }
            DiscoveryApiMessage::ApplyServiceMessage(message) => {
                let events = self.state.apply_service_message(message);
                self.publish_all(events);
            }
            DiscoveryApiMessage::ApplySnapshot { node_id, services } => {
                let events = self.state.apply_snapshot(&node_id, services);
                self.publish_all(events);
            }
            DiscoveryApiMessage::GetNode(id, tx) => {
                let id = id.unwrap_or_else(|| self.state.local_id().to_owned());
                tx.send(self.state.node(&id)).ok();
            }
            DiscoveryApiMessage::ListNodes(tx) => {
                tx.send(self.state.list_nodes()).ok();
            }
            DiscoveryApiMessage::ListServices {
                node,
                service_type,
                tx,
            } => {
                tx.send(self.state.list_services(node.as_deref(), service_type))
                    .ok();
            }
            DiscoveryApiMessage::RegisterService(service, tx) => {
                let (action, events) = self.state.register_local_service(service.clone());
                self.publish_all(events);
                let message = ServiceMessage {
                    action,
                    service: ServiceDescriptor {
                        node_id: self.state.local_id().to_owned(),
                        ..service
                    },
                };
                if self.publish_tx.send(message).await.is_err() {
                    warn!("Service channel is gone, could not publish registration");
                }
                tx.send(()).ok();
            }
            DiscoveryApiMessage::Resync => {
                for node in self.state.list_nodes() {
                    if node.id != self.state.local_id() && node.status != NodeStatus::Offline {
                        self.spawn_snapshot_fetch(node);
                    }
                }
            }
            DiscoveryApiMessage::UnregisterService(name, tx) => {
                match self.state.unregister_local_service(&name) {
                    Some((service, events)) => {
                        self.publish_all(events);
                        let message = ServiceMessage {
                            action: ServiceAction::Unregistered,
                            service,
                        };
                        if self.publish_tx.send(message).await.is_err() {
                            warn!("Service channel is gone, could not publish unregistration");
                        }
                        tx.send(true).ok();
                    }
                    None => {
                        tx.send(false).ok();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::EventKind,
        model::{Health, NodeRole, ServiceEndpoint},
    };
    use std::collections::BTreeSet;

    fn local() -> NodeDescriptor {
        NodeDescriptor {
            id: "indigo".to_owned(),
            name: "indigo".to_owned(),
            host: "192.168.32.7".parse().expect("ip"),
            control_port: 5556,
            roles: BTreeSet::new(),
            tags: HashMap::new(),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
        }
    }

    fn beacon_from(id: &str, host: &str, now: DateTime<Utc>) -> Beacon {
        Beacon {
            node_id: id.to_owned(),
            node_name: id.to_owned(),
            host: host.parse().expect("ip"),
            control_port: 5556,
            roles: [NodeRole::TransportAgent].into_iter().collect(),
            tags: HashMap::new(),
            timestamp_ms: now.timestamp_millis() as u64,
        }
    }

    fn service(node: &str, name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            node_id: node.to_owned(),
            service_type: ServiceType::JackClient,
            name: name.to_owned(),
            endpoint: ServiceEndpoint::Local,
            capabilities: HashMap::new(),
            availability: Availability::Available,
            health: Health::Healthy,
        }
    }

    fn state() -> RegistryState {
        RegistryState::new(local(), Duration::from_secs(10))
    }

    #[test]
    fn first_beacon_discovers_a_node() {
        let mut state = state();
        let now = Utc::now();
        let events = state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::NodeDiscovered);
        assert_eq!(
            state.node("karate").map(|n| n.status),
            Some(NodeStatus::Online)
        );
    }

    #[test]
    fn own_beacons_are_ignored() {
        let mut state = state();
        let now = Utc::now();
        let events = state.apply_beacon(beacon_from("indigo", "192.168.32.7", now), now);
        assert!(events.is_empty());
    }

    #[test]
    fn stale_beacons_are_ignored() {
        let mut state = state();
        let now = Utc::now();
        let mut beacon = beacon_from("karate", "192.168.32.11", now);
        beacon.timestamp_ms = (now - TimeDelta::seconds(15)).timestamp_millis() as u64;
        assert!(state.apply_beacon(beacon, now).is_empty());
        assert!(state.node("karate").is_none());
    }

    #[test]
    fn nodes_expire_after_the_liveness_window() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);

        // Just inside the window: nothing happens.
        assert!(state.sweep(now + TimeDelta::seconds(9)).is_empty());

        let events = state.sweep(now + TimeDelta::seconds(12));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::NodeLost);
        assert_eq!(
            state.node("karate").map(|n| n.status),
            Some(NodeStatus::Offline)
        );
    }

    #[test]
    fn healed_partition_refreshes_silently() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        state.sweep(now + TimeDelta::seconds(12));

        let later = now + TimeDelta::seconds(13);
        let events = state.apply_beacon(beacon_from("karate", "192.168.32.11", later), later);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::NodeUpdated);
        assert_eq!(
            state.node("karate").map(|n| n.status),
            Some(NodeStatus::Online)
        );
    }

    #[test]
    fn id_collision_lets_the_later_heartbeat_win() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        let events = state.apply_beacon(beacon_from("karate", "192.168.32.99", now), now);
        let kinds: Vec<_> = events.iter().map(Event::kind).collect();
        assert!(kinds.contains(&EventKind::IdCollision));
        assert_eq!(
            state.node("karate").map(|n| n.host.to_string()),
            Some("192.168.32.99".to_owned())
        );
    }

    #[test]
    fn control_port_change_is_an_update_not_a_new_node() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        let mut beacon = beacon_from("karate", "192.168.32.11", now);
        beacon.control_port = 6000;
        let events = state.apply_beacon(beacon, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::NodeUpdated);
        assert_eq!(state.list_nodes().len(), 2);
    }

    #[test]
    fn offline_nodes_keep_their_services_as_unavailable() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        state.apply_service_message(ServiceMessage {
            action: ServiceAction::Registered,
            service: service("karate", "jack"),
        });
        state.sweep(now + TimeDelta::seconds(12));

        let services = state.list_services(Some("karate"), None);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].availability, Availability::Unavailable);
    }

    #[test]
    fn register_then_unregister_restores_the_service_set() {
        let mut state = state();
        let before = state.list_services(None, None);
        state.register_local_service(service("indigo", "voice"));
        assert_eq!(state.list_services(None, None).len(), 1);
        assert!(state.unregister_local_service("voice").is_some());
        assert_eq!(state.list_services(None, None), before);
    }

    #[test]
    fn snapshots_reconcile_removed_services() {
        let mut state = state();
        let now = Utc::now();
        state.apply_beacon(beacon_from("karate", "192.168.32.11", now), now);
        state.apply_service_message(ServiceMessage {
            action: ServiceAction::Registered,
            service: service("karate", "old"),
        });
        let events = state.apply_snapshot("karate", vec![service("karate", "new")]);
        let kinds: Vec<_> = events.iter().map(Event::kind).collect();
        assert!(kinds.contains(&EventKind::ServiceUnregistered));
        assert!(kinds.contains(&EventKind::ServiceRegistered));
        let services = state.list_services(Some("karate"), None);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].name, "new");
    }
}
