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

use crate::model::{NodeDescriptor, NodeId, ServiceDescriptor, TransportState};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeDiscovered,
    NodeUpdated,
    NodeLost,
    IdCollision,
    ServiceRegistered,
    ServiceUpdated,
    ServiceUnregistered,
    JackPortChanged,
    JackConnectionChanged,
    JackTransportChanged,
    TransportSkewReported,
    VoiceWake,
    VoiceCommand,
    VoiceWakeTimeout,
    ToolInvocationStarted,
    ToolInvocationFinished,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "event")]
pub enum Event {
    NodeDiscovered(NodeDescriptor),
    NodeUpdated(NodeDescriptor),
    NodeLost {
        node_id: NodeId,
    },
    IdCollision {
        node_id: NodeId,
        host: IpAddr,
    },
    ServiceRegistered(ServiceDescriptor),
    ServiceUpdated(ServiceDescriptor),
    ServiceUnregistered {
        node_id: NodeId,
        service_name: String,
    },
    JackPortChanged {
        port: String,
        registered: bool,
    },
    JackConnectionChanged {
        source: String,
        sink: String,
        connected: bool,
    },
    JackTransportChanged {
        state: TransportState,
        frame: u64,
    },
    TransportSkewReported {
        action: String,
        target_micros: u64,
        fired_micros: u64,
        skew_micros: i64,
    },
    VoiceWake {
        node_id: NodeId,
        phrase: String,
    },
    VoiceCommand {
        target_node: NodeId,
        command: String,
        raw_text: String,
        confidence: f32,
    },
    VoiceWakeTimeout {
        node_id: NodeId,
    },
    ToolInvocationStarted {
        invocation_id: u64,
        tool: String,
        caller_id: String,
    },
    ToolInvocationFinished {
        invocation_id: u64,
        tool: String,
        ok: bool,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NodeDiscovered(_) => EventKind::NodeDiscovered,
            Event::NodeUpdated(_) => EventKind::NodeUpdated,
            Event::NodeLost { .. } => EventKind::NodeLost,
            Event::IdCollision { .. } => EventKind::IdCollision,
            Event::ServiceRegistered(_) => EventKind::ServiceRegistered,
            Event::ServiceUpdated(_) => EventKind::ServiceUpdated,
            Event::ServiceUnregistered { .. } => EventKind::ServiceUnregistered,
            Event::JackPortChanged { .. } => EventKind::JackPortChanged,
            Event::JackConnectionChanged { .. } => EventKind::JackConnectionChanged,
            Event::JackTransportChanged { .. } => EventKind::JackTransportChanged,
            Event::TransportSkewReported { .. } => EventKind::TransportSkewReported,
            Event::VoiceWake { .. } => EventKind::VoiceWake,
            Event::VoiceCommand { .. } => EventKind::VoiceCommand,
            Event::VoiceWakeTimeout { .. } => EventKind::VoiceWakeTimeout,
            Event::ToolInvocationStarted { .. } => EventKind::ToolInvocationStarted,
            Event::ToolInvocationFinished { .. } => EventKind::ToolInvocationFinished,
        }
    }
}

struct Subscription {
    name: String,
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::Sender<Event>,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// Thread-safe fan-out of core events. Each subscriber drains its own
/// channel on whatever executor it likes; publishing never blocks. Dead
/// subscribers are dropped with a warning.
#[derive(Clone)]
pub struct EventBridge {
    subscriptions: Arc<DashMap<u64, Subscription>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Subscribes to the given kinds; `None` subscribes to everything.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        kinds: Option<HashSet<EventKind>>,
    ) -> (u64, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.insert(
            id,
            Subscription {
                name: name.into(),
                kinds,
                tx,
            },
        );
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscriptions.remove(&id);
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let mut dead = Vec::new();
        for sub in self.subscriptions.iter() {
            if !sub.wants(kind) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Event subscriber '{}' is not keeping up, dropping {kind:?}",
                        sub.name
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push((*sub.key(), sub.name.clone()));
                }
            }
        }
        for (id, name) in dead {
            warn!("Event subscriber '{name}' went away, removing subscription");
            self.subscriptions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> NodeDescriptor {
        use crate::model::NodeStatus;
        NodeDescriptor {
            id: id.to_owned(),
            name: id.to_owned(),
            host: "192.168.32.7".parse().expect("ip"),
            control_port: 5556,
            roles: Default::default(),
            tags: Default::default(),
            status: NodeStatus::Online,
            last_seen: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let bridge = EventBridge::new();
        let (_, mut rx) = bridge.subscribe("test", None);

        bridge.publish(Event::NodeDiscovered(node("indigo")));
        bridge.publish(Event::NodeLost {
            node_id: "indigo".to_owned(),
        });

        let first = rx.recv().await.expect("event");
        let second = rx.recv().await.expect("event");
        assert_eq!(first.kind(), EventKind::NodeDiscovered);
        assert_eq!(second.kind(), EventKind::NodeLost);
    }

    #[tokio::test]
    async fn kind_filter_is_honored() {
        let bridge = EventBridge::new();
        let kinds = [EventKind::NodeLost].into_iter().collect();
        let (_, mut rx) = bridge.subscribe("filtered", Some(kinds));

        bridge.publish(Event::NodeDiscovered(node("indigo")));
        bridge.publish(Event::NodeLost {
            node_id: "indigo".to_owned(),
        });

        let only = rx.recv().await.expect("event");
        assert_eq!(only.kind(), EventKind::NodeLost);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_subscribers_do_not_affect_the_rest() {
        let bridge = EventBridge::new();
        let (_, rx_dead) = bridge.subscribe("dead", None);
        drop(rx_dead);
        let (_, mut rx_live) = bridge.subscribe("live", None);

        bridge.publish(Event::NodeDiscovered(node("indigo")));

        let event = rx_live.recv().await.expect("event");
        assert_eq!(event.kind(), EventKind::NodeDiscovered);
    }
}
