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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    net::IpAddr,
};

pub type NodeId = String;

/// Closed vocabulary of roles a node may declare in its beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    AudioHub,
    SttRealtime,
    SttBatch,
    Tts,
    Llm,
    Rag,
    TransportAgent,
    TransportCoordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

/// A peer as seen by the local registry. Created on first heartbeat receipt
/// or self-registration and mutated only by discovery events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub name: String,
    pub host: IpAddr,
    pub control_port: u16,
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
}

impl NodeDescriptor {
    pub fn control_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.control_port)
    }
}

/// Closed enum of advertisable service types; the reserved slot absorbs
/// types from newer peers without breaking decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    SttEngine,
    TtsEngine,
    JackClient,
    TransportAgent,
    TransportCoordinator,
    VoiceCommand,
    RemoteJack,
    #[serde(other)]
    Reserved,
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::SttEngine => "stt_engine",
            ServiceType::TtsEngine => "tts_engine",
            ServiceType::JackClient => "jack_client",
            ServiceType::TransportAgent => "transport_agent",
            ServiceType::TransportCoordinator => "transport_coordinator",
            ServiceType::VoiceCommand => "voice_command",
            ServiceType::RemoteJack => "remote_jack",
            ServiceType::Reserved => "reserved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceEndpoint {
    Local,
    Remote { host: IpAddr, port: u16 },
}

impl Display for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceEndpoint::Local => f.write_str("local"),
            ServiceEndpoint::Remote { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// A capability a node advertises on the service channel. Owned by the
/// advertising node; its lifetime is bounded by that node's liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub node_id: NodeId,
    pub service_type: ServiceType,
    /// Unique per node.
    pub name: String,
    pub endpoint: ServiceEndpoint,
    /// String-valued on purpose: descriptors travel in the compact binary
    /// discovery encoding, which cannot carry free-form JSON.
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub availability: Availability,
    pub health: Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Source,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Audio,
    Midi,
}

/// A port of the local JACK graph, fully qualified as `client:port`.
/// Ephemeral; discovered by querying the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackPort {
    pub name: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub physical: bool,
    pub terminal: bool,
}

/// An ordered `source -> sink` pair. Only this direction is legal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackConnection {
    pub source: String,
    pub sink: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Stopped,
    Rolling,
    Starting,
    Stopping,
}

impl Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Stopped => "stopped",
            TransportState::Rolling => "rolling",
            TransportState::Starting => "starting",
            TransportState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_the_closed_wire_vocabulary() {
        let json = serde_json::to_string(&NodeRole::AudioHub).expect("serialize");
        assert_eq!(json, "\"audio_hub\"");
        let role: NodeRole = serde_json::from_str("\"transport_agent\"").expect("deserialize");
        assert_eq!(role, NodeRole::TransportAgent);
    }

    #[test]
    fn unknown_service_types_decode_into_the_reserved_slot() {
        let st: ServiceType = serde_json::from_str("\"holo_projector\"").expect("deserialize");
        assert_eq!(st, ServiceType::Reserved);
    }

    #[test]
    fn service_endpoint_formats_for_humans() {
        assert_eq!(ServiceEndpoint::Local.to_string(), "local");
        let remote = ServiceEndpoint::Remote {
            host: "192.168.32.7".parse().expect("ip"),
            port: 5556,
        };
        assert_eq!(remote.to_string(), "192.168.32.7:5556");
    }
}
