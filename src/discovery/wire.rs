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
    error::{SkeletonCrewError, SkeletonCrewResult},
    model::{NodeId, NodeRole, ServiceDescriptor},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
};

/// Bumped on every incompatible change to the discovery messages. Decoders
/// reject everything they don't know.
pub const WIRE_VERSION: u8 = 1;

/// Periodic LAN-broadcast announcement. Small on purpose: it is sent at
/// 2 Hz by every node on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub node_id: NodeId,
    pub node_name: String,
    pub host: IpAddr,
    pub control_port: u16,
    pub roles: BTreeSet<NodeRole>,
    pub tags: HashMap<String, String>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    Registered,
    Updated,
    Unregistered,
}

/// Delta published on the service channel whenever a node's advertised
/// services change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMessage {
    pub action: ServiceAction,
    pub service: ServiceDescriptor,
}

pub fn encode<T: Serialize>(message: &T) -> SkeletonCrewResult<Vec<u8>> {
    let body = postcard::to_allocvec(message)?;
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(WIRE_VERSION);
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> SkeletonCrewResult<T> {
    let Some((&version, body)) = frame.split_first() else {
        return Err(SkeletonCrewError::Other(
            "empty discovery datagram".to_owned(),
        ));
    };
    if version != WIRE_VERSION {
        return Err(SkeletonCrewError::Other(format!(
            "unsupported discovery wire version {version}"
        )));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Availability, Health, ServiceEndpoint, ServiceType};

    fn beacon() -> Beacon {
        Beacon {
            node_id: "indigo".to_owned(),
            node_name: "Indigo Workstation".to_owned(),
            host: "192.168.32.7".parse().expect("ip"),
            control_port: 5556,
            roles: [NodeRole::AudioHub, NodeRole::TransportAgent]
                .into_iter()
                .collect(),
            tags: [("room".to_owned(), "studio-a".to_owned())]
                .into_iter()
                .collect(),
            timestamp_ms: 1_754_000_000_000,
        }
    }

    #[test]
    fn beacons_round_trip() {
        let original = beacon();
        let frame = encode(&original).expect("encode");
        assert_eq!(frame[0], WIRE_VERSION);
        let decoded: Beacon = decode(&frame).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn service_messages_round_trip() {
        let original = ServiceMessage {
            action: ServiceAction::Registered,
            service: ServiceDescriptor {
                node_id: "indigo".to_owned(),
                service_type: ServiceType::JackClient,
                name: "jack".to_owned(),
                endpoint: ServiceEndpoint::Local,
                capabilities: [("sampleRate".to_owned(), "48000".to_owned())]
                    .into_iter()
                    .collect(),
                availability: Availability::Available,
                health: Health::Healthy,
            },
        };
        let frame = encode(&original).expect("encode");
        let decoded: ServiceMessage = decode(&frame).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn foreign_wire_versions_are_rejected() {
        let mut frame = encode(&beacon()).expect("encode");
        frame[0] = WIRE_VERSION + 1;
        assert!(decode::<Beacon>(&frame).is_err());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = encode(&beacon()).expect("encode");
        assert!(decode::<Beacon>(&frame[..frame.len() / 2]).is_err());
        assert!(decode::<Beacon>(&[]).is_err());
    }
}
