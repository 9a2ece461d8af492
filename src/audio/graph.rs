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
    audio::PortFilter,
    error::{ErrorKind, ToolError},
    model::{JackConnection, JackPort, PortDirection},
};
use std::collections::{BTreeMap, BTreeSet};

/// Point-in-time view of the local JACK graph. All connection legality
/// checks run against a snapshot so that the rules stay testable without a
/// JACK server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub ports: Vec<JackPort>,
    pub connections: BTreeSet<JackConnection>,
}

impl GraphSnapshot {
    pub fn port(&self, name: &str) -> Option<&JackPort> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn is_connected(&self, source: &str, sink: &str) -> bool {
        self.connections.contains(&JackConnection {
            source: source.to_owned(),
            sink: sink.to_owned(),
        })
    }

    /// Validates a `source -> sink` connect request against the graph
    /// invariants. The call to JACK only happens after this passes.
    pub fn check_connect(&self, source: &str, sink: &str) -> Result<(), ToolError> {
        let (src, snk) = self.endpoints(source, sink)?;
        check_directions(src, snk)?;
        if self.is_connected(source, sink) {
            return Err(ToolError::new(
                ErrorKind::AlreadyConnected,
                format!("{source} is already connected to {sink}"),
            ));
        }
        Ok(())
    }

    /// Disconnecting something that isn't connected is an error, not a
    /// silent success.
    pub fn check_disconnect(&self, source: &str, sink: &str) -> Result<(), ToolError> {
        let (src, snk) = self.endpoints(source, sink)?;
        check_directions(src, snk)?;
        if !self.is_connected(source, sink) {
            return Err(ToolError::new(
                ErrorKind::NotConnected,
                format!("{source} is not connected to {sink}"),
            ));
        }
        Ok(())
    }

    fn endpoints(&self, source: &str, sink: &str) -> Result<(&JackPort, &JackPort), ToolError> {
        let src = self.port(source).ok_or_else(|| {
            ToolError::new(ErrorKind::EndpointMissing, format!("no such port: {source}"))
        })?;
        let snk = self.port(sink).ok_or_else(|| {
            ToolError::new(ErrorKind::EndpointMissing, format!("no such port: {sink}"))
        })?;
        Ok((src, snk))
    }

    pub fn filtered(&self, filter: &PortFilter) -> Vec<JackPort> {
        self.ports
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect()
    }

    /// source -> sorted sinks, for status reports.
    pub fn connection_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for conn in &self.connections {
            map.entry(conn.source.clone())
                .or_default()
                .push(conn.sink.clone());
        }
        map
    }
}

fn check_directions(src: &JackPort, snk: &JackPort) -> Result<(), ToolError> {
    if src.direction != PortDirection::Source || snk.direction != PortDirection::Sink {
        return Err(ToolError::new(
            ErrorKind::DirectionMismatch,
            format!(
                "cannot connect {} ({:?}) to {} ({:?}); only source -> sink is legal",
                src.name, src.direction, snk.name, snk.direction
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PortKind;

    fn port(name: &str, direction: PortDirection) -> JackPort {
        JackPort {
            name: name.to_owned(),
            direction,
            kind: PortKind::Audio,
            physical: false,
            terminal: false,
        }
    }

    fn snapshot() -> GraphSnapshot {
        GraphSnapshot {
            ports: vec![
                port("system:capture_1", PortDirection::Source),
                port("voice_in:in_1", PortDirection::Sink),
                port("system:playback_1", PortDirection::Sink),
            ],
            connections: BTreeSet::new(),
        }
    }

    #[test]
    fn connect_requires_both_endpoints() {
        let snap = snapshot();
        let err = snap
            .check_connect("nope:out", "voice_in:in_1")
            .expect_err("missing endpoint");
        assert_eq!(err.kind, ErrorKind::EndpointMissing);
    }

    #[test]
    fn only_source_to_sink_is_legal() {
        let snap = snapshot();
        let err = snap
            .check_connect("voice_in:in_1", "system:playback_1")
            .expect_err("direction mismatch");
        assert_eq!(err.kind, ErrorKind::DirectionMismatch);
    }

    #[test]
    fn duplicate_connections_are_surfaced() {
        let mut snap = snapshot();
        snap.check_connect("system:capture_1", "voice_in:in_1")
            .expect("legal connect");
        snap.connections.insert(JackConnection {
            source: "system:capture_1".to_owned(),
            sink: "voice_in:in_1".to_owned(),
        });
        let err = snap
            .check_connect("system:capture_1", "voice_in:in_1")
            .expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::AlreadyConnected);
        assert!(!err.retryable);
    }

    #[test]
    fn disconnecting_nonexistent_connection_is_an_error() {
        let snap = snapshot();
        let err = snap
            .check_disconnect("system:capture_1", "voice_in:in_1")
            .expect_err("not connected");
        assert_eq!(err.kind, ErrorKind::NotConnected);
    }

    #[test]
    fn connect_then_disconnect_restores_the_map() {
        let mut snap = snapshot();
        let before = snap.connection_map();
        snap.connections.insert(JackConnection {
            source: "system:capture_1".to_owned(),
            sink: "voice_in:in_1".to_owned(),
        });
        snap.check_disconnect("system:capture_1", "voice_in:in_1")
            .expect("connected");
        snap.connections.remove(&JackConnection {
            source: "system:capture_1".to_owned(),
            sink: "voice_in:in_1".to_owned(),
        });
        assert_eq!(snap.connection_map(), before);
    }

    #[test]
    fn every_connection_map_entry_is_source_to_sink() {
        let mut snap = snapshot();
        snap.connections.insert(JackConnection {
            source: "system:capture_1".to_owned(),
            sink: "voice_in:in_1".to_owned(),
        });
        for (source, sinks) in snap.connection_map() {
            assert_eq!(
                snap.port(&source).map(|p| p.direction),
                Some(PortDirection::Source)
            );
            for sink in sinks {
                assert_eq!(
                    snap.port(&sink).map(|p| p.direction),
                    Some(PortDirection::Sink)
                );
            }
        }
    }
}
