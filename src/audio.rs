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

pub mod adapter;
pub mod graph;
pub mod recorder;

use crate::model::{JackPort, PortDirection, PortKind, TransportState};
use ringbuf::{HeapCons, HeapProd};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::AtomicU64},
};

/// Single-producer end of a capture ring. The JACK process callback pushes
/// into it without allocating or blocking; samples that don't fit are
/// counted and dropped.
pub struct CaptureChannel {
    pub producer: HeapProd<f32>,
    pub overflows: Arc<AtomicU64>,
}

/// Consumer end of the voice capture ring, handed to the voice pipeline
/// whenever the adapter (re-)connects to JACK. A fresh stream replaces the
/// previous one.
pub struct VoiceStream {
    pub consumer: HeapCons<f32>,
    pub sample_rate: u32,
    pub overflows: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningState {
    Running,
    NotRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsReport {
    pub source: Vec<String>,
    pub sink: Vec<String>,
    pub total: usize,
}

/// Snake-case on the wire: this record is part of the `jack_status` tool
/// contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JackStatusReport {
    pub status: RunningState,
    pub sample_rate: u32,
    pub buffer_size: u32,
    pub ports: PortsReport,
    pub connections: BTreeMap<String, Vec<String>>,
    pub transport_state: TransportState,
    pub transport_frame: u64,
    pub capture_overflows: u64,
}

impl JackStatusReport {
    /// The synthetic record reported while JACK is unreachable.
    pub fn not_running() -> Self {
        Self {
            status: RunningState::NotRunning,
            sample_rate: 0,
            buffer_size: 0,
            ports: PortsReport::default(),
            connections: BTreeMap::new(),
            transport_state: TransportState::Stopped,
            transport_frame: 0,
            capture_overflows: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    #[serde(default)]
    pub direction: Option<PortDirection>,
    #[serde(default)]
    pub kind: Option<PortKind>,
    /// Substring match on the fully qualified port name.
    #[serde(default)]
    pub name_contains: Option<String>,
}

impl PortFilter {
    pub fn matches(&self, port: &JackPort) -> bool {
        if let Some(direction) = self.direction
            && port.direction != direction
        {
            return false;
        }
        if let Some(kind) = self.kind
            && port.kind != kind
        {
            return false;
        }
        if let Some(fragment) = &self.name_contains
            && !port.name.contains(fragment.as_str())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    pub path: String,
    pub channels: usize,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub path: String,
    pub frames_written: u64,
    pub overflow_samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_running_report_matches_the_tool_contract() {
        let report = JackStatusReport::not_running();
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "not_running");
        assert_eq!(json["ports"]["total"], 0);
        assert_eq!(json["transport_state"], "stopped");
        assert!(
            json["connections"]
                .as_object()
                .expect("connections object")
                .is_empty()
        );
    }

    #[test]
    fn port_filter_matches_on_all_axes() {
        let port = JackPort {
            name: "system:capture_1".to_owned(),
            direction: PortDirection::Source,
            kind: PortKind::Audio,
            physical: true,
            terminal: false,
        };
        assert!(PortFilter::default().matches(&port));
        assert!(
            PortFilter {
                direction: Some(PortDirection::Source),
                kind: Some(PortKind::Audio),
                name_contains: Some("capture".to_owned()),
            }
            .matches(&port)
        );
        assert!(
            !PortFilter {
                direction: Some(PortDirection::Sink),
                ..Default::default()
            }
            .matches(&port)
        );
        assert!(
            !PortFilter {
                name_contains: Some("playback".to_owned()),
                ..Default::default()
            }
            .matches(&port)
        );
    }
}
