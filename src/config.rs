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

use crate::{error::SkeletonCrewResult, model::NodeRole};
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "SKELETON_CREW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "skeleton-crew".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Stable node id announced in beacons. Defaults to the instance name.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<NodeRole>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            roles: [NodeRole::AudioHub, NodeRole::TransportAgent]
                .into_iter()
                .collect(),
            tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    pub beacon_address: IpAddr,
    pub beacon_port: u16,
    #[serde(with = "serde_millis")]
    pub beacon_interval: Duration,
    #[serde(with = "serde_millis")]
    pub beacon_jitter: Duration,
    #[serde(with = "serde_millis")]
    pub liveness_window: Duration,
    pub service_group: Ipv4Addr,
    pub service_port: u16,
    /// Interface to bind multicast membership to; `None` means any.
    #[serde(default)]
    pub interface_ip: Option<IpAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            beacon_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            beacon_port: 5557,
            beacon_interval: Duration::from_secs(2),
            beacon_jitter: Duration::from_millis(250),
            liveness_window: Duration::from_secs(10),
            service_group: Ipv4Addr::new(239, 255, 42, 99),
            service_port: 5558,
            interface_ip: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub agent_port: u16,
    #[serde(with = "serde_millis")]
    pub skew_warn_threshold: Duration,
    #[serde(with = "serde_millis")]
    pub default_pre_roll: Duration,
    #[serde(with = "serde_millis")]
    pub query_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            agent_port: 5555,
            skew_warn_threshold: Duration::from_millis(5),
            default_pre_roll: Duration::from_secs(3),
            query_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasConfig {
    /// Spoken phrase, matched after normalization.
    pub phrase: String,
    /// Canonical command (a voice-invocable tool name).
    pub command: String,
    /// Restrict the alias to one node; global when absent.
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub input_port: String,
    pub recognizer_sample_rate: u32,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(with = "serde_millis")]
    pub wake_window: Duration,
    /// node id -> wake phrase
    #[serde(default)]
    pub wake_words: HashMap<String, String>,
    #[serde(default)]
    pub aliases: Vec<AliasConfig>,
    /// Capacity of the capture ring buffer, in samples at the JACK rate.
    pub capture_queue_samples: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            input_port: "voice_in".to_owned(),
            recognizer_sample_rate: 16_000,
            model_path: None,
            wake_window: Duration::from_secs(5),
            wake_words: HashMap::new(),
            aliases: Vec::new(),
            capture_queue_samples: 65_536,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5556,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JackConfig {
    /// JACK client name; defaults to the instance name.
    #[serde(default)]
    pub client_name: Option<String>,
    /// Input ports pre-registered for the recorder.
    #[serde(default = "default_recorder_channels")]
    pub recorder_channels: usize,
}

fn default_recorder_channels() -> usize {
    2
}

impl Default for JackConfig {
    fn default() -> Self {
        Self {
            client_name: None,
            recorder_channels: default_recorder_channels(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Database file; defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub voice: Option<VoiceConfig>,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub jack: JackConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    /// Address this node announces itself under.
    pub host_ip: IpAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: Default::default(),
            telemetry: Default::default(),
            node: Default::default(),
            discovery: Default::default(),
            transport: Default::default(),
            voice: Default::default(),
            gateway: Default::default(),
            jack: Default::default(),
            store: Default::default(),
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl Config {
    #[instrument]
    pub async fn load() -> SkeletonCrewResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        let config = Config::load_from_file(args.config.as_deref()).await?;

        Ok(config)
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> SkeletonCrewResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(&path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/skeleton-crew/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(it) => {
                        let config = serde_yaml::from_str(&it)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }

    pub fn node_id(&self) -> String {
        self.node
            .id
            .clone()
            .unwrap_or_else(|| self.app.instance.name.clone())
    }

    pub fn jack_client_name(&self) -> String {
        self.jack
            .client_name
            .clone()
            .unwrap_or_else(|| self.app.instance.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_in_defaults() {
        let config: Config = serde_yaml::from_str("hostIp: 192.168.32.7\n").expect("parse");
        assert_eq!(config.discovery.beacon_port, 5557);
        assert_eq!(config.discovery.liveness_window, Duration::from_secs(10));
        assert_eq!(config.transport.agent_port, 5555);
        assert_eq!(config.gateway.request_timeout, Duration::from_secs(5));
        assert!(config.voice.is_none());
    }

    #[test]
    fn node_id_falls_back_to_instance_name() {
        let mut config = Config::default();
        config.app.instance.name = "indigo".to_owned();
        assert_eq!(config.node_id(), "indigo");
        config.node.id = Some("karate".to_owned());
        assert_eq!(config.node_id(), "karate");
    }

    #[test]
    fn voice_section_parses_wake_words_and_aliases() {
        let yaml = r#"
hostIp: 192.168.32.7
voice:
  inputPort: voice_in
  recognizerSampleRate: 16000
  wakeWindow: 5000
  captureQueueSamples: 65536
  wakeWords:
    indigo: computer indigo
  aliases:
    - phrase: play
      command: jack_transport_start
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        let voice = config.voice.expect("voice config");
        assert_eq!(voice.wake_words.get("indigo").map(String::as_str), Some("computer indigo"));
        assert_eq!(voice.aliases[0].command, "jack_transport_start");
        assert!(voice.aliases[0].node.is_none());
    }
}
