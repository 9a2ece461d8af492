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
    audio::{PortFilter, adapter::JackAdapterApi},
    discovery::DiscoveryApi,
    error::{ToolError, ToolResult},
    model::{PortDirection, PortKind, ServiceType},
    tools::{
        registry::{ToolHandler, ToolRegistry},
        schema::{ParamKind, ParamSpec, ToolSpec},
    },
    transport::TransportCoordinatorApi,
};
use serde_json::{Value, json};
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};

/// Everything the core tools need to do their work. The registry is weak:
/// `trigger_voice_command` re-enters it.
pub struct BuiltinToolDeps {
    pub adapter: JackAdapterApi,
    pub discovery: DiscoveryApi,
    pub coordinator: TransportCoordinatorApi,
    pub registry: Weak<ToolRegistry>,
    pub default_pre_roll: Duration,
}

/// Registers the core tool set on the registry.
pub fn register_builtin_tools(
    registry: &Arc<ToolRegistry>,
    deps: BuiltinToolDeps,
) -> ToolResult<()> {
    let adapter = deps.adapter;

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("jack_status", "Report the local JACK graph and transport state"),
            handler(move |_, _| {
                let adapter = adapter.clone();
                async move { to_json(adapter.status().await) }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("list_jack_ports", "List JACK ports, optionally filtered")
                .param(
                    ParamSpec::optional("direction", ParamKind::String)
                        .one_of(["source", "sink"]),
                )
                .param(ParamSpec::optional("kind", ParamKind::String).one_of(["audio", "midi"]))
                .param(ParamSpec::optional("name_contains", ParamKind::String)),
            handler(move |args, _| {
                let adapter = adapter.clone();
                async move {
                    let filter = PortFilter {
                        direction: match opt_str(&args, "direction").as_deref() {
                            Some("source") => Some(PortDirection::Source),
                            Some("sink") => Some(PortDirection::Sink),
                            _ => None,
                        },
                        kind: match opt_str(&args, "kind").as_deref() {
                            Some("audio") => Some(PortKind::Audio),
                            Some("midi") => Some(PortKind::Midi),
                            _ => None,
                        },
                        name_contains: opt_str(&args, "name_contains"),
                    };
                    to_json(adapter.list_ports(filter).await?)
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("connect_jack_ports", "Connect a source port to a sink port")
                .param(ParamSpec::required("source", ParamKind::String))
                .param(ParamSpec::required("sink", ParamKind::String)),
            handler(move |args, _| {
                let adapter = adapter.clone();
                async move {
                    let source = req_str(&args, "source")?;
                    let sink = req_str(&args, "sink")?;
                    adapter.connect(source.clone(), sink.clone()).await?;
                    Ok(json!({ "connected": true, "source": source, "sink": sink }))
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("disconnect_jack_ports", "Disconnect a source port from a sink port")
                .param(ParamSpec::required("source", ParamKind::String))
                .param(ParamSpec::required("sink", ParamKind::String)),
            handler(move |args, _| {
                let adapter = adapter.clone();
                async move {
                    let source = req_str(&args, "source")?;
                    let sink = req_str(&args, "sink")?;
                    adapter.disconnect(source.clone(), sink.clone()).await?;
                    Ok(json!({ "disconnected": true, "source": source, "sink": sink }))
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("jack_transport_start", "Start the local JACK transport"),
            handler(move |_, _| {
                let adapter = adapter.clone();
                async move {
                    adapter.transport_start().await?;
                    Ok(json!({ "started": true }))
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("jack_transport_stop", "Stop the local JACK transport"),
            handler(move |_, _| {
                let adapter = adapter.clone();
                async move {
                    adapter.transport_stop().await?;
                    Ok(json!({ "stopped": true }))
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("jack_transport_locate", "Locate the local JACK transport to a frame")
                .param(ParamSpec::required("frame", ParamKind::Integer).min(0.0)),
            handler(move |args, _| {
                let adapter = adapter.clone();
                async move {
                    let frame = req_u64(&args, "frame")?;
                    adapter.transport_locate(frame).await?;
                    Ok(json!({ "frame": frame }))
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("record_start", "Record source ports into a WAV file")
                .param(ParamSpec::required("sources", ParamKind::Array))
                .param(ParamSpec::required("path", ParamKind::String)),
            handler(move |args, _| {
                let adapter = adapter.clone();
                async move {
                    let sources = str_array(&args, "sources")?;
                    let path = PathBuf::from(req_str(&args, "path")?);
                    to_json(adapter.record_start(sources, path).await?)
                }
            }),
        )?;
    }

    {
        let adapter = adapter.clone();
        registry.register(
            ToolSpec::new("record_stop", "Stop the running recording"),
            handler(move |_, _| {
                let adapter = adapter.clone();
                async move { to_json(adapter.record_stop().await?) }
            }),
        )?;
    }

    {
        let discovery = deps.discovery.clone();
        registry.register(
            ToolSpec::new("get_node_status", "Describe a node from the registry")
                .param(ParamSpec::optional("node", ParamKind::String)),
            handler(move |args, _| {
                let discovery = discovery.clone();
                async move {
                    let node = opt_str(&args, "node");
                    match discovery.node(node.clone()).await {
                        Some(descriptor) => to_json(descriptor),
                        None => Err(ToolError::invalid_args(format!(
                            "unknown node '{}'",
                            node.unwrap_or_default()
                        ))),
                    }
                }
            }),
        )?;
    }

    {
        let discovery = deps.discovery.clone();
        registry.register(
            ToolSpec::new("list_services", "List known services, optionally filtered")
                .param(ParamSpec::optional("node", ParamKind::String))
                .param(ParamSpec::optional("service_type", ParamKind::String)),
            handler(move |args, _| {
                let discovery = discovery.clone();
                async move {
                    let node = opt_str(&args, "node");
                    let service_type = opt_str(&args, "service_type")
                        .and_then(|s| serde_json::from_value::<ServiceType>(json!(s)).ok());
                    to_json(discovery.list_services(node, service_type).await)
                }
            }),
        )?;
    }

    {
        let registry_weak = deps.registry.clone();
        registry.register(
            ToolSpec::new(
                "trigger_voice_command",
                "Execute a canonical voice command for a node",
            )
            .param(ParamSpec::required("command", ParamKind::String))
            .param(ParamSpec::optional("raw_text", ParamKind::String))
            .param(ParamSpec::optional("confidence", ParamKind::Float))
            .param(ParamSpec::optional("target_node", ParamKind::String)),
            handler(move |args, caller| {
                let registry_weak = registry_weak.clone();
                async move {
                    let command = req_str(&args, "command")?;
                    let Some(registry) = registry_weak.upgrade() else {
                        return Err(ToolError::internal("tool registry is gone"));
                    };
                    let result = registry.execute(&command, json!({}), caller).await?;
                    Ok(json!({ "command": command, "result": result }))
                }
            }),
        )?;
    }

    // The coordinator is driven through the registry as well, so that
    // remote peers and the GUI reach it through one audited surface.
    let pre_roll_default = deps.default_pre_roll;

    {
        let coordinator = deps.coordinator.clone();
        registry.register(
            ToolSpec::new("add_transport_agent", "Add an agent endpoint to the coordinator")
                .param(ParamSpec::required("endpoint", ParamKind::String))
                .param(ParamSpec::required("name", ParamKind::String)),
            handler(move |args, _| {
                let coordinator = coordinator.clone();
                async move {
                    let endpoint = req_endpoint(&args)?;
                    let name = req_str(&args, "name")?;
                    coordinator.add_agent(endpoint, name).await;
                    Ok(json!({ "added": endpoint.to_string() }))
                }
            }),
        )?;
    }

    {
        let coordinator = deps.coordinator.clone();
        registry.register(
            ToolSpec::new("remove_transport_agent", "Remove an agent endpoint from the coordinator")
                .param(ParamSpec::required("endpoint", ParamKind::String)),
            handler(move |args, _| {
                let coordinator = coordinator.clone();
                async move {
                    let endpoint = req_endpoint(&args)?;
                    let removed = coordinator.remove_agent(endpoint).await;
                    Ok(json!({ "removed": removed }))
                }
            }),
        )?;
    }

    {
        let coordinator = deps.coordinator.clone();
        registry.register(
            ToolSpec::new("transport_start_all", "Start all coordinated transports")
                .param(ParamSpec::optional("pre_roll", ParamKind::Float).min(0.0)),
            handler(move |args, _| {
                let coordinator = coordinator.clone();
                async move {
                    let pre_roll = pre_roll_arg(&args, pre_roll_default);
                    let target = coordinator
                        .start_all(pre_roll)
                        .await
                        .map_err(internal)?;
                    Ok(json!({ "target_instant": target }))
                }
            }),
        )?;
    }

    {
        let coordinator = deps.coordinator.clone();
        registry.register(
            ToolSpec::new("transport_stop_all", "Stop all coordinated transports")
                .param(ParamSpec::optional("pre_roll", ParamKind::Float).min(0.0)),
            handler(move |args, _| {
                let coordinator = coordinator.clone();
                async move {
                    let pre_roll = pre_roll_arg(&args, pre_roll_default);
                    let target = coordinator.stop_all(pre_roll).await.map_err(internal)?;
                    Ok(json!({ "target_instant": target }))
                }
            }),
        )?;
    }

    {
        let coordinator = deps.coordinator.clone();
        registry.register(
            ToolSpec::new(
                "transport_locate_start_all",
                "Locate all coordinated transports and start them together",
            )
            .param(ParamSpec::required("frame", ParamKind::Integer).min(0.0))
            .param(ParamSpec::optional("pre_roll", ParamKind::Float).min(0.0)),
            handler(move |args, _| {
                let coordinator = coordinator.clone();
                async move {
                    let frame = req_u64(&args, "frame")?;
                    let pre_roll = pre_roll_arg(&args, pre_roll_default);
                    let target = coordinator
                        .locate_and_start_all(frame, pre_roll)
                        .await
                        .map_err(internal)?;
                    Ok(json!({ "frame": frame, "target_instant": target }))
                }
            }),
        )?;
    }

    {
        let coordinator = deps.coordinator;
        registry.register(
            ToolSpec::new("transport_query_all", "Query all coordinated transports"),
            handler(move |_, _| {
                let coordinator = coordinator.clone();
                async move {
                    let replies = coordinator.query_all().await;
                    let by_endpoint: serde_json::Map<String, Value> = replies
                        .into_iter()
                        .map(|(endpoint, report)| {
                            (
                                endpoint.to_string(),
                                serde_json::to_value(report).unwrap_or(Value::Null),
                            )
                        })
                        .collect();
                    Ok(Value::Object(by_endpoint))
                }
            }),
        )?;
    }

    Ok(())
}

fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult<Value>> + Send + 'static,
{
    Arc::new(move |args, caller| {
        let fut: crate::tools::registry::ToolHandlerFuture = Box::pin(f(args, caller));
        fut
    })
}

fn to_json(value: impl serde::Serialize) -> ToolResult<Value> {
    serde_json::to_value(value).map_err(|e| ToolError::internal(format!("serialization: {e}")))
}

fn internal(e: impl std::fmt::Display) -> ToolError {
    ToolError::internal(e.to_string())
}

fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)?.as_str().map(ToOwned::to_owned)
}

fn req_str(args: &Value, key: &str) -> ToolResult<String> {
    opt_str(args, key).ok_or_else(|| ToolError::invalid_args(format!("{key} is required")))
}

fn req_u64(args: &Value, key: &str) -> ToolResult<u64> {
    args.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ToolError::invalid_args(format!("{key} is required")))
}

fn str_array(args: &Value, key: &str) -> ToolResult<Vec<String>> {
    let items = args
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::invalid_args(format!("{key} is required")))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(ToOwned::to_owned)
                .ok_or_else(|| ToolError::invalid_args(format!("{key} must contain strings")))
        })
        .collect()
}

fn req_endpoint(args: &Value) -> ToolResult<SocketAddr> {
    let raw = req_str(args, "endpoint")?;
    raw.parse()
        .map_err(|_| ToolError::invalid_args(format!("'{raw}' is not a host:port endpoint")))
}

fn pre_roll_arg(args: &Value, default: Duration) -> Duration {
    args.get("pre_roll")
        .and_then(Value::as_f64)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn argument_helpers_extract_and_reject() {
        let args = json!({
            "source": "system:capture_1",
            "frame": 96000,
            "sources": ["a", "b"],
        });
        assert_eq!(req_str(&args, "source").expect("str"), "system:capture_1");
        assert_eq!(req_u64(&args, "frame").expect("u64"), 96_000);
        assert_eq!(str_array(&args, "sources").expect("array"), vec!["a", "b"]);
        assert!(req_str(&args, "sink").is_err());
        assert!(str_array(&json!({"sources": [1]}), "sources").is_err());
    }

    #[test]
    fn endpoints_parse_as_socket_addresses() {
        let args = json!({"endpoint": "192.168.32.11:5555"});
        assert_eq!(
            req_endpoint(&args).expect("endpoint"),
            "192.168.32.11:5555".parse::<SocketAddr>().expect("addr")
        );
        assert!(req_endpoint(&json!({"endpoint": "karate"})).is_err());
    }

    #[test]
    fn pre_roll_falls_back_to_the_default() {
        let default = Duration::from_secs(3);
        assert_eq!(pre_roll_arg(&json!({}), default), default);
        assert_eq!(
            pre_roll_arg(&json!({"pre_roll": 1.5}), default),
            Duration::from_millis(1_500)
        );
    }
}
