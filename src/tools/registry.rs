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
    error::{ErrorKind, ToolError, ToolResult},
    events::{Event, EventBridge},
    tools::{
        CallerId,
        schema::{ToolSpec, validate},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    pin::Pin,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_HISTORY_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

pub type ToolHandlerFuture = Pin<Box<dyn Future<Output = ToolResult<Value>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Value, CallerId) -> ToolHandlerFuture + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum InvocationOutcome {
    Ok { result: Value },
    Error { kind: ErrorKind, message: String },
}

/// One audited invocation: who called what with which arguments, and how it
/// went. The end timestamp is filled in when the handler returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub id: u64,
    pub tool: String,
    pub args: Value,
    pub caller_id: CallerId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<InvocationOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub errors_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// Process-wide, schema-driven dispatcher. Validation, audit start record,
/// handler invocation and audit end record form one observational unit:
/// every started invocation gets exactly one end record.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    history: Mutex<VecDeque<ToolInvocation>>,
    history_capacity: usize,
    permits: Arc<Semaphore>,
    next_invocation_id: AtomicU64,
    accepting: AtomicBool,
    events: EventBridge,
}

impl ToolRegistry {
    pub fn new(events: EventBridge) -> Self {
        Self::with_limits(events, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_CONCURRENCY)
    }

    pub fn with_limits(
        events: EventBridge,
        history_capacity: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            next_invocation_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            events,
        }
    }

    /// Registers a tool. Fails with `tool_exists` on a name collision.
    pub fn register(&self, spec: ToolSpec, handler: ToolHandler) -> ToolResult<()> {
        let mut tools = self.tools.write().expect("tool table poisoned");
        if tools.contains_key(&spec.name) {
            return Err(ToolError::new(
                ErrorKind::ToolExists,
                format!("a tool named '{}' is already registered", spec.name),
            ));
        }
        debug!("Registering tool '{}'", spec.name);
        tools.insert(spec.name.clone(), RegisteredTool { spec, handler });
        Ok(())
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let tools = self.tools.read().expect("tool table poisoned");
        let mut specs: Vec<_> = tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Stops accepting new invocations; running handlers finish normally.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        info!("Tool registry closed, rejecting new invocations.");
    }

    #[instrument(skip(self, args))]
    pub async fn execute(&self, name: &str, args: Value, caller_id: CallerId) -> ToolResult<Value> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ToolError::internal("tool registry is shutting down"));
        }

        let (spec, handler) = {
            let tools = self.tools.read().expect("tool table poisoned");
            let Some(tool) = tools.get(name) else {
                // No audit record: nothing was invoked.
                return Err(ToolError::new(
                    ErrorKind::ToolNotFound,
                    format!("no tool named '{name}'"),
                ));
            };
            (tool.spec.clone(), tool.handler.clone())
        };

        let id = self.next_invocation_id.fetch_add(1, Ordering::Relaxed);
        self.record_start(id, name, &args, &caller_id);

        let diagnostics = validate(&spec, &args);
        if !diagnostics.is_empty() {
            let message = diagnostics
                .iter()
                .map(|d| format!("{}: {}", d.field, d.problem))
                .collect::<Vec<_>>()
                .join("; ");
            let error = ToolError::invalid_args(message);
            self.record_end(id, name, Err(&error));
            return Err(error);
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ToolError::internal("tool registry worker pool is closed"))?;

        let result = handler(args, caller_id).await;
        self.record_end(id, name, result.as_ref());
        result
    }

    /// Recent invocations, oldest first, from the bounded ring.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<ToolInvocation> {
        let history = self.history.lock().expect("tool history poisoned");
        let matches = |record: &ToolInvocation| {
            if let Some(tool) = &filter.tool
                && &record.tool != tool
            {
                return false;
            }
            if let Some(caller) = &filter.caller
                && &record.caller_id != caller
            {
                return false;
            }
            if filter.errors_only
                && !matches!(record.outcome, Some(InvocationOutcome::Error { .. }))
            {
                return false;
            }
            true
        };
        let mut records: Vec<_> = history.iter().filter(|r| matches(r)).cloned().collect();
        if let Some(limit) = filter.limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        records
    }

    fn record_start(&self, id: u64, tool: &str, args: &Value, caller_id: &str) {
        let record = ToolInvocation {
            id,
            tool: tool.to_owned(),
            args: args.clone(),
            caller_id: caller_id.to_owned(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        };
        {
            let mut history = self.history.lock().expect("tool history poisoned");
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(record);
        }
        self.events.publish(Event::ToolInvocationStarted {
            invocation_id: id,
            tool: tool.to_owned(),
            caller_id: caller_id.to_owned(),
        });
    }

    fn record_end(&self, id: u64, tool: &str, result: Result<&Value, &ToolError>) {
        let outcome = match result {
            Ok(value) => InvocationOutcome::Ok {
                result: value.clone(),
            },
            Err(e) => InvocationOutcome::Error {
                kind: e.kind,
                message: e.message.clone(),
            },
        };
        let ok = matches!(outcome, InvocationOutcome::Ok { .. });
        {
            let mut history = self.history.lock().expect("tool history poisoned");
            match history.iter_mut().rev().find(|r| r.id == id) {
                Some(record) => {
                    record.finished_at = Some(Utc::now());
                    record.outcome = Some(outcome);
                }
                // The ring was small enough to evict a running invocation.
                None => warn!("Audit record {id} for '{tool}' was evicted before completion"),
            }
        }
        self.events.publish(Event::ToolInvocationFinished {
            invocation_id: id,
            tool: tool.to_owned(),
            ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ParamKind, ParamSpec};
    use serde_json::json;

    fn echo_handler() -> ToolHandler {
        Arc::new(|args, _caller| {
            let fut: ToolHandlerFuture = Box::pin(async move { Ok(args) });
            fut
        })
    }

    fn failing_handler(kind: ErrorKind) -> ToolHandler {
        Arc::new(move |_args, _caller| {
            let fut: ToolHandlerFuture =
                Box::pin(async move { Err(ToolError::new(kind, "nope")) });
            fut
        })
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(EventBridge::new())
    }

    fn echo_spec() -> ToolSpec {
        ToolSpec::new("echo", "returns its arguments")
            .param(ParamSpec::required("text", ParamKind::String))
    }

    #[tokio::test]
    async fn execute_records_matching_start_and_end() {
        let registry = registry();
        registry.register(echo_spec(), echo_handler()).expect("register");

        let result = registry
            .execute("echo", json!({"text": "hello"}), "indigo".to_owned())
            .await
            .expect("execute");
        assert_eq!(result, json!({"text": "hello"}));

        let history = registry.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        let record = &history[0];
        assert_eq!(record.tool, "echo");
        assert_eq!(record.caller_id, "indigo");
        assert_eq!(record.args, json!({"text": "hello"}));
        let finished = record.finished_at.expect("finished");
        assert!(finished >= record.started_at);
        assert!(matches!(record.outcome, Some(InvocationOutcome::Ok { .. })));
    }

    #[tokio::test]
    async fn unknown_tools_leave_no_audit_record() {
        let registry = registry();
        let err = registry
            .execute("nope", json!({}), "indigo".to_owned())
            .await
            .expect_err("unknown tool");
        assert_eq!(err.kind, ErrorKind::ToolNotFound);
        assert!(registry.history(&HistoryFilter::default()).is_empty());
    }

    #[tokio::test]
    async fn invalid_args_fail_fast_with_field_diagnostics() {
        let registry = registry();
        registry.register(echo_spec(), echo_handler()).expect("register");

        let err = registry
            .execute("echo", json!({"text": 42}), "indigo".to_owned())
            .await
            .expect_err("invalid args");
        assert_eq!(err.kind, ErrorKind::InvalidArgs);
        assert!(err.message.contains("text"));

        let history = registry.history(&HistoryFilter::default());
        assert_eq!(history.len(), 1);
        assert!(matches!(
            history[0].outcome,
            Some(InvocationOutcome::Error {
                kind: ErrorKind::InvalidArgs,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let registry = registry();
        registry.register(echo_spec(), echo_handler()).expect("register");
        let err = registry
            .register(echo_spec(), echo_handler())
            .expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::ToolExists);
    }

    #[tokio::test]
    async fn history_filters_by_tool_caller_and_outcome() {
        let registry = registry();
        registry.register(echo_spec(), echo_handler()).expect("register");
        registry
            .register(
                ToolSpec::new("fail", "always fails"),
                failing_handler(ErrorKind::JackUnavailable),
            )
            .expect("register");

        registry
            .execute("echo", json!({"text": "a"}), "indigo".to_owned())
            .await
            .expect("echo");
        registry
            .execute("fail", json!({}), "karate".to_owned())
            .await
            .expect_err("fail");

        let errors = registry.history(&HistoryFilter {
            errors_only: true,
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tool, "fail");

        let by_caller = registry.history(&HistoryFilter {
            caller: Some("indigo".to_owned()),
            ..Default::default()
        });
        assert_eq!(by_caller.len(), 1);
        assert_eq!(by_caller[0].tool, "echo");
    }

    #[tokio::test]
    async fn the_history_ring_is_bounded() {
        let registry = ToolRegistry::with_limits(EventBridge::new(), 4, 2);
        registry.register(echo_spec(), echo_handler()).expect("register");
        for i in 0..10 {
            registry
                .execute("echo", json!({"text": format!("{i}")}), "indigo".to_owned())
                .await
                .expect("execute");
        }
        let history = registry.history(&HistoryFilter::default());
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].args, json!({"text": "6"}));
    }

    #[tokio::test]
    async fn closed_registry_rejects_new_invocations() {
        let registry = registry();
        registry.register(echo_spec(), echo_handler()).expect("register");
        registry.close();
        let err = registry
            .execute("echo", json!({"text": "hello"}), "indigo".to_owned())
            .await
            .expect_err("closed");
        assert_eq!(err.kind, ErrorKind::Internal);
    }
}
