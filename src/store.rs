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
    events::{Event, EventBridge},
    model::NodeDescriptor,
    tools::registry::{HistoryFilter, ToolInvocation, ToolRegistry},
};
use rusqlite::{Connection, params};
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{debug, info, warn};

/// Keyed-record store mirroring the in-memory node registry plus a command
/// history table. Core operation never depends on it; an unopenable store
/// is a supported degraded mode.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: Option<&Path>) -> SkeletonCrewResult<Self> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            None => {
                let dir = dirs::data_dir()
                    .ok_or_else(|| {
                        SkeletonCrewError::Other("no data directory on this platform".to_owned())
                    })?
                    .join("skeleton-crew");
                std::fs::create_dir_all(&dir)?;
                Connection::open(dir.join("registry.db"))?
            }
        };
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> SkeletonCrewResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> SkeletonCrewResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                descriptor TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tool_history (
                invocation_id INTEGER NOT NULL,
                tool TEXT NOT NULL,
                caller TEXT NOT NULL,
                record TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn save_node(&self, node: &NodeDescriptor) -> SkeletonCrewResult<()> {
        let descriptor = serde_json::to_string(node)?;
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO nodes (id, descriptor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET descriptor = ?2, updated_at = ?3",
            params![node.id, descriptor, node.last_seen.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_nodes(&self) -> SkeletonCrewResult<Vec<NodeDescriptor>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare("SELECT descriptor FROM nodes ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut nodes = Vec::new();
        for row in rows {
            match serde_json::from_str(&row?) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("Skipping unreadable node record: {e}"),
            }
        }
        Ok(nodes)
    }

    pub fn append_invocation(&self, record: &ToolInvocation) -> SkeletonCrewResult<()> {
        let serialized = serde_json::to_string(record)?;
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO tool_history (invocation_id, tool, caller, record, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id as i64,
                record.tool,
                record.caller_id,
                serialized,
                record.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn recent_invocations(&self, limit: usize) -> SkeletonCrewResult<Vec<ToolInvocation>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT record FROM tool_history ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            match serde_json::from_str(&row?) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable history record: {e}"),
            }
        }
        records.reverse();
        Ok(records)
    }
}

/// Mirrors registry changes into the store by following the event bridge.
pub fn start_store_writer(
    subsys: &SubsystemHandle,
    store: Arc<Store>,
    events: &EventBridge,
    registry: Arc<ToolRegistry>,
) {
    let (_, mut rx) = events.subscribe("store-writer", None);
    subsys.start(SubsystemBuilder::new("store-writer", move |s| async move {
        info!("Store writer started.");
        loop {
            select! {
                Some(event) = rx.recv() => {
                    if let Err(e) = persist_event(&store, &registry, event) {
                        debug!("Store write failed: {e}");
                    }
                }
                _ = s.on_shutdown_requested() => break,
            }
        }
        info!("Store writer stopped.");
        Ok::<(), SkeletonCrewError>(())
    }));
}

fn persist_event(
    store: &Store,
    registry: &ToolRegistry,
    event: Event,
) -> SkeletonCrewResult<()> {
    match event {
        Event::NodeDiscovered(node) | Event::NodeUpdated(node) => store.save_node(&node),
        Event::ToolInvocationFinished { invocation_id, .. } => {
            let record = registry
                .history(&HistoryFilter::default())
                .into_iter()
                .find(|r| r.id == invocation_id);
            match record {
                Some(record) => store.append_invocation(&record),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeStatus;
    use chrono::Utc;
    use serde_json::json;

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_owned(),
            name: id.to_owned(),
            host: "192.168.32.7".parse().expect("ip"),
            control_port: 5556,
            roles: Default::default(),
            tags: Default::default(),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn nodes_round_trip_through_the_store() {
        let store = Store::open_in_memory().expect("store");
        store.save_node(&node("indigo")).expect("save");
        store.save_node(&node("karate")).expect("save");
        // Upsert: saving again must not duplicate.
        store.save_node(&node("indigo")).expect("save");

        let nodes = store.load_nodes().expect("load");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "indigo");
        assert_eq!(nodes[1].id, "karate");
    }

    #[test]
    fn invocations_are_appended_and_read_back_in_order() {
        let store = Store::open_in_memory().expect("store");
        for i in 1..=3u64 {
            let record = ToolInvocation {
                id: i,
                tool: "jack_status".to_owned(),
                args: json!({}),
                caller_id: "indigo".to_owned(),
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                outcome: None,
            };
            store.append_invocation(&record).expect("append");
        }
        let records = store.recent_invocations(2).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[1].id, 3);
    }
}
