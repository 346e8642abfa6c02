//! Graph persistence.
//!
//! [`GraphStore`] is the relational store behind the memory graph: nodes,
//! edges, a first-class time-series table, and scheduled-task storage, all
//! in one SQLite database. Writes commit before returning; reads within a
//! process are monotonic. The connection lives behind a mutex; the runtime
//! is single-writer, so a worker-thread pool would buy nothing.
//!
//! [`LocalGraphMemoryService`] wraps the store in the
//! [`MemoryService`](crate::mindfabric::service::MemoryService) contract so
//! it can be registered like any other provider.
//!
//! # Tables
//!
//! ```text
//! graph_nodes(node_id, scope, node_type, attributes_json, version,
//!             updated_by, updated_at)               PK (node_id, scope)
//! graph_edges(edge_id, source_node_id, target_node_id, scope,
//!             relationship, weight, attributes_json) PK edge_id
//! tsdb_points(node_id, scope, data_type, metric_name, metric_value,
//!             log_level, log_message, timestamp_ms, tags_json,
//!             retention, consolidated_by)            PK (node_id, scope)
//!             + index (scope, data_type, timestamp_ms)
//! scheduled_tasks(task_id, status, payload_json, updated_at)
//! ```

use crate::mindfabric::error::{FabricError, FabricResult};
use crate::mindfabric::graph::{
    GraphEdge, GraphNode, GraphScope, MemoryOpResult, MemoryQuery, MemorySearchResult, NodeType,
    TimeSeriesPoint, TsdbDataType, TsdbNode, CONSOLIDATED_INTO_TAG,
};
use crate::mindfabric::service::{
    EnvironmentUpdateRequest, IdentityUpdateRequest, MemoryService, ProviderResult, Service,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    node_id         TEXT NOT NULL,
    scope           TEXT NOT NULL,
    node_type       TEXT NOT NULL,
    attributes_json TEXT NOT NULL,
    version         INTEGER NOT NULL DEFAULT 1,
    updated_by      TEXT,
    updated_at      TEXT,
    PRIMARY KEY (node_id, scope)
);

CREATE TABLE IF NOT EXISTS graph_edges (
    edge_id         TEXT PRIMARY KEY,
    source_node_id  TEXT NOT NULL,
    target_node_id  TEXT NOT NULL,
    scope           TEXT NOT NULL,
    relationship    TEXT NOT NULL,
    weight          REAL NOT NULL DEFAULT 1.0,
    attributes_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON graph_edges(scope, source_node_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON graph_edges(scope, target_node_id);

CREATE TABLE IF NOT EXISTS tsdb_points (
    node_id         TEXT NOT NULL,
    scope           TEXT NOT NULL,
    data_type       TEXT NOT NULL,
    metric_name     TEXT,
    metric_value    REAL,
    log_level       TEXT,
    log_message     TEXT,
    timestamp_ms    INTEGER NOT NULL,
    tags_json       TEXT NOT NULL,
    retention       TEXT NOT NULL DEFAULT 'raw',
    consolidated_by TEXT,
    PRIMARY KEY (node_id, scope)
);

CREATE INDEX IF NOT EXISTS idx_tsdb_window ON tsdb_points(scope, data_type, timestamp_ms);

CREATE TABLE IF NOT EXISTS scheduled_tasks (
    task_id      TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
"#;

/// SQLite-backed store for the memory graph.
pub struct GraphStore {
    conn: StdMutex<Connection>,
}

impl GraphStore {
    /// Open (or create) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> FabricResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    /// In-memory store; state is lost when dropped. Useful for tests.
    pub fn open_in_memory() -> FabricResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("graph store lock poisoned")
    }

    /// Insert or replace a node by `(id, scope)`. `updated_at` is filled in
    /// when absent. Time-series nodes also land in the `tsdb_points` table.
    pub fn add_node(&self, node: &GraphNode) -> FabricResult<String> {
        if node.id.is_empty() {
            return Err(FabricError::Validation("node id must not be empty".into()));
        }
        let updated_at = node.updated_at.unwrap_or_else(Utc::now);
        let attributes_json = serde_json::to_string(&node.attributes)?;

        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO graph_nodes
             (node_id, scope, node_type, attributes_json, version, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.id,
                node.scope.as_str(),
                node.kind.as_str(),
                attributes_json,
                node.version,
                node.updated_by,
                updated_at.to_rfc3339(),
            ],
        )?;

        if node.kind == NodeType::TsdbData {
            Self::upsert_tsdb_row(&conn, node)?;
        }

        debug!("added graph node {} in scope {}", node.id, node.scope);
        Ok(node.id.clone())
    }

    fn upsert_tsdb_row(conn: &Connection, node: &GraphNode) -> FabricResult<()> {
        let data_type = node.attr_str("data_type").unwrap_or("metric").to_string();
        let timestamp = node
            .attr_str("timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let tags_json = node
            .attributes
            .get("tags")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let consolidated_by = tags_json
            .get(CONSOLIDATED_INTO_TAG)
            .and_then(Value::as_str)
            .map(str::to_string);

        conn.execute(
            "INSERT OR REPLACE INTO tsdb_points
             (node_id, scope, data_type, metric_name, metric_value, log_level, log_message,
              timestamp_ms, tags_json, retention, consolidated_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                node.id,
                node.scope.as_str(),
                data_type,
                node.attr_str("metric_name"),
                node.attr_f64("metric_value"),
                node.attr_str("log_level"),
                node.attr_str("log_message"),
                timestamp.timestamp_millis(),
                serde_json::to_string(&tags_json)?,
                node.attr_str("retention_policy").unwrap_or("raw"),
                consolidated_by,
            ],
        )?;
        Ok(())
    }

    /// Fetch a node by `(id, scope)`.
    pub fn get_node(&self, node_id: &str, scope: GraphScope) -> FabricResult<Option<GraphNode>> {
        let conn = self.lock();
        let node = conn
            .query_row(
                "SELECT node_id, scope, node_type, attributes_json, version, updated_by, updated_at
                 FROM graph_nodes WHERE node_id = ?1 AND scope = ?2",
                params![node_id, scope.as_str()],
                Self::row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// Every node in `scope` whose id starts with `prefix`.
    pub fn nodes_by_prefix(&self, prefix: &str, scope: GraphScope) -> FabricResult<Vec<GraphNode>> {
        let conn = self.lock();
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', "\\_"));
        let mut stmt = conn.prepare(
            "SELECT node_id, scope, node_type, attributes_json, version, updated_by, updated_at
             FROM graph_nodes WHERE scope = ?1 AND node_id LIKE ?2 ESCAPE '\\' ORDER BY node_id",
        )?;
        let rows = stmt.query_map(params![scope.as_str(), pattern], Self::row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    /// Every node in `scope`.
    pub fn nodes_in_scope(&self, scope: GraphScope) -> FabricResult<Vec<GraphNode>> {
        self.nodes_by_prefix("", scope)
    }

    /// Delete a node; returns the number of rows removed (0 or 1).
    pub fn delete_node(&self, node_id: &str, scope: GraphScope) -> FabricResult<usize> {
        let conn = self.lock();
        let count = conn.execute(
            "DELETE FROM graph_nodes WHERE node_id = ?1 AND scope = ?2",
            params![node_id, scope.as_str()],
        )?;
        conn.execute(
            "DELETE FROM tsdb_points WHERE node_id = ?1 AND scope = ?2",
            params![node_id, scope.as_str()],
        )?;
        Ok(count)
    }

    /// Insert or replace an edge by its deterministic key.
    pub fn add_edge(&self, edge: &GraphEdge) -> FabricResult<String> {
        if edge.source.is_empty() || edge.target.is_empty() || edge.relationship.is_empty() {
            return Err(FabricError::Validation(
                "edge source, target, and relationship must not be empty".into(),
            ));
        }
        let edge_id = edge.edge_key();
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO graph_edges
             (edge_id, source_node_id, target_node_id, scope, relationship, weight, attributes_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge_id,
                edge.source,
                edge.target,
                edge.scope.as_str(),
                edge.relationship,
                edge.weight,
                serde_json::to_string(&edge.attributes)?,
            ],
        )?;
        debug!("added graph edge {}", edge_id);
        Ok(edge_id)
    }

    /// Delete an edge by key; returns rows removed.
    pub fn delete_edge(&self, edge_id: &str) -> FabricResult<usize> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM graph_edges WHERE edge_id = ?1", params![edge_id])?)
    }

    /// Edges where the node is source or target, within one scope.
    pub fn edges_for_node(&self, node_id: &str, scope: GraphScope) -> FabricResult<Vec<GraphEdge>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source_node_id, target_node_id, scope, relationship, weight, attributes_json
             FROM graph_edges
             WHERE scope = ?1 AND (source_node_id = ?2 OR target_node_id = ?2)",
        )?;
        let rows = stmt.query_map(params![scope.as_str(), node_id], |row| {
            let attributes_json: String = row.get(5)?;
            Ok(GraphEdge {
                source: row.get(0)?,
                target: row.get(1)?,
                scope: GraphScope::parse(&row.get::<_, String>(2)?),
                relationship: row.get(3)?,
                weight: row.get(4)?,
                attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
            })
        })?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    /// Time-series points within the trailing `hours` window, ascending by
    /// timestamp. `data_types` and `tag_filters` narrow the result.
    pub fn recall_timeseries(
        &self,
        scope: GraphScope,
        hours: u32,
        data_types: Option<&[&str]>,
        tag_filters: Option<&HashMap<String, String>>,
    ) -> FabricResult<Vec<TimeSeriesPoint>> {
        let now = Utc::now();
        let window_start = now - chrono::Duration::hours(i64::from(hours));

        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, scope, data_type, metric_name, metric_value, log_level, log_message,
                    timestamp_ms, tags_json
             FROM tsdb_points
             WHERE scope = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
             ORDER BY timestamp_ms ASC",
        )?;
        let rows = stmt.query_map(
            params![
                scope.as_str(),
                window_start.timestamp_millis(),
                now.timestamp_millis()
            ],
            |row| {
                let tags_json: String = row.get(8)?;
                let tags: HashMap<String, String> =
                    serde_json::from_str(&tags_json).unwrap_or_default();
                let millis: i64 = row.get(7)?;
                Ok(TimeSeriesPoint {
                    node_id: row.get(0)?,
                    scope: GraphScope::parse(&row.get::<_, String>(1)?),
                    timestamp: Utc
                        .timestamp_millis_opt(millis)
                        .single()
                        .unwrap_or_else(Utc::now),
                    data_type: TsdbDataType::parse(&row.get::<_, String>(2)?)
                        .unwrap_or(TsdbDataType::Metric),
                    metric_name: row.get(3)?,
                    metric_value: row.get(4)?,
                    log_level: row.get(5)?,
                    log_message: row.get(6)?,
                    tags,
                })
            },
        )?;

        let mut points = Vec::new();
        for row in rows {
            let point = row?;
            if let Some(types) = data_types {
                if !types.iter().any(|t| *t == point.data_type.as_str()) {
                    continue;
                }
            }
            if let Some(filters) = tag_filters {
                let matches = filters
                    .iter()
                    .all(|(k, v)| point.tags.get(k).map(|t| t == v).unwrap_or(false));
                if !matches {
                    continue;
                }
            }
            points.push(point);
        }
        Ok(points)
    }

    /// Mark a time-series point as folded into a summary node. The point is
    /// retained; consolidation skips it from then on.
    pub fn mark_consolidated(
        &self,
        node_id: &str,
        scope: GraphScope,
        consolidation_id: &str,
    ) -> FabricResult<()> {
        let conn = self.lock();
        let tags_json: Option<String> = conn
            .query_row(
                "SELECT tags_json FROM tsdb_points WHERE node_id = ?1 AND scope = ?2",
                params![node_id, scope.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(tags_json) = tags_json {
            let mut tags: HashMap<String, String> =
                serde_json::from_str(&tags_json).unwrap_or_default();
            tags.insert(CONSOLIDATED_INTO_TAG.to_string(), consolidation_id.to_string());
            conn.execute(
                "UPDATE tsdb_points SET tags_json = ?1, consolidated_by = ?2
                 WHERE node_id = ?3 AND scope = ?4",
                params![
                    serde_json::to_string(&tags)?,
                    consolidation_id,
                    node_id,
                    scope.as_str()
                ],
            )?;
        }
        Ok(())
    }

    /// Persist a scheduled task payload.
    pub fn save_scheduled_task(
        &self,
        task_id: &str,
        status: &str,
        payload: &Value,
    ) -> FabricResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO scheduled_tasks (task_id, status, payload_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_id, status, payload.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load every scheduled task with one of the given statuses.
    pub fn load_scheduled_tasks(&self, statuses: &[&str]) -> FabricResult<Vec<Value>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT status, payload_json FROM scheduled_tasks ORDER BY task_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            let (status, payload_json) = row?;
            if statuses.iter().any(|s| *s == status) {
                tasks.push(serde_json::from_str(&payload_json)?);
            }
        }
        Ok(tasks)
    }

    /// Remove a scheduled task; returns rows removed.
    pub fn delete_scheduled_task(&self, task_id: &str) -> FabricResult<usize> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM scheduled_tasks WHERE task_id = ?1",
            params![task_id],
        )?)
    }

    fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
        let attributes_json: String = row.get(3)?;
        let updated_at: Option<String> = row.get(6)?;
        Ok(GraphNode {
            id: row.get(0)?,
            scope: GraphScope::parse(&row.get::<_, String>(1)?),
            kind: NodeType::parse(&row.get::<_, String>(2)?),
            attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
            version: row.get(4)?,
            updated_by: row.get(5)?,
            updated_at: updated_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Graph-backed memory provider.
///
/// Identity-scope policy: a node whose stored copy carries
/// `immutable: true` can never be replaced or forgotten, and
/// `update_identity_graph` requires `wa_approved` on the request.
pub struct LocalGraphMemoryService {
    store: Arc<GraphStore>,
}

impl LocalGraphMemoryService {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }

    fn guard_identity_write(&self, node_id: &str, scope: GraphScope) -> Option<MemoryOpResult> {
        if scope != GraphScope::Identity {
            return None;
        }
        match self.store.get_node(node_id, scope) {
            Ok(Some(existing)) if existing.attr_bool("immutable").unwrap_or(false) => Some(
                MemoryOpResult::denied(format!("node {} is immutable", node_id)),
            ),
            _ => None,
        }
    }
}

#[async_trait]
impl Service for LocalGraphMemoryService {
    fn name(&self) -> &str {
        "local_graph_memory"
    }

    async fn capabilities(&self) -> Vec<String> {
        vec![
            "memorize".to_string(),
            "recall".to_string(),
            "forget".to_string(),
            "search_memories".to_string(),
            "recall_timeseries".to_string(),
            "memorize_metric".to_string(),
            "memorize_log".to_string(),
            "export_identity_context".to_string(),
            "update_identity_graph".to_string(),
            "update_environment_graph".to_string(),
        ]
    }
}

#[async_trait]
impl MemoryService for LocalGraphMemoryService {
    async fn memorize(&self, node: &GraphNode) -> ProviderResult<MemoryOpResult> {
        if let Some(denied) = self.guard_identity_write(&node.id, node.scope) {
            return Ok(denied);
        }
        self.store.add_node(node)?;
        Ok(MemoryOpResult::ok())
    }

    async fn recall(&self, query: &MemoryQuery) -> ProviderResult<Vec<GraphNode>> {
        let mut nodes = if query.node_id == "*" {
            self.store.nodes_in_scope(query.scope)?
        } else if let Some(prefix) = query.node_id.strip_suffix('*') {
            self.store.nodes_by_prefix(prefix, query.scope)?
        } else {
            self.store
                .get_node(&query.node_id, query.scope)?
                .into_iter()
                .collect()
        };
        if let Some(kind) = query.kind {
            nodes.retain(|n| n.kind == kind);
        }
        Ok(nodes)
    }

    async fn forget(&self, node_id: &str, scope: GraphScope) -> ProviderResult<MemoryOpResult> {
        if let Some(denied) = self.guard_identity_write(node_id, scope) {
            return Ok(denied);
        }
        let removed = self.store.delete_node(node_id, scope)?;
        if removed == 0 {
            Ok(MemoryOpResult {
                status: crate::mindfabric::graph::MemoryOpStatus::Ok,
                reason: Some("node did not exist".to_string()),
                error: None,
            })
        } else {
            Ok(MemoryOpResult::ok())
        }
    }

    async fn search_memories(
        &self,
        query: &str,
        scope: GraphScope,
        limit: usize,
    ) -> ProviderResult<Vec<MemorySearchResult>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();
        for node in self.store.nodes_in_scope(scope)? {
            let haystack = format!(
                "{} {}",
                node.id.to_lowercase(),
                serde_json::to_string(&node.attributes)?.to_lowercase()
            );
            if haystack.contains(&needle) {
                hits.push(MemorySearchResult {
                    node,
                    relevance: 1.0,
                });
            }
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    async fn recall_timeseries(
        &self,
        scope: GraphScope,
        hours: u32,
        data_types: Option<&[&str]>,
        tag_filters: Option<&HashMap<String, String>>,
    ) -> ProviderResult<Vec<TimeSeriesPoint>> {
        Ok(self
            .store
            .recall_timeseries(scope, hours, data_types, tag_filters)?)
    }

    async fn memorize_metric(
        &self,
        metric_name: &str,
        value: f64,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> ProviderResult<MemoryOpResult> {
        let node = TsdbNode::metric(metric_name, value, tags, scope);
        self.store.add_node(&node.to_graph_node())?;
        Ok(MemoryOpResult::ok())
    }

    async fn memorize_log(
        &self,
        log_message: &str,
        log_level: &str,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> ProviderResult<MemoryOpResult> {
        let node = TsdbNode::log(log_message, log_level, tags, scope);
        self.store.add_node(&node.to_graph_node())?;
        Ok(MemoryOpResult::ok())
    }

    async fn export_identity_context(&self) -> ProviderResult<String> {
        let nodes = self.store.nodes_in_scope(GraphScope::Identity)?;
        let mut lines = Vec::with_capacity(nodes.len());
        for node in nodes {
            let rendered: Vec<String> = node
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            lines.push(format!("{} ({}): {}", node.id, node.kind, rendered.join(", ")));
        }
        Ok(lines.join("\n"))
    }

    async fn update_identity_graph(
        &self,
        request: &IdentityUpdateRequest,
    ) -> ProviderResult<MemoryOpResult> {
        if !request.wa_approved {
            return Ok(MemoryOpResult::denied(
                "identity graph updates require Wise Authority approval",
            ));
        }
        for node in &request.node_updates {
            if node.scope != GraphScope::Identity {
                return Ok(MemoryOpResult::denied(format!(
                    "node {} is not identity-scoped",
                    node.id
                )));
            }
            if let Some(denied) = self.guard_identity_write(&node.id, node.scope) {
                return Ok(denied);
            }
            let mut stamped = node.clone();
            stamped.updated_by = Some(request.source.clone());
            self.store.add_node(&stamped)?;
        }
        Ok(MemoryOpResult::ok())
    }

    async fn update_environment_graph(
        &self,
        request: &EnvironmentUpdateRequest,
    ) -> ProviderResult<MemoryOpResult> {
        for node in &request.node_updates {
            if node.scope != GraphScope::Environment {
                return Ok(MemoryOpResult::denied(format!(
                    "node {} is not environment-scoped",
                    node.id
                )));
            }
            let mut stamped = node.clone();
            stamped.updated_by = Some(request.source.clone());
            self.store.add_node(&stamped)?;
        }
        Ok(MemoryOpResult::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_upsert_and_fetch_roundtrip() {
        let store = GraphStore::open_in_memory().unwrap();
        let node = GraphNode::new("n1", NodeType::Concept, GraphScope::Local)
            .with_attribute("weight", json!(1.5))
            .with_attribute("label", json!("first"));
        store.add_node(&node).unwrap();

        let fetched = store.get_node("n1", GraphScope::Local).unwrap().unwrap();
        assert_eq!(fetched.id, "n1");
        assert_eq!(fetched.attributes["weight"], json!(1.5));
        assert_eq!(fetched.attributes["label"], json!("first"));
        assert!(fetched.updated_at.is_some());

        // Same (id, scope) replaces.
        let node2 = GraphNode::new("n1", NodeType::Concept, GraphScope::Local)
            .with_attribute("label", json!("second"));
        store.add_node(&node2).unwrap();
        let fetched = store.get_node("n1", GraphScope::Local).unwrap().unwrap();
        assert_eq!(fetched.attributes["label"], json!("second"));
        assert!(fetched.attributes.get("weight").is_none());
    }

    #[test]
    fn scopes_partition_nodes() {
        let store = GraphStore::open_in_memory().unwrap();
        store
            .add_node(&GraphNode::new("n1", NodeType::Concept, GraphScope::Local))
            .unwrap();
        assert!(store.get_node("n1", GraphScope::Identity).unwrap().is_none());
    }

    #[test]
    fn edges_upsert_by_deterministic_key() {
        let store = GraphStore::open_in_memory().unwrap();
        let mut edge = GraphEdge::new("a", "b", "cites", GraphScope::Local);
        store.add_edge(&edge).unwrap();
        edge.weight = 0.5;
        store.add_edge(&edge).unwrap();

        let edges = store.edges_for_node("a", GraphScope::Local).unwrap();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].weight - 0.5).abs() < f64::EPSILON);

        assert_eq!(store.delete_edge("a->b->cites").unwrap(), 1);
        assert!(store.edges_for_node("b", GraphScope::Local).unwrap().is_empty());
    }

    #[test]
    fn tsdb_rows_track_graph_nodes() {
        let store = GraphStore::open_in_memory().unwrap();
        let mut tags = HashMap::new();
        tags.insert("handler".to_string(), "h".to_string());
        let tsdb = TsdbNode::metric("cpu", 0.7, tags, GraphScope::Local);
        store.add_node(&tsdb.to_graph_node()).unwrap();

        let points = store
            .recall_timeseries(GraphScope::Local, 1, Some(&["metric"]), None)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].metric_name.as_deref(), Some("cpu"));
        assert_eq!(points[0].tags.get("handler").map(String::as_str), Some("h"));
    }

    #[test]
    fn consolidation_mark_is_visible_in_tags() {
        let store = GraphStore::open_in_memory().unwrap();
        let tsdb = TsdbNode::metric("m", 1.0, HashMap::new(), GraphScope::Local);
        store.add_node(&tsdb.to_graph_node()).unwrap();
        store
            .mark_consolidated(&tsdb.id, GraphScope::Local, "summary_1")
            .unwrap();

        let points = store
            .recall_timeseries(GraphScope::Local, 1, None, None)
            .unwrap();
        assert_eq!(
            points[0].tags.get(CONSOLIDATED_INTO_TAG).map(String::as_str),
            Some("summary_1")
        );
    }

    #[test]
    fn scheduled_tasks_roundtrip_and_delete() {
        let store = GraphStore::open_in_memory().unwrap();
        store
            .save_scheduled_task("t1", "ACTIVE", &json!({"task_id": "t1", "name": "demo"}))
            .unwrap();
        store
            .save_scheduled_task("t2", "COMPLETE", &json!({"task_id": "t2"}))
            .unwrap();

        let active = store.load_scheduled_tasks(&["ACTIVE"]).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["name"], json!("demo"));

        assert_eq!(store.delete_scheduled_task("t1").unwrap(), 1);
        assert!(store.load_scheduled_tasks(&["ACTIVE"]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn immutable_identity_nodes_resist_replacement() {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        let memory = LocalGraphMemoryService::new(Arc::clone(&store));

        let baseline = GraphNode::new("baseline_1", NodeType::Agent, GraphScope::Identity)
            .with_attribute("immutable", json!(true));
        assert!(memory.memorize(&baseline).await.unwrap().is_ok());

        let overwrite = GraphNode::new("baseline_1", NodeType::Agent, GraphScope::Identity);
        let result = memory.memorize(&overwrite).await.unwrap();
        assert_eq!(result.status, crate::mindfabric::graph::MemoryOpStatus::Denied);

        let forget = memory.forget("baseline_1", GraphScope::Identity).await.unwrap();
        assert_eq!(forget.status, crate::mindfabric::graph::MemoryOpStatus::Denied);
    }

    #[tokio::test]
    async fn identity_updates_require_wa_approval() {
        let store = Arc::new(GraphStore::open_in_memory().unwrap());
        let memory = LocalGraphMemoryService::new(store);

        let request = IdentityUpdateRequest {
            node_updates: vec![GraphNode::new("trust", NodeType::Config, GraphScope::Identity)],
            source: "wa_feedback".to_string(),
            wa_approved: false,
            approval_reference: None,
        };
        let result = memory.update_identity_graph(&request).await.unwrap();
        assert_eq!(result.status, crate::mindfabric::graph::MemoryOpStatus::Denied);

        let approved = IdentityUpdateRequest {
            wa_approved: true,
            approval_reference: Some("wa-123".to_string()),
            ..request
        };
        assert!(memory.update_identity_graph(&approved).await.unwrap().is_ok());
    }
}
