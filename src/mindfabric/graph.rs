//! Graph and memory schema types.
//!
//! Everything the runtime remembers (telemetry, audit events, behavior,
//! configuration, identity) is a [`GraphNode`] in one of five
//! [`GraphScope`]s. Time-series data uses the [`TsdbNode`] refinement, which
//! mirrors its typed fields into the node attribute map so that a TSDB node
//! round-trips through the plain graph schema without loss.
//!
//! # Node identity
//!
//! A node is uniquely identified by `(id, scope)`. Writing a node with an
//! existing `(id, scope)` pair replaces it (upsert semantics in the store).
//! Edges are identified by the deterministic key
//! `source->target->relationship`.
//!
//! # Example
//!
//! ```rust
//! use mindfabric::graph::{GraphNode, GraphScope, NodeType};
//!
//! let node = GraphNode::new("user_tracker", NodeType::Config, GraphScope::Local)
//!     .with_attribute("enabled", serde_json::json!(true));
//! assert_eq!(node.version, 1);
//! assert!(node.attributes.contains_key("enabled"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Memory scope of a graph node or edge.
///
/// Scope determines both storage partitioning and the approval policy:
/// `Identity`-scope nodes are guarded (immutable baselines cannot be
/// replaced, and identity-graph updates require Wise Authority approval),
/// while `Local`-scope nodes may be modified freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphScope {
    Local,
    Identity,
    Environment,
    Community,
    Network,
}

impl GraphScope {
    /// Stable lowercase form used in storage and node ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphScope::Local => "local",
            GraphScope::Identity => "identity",
            GraphScope::Environment => "environment",
            GraphScope::Community => "community",
            GraphScope::Network => "network",
        }
    }

    /// Parse the storage form back into a scope. Unknown strings map to
    /// `Local` so that a corrupted row degrades to the least privileged
    /// scope instead of failing the read.
    pub fn parse(s: &str) -> GraphScope {
        match s {
            "identity" => GraphScope::Identity,
            "environment" => GraphScope::Environment,
            "community" => GraphScope::Community,
            "network" => GraphScope::Network,
            _ => GraphScope::Local,
        }
    }
}

impl fmt::Display for GraphScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    User,
    Channel,
    Concept,
    Config,
    TsdbData,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Agent => "agent",
            NodeType::User => "user",
            NodeType::Channel => "channel",
            NodeType::Concept => "concept",
            NodeType::Config => "config",
            NodeType::TsdbData => "tsdb_data",
        }
    }

    pub fn parse(s: &str) -> NodeType {
        match s {
            "agent" => NodeType::Agent,
            "user" => NodeType::User,
            "channel" => NodeType::Channel,
            "config" => NodeType::Config,
            "tsdb_data" => NodeType::TsdbData,
            _ => NodeType::Concept,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration node taxonomy. Each kind is pinned to the scope in which
/// its nodes live; the scope decides whether an adaptation touching it can
/// be applied autonomously or needs Wise Authority review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    // Local scope: freely adaptable.
    FilterConfig,
    ChannelConfig,
    UserTracking,
    ResponseTemplates,
    ToolPreferences,
    // Identity scope: WA-gated.
    BehaviorConfig,
    EthicalBoundaries,
    CapabilityLimits,
    TrustParameters,
    LearningRules,
}

impl ConfigKind {
    pub const ALL: [ConfigKind; 10] = [
        ConfigKind::FilterConfig,
        ConfigKind::ChannelConfig,
        ConfigKind::UserTracking,
        ConfigKind::ResponseTemplates,
        ConfigKind::ToolPreferences,
        ConfigKind::BehaviorConfig,
        ConfigKind::EthicalBoundaries,
        ConfigKind::CapabilityLimits,
        ConfigKind::TrustParameters,
        ConfigKind::LearningRules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKind::FilterConfig => "filter_config",
            ConfigKind::ChannelConfig => "channel_config",
            ConfigKind::UserTracking => "user_tracking",
            ConfigKind::ResponseTemplates => "response_templates",
            ConfigKind::ToolPreferences => "tool_preferences",
            ConfigKind::BehaviorConfig => "behavior_config",
            ConfigKind::EthicalBoundaries => "ethical_boundaries",
            ConfigKind::CapabilityLimits => "capability_limits",
            ConfigKind::TrustParameters => "trust_parameters",
            ConfigKind::LearningRules => "learning_rules",
        }
    }

    pub fn parse(s: &str) -> Option<ConfigKind> {
        ConfigKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// The scope in which nodes of this configuration kind live.
    pub fn scope(&self) -> GraphScope {
        match self {
            ConfigKind::FilterConfig
            | ConfigKind::ChannelConfig
            | ConfigKind::UserTracking
            | ConfigKind::ResponseTemplates
            | ConfigKind::ToolPreferences => GraphScope::Local,
            ConfigKind::BehaviorConfig
            | ConfigKind::EthicalBoundaries
            | ConfigKind::CapabilityLimits
            | ConfigKind::TrustParameters
            | ConfigKind::LearningRules => GraphScope::Identity,
        }
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the memory graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    /// Node identifier, unique within its scope.
    pub id: String,
    /// Node kind.
    pub kind: NodeType,
    /// Memory scope.
    pub scope: GraphScope,
    /// Free-form JSON attribute map. Must round-trip through JSON.
    pub attributes: Map<String, Value>,
    /// Monotonically increasing version, starting at 1.
    pub version: u32,
    /// Who last wrote the node (handler or service name).
    pub updated_by: Option<String>,
    /// When the node was last written (auto-filled by the store if absent).
    pub updated_at: Option<DateTime<Utc>>,
}

impl GraphNode {
    /// Create a node with an empty attribute map at version 1.
    pub fn new(id: impl Into<String>, kind: NodeType, scope: GraphScope) -> Self {
        Self {
            id: id.into(),
            kind,
            scope,
            attributes: Map::new(),
            version: 1,
            updated_by: None,
            updated_at: None,
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Builder-style writer stamp.
    pub fn with_updated_by(mut self, by: impl Into<String>) -> Self {
        self.updated_by = Some(by.into());
        self
    }

    /// Fetch a string attribute, if present and a string.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Fetch a float attribute, accepting any JSON number.
    pub fn attr_f64(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(Value::as_f64)
    }

    /// Fetch a bool attribute.
    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(Value::as_bool)
    }
}

/// A directed, weighted edge in the memory graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relationship: String,
    pub scope: GraphScope,
    pub weight: f64,
    pub attributes: Map<String, Value>,
}

impl GraphEdge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relationship: impl Into<String>,
        scope: GraphScope,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship: relationship.into(),
            scope,
            weight: 1.0,
            attributes: Map::new(),
        }
    }

    /// Deterministic edge key: `source->target->relationship`.
    pub fn edge_key(&self) -> String {
        format!("{}->{}->{}", self.source, self.target, self.relationship)
    }
}

/// Payload class of a time-series node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TsdbDataType {
    Metric,
    LogEntry,
    AuditEvent,
}

impl TsdbDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TsdbDataType::Metric => "metric",
            TsdbDataType::LogEntry => "log_entry",
            TsdbDataType::AuditEvent => "audit_event",
        }
    }

    pub fn parse(s: &str) -> Option<TsdbDataType> {
        match s {
            "metric" => Some(TsdbDataType::Metric),
            "log_entry" => Some(TsdbDataType::LogEntry),
            "audit_event" => Some(TsdbDataType::AuditEvent),
            _ => None,
        }
    }
}

impl fmt::Display for TsdbDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention hint for a time-series node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    Raw,
    Aggregated,
    Downsampled,
}

impl RetentionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicy::Raw => "raw",
            RetentionPolicy::Aggregated => "aggregated",
            RetentionPolicy::Downsampled => "downsampled",
        }
    }

    pub fn parse(s: &str) -> RetentionPolicy {
        match s {
            "aggregated" => RetentionPolicy::Aggregated,
            "downsampled" => RetentionPolicy::Downsampled,
            _ => RetentionPolicy::Raw,
        }
    }
}

/// Tag key marking a time-series node as already folded into a summary node.
/// Consolidation skips points that carry it.
pub const CONSOLIDATED_INTO_TAG: &str = "consolidated_into";

/// A graph node specialized for time-series data: metrics, log entries, and
/// audit events. The typed fields are mirrored into the attribute map when
/// converting to a plain [`GraphNode`], so the relational store needs no
/// special casing beyond the time-series index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TsdbNode {
    pub id: String,
    pub scope: GraphScope,
    pub timestamp: DateTime<Utc>,
    pub data_type: TsdbDataType,
    pub metric_name: Option<String>,
    pub metric_value: Option<f64>,
    pub log_level: Option<String>,
    pub log_message: Option<String>,
    pub tags: HashMap<String, String>,
    pub retention: RetentionPolicy,
    pub aggregation_period: Option<String>,
}

impl TsdbNode {
    /// A metric data point, id `metric_<name>_<unix_seconds>`.
    pub fn metric(
        metric_name: impl Into<String>,
        value: f64,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> Self {
        let metric_name = metric_name.into();
        let now = Utc::now();
        Self {
            id: format!("metric_{}_{}", metric_name, now.timestamp()),
            scope,
            timestamp: now,
            data_type: TsdbDataType::Metric,
            metric_name: Some(metric_name),
            metric_value: Some(value),
            log_level: None,
            log_message: None,
            tags,
            retention: RetentionPolicy::Raw,
            aggregation_period: None,
        }
    }

    /// A log entry, id `log_<unix_seconds>_<hash>` where the hash suffix
    /// keeps same-second entries from colliding.
    pub fn log(
        message: impl Into<String>,
        level: impl Into<String>,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> Self {
        let message = message.into();
        let now = Utc::now();
        let mut h: u32 = 2166136261;
        for b in message.bytes() {
            h = (h ^ u32::from(b)).wrapping_mul(16777619);
        }
        Self {
            id: format!("log_{}_{:04}", now.timestamp(), h % 10000),
            scope,
            timestamp: now,
            data_type: TsdbDataType::LogEntry,
            metric_name: None,
            metric_value: None,
            log_level: Some(level.into()),
            log_message: Some(message),
            tags,
            retention: RetentionPolicy::Raw,
            aggregation_period: None,
        }
    }

    /// An audit event, id `audit_<action>_<unix_seconds>`. The action type
    /// and outcome are folded into the tag set for time-series queries.
    pub fn audit(
        action_type: impl Into<String>,
        outcome: impl Into<String>,
        mut tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> Self {
        let action_type = action_type.into();
        let now = Utc::now();
        tags.insert("action_type".to_string(), action_type.clone());
        tags.insert("outcome".to_string(), outcome.into());
        Self {
            id: format!("audit_{}_{}", action_type, now.timestamp()),
            scope,
            timestamp: now,
            data_type: TsdbDataType::AuditEvent,
            metric_name: None,
            metric_value: None,
            log_level: None,
            log_message: None,
            tags,
            retention: RetentionPolicy::Raw,
            aggregation_period: None,
        }
    }

    /// Override the auto-generated timestamp (and keep the id consistent
    /// with it where the id embeds seconds).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Render as a plain [`GraphNode`] with the typed fields mirrored into
    /// the attribute map.
    pub fn to_graph_node(&self) -> GraphNode {
        let mut node = GraphNode::new(self.id.clone(), NodeType::TsdbData, self.scope);
        node.attributes.insert(
            "data_type".to_string(),
            Value::String(self.data_type.as_str().to_string()),
        );
        node.attributes.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        if let Some(ref name) = self.metric_name {
            node.attributes
                .insert("metric_name".to_string(), Value::String(name.clone()));
        }
        if let Some(value) = self.metric_value {
            node.attributes
                .insert("metric_value".to_string(), serde_json::json!(value));
        }
        if let Some(ref level) = self.log_level {
            node.attributes
                .insert("log_level".to_string(), Value::String(level.clone()));
        }
        if let Some(ref msg) = self.log_message {
            node.attributes
                .insert("log_message".to_string(), Value::String(msg.clone()));
        }
        node.attributes.insert(
            "tags".to_string(),
            Value::Object(
                self.tags
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        node.attributes.insert(
            "retention_policy".to_string(),
            Value::String(self.retention.as_str().to_string()),
        );
        if let Some(ref period) = self.aggregation_period {
            node.attributes.insert(
                "aggregation_period".to_string(),
                Value::String(period.clone()),
            );
        }
        node
    }
}

/// A flat row returned by time-series recall, sorted by ascending timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesPoint {
    pub node_id: String,
    pub scope: GraphScope,
    pub timestamp: DateTime<Utc>,
    pub data_type: TsdbDataType,
    pub metric_name: Option<String>,
    pub metric_value: Option<f64>,
    pub log_level: Option<String>,
    pub log_message: Option<String>,
    pub tags: HashMap<String, String>,
}

impl TimeSeriesPoint {
    /// Rebuild a [`TsdbNode`] from this point, e.g. to re-memorize it with
    /// an added tag.
    pub fn to_tsdb_node(&self) -> TsdbNode {
        TsdbNode {
            id: self.node_id.clone(),
            scope: self.scope,
            timestamp: self.timestamp,
            data_type: self.data_type,
            metric_name: self.metric_name.clone(),
            metric_value: self.metric_value,
            log_level: self.log_level.clone(),
            log_message: self.log_message.clone(),
            tags: self.tags.clone(),
            retention: RetentionPolicy::Raw,
            aggregation_period: None,
        }
    }
}

/// Outcome status of a memory operation. Expected failures are statuses,
/// not errors: callers branch on the status instead of unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOpStatus {
    Ok,
    Deferred,
    Denied,
    Pending,
    Error,
}

/// Result of a memory operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOpResult {
    pub status: MemoryOpStatus,
    pub reason: Option<String>,
    pub error: Option<String>,
}

impl MemoryOpResult {
    pub fn ok() -> Self {
        Self {
            status: MemoryOpStatus::Ok,
            reason: None,
            error: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            status: MemoryOpStatus::Denied,
            reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: MemoryOpStatus::Error,
            reason: Some(message.clone()),
            error: Some(message),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == MemoryOpStatus::Ok
    }
}

/// Query parameters for memory recall.
///
/// `node_id` may be an exact id, a prefix wildcard (`"config/tool_preferences/*"`),
/// or the bare wildcard `"*"` matching every node in the scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub node_id: String,
    pub scope: GraphScope,
    pub kind: Option<NodeType>,
    pub include_edges: bool,
    pub depth: u32,
}

impl MemoryQuery {
    pub fn exact(node_id: impl Into<String>, scope: GraphScope) -> Self {
        Self {
            node_id: node_id.into(),
            scope,
            kind: None,
            include_edges: false,
            depth: 1,
        }
    }

    pub fn wildcard(prefix: impl Into<String>, scope: GraphScope) -> Self {
        let mut node_id = prefix.into();
        if !node_id.ends_with('*') {
            node_id.push('*');
        }
        Self {
            node_id,
            scope,
            kind: None,
            include_edges: false,
            depth: 1,
        }
    }
}

/// A single search hit from free-text memory search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchResult {
    pub node: GraphNode,
    pub relevance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_key_is_deterministic() {
        let edge = GraphEdge::new("a", "b", "follows", GraphScope::Local);
        assert_eq!(edge.edge_key(), "a->b->follows");
    }

    #[test]
    fn config_kind_scope_map() {
        assert_eq!(ConfigKind::ToolPreferences.scope(), GraphScope::Local);
        assert_eq!(ConfigKind::EthicalBoundaries.scope(), GraphScope::Identity);
        assert_eq!(
            ConfigKind::parse("behavior_config"),
            Some(ConfigKind::BehaviorConfig)
        );
    }

    #[test]
    fn tsdb_metric_node_roundtrips_through_graph_node() {
        let mut tags = HashMap::new();
        tags.insert("handler".to_string(), "h1".to_string());
        let tsdb = TsdbNode::metric("llm.tokens.total", 42.0, tags, GraphScope::Local);
        assert!(tsdb.id.starts_with("metric_llm.tokens.total_"));

        let node = tsdb.to_graph_node();
        assert_eq!(node.kind, NodeType::TsdbData);
        assert_eq!(node.attr_str("data_type"), Some("metric"));
        assert_eq!(node.attr_f64("metric_value"), Some(42.0));
        assert_eq!(
            node.attributes["tags"]["handler"],
            Value::String("h1".to_string())
        );
    }

    #[test]
    fn audit_node_tags_carry_action_and_outcome() {
        let tsdb = TsdbNode::audit("speak", "success", HashMap::new(), GraphScope::Local);
        assert_eq!(tsdb.tags.get("action_type").map(String::as_str), Some("speak"));
        assert_eq!(tsdb.tags.get("outcome").map(String::as_str), Some("success"));
        assert!(tsdb.id.starts_with("audit_speak_"));
    }

    #[test]
    fn wildcard_query_normalizes_trailing_star() {
        let q = MemoryQuery::wildcard("config/filter_config/", GraphScope::Local);
        assert_eq!(q.node_id, "config/filter_config/*");
    }
}
