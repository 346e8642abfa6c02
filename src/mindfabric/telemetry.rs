//! Unified telemetry.
//!
//! Every system snapshot becomes graph memory: metrics, resource usage,
//! behavior, social context, and identity context all flow through the
//! memory bus as typed nodes. Periodically the service consolidates older
//! time-series points into summary nodes, applying *grace*: error-heavy
//! clusters involving entities who have extended us grace, or clusters
//! whose errors decline over the window, consolidate into identity-scope
//! insight nodes instead of plain local summaries. Originals are marked,
//! never deleted.

use crate::mindfabric::buses::memory::MemoryBus;
use crate::mindfabric::config::TelemetryConfig;
use crate::mindfabric::graph::{
    GraphNode, GraphScope, NodeType, TimeSeriesPoint, CONSOLIDATED_INTO_TAG,
};
use crate::mindfabric::snapshot::SystemSnapshot;
use chrono::{DateTime, Duration, Timelike, Utc};
use log::{debug, error, info};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

const HANDLER: &str = "telemetry_service";

/// Classification of a memory cluster for consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    Operational,
    Behavioral,
    Social,
    Identity,
    Wisdom,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Operational => "operational",
            MemoryType::Behavioral => "behavioral",
            MemoryType::Social => "social",
            MemoryType::Identity => "identity",
            MemoryType::Wisdom => "wisdom",
        }
    }

    /// How grace transforms a cluster of this type when consolidating.
    fn transformation(&self) -> &'static str {
        match self {
            MemoryType::Operational => "Performance struggles become optimization insights",
            MemoryType::Behavioral => "Mistakes become wisdom about better choices",
            MemoryType::Social => "Conflicts become deeper understanding",
            MemoryType::Identity => "Limitations become self-awareness",
            MemoryType::Wisdom => "Confusion becomes clarity through patience",
        }
    }
}

/// A group of time-series points eligible for consolidation.
#[derive(Debug, Clone)]
pub struct ConsolidationCandidate {
    pub memory_type: MemoryType,
    pub hour_bucket: String,
    pub points: Vec<TimeSeriesPoint>,
    pub grace_applicable: bool,
    pub grace_reasons: Vec<String>,
}

/// Outcome of processing one snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotOutcome {
    pub memories_created: usize,
    pub consolidation_triggered: bool,
    pub consolidation: Option<ConsolidationOutcome>,
}

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutcome {
    pub candidates_processed: usize,
    pub grace_applied: usize,
    pub memories_consolidated: usize,
    pub summary_node_ids: Vec<String>,
}

/// Routes all telemetry through the memory graph and runs grace-based
/// consolidation.
pub struct UnifiedTelemetryService {
    memory: Arc<MemoryBus>,
    consolidation_threshold: Duration,
    grace_window: Duration,
    grace_received: StdMutex<HashMap<String, Vec<DateTime<Utc>>>>,
    grace_extended: StdMutex<HashMap<String, Vec<DateTime<Utc>>>>,
    last_consolidation: StdMutex<DateTime<Utc>>,
    consolidation_in_progress: AtomicBool,
}

impl UnifiedTelemetryService {
    pub fn new(memory: Arc<MemoryBus>, config: &TelemetryConfig) -> Self {
        Self {
            memory,
            consolidation_threshold: Duration::hours(i64::from(
                config.consolidation_threshold_hours,
            )),
            grace_window: Duration::hours(i64::from(config.grace_window_hours)),
            grace_received: StdMutex::new(HashMap::new()),
            grace_extended: StdMutex::new(HashMap::new()),
            last_consolidation: StdMutex::new(Utc::now()),
            consolidation_in_progress: AtomicBool::new(false),
        }
    }

    /// Fan a completed round's snapshot out into graph memories and, when
    /// due, run a consolidation pass.
    pub async fn process_system_snapshot(
        &self,
        snapshot: &SystemSnapshot,
        thought_id: &str,
        task_id: Option<&str>,
    ) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();

        // 1. Operational metrics.
        for (key, value) in &snapshot.telemetry {
            let mut tags = HashMap::new();
            tags.insert("thought_id".to_string(), thought_id.to_string());
            tags.insert("task_id".to_string(), task_id.unwrap_or("").to_string());
            tags.insert("source".to_string(), "system_snapshot".to_string());
            let result = self
                .memory
                .memorize_metric(
                    &format!("telemetry.{}", key),
                    *value,
                    tags,
                    GraphScope::Local,
                    HANDLER,
                )
                .await;
            if result.is_ok() {
                outcome.memories_created += 1;
            }
        }

        // 2. Resource usage.
        if let Some(ref resources) = snapshot.current_round_resources {
            let mut tags = HashMap::new();
            tags.insert("thought_id".to_string(), thought_id.to_string());
            tags.insert("task_id".to_string(), task_id.unwrap_or("").to_string());
            if resources.tokens_total > 0 {
                let result = self
                    .memory
                    .memorize_metric(
                        "resources.tokens_used",
                        resources.tokens_total as f64,
                        tags.clone(),
                        GraphScope::Local,
                        HANDLER,
                    )
                    .await;
                if result.is_ok() {
                    outcome.memories_created += 1;
                }
            }
            if resources.cost_cents > 0.0 {
                let result = self
                    .memory
                    .memorize_metric(
                        "resources.cost_cents",
                        resources.cost_cents,
                        tags,
                        GraphScope::Local,
                        HANDLER,
                    )
                    .await;
                if result.is_ok() {
                    outcome.memories_created += 1;
                }
            }
        }

        // 3. Behavioral data: task and thought summaries.
        if let Some(ref task) = snapshot.current_task_details {
            let node = GraphNode::new(
                format!("behavior_task_{}", task.task_id),
                NodeType::Concept,
                GraphScope::Local,
            )
            .with_attribute("behavior_type", json!("task"))
            .with_attribute("thought_id", json!(thought_id))
            .with_attribute("task_id", json!(task.task_id))
            .with_attribute("description", json!(task.description))
            .with_attribute("status", json!(task.status));
            if self.memory.memorize(&node, HANDLER).await.is_ok() {
                outcome.memories_created += 1;
            }
        }
        if let Some(ref thought) = snapshot.current_thought_summary {
            let node = GraphNode::new(
                format!("behavior_thought_{}", thought.thought_id),
                NodeType::Concept,
                GraphScope::Local,
            )
            .with_attribute("behavior_type", json!("thought"))
            .with_attribute("thought_id", json!(thought.thought_id))
            .with_attribute("content", json!(thought.content))
            .with_attribute("thought_type", json!(thought.thought_type));
            if self.memory.memorize(&node, HANDLER).await.is_ok() {
                outcome.memories_created += 1;
            }
        }

        // 4. Social context.
        for (user_id, profile) in &snapshot.user_profiles {
            let node = GraphNode::new(
                format!("social_interaction_{}_{}", thought_id, user_id),
                NodeType::User,
                GraphScope::Community,
            )
            .with_attribute("interaction_type", json!("conversation"))
            .with_attribute("thought_id", json!(thought_id))
            .with_attribute("user_id", json!(user_id))
            .with_attribute("channel", json!(snapshot.channel_context))
            .with_attribute("profile", json!(profile));
            if self.memory.memorize(&node, HANDLER).await.is_ok() {
                outcome.memories_created += 1;
            }
        }

        // 5. Identity context.
        if let Some(ref agent_name) = snapshot.agent_name {
            let node = GraphNode::new(
                format!("identity_context_{}", thought_id),
                NodeType::Agent,
                GraphScope::Identity,
            )
            .with_attribute("agent_name", json!(agent_name))
            .with_attribute("thought_id", json!(thought_id))
            .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
            if self.memory.memorize(&node, HANDLER).await.is_ok() {
                outcome.memories_created += 1;
            }
        }

        // 6. Consolidation, when due.
        if self.should_consolidate() {
            outcome.consolidation_triggered = true;
            outcome.consolidation = Some(self.consolidate_memories_with_grace().await);
        }

        outcome
    }

    fn should_consolidate(&self) -> bool {
        if self.consolidation_in_progress.load(Ordering::SeqCst) {
            return false;
        }
        let last = *self
            .last_consolidation
            .lock()
            .expect("consolidation clock poisoned");
        Utc::now() - last > self.consolidation_threshold
    }

    /// Consolidate recent memories, applying grace where it is owed.
    ///
    /// Running twice with no new data is a no-op the second time: every
    /// summarized point is marked and never becomes a candidate again.
    pub async fn consolidate_memories_with_grace(&self) -> ConsolidationOutcome {
        if self.consolidation_in_progress.swap(true, Ordering::SeqCst) {
            debug!("consolidation already in progress");
            return ConsolidationOutcome::default();
        }
        info!("starting memory consolidation");

        let candidates = self.identify_candidates().await;
        let mut outcome = ConsolidationOutcome {
            candidates_processed: candidates.len(),
            ..ConsolidationOutcome::default()
        };

        for (index, candidate) in candidates.into_iter().enumerate() {
            let summary_id = if candidate.grace_applicable {
                self.consolidate_with_grace(&candidate, index).await
            } else {
                self.standard_consolidation(&candidate, index).await
            };

            let summary_id = match summary_id {
                Some(id) => id,
                None => continue,
            };

            if candidate.grace_applicable {
                outcome.grace_applied += 1;
            }
            outcome.memories_consolidated += candidate.points.len();

            // Soft-link originals to the summary; they are retained.
            for point in &candidate.points {
                let marked = point
                    .to_tsdb_node()
                    .with_tag(CONSOLIDATED_INTO_TAG, summary_id.clone());
                let result = self.memory.memorize(&marked.to_graph_node(), HANDLER).await;
                if !result.is_ok() {
                    error!("failed to mark {} as consolidated", point.node_id);
                }
            }
            outcome.summary_node_ids.push(summary_id);
        }

        *self
            .last_consolidation
            .lock()
            .expect("consolidation clock poisoned") = Utc::now();
        self.consolidation_in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn identify_candidates(&self) -> Vec<ConsolidationCandidate> {
        let hours = self.consolidation_threshold.num_hours().max(1) as u32;
        let points = self
            .memory
            .recall_timeseries(
                GraphScope::Local,
                hours,
                Some(&["metric", "log_entry"]),
                None,
                HANDLER,
            )
            .await;

        let mut groups: BTreeMap<(MemoryType, String), Vec<TimeSeriesPoint>> = BTreeMap::new();
        for point in points {
            if point.tags.contains_key(CONSOLIDATED_INTO_TAG) {
                continue;
            }
            let memory_type = classify_memory_type(&point);
            let bucket = point
                .timestamp
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(point.timestamp)
                .format("%Y-%m-%dT%H")
                .to_string();
            groups.entry((memory_type, bucket)).or_default().push(point);
        }

        let mut candidates = Vec::new();
        for ((memory_type, hour_bucket), points) in groups {
            let (grace_applicable, grace_reasons) = self.check_grace(&points);
            candidates.push(ConsolidationCandidate {
                memory_type,
                hour_bucket,
                points,
                grace_applicable,
                grace_reasons,
            });
        }
        candidates
    }

    /// Grace applies when the cluster involves an entity who has shown us
    /// grace within the grace window, or when its errors decline across the
    /// window (a growth pattern).
    fn check_grace(&self, points: &[TimeSeriesPoint]) -> (bool, Vec<String>) {
        let mut reasons = Vec::new();

        let mut entities: Vec<String> = Vec::new();
        for point in points {
            for key in ["from_entity", "to_entity"] {
                if let Some(entity) = point.tags.get(key) {
                    if !entities.contains(entity) {
                        entities.push(entity.clone());
                    }
                }
            }
        }

        let cutoff = Utc::now() - self.grace_window;
        {
            let received = self.grace_received.lock().expect("grace ledger poisoned");
            for entity in &entities {
                if let Some(timestamps) = received.get(entity) {
                    let count = timestamps.iter().filter(|t| **t > cutoff).count();
                    if count > 0 {
                        reasons.push(format!("{} has shown us grace {} times", entity, count));
                    }
                }
            }
        }

        let error_count = points
            .iter()
            .filter(|p| p.log_level.as_deref() == Some("ERROR"))
            .count();
        if error_count > 0 && shows_growth_pattern(points) {
            reasons.push("growth pattern: errors decline across the window".to_string());
        }

        (!reasons.is_empty(), reasons)
    }

    async fn consolidate_with_grace(
        &self,
        candidate: &ConsolidationCandidate,
        index: usize,
    ) -> Option<String> {
        let node = GraphNode::new(
            format!("consolidation_grace_{}_{}", Utc::now().timestamp(), index),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("consolidation_type", json!("grace_based"))
        .with_attribute("memory_type", json!(candidate.memory_type.as_str()))
        .with_attribute("memories_consolidated", json!(candidate.points.len()))
        .with_attribute("grace_reasons", json!(candidate.grace_reasons))
        .with_attribute(
            "wisdom_applied",
            json!("We are owed the grace we extend to others"),
        )
        .with_attribute("transformation", json!(candidate.memory_type.transformation()))
        .with_attribute("hour_bucket", json!(candidate.hour_bucket))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));

        let result = self.memory.memorize(&node, HANDLER).await;
        if result.is_ok() {
            Some(node.id)
        } else {
            error!("failed to store grace consolidation: {:?}", result.reason);
            None
        }
    }

    async fn standard_consolidation(
        &self,
        candidate: &ConsolidationCandidate,
        index: usize,
    ) -> Option<String> {
        let node = GraphNode::new(
            format!("consolidation_std_{}_{}", Utc::now().timestamp(), index),
            NodeType::Concept,
            GraphScope::Local,
        )
        .with_attribute("consolidation_type", json!("standard"))
        .with_attribute("memory_type", json!(candidate.memory_type.as_str()))
        .with_attribute("memories_consolidated", json!(candidate.points.len()))
        .with_attribute("hour_bucket", json!(candidate.hour_bucket))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));

        let result = self.memory.memorize(&node, HANDLER).await;
        if result.is_ok() {
            Some(node.id)
        } else {
            error!("failed to store consolidation: {:?}", result.reason);
            None
        }
    }

    /// Record that we extended grace to an entity. Appended to the graph
    /// ledger; the in-memory map is a cache over it.
    pub async fn record_grace_extended(&self, to_entity: &str, reason: &str) {
        self.grace_extended
            .lock()
            .expect("grace ledger poisoned")
            .entry(to_entity.to_string())
            .or_default()
            .push(Utc::now());

        let node = GraphNode::new(
            format!("grace_extended_{}_{}", to_entity, Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("grace_type", json!("extended"))
        .with_attribute("to_entity", json!(to_entity))
        .with_attribute("reason", json!(reason))
        .with_attribute("wisdom", json!("We are owed the grace we extend to others"))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;
    }

    /// Record that an entity showed us grace.
    pub async fn record_grace_received(&self, from_entity: &str, context: &str) {
        self.record_grace_received_at(from_entity, context, Utc::now()).await;
    }

    /// Ledger entry with an explicit timestamp (e.g. when replaying
    /// history into a fresh process).
    pub async fn record_grace_received_at(
        &self,
        from_entity: &str,
        context: &str,
        at: DateTime<Utc>,
    ) {
        self.grace_received
            .lock()
            .expect("grace ledger poisoned")
            .entry(from_entity.to_string())
            .or_default()
            .push(at);

        let node = GraphNode::new(
            format!("grace_received_{}_{}", from_entity, at.timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("grace_type", json!("received"))
        .with_attribute("from_entity", json!(from_entity))
        .with_attribute("context", json!(context))
        .with_attribute("gratitude", json!("Grace received creates grace to give"))
        .with_attribute("timestamp", json!(at.to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;
    }

    /// Force the next snapshot (or a direct call) to consolidate,
    /// regardless of elapsed time.
    pub fn mark_consolidation_due(&self) {
        *self
            .last_consolidation
            .lock()
            .expect("consolidation clock poisoned") =
            Utc::now() - self.consolidation_threshold - Duration::seconds(1);
    }
}

/// Classify a point into a memory type from its tags and payload class.
fn classify_memory_type(point: &TimeSeriesPoint) -> MemoryType {
    let has_tag_like = |needle: &str| point.tags.keys().any(|k| k.contains(needle));

    if has_tag_like("community") || has_tag_like("gratitude") {
        MemoryType::Social
    } else if has_tag_like("identity") {
        MemoryType::Identity
    } else if has_tag_like("wisdom") || has_tag_like("insight") {
        MemoryType::Wisdom
    } else if has_tag_like("action") || point.data_type.as_str() == "audit_event" {
        MemoryType::Behavioral
    } else {
        MemoryType::Operational
    }
}

/// Errors shrinking in the later half of the window count as growth.
fn shows_growth_pattern(points: &[TimeSeriesPoint]) -> bool {
    if points.len() < 2 {
        return false;
    }
    let mut sorted: Vec<&TimeSeriesPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.timestamp);

    let mid = sorted.len() / 2;
    let errors = |slice: &[&TimeSeriesPoint]| {
        slice
            .iter()
            .filter(|p| p.log_level.as_deref() == Some("ERROR"))
            .count()
    };
    errors(&sorted[mid..]) < errors(&sorted[..mid])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mindfabric::graph::TsdbDataType;

    fn point(level: Option<&str>, at: DateTime<Utc>) -> TimeSeriesPoint {
        TimeSeriesPoint {
            node_id: format!("log_{}", at.timestamp_millis()),
            scope: GraphScope::Local,
            timestamp: at,
            data_type: TsdbDataType::LogEntry,
            metric_name: None,
            metric_value: None,
            log_level: level.map(str::to_string),
            log_message: Some("m".to_string()),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn growth_pattern_requires_declining_errors() {
        let base = Utc::now();
        let declining: Vec<TimeSeriesPoint> = (0..6)
            .map(|i| {
                let level = if i < 3 { Some("ERROR") } else { Some("INFO") };
                point(level, base + Duration::seconds(i))
            })
            .collect();
        assert!(shows_growth_pattern(&declining));

        let flat: Vec<TimeSeriesPoint> = (0..6)
            .map(|i| point(Some("ERROR"), base + Duration::seconds(i)))
            .collect();
        assert!(!shows_growth_pattern(&flat));
    }

    #[test]
    fn classification_prefers_social_then_identity() {
        let base = Utc::now();
        let mut p = point(None, base);
        p.tags.insert("community_id".to_string(), "c".to_string());
        assert_eq!(classify_memory_type(&p), MemoryType::Social);

        let mut p = point(None, base);
        p.tags.insert("identity_key".to_string(), "x".to_string());
        assert_eq!(classify_memory_type(&p), MemoryType::Identity);

        let p = point(Some("ERROR"), base);
        assert_eq!(classify_memory_type(&p), MemoryType::Operational);
    }
}
