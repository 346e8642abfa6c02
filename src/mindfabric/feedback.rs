//! Configuration feedback loop.
//!
//! The loop that closes experience back into configuration:
//!
//! ```text
//! metrics/audit/logs → pattern detection → adaptation proposals → config nodes → new behavior
//! ```
//!
//! Four detectors (temporal, frequency, performance, and error) run over
//! the recent graph history, and each qualifying pattern yields at most one
//! [`AdaptationProposal`]. LOCAL-scope proposals with enough confidence can
//! be applied autonomously; everything touching identity scope is stored
//! pending review. The self-configuration orchestrator drives the same
//! machinery through [`detect_and_propose`](ConfigurationFeedbackLoop::detect_and_propose)
//! and applies its own variance-budget filter before calling
//! [`apply_proposal`](ConfigurationFeedbackLoop::apply_proposal).

use crate::mindfabric::action::HandlerActionType;
use crate::mindfabric::buses::memory::MemoryBus;
use crate::mindfabric::config::FeedbackConfig;
use crate::mindfabric::graph::{ConfigKind, GraphNode, GraphScope, MemoryQuery, NodeType, TimeSeriesPoint};
use chrono::{DateTime, Duration, Timelike, Utc};
use log::{debug, error, info};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use uuid::Uuid;

const HANDLER: &str = "config_feedback_loop";

/// Kinds of patterns the detectors produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    Temporal,
    Frequency,
    Performance,
    Error,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Temporal => "temporal",
            PatternType::Frequency => "frequency",
            PatternType::Performance => "performance",
            PatternType::Error => "error",
        }
    }
}

/// A pattern detected from recent telemetry.
#[derive(Debug, Clone)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    pub pattern_id: String,
    pub description: String,
    pub evidence: Vec<String>,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub metrics: Map<String, Value>,
}

/// A structured request to change configuration, derived from a pattern.
#[derive(Debug, Clone)]
pub struct AdaptationProposal {
    pub id: String,
    pub trigger: String,
    pub current_pattern: String,
    /// Config kind name → value map to write.
    pub proposed_changes: Map<String, Value>,
    pub evidence: Vec<String>,
    pub confidence: f64,
    pub auto_applicable: bool,
    /// The scope the change ultimately touches; drives projected variance.
    pub scope: GraphScope,
    pub applied: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

impl AdaptationProposal {
    pub fn new(
        trigger: impl Into<String>,
        current_pattern: impl Into<String>,
        proposed_changes: Map<String, Value>,
        evidence: Vec<String>,
        confidence: f64,
        auto_applicable: bool,
        scope: GraphScope,
    ) -> Self {
        Self {
            id: format!("adaptation_proposal_{}", Uuid::new_v4().simple()),
            trigger: trigger.into(),
            current_pattern: current_pattern.into(),
            proposed_changes,
            evidence,
            confidence,
            auto_applicable,
            scope,
            applied: false,
            applied_at: None,
        }
    }

    /// Eligible for autonomous application: LOCAL scope, flagged
    /// auto-applicable, and confident enough.
    pub fn can_auto_apply(&self, adaptation_threshold: f64) -> bool {
        self.auto_applicable
            && self.scope == GraphScope::Local
            && self.confidence >= adaptation_threshold
    }

    /// Render as a graph node. Proposal nodes always live in LOCAL scope;
    /// the target scope is an attribute.
    pub fn to_node(&self) -> GraphNode {
        GraphNode::new(self.id.clone(), NodeType::Concept, GraphScope::Local)
            .with_attribute("node_class", json!("adaptation_proposal"))
            .with_attribute("trigger", json!(self.trigger))
            .with_attribute("current_pattern", json!(self.current_pattern))
            .with_attribute("proposed_changes", Value::Object(self.proposed_changes.clone()))
            .with_attribute("evidence", json!(self.evidence))
            .with_attribute("confidence", json!(self.confidence))
            .with_attribute("auto_applicable", json!(self.auto_applicable))
            .with_attribute("scope", json!(self.scope.as_str()))
            .with_attribute("applied", json!(self.applied))
            .with_attribute(
                "applied_at",
                self.applied_at
                    .map(|t| json!(t.to_rfc3339()))
                    .unwrap_or(Value::Null),
            )
    }

    /// Parse a proposal back out of a graph node.
    pub fn from_node(node: &GraphNode) -> Option<Self> {
        if node.attr_str("node_class") != Some("adaptation_proposal") {
            return None;
        }
        Some(Self {
            id: node.id.clone(),
            trigger: node.attr_str("trigger")?.to_string(),
            current_pattern: node.attr_str("current_pattern").unwrap_or("").to_string(),
            proposed_changes: node
                .attributes
                .get("proposed_changes")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            evidence: node
                .attributes
                .get("evidence")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            confidence: node.attr_f64("confidence").unwrap_or(0.0),
            auto_applicable: node.attr_bool("auto_applicable").unwrap_or(false),
            scope: GraphScope::parse(node.attr_str("scope").unwrap_or("local")),
            applied: node.attr_bool("applied").unwrap_or(false),
            applied_at: node
                .attr_str("applied_at")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }
}

/// Summary of one analysis pass.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutcome {
    pub ran: bool,
    pub patterns_detected: usize,
    pub proposals: Vec<AdaptationProposal>,
    pub auto_applied: Vec<String>,
}

/// Continuous feedback between observed behavior and configuration.
pub struct ConfigurationFeedbackLoop {
    memory: Arc<MemoryBus>,
    pattern_threshold: f64,
    adaptation_threshold: f64,
    analysis_interval: Duration,
    last_analysis: StdMutex<DateTime<Utc>>,
}

impl ConfigurationFeedbackLoop {
    pub fn new(memory: Arc<MemoryBus>, config: &FeedbackConfig) -> Self {
        Self {
            memory,
            pattern_threshold: config.pattern_threshold,
            adaptation_threshold: config.adaptation_threshold,
            analysis_interval: Duration::hours(i64::from(config.analysis_interval_hours)),
            last_analysis: StdMutex::new(Utc::now() - Duration::hours(i64::from(config.analysis_interval_hours)) - Duration::seconds(1)),
        }
    }

    /// Full standalone pass: detect, propose, auto-apply what qualifies,
    /// store the rest pending review.
    pub async fn analyze_and_adapt(&self, force: bool) -> AnalysisOutcome {
        let mut outcome = self.detect_and_propose(force).await;
        if !outcome.ran {
            return outcome;
        }

        for proposal in outcome.proposals.iter_mut() {
            if proposal.can_auto_apply(self.adaptation_threshold) {
                if self.apply_proposal(proposal).await {
                    outcome.auto_applied.push(proposal.id.clone());
                    info!("applied adaptation {}", proposal.id);
                }
            }
        }

        self.store_learning_state(&outcome).await;
        outcome
    }

    /// Detect patterns and store proposals without applying anything. The
    /// orchestrator calls this and applies through its own safety filter.
    pub async fn detect_and_propose(&self, force: bool) -> AnalysisOutcome {
        {
            let last = *self.last_analysis.lock().expect("analysis clock poisoned");
            if !force && Utc::now() - last < self.analysis_interval {
                debug!("analysis not due yet");
                return AnalysisOutcome::default();
            }
        }

        let patterns = self.detect_patterns().await;
        for pattern in &patterns {
            self.store_pattern(pattern).await;
        }

        let proposals = self.generate_proposals(&patterns);
        for proposal in &proposals {
            self.memory.memorize(&proposal.to_node(), HANDLER).await;
        }

        *self.last_analysis.lock().expect("analysis clock poisoned") = Utc::now();
        AnalysisOutcome {
            ran: true,
            patterns_detected: patterns.len(),
            proposals,
            auto_applied: Vec::new(),
        }
    }

    /// Proposals stored in the graph that have not been applied yet.
    pub async fn pending_proposals(&self) -> Vec<AdaptationProposal> {
        self.memory
            .recall(
                &MemoryQuery::wildcard("adaptation_proposal_", GraphScope::Local),
                HANDLER,
            )
            .await
            .iter()
            .filter_map(AdaptationProposal::from_node)
            .filter(|p| !p.applied)
            .collect()
    }

    /// The config-update path: write one config node per proposed change
    /// and mark the proposal applied. Returns `false` if any write failed.
    pub async fn apply_proposal(&self, proposal: &mut AdaptationProposal) -> bool {
        for (config_type, changes) in proposal.proposed_changes.clone() {
            let kind = match ConfigKind::parse(&config_type) {
                Some(kind) => kind,
                None => {
                    error!("unknown config kind '{}' in {}", config_type, proposal.id);
                    return false;
                }
            };
            let node = GraphNode::new(
                format!("config/{}/adapted_{}", kind, Utc::now().timestamp()),
                NodeType::Config,
                kind.scope(),
            )
            .with_attribute("config_type", json!(kind.as_str()))
            .with_attribute("values", changes)
            .with_attribute("source", json!("configuration_feedback_loop"))
            .with_attribute("proposal_id", json!(proposal.id))
            .with_attribute("applied_at", json!(Utc::now().to_rfc3339()));

            let result = self.memory.memorize(&node, HANDLER).await;
            if !result.is_ok() {
                error!(
                    "failed to store config update for {}: {:?}",
                    proposal.id, result.reason
                );
                return false;
            }
        }

        proposal.applied = true;
        proposal.applied_at = Some(Utc::now());
        self.memory.memorize(&proposal.to_node(), HANDLER).await;
        true
    }

    /// Run the four detectors over recent history.
    pub async fn detect_patterns(&self) -> Vec<DetectedPattern> {
        let mut patterns = Vec::new();
        patterns.extend(self.detect_temporal_patterns().await);
        patterns.extend(self.detect_frequency_patterns().await);
        patterns.extend(self.detect_performance_patterns().await);
        patterns.extend(self.detect_error_patterns().await);
        patterns
    }

    /// Tool usage split by time of day: morning (06–11) versus evening
    /// (18–22). Different top tools yield a temporal pattern.
    async fn detect_temporal_patterns(&self) -> Vec<DetectedPattern> {
        let actions = self
            .memory
            .recall_timeseries(GraphScope::Local, 24 * 7, Some(&["audit_event"]), None, HANDLER)
            .await;

        let mut morning: HashMap<String, u64> = HashMap::new();
        let mut evening: HashMap<String, u64> = HashMap::new();
        for action in &actions {
            if action.tags.get("action_type").map(String::as_str) != Some("TOOL") {
                continue;
            }
            let tool = action
                .tags
                .get("tool_name")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let hour = action.timestamp.hour();
            if (6..12).contains(&hour) {
                *morning.entry(tool).or_insert(0) += 1;
            } else if (18..23).contains(&hour) {
                *evening.entry(tool).or_insert(0) += 1;
            }
        }

        if morning.is_empty() || evening.is_empty() {
            return Vec::new();
        }

        let top = |counts: &HashMap<String, u64>| -> Vec<String> {
            let mut entries: Vec<(&String, &u64)> = counts.iter().collect();
            entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
            entries.into_iter().take(3).map(|(tool, _)| tool.clone()).collect()
        };
        let top_morning = top(&morning);
        let top_evening = top(&evening);

        let morning_set: std::collections::HashSet<&String> = top_morning.iter().collect();
        let evening_set: std::collections::HashSet<&String> = top_evening.iter().collect();
        if morning_set == evening_set {
            return Vec::new();
        }

        let mut metrics = Map::new();
        metrics.insert("morning_tools".to_string(), json!(top_morning));
        metrics.insert("evening_tools".to_string(), json!(top_evening));

        vec![DetectedPattern {
            pattern_type: PatternType::Temporal,
            pattern_id: "tool_usage_by_hour".to_string(),
            description: "Different tools preferred at different times of day".to_string(),
            evidence: Vec::new(),
            confidence: 0.8,
            detected_at: Utc::now(),
            metrics,
        }]
    }

    /// Action frequency over the last week: dominant actions (> 30% share)
    /// and underused capabilities (fewer than 5 uses).
    async fn detect_frequency_patterns(&self) -> Vec<DetectedPattern> {
        let actions = self
            .memory
            .recall_timeseries(GraphScope::Local, 24 * 7, Some(&["audit_event"]), None, HANDLER)
            .await;

        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut evidence: HashMap<String, Vec<String>> = HashMap::new();
        for action in &actions {
            let action_type = action
                .tags
                .get("action_type")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            *counts.entry(action_type.clone()).or_insert(0) += 1;
            let bucket = evidence.entry(action_type).or_default();
            if bucket.len() < 10 {
                bucket.push(action.node_id.clone());
            }
        }
        let total: u64 = counts.values().sum();

        let mut patterns = Vec::new();
        for (action, count) in &counts {
            let share = *count as f64 / total.max(1) as f64;
            if share > 0.3 {
                let mut metrics = Map::new();
                metrics.insert("action".to_string(), json!(action));
                metrics.insert("count".to_string(), json!(count));
                metrics.insert("percentage".to_string(), json!(share));
                patterns.push(DetectedPattern {
                    pattern_type: PatternType::Frequency,
                    pattern_id: format!("freq_dominant_{}", action),
                    description: format!(
                        "Action '{}' is used {:.1}% of the time",
                        action,
                        share * 100.0
                    ),
                    evidence: evidence.get(action).cloned().unwrap_or_default(),
                    confidence: (*count as f64 / 100.0).min(0.9),
                    detected_at: Utc::now(),
                    metrics,
                });
            }
        }

        for capability in HandlerActionType::ALL {
            let count = counts.get(capability.as_str()).copied().unwrap_or(0);
            if count < 5 {
                let mut metrics = Map::new();
                metrics.insert("capability".to_string(), json!(capability.as_str()));
                metrics.insert("count".to_string(), json!(count));
                patterns.push(DetectedPattern {
                    pattern_type: PatternType::Frequency,
                    pattern_id: format!("freq_underused_{}", capability.as_str()),
                    description: format!(
                        "Capability '{}' is rarely used ({} times)",
                        capability.as_str(),
                        count
                    ),
                    evidence: Vec::new(),
                    confidence: 0.9,
                    detected_at: Utc::now(),
                    metrics,
                });
            }
        }

        patterns
    }

    /// Response-time trend: the latest ten samples against the earliest
    /// ten; 20% slower or worse is a degradation pattern.
    async fn detect_performance_patterns(&self) -> Vec<DetectedPattern> {
        let points = self
            .memory
            .recall_timeseries(GraphScope::Local, 24 * 7, Some(&["metric"]), None, HANDLER)
            .await;

        let response_times: Vec<&TimeSeriesPoint> = points
            .iter()
            .filter(|p| {
                p.metric_name
                    .as_deref()
                    .map(|name| name.ends_with("response_time"))
                    .unwrap_or(false)
            })
            .collect();

        if response_times.len() <= 10 {
            return Vec::new();
        }

        let value = |p: &TimeSeriesPoint| p.metric_value.unwrap_or(0.0);
        let avg_previous: f64 =
            response_times[..10].iter().map(|p| value(p)).sum::<f64>() / 10.0;
        let avg_recent: f64 = response_times[response_times.len() - 10..]
            .iter()
            .map(|p| value(p))
            .sum::<f64>()
            / 10.0;

        if avg_previous <= 0.0 || avg_recent < avg_previous * 1.2 {
            return Vec::new();
        }

        let degradation = avg_recent / avg_previous;
        let mut metrics = Map::new();
        metrics.insert("avg_recent".to_string(), json!(avg_recent));
        metrics.insert("avg_previous".to_string(), json!(avg_previous));
        metrics.insert("degradation".to_string(), json!(degradation));

        vec![DetectedPattern {
            pattern_type: PatternType::Performance,
            pattern_id: "perf_degradation_response_time".to_string(),
            description: format!(
                "Response times degraded by {:.1}%",
                (degradation - 1.0) * 100.0
            ),
            evidence: response_times[response_times.len() - 10..]
                .iter()
                .map(|p| p.node_id.clone())
                .collect(),
            confidence: 0.8,
            detected_at: Utc::now(),
            metrics,
        }]
    }

    /// Recurring errors over the last three days, grouped by inferred
    /// error type; three or more occurrences qualify.
    async fn detect_error_patterns(&self) -> Vec<DetectedPattern> {
        let logs = self
            .memory
            .recall_timeseries(GraphScope::Local, 24 * 3, Some(&["log_entry"]), None, HANDLER)
            .await;

        let mut groups: HashMap<String, Vec<&TimeSeriesPoint>> = HashMap::new();
        for log in &logs {
            let level = log.log_level.as_deref().unwrap_or("INFO");
            if level != "ERROR" && level != "WARNING" {
                continue;
            }
            groups.entry(infer_error_type(log)).or_default().push(log);
        }

        let mut patterns = Vec::new();
        for (error_type, instances) in groups {
            if instances.len() < 3 {
                continue;
            }
            let mut metrics = Map::new();
            metrics.insert("error_type".to_string(), json!(error_type));
            metrics.insert("count".to_string(), json!(instances.len()));
            patterns.push(DetectedPattern {
                pattern_type: PatternType::Error,
                pattern_id: format!("error_recurring_{}", error_type),
                description: format!(
                    "Recurring error: {} ({} times)",
                    error_type,
                    instances.len()
                ),
                evidence: instances.iter().take(5).map(|p| p.node_id.clone()).collect(),
                confidence: (instances.len() as f64 / 10.0).min(0.9),
                detected_at: Utc::now(),
                metrics,
            });
        }
        patterns
    }

    /// Turn qualifying patterns into proposals, one per pattern at most.
    pub fn generate_proposals(&self, patterns: &[DetectedPattern]) -> Vec<AdaptationProposal> {
        patterns
            .iter()
            .filter(|p| p.confidence >= self.pattern_threshold)
            .filter_map(|pattern| match pattern.pattern_type {
                PatternType::Temporal => self.propose_temporal(pattern),
                PatternType::Frequency => self.propose_frequency(pattern),
                PatternType::Performance => self.propose_performance(pattern),
                PatternType::Error => self.propose_error(pattern),
            })
            .collect()
    }

    fn propose_temporal(&self, pattern: &DetectedPattern) -> Option<AdaptationProposal> {
        if pattern.pattern_id != "tool_usage_by_hour" {
            return None;
        }
        let mut changes = Map::new();
        changes.insert(
            ConfigKind::ToolPreferences.as_str().to_string(),
            json!({
                "time_based_selection": true,
                "morning_tools": pattern.metrics.get("morning_tools").cloned().unwrap_or(Value::Null),
                "evening_tools": pattern.metrics.get("evening_tools").cloned().unwrap_or(Value::Null),
                "morning_hours": [6, 7, 8, 9, 10, 11],
                "evening_hours": [18, 19, 20, 21, 22],
            }),
        );
        Some(AdaptationProposal::new(
            format!("Temporal pattern: {}", pattern.description),
            "Static tool preferences",
            changes,
            pattern.evidence.clone(),
            pattern.confidence,
            true,
            GraphScope::Local,
        ))
    }

    fn propose_frequency(&self, pattern: &DetectedPattern) -> Option<AdaptationProposal> {
        if pattern.pattern_id.starts_with("freq_dominant_") {
            let action = pattern.metrics.get("action")?.as_str()?.to_string();
            let mut template_config = Map::new();
            template_config.insert(format!("optimize_for_{}", action), json!(true));
            template_config.insert(format!("{}_cache_size", action), json!(100));
            template_config.insert(format!("{}_preload", action), json!(true));
            let mut changes = Map::new();
            changes.insert(
                ConfigKind::ResponseTemplates.as_str().to_string(),
                Value::Object(template_config),
            );
            return Some(AdaptationProposal::new(
                format!("Frequency pattern: {}", pattern.description),
                format!("No optimization for {}", action),
                changes,
                pattern.evidence.clone(),
                pattern.confidence,
                true,
                GraphScope::Local,
            ));
        }

        if pattern.pattern_id.starts_with("freq_underused_") {
            let capability = pattern.metrics.get("capability")?.as_str()?.to_string();
            let count = pattern.metrics.get("count")?.as_u64()?;
            if count > 0 {
                return None;
            }
            let mut limits = Map::new();
            limits.insert(format!("disable_{}", capability), json!(true));
            limits.insert("reason".to_string(), json!("Never used in practice"));
            let mut changes = Map::new();
            changes.insert(
                ConfigKind::CapabilityLimits.as_str().to_string(),
                Value::Object(limits),
            );
            return Some(AdaptationProposal::new(
                format!("Underused capability: {}", pattern.description),
                format!("Capability {} available but unused", capability),
                changes,
                Vec::new(),
                0.7,
                false,
                GraphScope::Identity,
            ));
        }

        None
    }

    fn propose_performance(&self, pattern: &DetectedPattern) -> Option<AdaptationProposal> {
        let degradation = pattern.metrics.get("degradation")?.as_f64()?;
        if degradation <= 1.5 {
            return None;
        }
        let mut changes = Map::new();
        changes.insert(
            ConfigKind::BehaviorConfig.as_str().to_string(),
            json!({
                "enable_performance_mode": true,
                "reduce_pondering_depth": true,
                "cache_aggressive": true,
                "timeout_adjustments": { "tool_timeout": 0.8, "llm_timeout": 0.9 },
            }),
        );
        Some(AdaptationProposal::new(
            format!("Performance issue: {}", pattern.description),
            "Performance degrading over time",
            changes,
            pattern.evidence.clone(),
            pattern.confidence * 0.8,
            false,
            GraphScope::Identity,
        ))
    }

    fn propose_error(&self, pattern: &DetectedPattern) -> Option<AdaptationProposal> {
        let error_type = pattern.metrics.get("error_type")?.as_str()?.to_string();
        let count = pattern.metrics.get("count")?.as_u64()?;
        if count < 5 {
            return None;
        }

        if error_type.contains("timeout") {
            let mut changes = Map::new();
            changes.insert(
                ConfigKind::BehaviorConfig.as_str().to_string(),
                json!({
                    "timeout_adjustments": {
                        "global_multiplier": 1.5,
                        "retry_on_timeout": true,
                        "max_retries": 2,
                    },
                }),
            );
            return Some(AdaptationProposal::new(
                format!("Recurring error: {}", pattern.description),
                format!("Frequent {} errors", error_type),
                changes,
                pattern.evidence.clone(),
                pattern.confidence,
                false,
                GraphScope::Identity,
            ));
        }

        if let Some(tool_name) = extract_tool_name(&error_type) {
            let mut preferences = Map::new();
            preferences.insert(format!("deprioritize_{}", tool_name), json!(true));
            preferences.insert(format!("{}_reliability_score", tool_name), json!(0.3));
            preferences.insert("prefer_alternatives_to".to_string(), json!([tool_name]));
            let mut changes = Map::new();
            changes.insert(
                ConfigKind::ToolPreferences.as_str().to_string(),
                Value::Object(preferences),
            );
            return Some(AdaptationProposal::new(
                format!("Tool errors: {}", pattern.description),
                format!("Tool {} failing frequently", tool_name),
                changes,
                pattern.evidence.clone(),
                pattern.confidence,
                true,
                GraphScope::Local,
            ));
        }

        None
    }

    async fn store_pattern(&self, pattern: &DetectedPattern) {
        let node = GraphNode::new(
            format!("pattern_{}_{}", pattern.pattern_id, pattern.detected_at.timestamp()),
            NodeType::Concept,
            GraphScope::Local,
        )
        .with_attribute("pattern_type", json!(pattern.pattern_type.as_str()))
        .with_attribute("pattern_id", json!(pattern.pattern_id))
        .with_attribute("description", json!(pattern.description))
        .with_attribute("confidence", json!(pattern.confidence))
        .with_attribute("detected_at", json!(pattern.detected_at.to_rfc3339()))
        .with_attribute("metrics", Value::Object(pattern.metrics.clone()))
        .with_attribute("evidence_count", json!(pattern.evidence.len()));

        self.memory.memorize(&node, HANDLER).await;
    }

    async fn store_learning_state(&self, outcome: &AnalysisOutcome) {
        let node = GraphNode::new(
            format!("learning_state_{}", Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Local,
        )
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()))
        .with_attribute("patterns_detected", json!(outcome.patterns_detected))
        .with_attribute("proposals_generated", json!(outcome.proposals.len()))
        .with_attribute("adaptations_applied", json!(outcome.auto_applied.len()));

        self.memory.memorize(&node, HANDLER).await;
    }
}

/// Best-effort error-type inference from tags and message text.
fn infer_error_type(point: &TimeSeriesPoint) -> String {
    if let Some(error_type) = point.tags.get("error_type") {
        if !error_type.is_empty() {
            return error_type.clone();
        }
    }
    let message = point.log_message.as_deref().unwrap_or("").to_lowercase();
    if message.contains("timeout") {
        "timeout_error".to_string()
    } else if message.contains("tool") {
        "tool_error".to_string()
    } else if message.contains("memory") {
        "memory_error".to_string()
    } else {
        "unknown_error".to_string()
    }
}

/// `tool_<name>_...` error types name the failing tool.
fn extract_tool_name(error_type: &str) -> Option<String> {
    let parts: Vec<&str> = error_type.split('_').collect();
    if parts.len() > 2 && parts[0] == "tool" {
        Some(parts[1].to_string())
    } else {
        None
    }
}
