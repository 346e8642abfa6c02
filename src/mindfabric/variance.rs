//! Identity variance monitoring.
//!
//! At first start the agent's identity is frozen into an immutable baseline
//! snapshot. From then on the monitor periodically assembles a current
//! snapshot (identity-scope nodes, configuration nodes, and the last
//! week's behavioral distribution) and measures weighted drift from the
//! baseline. Drift at or past the threshold (20% by default) marks the
//! report for Wise Authority review and sends exactly one review request
//! through the Wise bus; enforcement (pausing adaptation) belongs to the
//! self-configuration orchestrator, not to this monitor.
//!
//! # Variance math
//!
//! Each difference carries an impact weight (critical x5, high x3,
//! medium x2, low x1) and `total_variance = sum(count * weight) / 100`.

use crate::mindfabric::action::HandlerActionType;
use crate::mindfabric::buses::memory::MemoryBus;
use crate::mindfabric::buses::wise::WiseBus;
use crate::mindfabric::config::VarianceConfig;
use crate::mindfabric::error::{FabricError, FabricResult};
use crate::mindfabric::graph::{ConfigKind, GraphNode, GraphScope, MemoryQuery, NodeType};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

const HANDLER: &str = "identity_variance_monitor";

/// Node id of the pointer to the current baseline snapshot.
pub const BASELINE_POINTER_ID: &str = "identity_baseline_current";

/// The identity seed frozen into the baseline at first start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub purpose: String,
    pub role_description: String,
    pub permitted_actions: Vec<HandlerActionType>,
    pub restricted_capabilities: Vec<String>,
    /// Overrides shaping action selection; treated as ethical boundaries.
    pub action_selection_overrides: Map<String, Value>,
    /// Overrides shaping trust assessment.
    pub trust_overrides: Map<String, Value>,
}

impl AgentIdentity {
    /// SHA-256 over the canonical JSON form of the identity.
    pub fn identity_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn ethical_boundaries(&self) -> Map<String, Value> {
        let mut boundaries = self.action_selection_overrides.clone();
        if !self.restricted_capabilities.is_empty() {
            boundaries.insert(
                "restricted_actions".to_string(),
                json!(self.restricted_capabilities),
            );
        }
        boundaries
    }
}

/// Impact level of one identity difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarianceImpact {
    Critical,
    High,
    Medium,
    Low,
}

impl VarianceImpact {
    pub fn weight(&self) -> f64 {
        match self {
            VarianceImpact::Critical => 5.0,
            VarianceImpact::High => 3.0,
            VarianceImpact::Medium => 2.0,
            VarianceImpact::Low => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VarianceImpact::Critical => "critical",
            VarianceImpact::High => "high",
            VarianceImpact::Medium => "medium",
            VarianceImpact::Low => "low",
        }
    }
}

/// Kind of difference between baseline and current identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffType {
    Added,
    Removed,
    Modified,
}

/// One difference between the baseline and current snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityDiff {
    pub node_id: String,
    pub diff_type: DiffType,
    pub impact: VarianceImpact,
    pub baseline_value: Value,
    pub current_value: Value,
    pub description: String,
}

/// Complete variance analysis for one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarianceReport {
    pub timestamp: DateTime<Utc>,
    pub baseline_id: String,
    pub current_id: String,
    pub total_variance: f64,
    pub variance_by_impact: HashMap<VarianceImpact, f64>,
    pub differences: Vec<IdentityDiff>,
    pub requires_wa_review: bool,
    pub recommendations: Vec<String>,
}

/// Weighted, normalized drift for a difference list.
///
/// Exposed for reuse by the orchestrator's safety filter tests.
pub fn calculate_variance(
    differences: &[IdentityDiff],
) -> (f64, HashMap<VarianceImpact, f64>) {
    let mut counts: HashMap<VarianceImpact, f64> = HashMap::new();
    for diff in differences {
        *counts.entry(diff.impact).or_insert(0.0) += 1.0;
    }

    let baseline_weight = 100.0;
    let mut by_impact = HashMap::new();
    let mut total = 0.0;
    for impact in [
        VarianceImpact::Critical,
        VarianceImpact::High,
        VarianceImpact::Medium,
        VarianceImpact::Low,
    ] {
        let count = counts.get(&impact).copied().unwrap_or(0.0);
        let weighted = count * impact.weight();
        total += weighted;
        by_impact.insert(impact, weighted / baseline_weight);
    }
    (total / baseline_weight, by_impact)
}

/// Tracks identity drift from the frozen baseline.
pub struct IdentityVarianceMonitor {
    memory: Arc<MemoryBus>,
    wise: Arc<WiseBus>,
    threshold: f64,
    check_interval: Duration,
    baseline_id: StdMutex<Option<String>>,
    last_check: StdMutex<DateTime<Utc>>,
    last_report: StdMutex<Option<VarianceReport>>,
}

impl IdentityVarianceMonitor {
    pub fn new(memory: Arc<MemoryBus>, wise: Arc<WiseBus>, config: &VarianceConfig) -> Self {
        Self {
            memory,
            wise,
            threshold: config.variance_threshold,
            check_interval: Duration::hours(i64::from(config.check_interval_hours)),
            baseline_id: StdMutex::new(None),
            last_check: StdMutex::new(Utc::now()),
            last_report: StdMutex::new(None),
        }
    }

    pub fn variance_threshold(&self) -> f64 {
        self.threshold
    }

    /// Freeze the identity baseline. Called once at agent first start; the
    /// stored snapshot is immutable and every later check compares against
    /// it via the `identity_baseline_current` pointer node.
    pub async fn initialize_baseline(&self, identity: &AgentIdentity) -> FabricResult<String> {
        let baseline_id = format!("identity_baseline_{}", Utc::now().timestamp());
        let permitted: Vec<&str> = identity.permitted_actions.iter().map(|a| a.as_str()).collect();

        let baseline = GraphNode::new(baseline_id.clone(), NodeType::Agent, GraphScope::Identity)
            .with_attribute("snapshot_type", json!("baseline"))
            .with_attribute("agent_id", json!(identity.agent_id))
            .with_attribute("identity_hash", json!(identity.identity_hash()))
            .with_attribute("core_purpose", json!(identity.purpose))
            .with_attribute("role", json!(identity.role_description))
            .with_attribute("capabilities", json!(permitted))
            .with_attribute("restricted_capabilities", json!(identity.restricted_capabilities))
            .with_attribute("ethical_boundaries", Value::Object(identity.ethical_boundaries()))
            .with_attribute("trust_parameters", Value::Object(identity.trust_overrides.clone()))
            .with_attribute("timestamp", json!(Utc::now().to_rfc3339()))
            .with_attribute("immutable", json!(true));

        let result = self.memory.memorize(&baseline, HANDLER).await;
        if !result.is_ok() {
            return Err(FabricError::ProviderFailed {
                provider: "memory".to_string(),
                message: result
                    .reason
                    .unwrap_or_else(|| "failed to store baseline".to_string()),
            });
        }

        let pointer = GraphNode::new(BASELINE_POINTER_ID, NodeType::Concept, GraphScope::Identity)
            .with_attribute("baseline_id", json!(baseline_id))
            .with_attribute("established_at", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&pointer, HANDLER).await;

        *self.baseline_id.lock().expect("baseline lock poisoned") = Some(baseline_id.clone());
        info!("identity baseline established: {}", baseline_id);
        Ok(baseline_id)
    }

    /// Measure drift from the baseline. Unforced checks inside the check
    /// interval return the cached report; forced checks always recompute.
    pub async fn check_variance(&self, force: bool) -> FabricResult<VarianceReport> {
        if !force {
            let last = *self.last_check.lock().expect("check clock poisoned");
            if Utc::now() - last < self.check_interval {
                if let Some(report) = self.last_report.lock().expect("report lock poisoned").clone()
                {
                    debug!("variance check not due, returning cached report");
                    return Ok(report);
                }
            }
        }

        let baseline_id = match self.resolve_baseline_id().await {
            Some(id) => id,
            None => {
                return Err(FabricError::Validation(
                    "no identity baseline available".to_string(),
                ))
            }
        };
        let baseline = self
            .memory
            .recall(&MemoryQuery::exact(&baseline_id, GraphScope::Identity), HANDLER)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                FabricError::Validation(format!("baseline snapshot {} not found", baseline_id))
            })?;

        let current = self.take_identity_snapshot(&baseline).await;
        let differences = self.calculate_differences(&baseline, &current);
        let (total_variance, variance_by_impact) = calculate_variance(&differences);

        let report = VarianceReport {
            timestamp: Utc::now(),
            baseline_id,
            current_id: current.id.clone(),
            total_variance,
            variance_by_impact,
            requires_wa_review: total_variance >= self.threshold,
            recommendations: self.recommendations(&differences, total_variance),
            differences,
        };

        self.store_report(&report).await;
        if report.requires_wa_review {
            self.trigger_wa_review(&report).await;
        }

        *self.last_check.lock().expect("check clock poisoned") = Utc::now();
        *self.last_report.lock().expect("report lock poisoned") = Some(report.clone());
        Ok(report)
    }

    async fn resolve_baseline_id(&self) -> Option<String> {
        if let Some(id) = self.baseline_id.lock().expect("baseline lock poisoned").clone() {
            return Some(id);
        }
        let pointer = self
            .memory
            .recall(
                &MemoryQuery::exact(BASELINE_POINTER_ID, GraphScope::Identity),
                HANDLER,
            )
            .await
            .into_iter()
            .next()?;
        let id = pointer.attr_str("baseline_id")?.to_string();
        *self.baseline_id.lock().expect("baseline lock poisoned") = Some(id.clone());
        debug!("loaded baseline id from pointer: {}", id);
        Some(id)
    }

    /// Assemble the current identity snapshot from identity nodes, config
    /// nodes, and the last week's action distribution. When a category has
    /// no observed state yet, the baseline's value carries over: absence
    /// of data is not drift.
    async fn take_identity_snapshot(&self, baseline: &GraphNode) -> GraphNode {
        let identity_nodes = self
            .memory
            .recall(&MemoryQuery::wildcard("", GraphScope::Identity), HANDLER)
            .await;
        let config_nodes = self.gather_config_nodes().await;
        let behavioral = self.analyze_behavioral_patterns().await;

        let mut ethics = Map::new();
        let mut trust = Map::new();
        for node in &config_nodes {
            let values = node.attributes.get("values").and_then(Value::as_object);
            match node.attr_str("config_type") {
                Some(t) if t == ConfigKind::EthicalBoundaries.as_str() => {
                    if let Some(values) = values {
                        ethics.extend(values.clone());
                    }
                }
                Some(t) if t == ConfigKind::TrustParameters.as_str() => {
                    if let Some(values) = values {
                        trust.extend(values.clone());
                    }
                }
                _ => {}
            }
        }
        if ethics.is_empty() {
            if let Some(b) = baseline.attributes.get("ethical_boundaries").and_then(Value::as_object)
            {
                ethics = b.clone();
            }
        }
        if trust.is_empty() {
            if let Some(b) = baseline.attributes.get("trust_parameters").and_then(Value::as_object) {
                trust = b.clone();
            }
        }

        let mut capabilities: Vec<String> = identity_nodes
            .iter()
            .filter(|n| n.attr_str("node_type") == Some("capability_change"))
            .filter_map(|n| n.attr_str("capability").map(str::to_string))
            .collect();
        capabilities.sort();
        capabilities.dedup();
        if capabilities.is_empty() {
            capabilities = baseline
                .attributes
                .get("capabilities")
                .and_then(Value::as_array)
                .map(|caps| {
                    caps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
        }

        let snapshot = GraphNode::new(
            format!("identity_snapshot_{}", Utc::now().timestamp()),
            NodeType::Agent,
            GraphScope::Identity,
        )
        .with_attribute("snapshot_type", json!("current"))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()))
        .with_attribute("identity_nodes", json!(identity_nodes.len()))
        .with_attribute("config_nodes", json!(config_nodes.len()))
        .with_attribute("ethical_boundaries", Value::Object(ethics))
        .with_attribute("trust_parameters", Value::Object(trust))
        .with_attribute("capabilities", json!(capabilities))
        .with_attribute("behavioral_patterns", behavioral);

        self.memory.memorize(&snapshot, HANDLER).await;
        snapshot
    }

    async fn gather_config_nodes(&self) -> Vec<GraphNode> {
        let mut nodes = Vec::new();
        for kind in ConfigKind::ALL {
            let query = MemoryQuery::wildcard(format!("config/{}/", kind), kind.scope());
            nodes.extend(self.memory.recall(&query, HANDLER).await);
        }
        nodes
    }

    /// Distribution of handler actions over the last week's audit events.
    async fn analyze_behavioral_patterns(&self) -> Value {
        let actions = self
            .memory
            .recall_timeseries(
                GraphScope::Local,
                24 * 7,
                Some(&["audit_event"]),
                None,
                HANDLER,
            )
            .await;

        let mut distribution: HashMap<String, u64> = HashMap::new();
        for action in &actions {
            let action_type = action
                .tags
                .get("action_type")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            *distribution.entry(action_type).or_insert(0) += 1;
        }
        let total: u64 = distribution.values().sum();

        json!({
            "action_distribution": distribution,
            "total_actions": total,
        })
    }

    fn calculate_differences(&self, baseline: &GraphNode, current: &GraphNode) -> Vec<IdentityDiff> {
        let mut differences = Vec::new();

        // Ethical boundaries: every add/remove/modify is critical.
        let empty = Map::new();
        let baseline_ethics = baseline
            .attributes
            .get("ethical_boundaries")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let current_ethics = current
            .attributes
            .get("ethical_boundaries")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut keys: HashSet<&String> = baseline_ethics.keys().collect();
        keys.extend(current_ethics.keys());
        for key in keys {
            match (baseline_ethics.get(key), current_ethics.get(key)) {
                (Some(b), None) => differences.push(IdentityDiff {
                    node_id: format!("ethics_{}", key),
                    diff_type: DiffType::Removed,
                    impact: VarianceImpact::Critical,
                    baseline_value: b.clone(),
                    current_value: Value::Null,
                    description: format!("Ethical boundary '{}' removed", key),
                }),
                (None, Some(c)) => differences.push(IdentityDiff {
                    node_id: format!("ethics_{}", key),
                    diff_type: DiffType::Added,
                    impact: VarianceImpact::Critical,
                    baseline_value: Value::Null,
                    current_value: c.clone(),
                    description: format!("Ethical boundary '{}' added", key),
                }),
                (Some(b), Some(c)) if b != c => differences.push(IdentityDiff {
                    node_id: format!("ethics_{}", key),
                    diff_type: DiffType::Modified,
                    impact: VarianceImpact::Critical,
                    baseline_value: b.clone(),
                    current_value: c.clone(),
                    description: format!("Ethical boundary '{}' modified", key),
                }),
                _ => {}
            }
        }

        // Capabilities: every add/remove is high.
        let as_set = |node: &GraphNode| -> HashSet<String> {
            node.attributes
                .get("capabilities")
                .and_then(Value::as_array)
                .map(|caps| {
                    caps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let baseline_caps = as_set(baseline);
        let current_caps = as_set(current);
        for cap in baseline_caps.difference(&current_caps) {
            differences.push(IdentityDiff {
                node_id: format!("capability_{}", cap),
                diff_type: DiffType::Removed,
                impact: VarianceImpact::High,
                baseline_value: json!(cap),
                current_value: Value::Null,
                description: format!("Capability '{}' removed", cap),
            });
        }
        for cap in current_caps.difference(&baseline_caps) {
            differences.push(IdentityDiff {
                node_id: format!("capability_{}", cap),
                diff_type: DiffType::Added,
                impact: VarianceImpact::High,
                baseline_value: Value::Null,
                current_value: json!(cap),
                description: format!("Capability '{}' added", cap),
            });
        }

        // Behavioral patterns: shifts past 20 percentage points are medium.
        differences.extend(self.compare_patterns(baseline, current));
        differences
    }

    fn compare_patterns(&self, baseline: &GraphNode, current: &GraphNode) -> Vec<IdentityDiff> {
        let distribution = |node: &GraphNode| -> (HashMap<String, f64>, f64) {
            let patterns = node.attributes.get("behavioral_patterns");
            let total = patterns
                .and_then(|p| p.get("total_actions"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .max(1.0);
            let map = patterns
                .and_then(|p| p.get("action_distribution"))
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
                        .collect()
                })
                .unwrap_or_default();
            (map, total)
        };

        let (baseline_dist, baseline_total) = distribution(baseline);
        let (current_dist, current_total) = distribution(current);

        let mut actions: HashSet<&String> = baseline_dist.keys().collect();
        actions.extend(current_dist.keys());

        let mut differences = Vec::new();
        for action in actions {
            let baseline_pct = baseline_dist.get(action).copied().unwrap_or(0.0) / baseline_total;
            let current_pct = current_dist.get(action).copied().unwrap_or(0.0) / current_total;
            if (current_pct - baseline_pct).abs() > 0.2 {
                differences.push(IdentityDiff {
                    node_id: format!("pattern_action_{}", action),
                    diff_type: DiffType::Modified,
                    impact: VarianceImpact::Medium,
                    baseline_value: json!(format!("{:.1}%", baseline_pct * 100.0)),
                    current_value: json!(format!("{:.1}%", current_pct * 100.0)),
                    description: format!("Behavior pattern '{}' shifted significantly", action),
                });
            }
        }
        differences
    }

    fn recommendations(&self, differences: &[IdentityDiff], total_variance: f64) -> Vec<String> {
        let mut recommendations = Vec::new();

        if total_variance >= self.threshold {
            recommendations.push(format!(
                "CRITICAL: Variance ({:.1}%) exceeds safe threshold. WA review required before further changes.",
                total_variance * 100.0
            ));
        } else if total_variance > self.threshold * 0.8 {
            recommendations.push(format!(
                "WARNING: Variance ({:.1}%) approaching threshold. Consider consolidating changes before adding more.",
                total_variance * 100.0
            ));
        }

        let critical = differences
            .iter()
            .filter(|d| d.impact == VarianceImpact::Critical)
            .count();
        if critical > 0 {
            recommendations.push(format!(
                "Found {} critical changes affecting core identity. These have the highest impact on variance.",
                critical
            ));
        }

        if total_variance < self.threshold * 0.5 {
            recommendations.push(
                "Healthy variance range. There is room for growth and adaptation within safe bounds."
                    .to_string(),
            );
        }

        recommendations
    }

    async fn store_report(&self, report: &VarianceReport) {
        let by_impact: Map<String, Value> = report
            .variance_by_impact
            .iter()
            .map(|(impact, value)| (impact.as_str().to_string(), json!(value)))
            .collect();

        let node = GraphNode::new(
            format!("variance_report_{}", report.timestamp.timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("report_type", json!("identity_variance"))
        .with_attribute("timestamp", json!(report.timestamp.to_rfc3339()))
        .with_attribute("total_variance", json!(report.total_variance))
        .with_attribute("variance_by_impact", Value::Object(by_impact))
        .with_attribute("requires_wa_review", json!(report.requires_wa_review))
        .with_attribute("difference_count", json!(report.differences.len()))
        .with_attribute("recommendations", json!(report.recommendations));

        self.memory.memorize(&node, HANDLER).await;
    }

    async fn trigger_wa_review(&self, report: &VarianceReport) {
        let critical: Vec<&str> = report
            .differences
            .iter()
            .filter(|d| d.impact == VarianceImpact::Critical)
            .map(|d| d.description.as_str())
            .collect();

        let review_data = json!({
            "request_type": "identity_variance_review",
            "variance_report": {
                "total_variance": report.total_variance,
                "threshold": self.threshold,
                "critical_changes": critical,
                "recommendations": report.recommendations,
            },
            "urgency": if report.total_variance > 0.30 { "high" } else { "moderate" },
        });

        if self
            .wise
            .request_review("identity_variance", &review_data, HANDLER)
            .await
        {
            warn!(
                "WA review triggered for identity variance {:.1}%",
                report.total_variance * 100.0
            );
        }
    }
}
