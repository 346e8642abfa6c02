//! System snapshot types.
//!
//! After every completed thought the reasoning layer assembles a
//! [`SystemSnapshot`] and hands it to the
//! [`UnifiedTelemetryService`](crate::mindfabric::telemetry::UnifiedTelemetryService),
//! which fans it out into graph memories. The snapshot is deliberately
//! flat: numeric telemetry, resource accounting for the round, the task and
//! thought being worked, and the social context around them.

use crate::mindfabric::service::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Summary of the task a thought belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub description: String,
    pub status: String,
}

/// Summary of a completed thought.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtSummary {
    pub thought_id: String,
    pub content: String,
    pub thought_type: Option<String>,
}

/// A user seen in the current interaction context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    pub trust_score: Option<f64>,
    pub notes: Option<String>,
}

/// Everything the telemetry flow knows about one completed round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Numeric telemetry keys for this round; each becomes a
    /// `telemetry.<key>` metric node.
    pub telemetry: HashMap<String, f64>,
    /// Resource accounting for the round, if any LLM work happened.
    pub current_round_resources: Option<ResourceUsage>,
    /// The task being worked, if any.
    pub current_task_details: Option<TaskSummary>,
    /// The thought that just completed, if any.
    pub current_thought_summary: Option<ThoughtSummary>,
    /// Users present in the interaction, keyed by user id.
    pub user_profiles: HashMap<String, UserProfile>,
    /// Channel the interaction happened in.
    pub channel_context: Option<String>,
    /// The agent's display name, memorized into identity context.
    pub agent_name: Option<String>,
}
