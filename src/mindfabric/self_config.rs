//! Self-configuration orchestration.
//!
//! The master coordinator of autonomous adaptation. It owns the three
//! subsystems that make adaptation safe (the identity variance monitor,
//! the configuration feedback loop, and the unified telemetry service)
//! and runs the adaptation lifecycle:
//!
//! ```text
//! learning → proposing → adapting → stabilizing → (learning | reviewing)
//! ```
//!
//! Safety mechanisms, in order of severity:
//! - proposals are admitted only while their projected impact fits inside
//!   half the remaining variance budget;
//! - a post-apply variance breach rolls the cycle back and parks the
//!   system in `reviewing` until the Wise Authority answers;
//! - three consecutive failed cycles engage a sticky emergency stop that
//!   only a process restart clears.

use crate::mindfabric::buses::memory::MemoryBus;
use crate::mindfabric::buses::wise::WiseBus;
use crate::mindfabric::config::FabricConfig;
use crate::mindfabric::error::FabricResult;
use crate::mindfabric::feedback::{AdaptationProposal, ConfigurationFeedbackLoop};
use crate::mindfabric::graph::{GraphNode, GraphScope, NodeType};
use crate::mindfabric::snapshot::SystemSnapshot;
use crate::mindfabric::telemetry::{SnapshotOutcome, UnifiedTelemetryService};
use crate::mindfabric::variance::{AgentIdentity, IdentityVarianceMonitor};
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

const HANDLER: &str = "self_configuration";

/// State of the self-configuration system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationState {
    /// Gathering data; no changes yet.
    Learning,
    /// Actively generating proposals.
    Proposing,
    /// Applying admitted proposals.
    Adapting,
    /// Waiting for applied changes to settle.
    Stabilizing,
    /// Parked pending Wise Authority review.
    Reviewing,
}

impl AdaptationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationState::Learning => "learning",
            AdaptationState::Proposing => "proposing",
            AdaptationState::Adapting => "adapting",
            AdaptationState::Stabilizing => "stabilizing",
            AdaptationState::Reviewing => "reviewing",
        }
    }
}

/// Record of one completed (or aborted) adaptation cycle.
#[derive(Debug, Clone)]
pub struct AdaptationCycle {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub state: AdaptationState,
    pub patterns_detected: usize,
    pub proposals_generated: usize,
    pub changes_applied: usize,
    pub variance_before: f64,
    pub variance_after: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of one `run_adaptation_cycle` invocation.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// The cycle did not run; the reason says why.
    Skipped { reason: &'static str },
    /// Variance already requires review; no proposals were touched.
    ReviewRequired { cycle_id: String, variance: f64 },
    /// The cycle ran to completion (possibly rolling back).
    Completed {
        cycle_id: String,
        patterns_detected: usize,
        proposals_generated: usize,
        changes_applied: usize,
        variance_before: f64,
        variance_after: Option<f64>,
        rolled_back: bool,
        new_state: AdaptationState,
    },
    /// The cycle errored; counted toward the emergency stop.
    Failed { error: String },
}

/// Outcome of processing one experience snapshot.
#[derive(Debug)]
pub struct ExperienceOutcome {
    pub snapshot: SnapshotOutcome,
    pub adaptation: Option<CycleOutcome>,
}

/// Point-in-time status report.
#[derive(Debug, Clone)]
pub struct AdaptationStatus {
    pub current_state: AdaptationState,
    pub emergency_stop: bool,
    pub consecutive_failures: u32,
    pub cycles_completed: usize,
    pub last_adaptation: DateTime<Utc>,
}

/// Master service orchestrating safe autonomous adaptation.
pub struct SelfConfigurationService {
    memory: Arc<MemoryBus>,
    variance_monitor: Arc<IdentityVarianceMonitor>,
    feedback: Arc<ConfigurationFeedbackLoop>,
    telemetry: Arc<UnifiedTelemetryService>,
    variance_threshold: f64,
    adaptation_interval: Duration,
    stabilization_period: Duration,
    max_failures: u32,
    state: StdMutex<AdaptationState>,
    cycle_active: AtomicBool,
    last_adaptation: StdMutex<DateTime<Utc>>,
    last_cycle: StdMutex<DateTime<Utc>>,
    history: StdMutex<Vec<AdaptationCycle>>,
    consecutive_failures: AtomicU32,
    emergency_stopped: AtomicBool,
}

impl SelfConfigurationService {
    /// Build the orchestrator and its child subsystems. The orchestrator
    /// is the owner; children hold only the bus handles they need.
    pub fn new(memory: Arc<MemoryBus>, wise: Arc<WiseBus>, config: &FabricConfig) -> Self {
        let variance_monitor = Arc::new(IdentityVarianceMonitor::new(
            Arc::clone(&memory),
            wise,
            &config.variance,
        ));
        let feedback = Arc::new(ConfigurationFeedbackLoop::new(
            Arc::clone(&memory),
            &config.feedback,
        ));
        let telemetry = Arc::new(UnifiedTelemetryService::new(
            Arc::clone(&memory),
            &config.telemetry,
        ));

        let adaptation_interval =
            Duration::hours(i64::from(config.self_config.adaptation_interval_hours));
        Self {
            memory,
            variance_monitor,
            feedback,
            telemetry,
            variance_threshold: config.variance.variance_threshold,
            adaptation_interval,
            stabilization_period: Duration::hours(i64::from(
                config.self_config.stabilization_period_hours,
            )),
            max_failures: config.self_config.max_consecutive_failures,
            state: StdMutex::new(AdaptationState::Learning),
            cycle_active: AtomicBool::new(false),
            // Let the first cycle run without waiting out an interval.
            last_adaptation: StdMutex::new(Utc::now() - adaptation_interval - Duration::seconds(1)),
            last_cycle: StdMutex::new(Utc::now() - adaptation_interval - Duration::seconds(1)),
            history: StdMutex::new(Vec::new()),
            consecutive_failures: AtomicU32::new(0),
            emergency_stopped: AtomicBool::new(false),
        }
    }

    pub fn variance_monitor(&self) -> &IdentityVarianceMonitor {
        &self.variance_monitor
    }

    pub fn feedback(&self) -> &ConfigurationFeedbackLoop {
        &self.feedback
    }

    pub fn telemetry(&self) -> &UnifiedTelemetryService {
        &self.telemetry
    }

    pub fn current_state(&self) -> AdaptationState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped.load(Ordering::SeqCst)
    }

    /// Freeze the identity baseline. Call once at agent first start.
    pub async fn initialize_identity_baseline(
        &self,
        identity: &AgentIdentity,
    ) -> FabricResult<String> {
        let baseline_id = self.variance_monitor.initialize_baseline(identity).await?;

        let node = GraphNode::new(
            format!("self_config_init_{}", Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("event_type", json!("self_configuration_initialized"))
        .with_attribute("baseline_id", json!(baseline_id))
        .with_attribute("variance_threshold", json!(self.variance_threshold))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;

        Ok(baseline_id)
    }

    /// Process one experience snapshot: route it into the memory graph,
    /// then run an adaptation cycle if one is due.
    pub async fn process_experience(
        &self,
        snapshot: &SystemSnapshot,
        thought_id: &str,
        task_id: Option<&str>,
    ) -> ExperienceOutcome {
        let snapshot_outcome = self
            .telemetry
            .process_system_snapshot(snapshot, thought_id, task_id)
            .await;

        let adaptation = if self.should_run_adaptation_cycle() {
            Some(self.run_adaptation_cycle().await)
        } else {
            None
        };

        ExperienceOutcome {
            snapshot: snapshot_outcome,
            adaptation,
        }
    }

    fn should_run_adaptation_cycle(&self) -> bool {
        if self.emergency_stopped.load(Ordering::SeqCst)
            || self.cycle_active.load(Ordering::SeqCst)
        {
            return false;
        }
        let state = self.current_state();
        if state == AdaptationState::Reviewing {
            return false;
        }
        let since_adaptation = Utc::now() - *self.last_adaptation.lock().expect("clock poisoned");
        if state == AdaptationState::Stabilizing && since_adaptation < self.stabilization_period {
            return false;
        }
        let since_cycle = Utc::now() - *self.last_cycle.lock().expect("clock poisoned");
        since_cycle >= self.adaptation_interval
    }

    /// Run one complete adaptation cycle. Emergency stop, an active cycle,
    /// a pending review, or an unfinished stabilization period short-circuit
    /// to [`CycleOutcome::Skipped`] without touching any provider.
    pub async fn run_adaptation_cycle(&self) -> CycleOutcome {
        if self.emergency_stopped.load(Ordering::SeqCst) {
            return CycleOutcome::Skipped {
                reason: "emergency_stop",
            };
        }
        if self.cycle_active.swap(true, Ordering::SeqCst) {
            return CycleOutcome::Skipped {
                reason: "cycle_in_progress",
            };
        }

        let gate = {
            let state = self.current_state();
            if state == AdaptationState::Reviewing {
                Some("awaiting_review")
            } else if state == AdaptationState::Stabilizing {
                let since_last =
                    Utc::now() - *self.last_adaptation.lock().expect("clock poisoned");
                if since_last < self.stabilization_period {
                    Some("stabilizing")
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(reason) = gate {
            self.cycle_active.store(false, Ordering::SeqCst);
            return CycleOutcome::Skipped { reason };
        }

        let outcome = self.run_cycle_inner().await;
        self.cycle_active.store(false, Ordering::SeqCst);
        *self.last_cycle.lock().expect("clock poisoned") = Utc::now();

        match &outcome {
            CycleOutcome::Failed { error } => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!("adaptation cycle failed ({} consecutive): {}", failures, error);
                if failures >= self.max_failures {
                    self.engage_emergency_stop("repeated adaptation cycle failures")
                        .await;
                }
            }
            _ => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
        outcome
    }

    async fn run_cycle_inner(&self) -> CycleOutcome {
        let cycle_id = format!("cycle_{}", Utc::now().timestamp());
        let mut cycle = AdaptationCycle {
            cycle_id: cycle_id.clone(),
            started_at: Utc::now(),
            state: self.current_state(),
            patterns_detected: 0,
            proposals_generated: 0,
            changes_applied: 0,
            variance_before: 0.0,
            variance_after: None,
            completed_at: None,
        };
        info!("starting adaptation cycle {}", cycle_id);

        // 1. Where do we stand against the baseline?
        let variance_report = match self.variance_monitor.check_variance(true).await {
            Ok(report) => report,
            Err(e) => return CycleOutcome::Failed { error: e.to_string() },
        };
        cycle.variance_before = variance_report.total_variance;

        if variance_report.requires_wa_review {
            self.set_state(AdaptationState::Reviewing);
            cycle.state = AdaptationState::Reviewing;
            self.store_cycle_event(
                &cycle_id,
                "variance_exceeded",
                json!({
                    "variance": variance_report.total_variance,
                    "threshold": self.variance_threshold,
                }),
            )
            .await;
            self.finish_cycle(cycle).await;
            return CycleOutcome::ReviewRequired {
                cycle_id,
                variance: variance_report.total_variance,
            };
        }

        // 2. Detect patterns and harvest proposals.
        self.set_state(AdaptationState::Proposing);
        let analysis = self.feedback.detect_and_propose(true).await;
        cycle.patterns_detected = analysis.patterns_detected;
        cycle.proposals_generated = analysis.proposals.len();

        let pending = self.feedback.pending_proposals().await;

        // 3. Admit only what fits the variance budget.
        let admitted = filter_safe_proposals(
            pending,
            variance_report.total_variance,
            self.variance_threshold,
        );

        // 4. Apply what was admitted.
        let mut rolled_back = false;
        let mut applied: Vec<AdaptationProposal> = Vec::new();
        if !admitted.is_empty() {
            self.set_state(AdaptationState::Adapting);
            for mut proposal in admitted {
                self.store_cycle_event(
                    &cycle_id,
                    "applying_proposal",
                    json!({
                        "proposal_id": proposal.id,
                        "scope": proposal.scope.as_str(),
                        "confidence": proposal.confidence,
                    }),
                )
                .await;
                if self.feedback.apply_proposal(&mut proposal).await {
                    applied.push(proposal);
                }
            }
            cycle.changes_applied = applied.len();

            // 5. Did the changes push us over the line?
            if !applied.is_empty() {
                match self.variance_monitor.check_variance(true).await {
                    Ok(post) => {
                        cycle.variance_after = Some(post.total_variance);
                        if post.requires_wa_review {
                            warn!("changes exceeded variance threshold, rolling back");
                            self.rollback_changes(&applied).await;
                            rolled_back = true;
                            self.set_state(AdaptationState::Reviewing);
                        }
                    }
                    Err(e) => return CycleOutcome::Failed { error: e.to_string() },
                }
            }
        }

        // 6. Settle into the next state.
        if !rolled_back {
            if cycle.changes_applied > 0 {
                self.set_state(AdaptationState::Stabilizing);
                *self.last_adaptation.lock().expect("clock poisoned") = Utc::now();
            } else {
                self.set_state(AdaptationState::Learning);
            }
        }

        let new_state = self.current_state();
        cycle.state = new_state;
        let outcome = CycleOutcome::Completed {
            cycle_id,
            patterns_detected: cycle.patterns_detected,
            proposals_generated: cycle.proposals_generated,
            changes_applied: cycle.changes_applied,
            variance_before: cycle.variance_before,
            variance_after: cycle.variance_after,
            rolled_back,
            new_state,
        };
        self.finish_cycle(cycle).await;
        outcome
    }

    /// Exit the `reviewing` state after the Wise Authority has answered.
    pub async fn resume_after_review(&self, approved: bool) {
        if self.current_state() != AdaptationState::Reviewing {
            warn!("resume_after_review called outside reviewing state");
            return;
        }

        if approved {
            self.set_state(AdaptationState::Stabilizing);
            *self.last_adaptation.lock().expect("clock poisoned") = Utc::now();
            info!("WA review approved, entering stabilization");
        } else {
            self.set_state(AdaptationState::Learning);
            info!("WA review rejected, returning to learning");
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let node = GraphNode::new(
            format!("wa_review_outcome_{}", Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("review_type", json!("identity_variance"))
        .with_attribute("approved", json!(approved))
        .with_attribute("new_state", json!(self.current_state().as_str()))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;
    }

    /// Engage the sticky emergency stop. Every later cycle is a no-op;
    /// only a process restart clears it.
    pub async fn emergency_stop(&self, reason: &str) {
        self.engage_emergency_stop(reason).await;
    }

    async fn engage_emergency_stop(&self, reason: &str) {
        if self.emergency_stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("emergency stop activated: {}", reason);

        let node = GraphNode::new(
            format!("emergency_stop_{}", Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("event_type", json!("emergency_stop"))
        .with_attribute("reason", json!(reason))
        .with_attribute("previous_state", json!(self.current_state().as_str()))
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;
    }

    pub fn adaptation_status(&self) -> AdaptationStatus {
        AdaptationStatus {
            current_state: self.current_state(),
            emergency_stop: self.emergency_stopped.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            cycles_completed: self.history.lock().expect("history lock poisoned").len(),
            last_adaptation: *self.last_adaptation.lock().expect("clock poisoned"),
        }
    }

    fn set_state(&self, state: AdaptationState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    async fn rollback_changes(&self, proposals: &[AdaptationProposal]) {
        for proposal in proposals {
            let node = GraphNode::new(
                format!("rollback_{}_{}", proposal.id, Utc::now().timestamp()),
                NodeType::Config,
                proposal.scope,
            )
            .with_attribute("rollback_type", json!("variance_exceeded"))
            .with_attribute("original_proposal", json!(proposal.id))
            .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
            let result = self.memory.memorize(&node, HANDLER).await;
            if !result.is_ok() {
                error!("failed to write rollback node for {}", proposal.id);
            }
        }
    }

    async fn store_cycle_event(&self, cycle_id: &str, event_type: &str, data: serde_json::Value) {
        let node = GraphNode::new(
            format!("cycle_event_{}_{}_{}", cycle_id, event_type, Utc::now().timestamp()),
            NodeType::Concept,
            GraphScope::Local,
        )
        .with_attribute("cycle_id", json!(cycle_id))
        .with_attribute("event_type", json!(event_type))
        .with_attribute("data", data)
        .with_attribute("timestamp", json!(Utc::now().to_rfc3339()));
        self.memory.memorize(&node, HANDLER).await;
    }

    async fn finish_cycle(&self, mut cycle: AdaptationCycle) {
        cycle.completed_at = Some(Utc::now());

        let node = GraphNode::new(
            format!("cycle_summary_{}", cycle.cycle_id),
            NodeType::Concept,
            GraphScope::Identity,
        )
        .with_attribute("cycle_id", json!(cycle.cycle_id))
        .with_attribute("patterns_detected", json!(cycle.patterns_detected))
        .with_attribute("proposals_generated", json!(cycle.proposals_generated))
        .with_attribute("changes_applied", json!(cycle.changes_applied))
        .with_attribute("variance_before", json!(cycle.variance_before))
        .with_attribute("variance_after", json!(cycle.variance_after))
        .with_attribute("final_state", json!(cycle.state.as_str()))
        .with_attribute(
            "timestamp",
            json!(cycle.completed_at.unwrap_or_else(Utc::now).to_rfc3339()),
        );
        self.memory.memorize(&node, HANDLER).await;

        self.history.lock().expect("history lock poisoned").push(cycle);
    }
}

/// Projected variance impact of a proposal: a base cost by scope,
/// multiplied by 1.2 for every change beyond the first.
pub fn estimate_variance_impact(proposal: &AdaptationProposal) -> f64 {
    let base = match proposal.scope {
        GraphScope::Local => 0.02,
        GraphScope::Community => 0.03,
        GraphScope::Environment => 0.05,
        GraphScope::Identity => 0.10,
        GraphScope::Network => 0.05,
    };
    let changes = proposal.proposed_changes.len().max(1);
    base * (1.0 + 0.2 * (changes as f64 - 1.0))
}

/// Admit proposals against the remaining variance budget.
///
/// Proposals are considered LOCAL-scope first, then by descending
/// confidence. A proposal is admitted while its projected impact is under
/// half the remaining budget; each admission shrinks the budget, and the
/// filter stops outright once the budget falls to 5% or below.
pub fn filter_safe_proposals(
    proposals: Vec<AdaptationProposal>,
    current_variance: f64,
    threshold: f64,
) -> Vec<AdaptationProposal> {
    let mut remaining = threshold - current_variance;
    if remaining <= 0.0 {
        return Vec::new();
    }

    let mut sorted = proposals;
    sorted.sort_by(|a, b| {
        let a_local = a.scope == GraphScope::Local;
        let b_local = b.scope == GraphScope::Local;
        b_local
            .cmp(&a_local)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut admitted = Vec::new();
    for proposal in sorted {
        let impact = estimate_variance_impact(&proposal);
        if impact < remaining * 0.5 {
            remaining -= impact;
            admitted.push(proposal);
        }
        if remaining <= 0.05 {
            break;
        }
    }
    admitted
}
