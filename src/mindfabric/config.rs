//! Runtime configuration.
//!
//! [`FabricConfig`] gathers the tunables of every subsystem with the
//! documented defaults. Construct it manually, tweak the fields you care
//! about, or load it from a JSON file. The core reads no other
//! configuration source; provider credentials and endpoints belong to the
//! adapters, not here.
//!
//! # Example
//!
//! ```rust
//! use mindfabric::config::FabricConfig;
//! use mindfabric::buses::llm::DistributionStrategy;
//!
//! let mut config = FabricConfig::default();
//! config.llm.distribution_strategy = DistributionStrategy::RoundRobin;
//! config.buses.max_queue_size = 500;
//! assert_eq!(config.variance.variance_threshold, 0.20);
//! ```

use crate::mindfabric::buses::llm::DistributionStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Queue tunables shared by every bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bounded queue capacity per bus.
    pub max_queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
        }
    }
}

/// Per-provider circuit breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before allowing a half-open probe.
    pub recovery_timeout_s: f64,
    /// Successful half-open calls required to close the breaker again.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_s: 60.0,
            half_open_max_calls: 3,
        }
    }
}

/// LLM bus tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmBusConfig {
    /// How requests are spread across providers within a priority group.
    pub distribution_strategy: DistributionStrategy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for LlmBusConfig {
    fn default() -> Self {
        Self {
            distribution_strategy: DistributionStrategy::LatencyBased,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Identity variance monitor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceConfig {
    /// Drift fraction at which Wise Authority review is required.
    pub variance_threshold: f64,
    pub check_interval_hours: u32,
}

impl Default for VarianceConfig {
    fn default() -> Self {
        Self {
            variance_threshold: 0.20,
            check_interval_hours: 24,
        }
    }
}

/// Pattern feedback loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Minimum confidence for a detected pattern to yield a proposal.
    pub pattern_threshold: f64,
    /// Minimum confidence for a LOCAL-scope proposal to auto-apply.
    pub adaptation_threshold: f64,
    pub analysis_interval_hours: u32,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            pattern_threshold: 0.7,
            adaptation_threshold: 0.8,
            analysis_interval_hours: 6,
        }
    }
}

/// Self-configuration orchestrator tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfConfigConfig {
    pub stabilization_period_hours: u32,
    /// Consecutive failed cycles before the emergency stop engages.
    pub max_consecutive_failures: u32,
    /// Minimum spacing between adaptation cycles.
    pub adaptation_interval_hours: u32,
}

impl Default for SelfConfigConfig {
    fn default() -> Self {
        Self {
            stabilization_period_hours: 24,
            max_consecutive_failures: 3,
            adaptation_interval_hours: 6,
        }
    }
}

/// Unified telemetry / consolidation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub consolidation_threshold_hours: u32,
    pub grace_window_hours: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold_hours: 24,
            grace_window_hours: 72,
        }
    }
}

/// Task scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_s: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval_s: 1.0 }
    }
}

/// Root configuration for the runtime core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub buses: BusConfig,
    pub llm: LlmBusConfig,
    pub variance: VarianceConfig,
    pub feedback: FeedbackConfig,
    pub self_config: SelfConfigConfig,
    pub telemetry: TelemetryConfig,
    pub scheduler: SchedulerConfig,
}

impl FabricConfig {
    /// Load configuration from a JSON file. Missing keys take their
    /// defaults; unknown keys are ignored.
    pub fn from_json_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FabricConfig::default();
        assert_eq!(config.buses.max_queue_size, 1000);
        assert_eq!(config.llm.circuit_breaker.failure_threshold, 5);
        assert!((config.llm.circuit_breaker.recovery_timeout_s - 60.0).abs() < f64::EPSILON);
        assert_eq!(config.llm.circuit_breaker.half_open_max_calls, 3);
        assert!((config.variance.variance_threshold - 0.20).abs() < f64::EPSILON);
        assert_eq!(config.variance.check_interval_hours, 24);
        assert!((config.feedback.pattern_threshold - 0.7).abs() < f64::EPSILON);
        assert!((config.feedback.adaptation_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.feedback.analysis_interval_hours, 6);
        assert_eq!(config.self_config.stabilization_period_hours, 24);
        assert_eq!(config.self_config.max_consecutive_failures, 3);
        assert_eq!(config.telemetry.consolidation_threshold_hours, 24);
        assert_eq!(config.telemetry.grace_window_hours, 72);
        assert!((config.scheduler.tick_interval_s - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: FabricConfig =
            serde_json::from_str(r#"{"buses": {"max_queue_size": 64}}"#).unwrap();
        assert_eq!(config.buses.max_queue_size, 64);
        assert_eq!(config.variance.check_interval_hours, 24);
    }
}
