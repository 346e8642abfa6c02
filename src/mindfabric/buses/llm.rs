//! LLM bus.
//!
//! Dispatches structured-generation requests across every registered LLM
//! provider with redundancy: providers are grouped by priority, one is
//! picked per group by the configured [`DistributionStrategy`], a
//! per-provider [`CircuitBreaker`] gates the call, and on failure the bus
//! fails over to the next provider in the group, then the next group. The
//! call that finally succeeds has its token, cost, environmental, and
//! latency figures emitted through the telemetry bus.
//!
//! # Request flow
//!
//! ```text
//! generate_structured::<T>()
//!   └─ enumerate healthy providers with "call_llm_structured"
//!   └─ group by priority, ascending
//!       └─ order group by strategy (round-robin / latency / random / least-loaded)
//!           └─ circuit breaker closed? ── no ──▶ skip provider
//!           └─ call provider
//!               ├─ ok: record latency, emit llm.* metrics, deserialize T, return
//!               └─ err: record failure, try next provider / next group
//!   └─ everything failed ──▶ AllProvidersFailed { last_error }
//! ```

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::buses::telemetry::TelemetryBus;
use crate::mindfabric::config::{CircuitBreakerConfig, LlmBusConfig};
use crate::mindfabric::error::{FabricError, FabricResult};
use crate::mindfabric::registry::{Registration, ServiceRegistry};
use crate::mindfabric::service::{
    capability, ChatMessage, LlmService, Priority, ResourceUsage, ServiceType,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

/// How requests are spread across providers within one priority group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    RoundRobin,
    LatencyBased,
    Random,
    LeastLoaded,
}

/// Rolling metrics for a single LLM provider.
#[derive(Debug, Clone, Default)]
pub struct ServiceMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: f64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ServiceMetrics {
    pub fn average_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total_requests as f64
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Per-provider failure governor.
///
/// `failure_threshold` consecutive failures open the breaker; after
/// `recovery_timeout` the next call attempt transitions it to half-open,
/// where up to `half_open_max_calls` probes are allowed. That many
/// successes close it again; any half-open failure reopens it and restarts
/// the recovery timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            failure_count: 0,
            last_failure: None,
            state: BreakerState::Closed,
            half_open_calls: 0,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs_f64(config.recovery_timeout_s),
            config.half_open_max_calls,
        )
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a call may be attempted right now. An open breaker whose
    /// recovery timeout has elapsed transitions to half-open here.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let recovered = self
                    .last_failure
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_calls = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => self.half_open_calls < self.half_open_max_calls,
        }
    }

    pub fn record_success(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.half_open_calls += 1;
            if self.half_open_calls >= self.half_open_max_calls {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
            }
        } else {
            self.failure_count = 0;
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.failure_count >= self.failure_threshold {
            self.state = BreakerState::Open;
        } else if self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.half_open_calls = 0;
        }
    }
}

/// One row of the per-provider stats table.
#[derive(Debug, Clone, Serialize)]
pub struct LlmProviderStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub failure_rate: f64,
    pub average_latency_ms: f64,
    pub consecutive_failures: u32,
    pub circuit_breaker_state: &'static str,
    pub last_request: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Message bus for all LLM operations, with redundancy and distribution.
pub struct LlmBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
    telemetry: Arc<TelemetryBus>,
    strategy: DistributionStrategy,
    breaker_config: CircuitBreakerConfig,
    metrics: StdMutex<HashMap<String, ServiceMetrics>>,
    breakers: StdMutex<HashMap<String, CircuitBreaker>>,
    round_robin: StdMutex<HashMap<Priority, usize>>,
}

impl LlmBus {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        telemetry: Arc<TelemetryBus>,
        config: &LlmBusConfig,
        max_queue_size: usize,
    ) -> Self {
        debug!(
            "LLM bus initialized with {:?} distribution strategy",
            config.distribution_strategy
        );
        Self {
            core: BusCore::new(ServiceType::Llm, max_queue_size),
            registry,
            telemetry,
            strategy: config.distribution_strategy,
            breaker_config: config.circuit_breaker.clone(),
            metrics: StdMutex::new(HashMap::new()),
            breakers: StdMutex::new(HashMap::new()),
            round_robin: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Llm)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Generate a structured response and deserialize it into `T`.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        messages: &[ChatMessage],
        response_schema: &Value,
        handler_name: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> FabricResult<(T, ResourceUsage)> {
        let (value, usage) = self
            .generate_value(messages, response_schema, handler_name, max_tokens, temperature)
            .await?;
        let typed = serde_json::from_value(value)?;
        Ok((typed, usage))
    }

    /// Generate a structured response as a raw JSON value.
    ///
    /// Handles provider discovery, priority grouping, strategy-based
    /// ordering, circuit breaking, failover, metrics, and telemetry.
    pub async fn generate_value(
        &self,
        messages: &[ChatMessage],
        response_schema: &Value,
        handler_name: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> FabricResult<(Value, ResourceUsage)> {
        let providers = self
            .registry
            .llm
            .get_all(handler_name, &[capability::CALL_LLM_STRUCTURED])
            .await;

        if providers.is_empty() {
            return Err(FabricError::ProviderUnavailable("llm"));
        }

        let mut groups: BTreeMap<Priority, Vec<Registration<dyn LlmService>>> = BTreeMap::new();
        for registration in providers {
            groups
                .entry(registration.priority)
                .or_insert_with(Vec::new)
                .push(registration);
        }

        let mut last_error = String::from("no provider attempted");

        for (priority, group) in groups {
            let ordered = self.order_by_strategy(group, priority);

            for registration in ordered {
                if !self.breaker_allows(&registration.name) {
                    warn!(
                        "circuit breaker OPEN for {}, skipping",
                        registration.name
                    );
                    last_error = format!("circuit breaker open for {}", registration.name);
                    continue;
                }

                debug!(
                    "calling LLM provider {} for {}",
                    registration.name, handler_name
                );
                let start = Instant::now();
                match registration
                    .service
                    .call_llm_structured(messages, response_schema, max_tokens, temperature)
                    .await
                {
                    Ok((value, usage)) => {
                        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                        self.record_success(&registration.name, latency_ms);
                        self.emit_usage_metrics(&registration.name, handler_name, &usage, latency_ms)
                            .await;
                        debug!(
                            "LLM call successful via {} ({:.2}ms)",
                            registration.name, latency_ms
                        );
                        return Ok((value, usage));
                    }
                    Err(e) => {
                        self.record_failure(&registration.name);
                        last_error = e.to_string();
                        warn!(
                            "LLM provider {} failed for {}: {}",
                            registration.name, handler_name, last_error
                        );
                    }
                }
            }
        }

        Err(FabricError::AllProvidersFailed {
            handler: handler_name.to_string(),
            last_error,
        })
    }

    /// Order one priority group by the configured strategy: the selected
    /// provider first, the rest kept as failover candidates in
    /// registration order.
    fn order_by_strategy(
        &self,
        group: Vec<Registration<dyn LlmService>>,
        priority: Priority,
    ) -> Vec<Registration<dyn LlmService>> {
        if group.len() <= 1 {
            return group;
        }

        let chosen = match self.strategy {
            DistributionStrategy::RoundRobin => {
                let mut counters = self.round_robin.lock().expect("round robin lock poisoned");
                let counter = counters.entry(priority).or_insert(0);
                let index = *counter % group.len();
                *counter += 1;
                index
            }
            DistributionStrategy::LatencyBased => {
                let metrics = self.metrics.lock().expect("metrics lock poisoned");
                let mut best = 0usize;
                let mut best_latency = f64::INFINITY;
                let mut untried = None;
                for (i, registration) in group.iter().enumerate() {
                    match metrics.get(&registration.name) {
                        // A provider that has never been called gets the
                        // first chance to establish a latency profile.
                        None => {
                            untried = Some(i);
                            break;
                        }
                        Some(m) if m.total_requests == 0 => {
                            untried = Some(i);
                            break;
                        }
                        Some(m) => {
                            if m.average_latency_ms() < best_latency {
                                best_latency = m.average_latency_ms();
                                best = i;
                            }
                        }
                    }
                }
                untried.unwrap_or(best)
            }
            DistributionStrategy::Random => rand::thread_rng().gen_range(0..group.len()),
            DistributionStrategy::LeastLoaded => {
                let metrics = self.metrics.lock().expect("metrics lock poisoned");
                let mut best = 0usize;
                let mut fewest = u64::MAX;
                for (i, registration) in group.iter().enumerate() {
                    let requests = metrics
                        .get(&registration.name)
                        .map(|m| m.total_requests)
                        .unwrap_or(0);
                    if requests < fewest {
                        fewest = requests;
                        best = i;
                    }
                }
                best
            }
        };

        let mut ordered = group;
        let selected = ordered.remove(chosen);
        ordered.insert(0, selected);
        ordered
    }

    fn breaker_allows(&self, provider_name: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        breakers
            .entry(provider_name.to_string())
            .or_insert_with(|| CircuitBreaker::from_config(&self.breaker_config))
            .can_execute()
    }

    fn record_success(&self, provider_name: &str, latency_ms: f64) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let m = metrics.entry(provider_name.to_string()).or_default();
            m.total_requests += 1;
            m.total_latency_ms += latency_ms;
            m.last_request_time = Some(Utc::now());
            m.consecutive_failures = 0;
        }
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        if let Some(breaker) = breakers.get_mut(provider_name) {
            breaker.record_success();
        }
    }

    fn record_failure(&self, provider_name: &str) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let m = metrics.entry(provider_name.to_string()).or_default();
            m.total_requests += 1;
            m.failed_requests += 1;
            m.last_failure_time = Some(Utc::now());
            m.consecutive_failures += 1;
        }
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        breakers
            .entry(provider_name.to_string())
            .or_insert_with(|| CircuitBreaker::from_config(&self.breaker_config))
            .record_failure();
    }

    /// Emit token, cost, environmental, and latency metrics for one call.
    /// Telemetry failures are logged and never affect the caller's result.
    async fn emit_usage_metrics(
        &self,
        service_name: &str,
        handler_name: &str,
        usage: &ResourceUsage,
        latency_ms: f64,
    ) {
        let mut tags = HashMap::new();
        tags.insert("service".to_string(), service_name.to_string());
        tags.insert(
            "model".to_string(),
            usage.model_used.clone().unwrap_or_else(|| "unknown".to_string()),
        );
        tags.insert("handler".to_string(), handler_name.to_string());

        let mut samples: Vec<(&str, f64)> = vec![("llm.tokens.total", usage.tokens_total as f64)];
        if usage.tokens_input > 0 {
            samples.push(("llm.tokens.input", usage.tokens_input as f64));
        }
        if usage.tokens_output > 0 {
            samples.push(("llm.tokens.output", usage.tokens_output as f64));
        }
        if usage.cost_cents > 0.0 {
            samples.push(("llm.cost.cents", usage.cost_cents));
        }
        if usage.water_ml > 0.0 {
            samples.push(("llm.environmental.water_ml", usage.water_ml));
        }
        if usage.carbon_g > 0.0 {
            samples.push(("llm.environmental.carbon_g", usage.carbon_g));
        }
        if usage.energy_kwh > 0.0 {
            samples.push(("llm.environmental.energy_kwh", usage.energy_kwh));
        }
        samples.push(("llm.latency.ms", latency_ms));

        for (metric_name, value) in samples {
            if !self
                .telemetry
                .record_metric(metric_name, value, handler_name, &tags)
                .await
            {
                warn!("failed to record telemetry for {}", metric_name);
            }
        }
    }

    /// Metrics snapshot for one provider.
    pub fn provider_metrics(&self, provider_name: &str) -> Option<ServiceMetrics> {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .get(provider_name)
            .cloned()
    }

    /// Breaker state for one provider, if it has been exercised.
    pub fn breaker_state(&self, provider_name: &str) -> Option<BreakerState> {
        self.breakers
            .lock()
            .expect("breakers lock poisoned")
            .get(provider_name)
            .map(CircuitBreaker::state)
    }

    /// The full per-provider stats table.
    pub fn service_stats(&self) -> HashMap<String, LlmProviderStats> {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let breakers = self.breakers.lock().expect("breakers lock poisoned");
        metrics
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    LlmProviderStats {
                        total_requests: m.total_requests,
                        failed_requests: m.failed_requests,
                        failure_rate: m.failure_rate(),
                        average_latency_ms: m.average_latency_ms(),
                        consecutive_failures: m.consecutive_failures,
                        circuit_breaker_state: breakers
                            .get(name)
                            .map(|b| b.state().as_str())
                            .unwrap_or("none"),
                        last_request: m.last_request_time,
                        last_failure: m.last_failure_time,
                    },
                )
            })
            .collect()
    }

    pub fn distribution_strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn queue_size(&self) -> usize {
        self.core.queue_size()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn stats(&self) -> BusStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_millis(50), 3)
    }

    #[test]
    fn breaker_opens_after_exactly_threshold_failures() {
        let mut breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn breaker_half_opens_after_recovery_and_closes_on_successes() {
        let mut breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_reopens_on_half_open_failure() {
        let mut breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn breaker_limits_half_open_probes() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10), 2);
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute()); // transitions to half-open
        assert!(breaker.can_execute()); // still under the probe budget
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn metrics_derive_average_latency_and_failure_rate() {
        let mut m = ServiceMetrics::default();
        m.total_requests = 4;
        m.failed_requests = 1;
        m.total_latency_ms = 200.0;
        assert!((m.average_latency_ms() - 50.0).abs() < f64::EPSILON);
        assert!((m.failure_rate() - 0.25).abs() < f64::EPSILON);

        let empty = ServiceMetrics::default();
        assert_eq!(empty.average_latency_ms(), 0.0);
        assert_eq!(empty.failure_rate(), 0.0);
    }
}
