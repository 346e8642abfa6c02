use async_trait::async_trait;
use mindfabric::buses::llm::{BreakerState, DistributionStrategy};
use mindfabric::buses::manager::BusManager;
use mindfabric::config::FabricConfig;
use mindfabric::registry::ServiceRegistry;
use mindfabric::service::{
    capability, ChatMessage, LlmService, MetricRecord, Priority, ProviderResult, ResourceLimits,
    ResourceUsage, Service, TelemetryService,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize, PartialEq)]
struct Answer {
    answer: String,
}

/// LLM provider that either fails every call or answers with a fixed
/// payload, optionally after a configured delay.
struct ScriptedLlm {
    name: String,
    fail: bool,
    delay: Option<Duration>,
    response: Value,
    usage: ResourceUsage,
    calls: AtomicU64,
}

impl ScriptedLlm {
    fn ok(name: &str, response: Value, usage: ResourceUsage) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            delay: None,
            response,
            usage,
            calls: AtomicU64::new(0),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            delay: None,
            response: Value::Null,
            usage: ResourceUsage::default(),
            calls: AtomicU64::new(0),
        })
    }

    fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            delay: Some(delay),
            response: json!({"answer": name}),
            usage: ResourceUsage::default(),
            calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Service for ScriptedLlm {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn call_llm_structured(
        &self,
        _messages: &[ChatMessage],
        _response_schema: &Value,
        _max_tokens: u32,
        _temperature: f64,
    ) -> ProviderResult<(Value, ResourceUsage)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(format!("{} is broken", self.name).into());
        }
        Ok((self.response.clone(), self.usage.clone()))
    }
}

/// Telemetry provider that records every metric it receives.
#[derive(Default)]
struct RecordingTelemetry {
    samples: Mutex<Vec<(String, f64, String, HashMap<String, String>)>>,
}

#[async_trait]
impl Service for RecordingTelemetry {
    fn name(&self) -> &str {
        "recording_telemetry"
    }
}

#[async_trait]
impl TelemetryService for RecordingTelemetry {
    async fn record_metric(
        &self,
        metric_name: &str,
        value: f64,
        handler_name: &str,
        tags: &HashMap<String, String>,
    ) -> ProviderResult<bool> {
        self.samples.lock().await.push((
            metric_name.to_string(),
            value,
            handler_name.to_string(),
            tags.clone(),
        ));
        Ok(true)
    }

    async fn record_resource_usage(
        &self,
        _usage: &ResourceUsage,
        _tags: &HashMap<String, String>,
    ) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn query_metrics(
        &self,
        _metric_names: &[String],
        _time_range: Option<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>,
        _tags: Option<&HashMap<String, String>>,
        _limit: usize,
    ) -> ProviderResult<Vec<MetricRecord>> {
        Ok(Vec::new())
    }

    async fn get_service_status(&self) -> ProviderResult<HashMap<String, bool>> {
        Ok(HashMap::new())
    }

    async fn get_resource_limits(&self) -> ProviderResult<ResourceLimits> {
        Ok(ResourceLimits::default())
    }
}

async fn fabric_with_strategy(
    strategy: DistributionStrategy,
) -> (BusManager, Arc<ServiceRegistry>, Arc<RecordingTelemetry>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = Arc::new(ServiceRegistry::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    registry
        .telemetry
        .register_global(
            "recording_telemetry",
            Arc::clone(&telemetry) as Arc<dyn TelemetryService>,
            Priority::Normal,
            &[capability::RECORD_METRIC, capability::QUERY_TELEMETRY],
            HashMap::new(),
        )
        .await;

    let mut config = FabricConfig::default();
    config.llm.distribution_strategy = strategy;
    let manager = BusManager::new(Arc::clone(&registry), &config);
    (manager, registry, telemetry)
}

async fn register_llm(registry: &ServiceRegistry, provider: Arc<ScriptedLlm>, priority: Priority) {
    let name = provider.name.clone();
    registry
        .llm
        .register_global(
            name,
            provider as Arc<dyn LlmService>,
            priority,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
}

#[tokio::test]
async fn failover_within_a_priority_group_with_telemetry() {
    let (manager, registry, telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;

    let p1 = ScriptedLlm::failing("P1");
    let p2 = ScriptedLlm::ok(
        "P2",
        json!({"answer": "hi"}),
        ResourceUsage {
            tokens_total: 10,
            cost_cents: 0.01,
            ..ResourceUsage::default()
        },
    );
    register_llm(&registry, Arc::clone(&p1), Priority::Critical).await;
    register_llm(&registry, Arc::clone(&p2), Priority::Critical).await;

    let (answer, usage) = manager
        .llm
        .generate_structured::<Answer>(
            &[ChatMessage::user("hi")],
            &json!({"type": "object"}),
            "H",
            1024,
            0.0,
        )
        .await
        .expect("failover should produce P2's answer");

    assert_eq!(answer, Answer { answer: "hi".to_string() });
    assert_eq!(usage.tokens_total, 10);
    assert_eq!(p1.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p2.calls.load(Ordering::SeqCst), 1);

    let p1_metrics = manager.llm.provider_metrics("P1").unwrap();
    assert_eq!(p1_metrics.total_requests, 1);
    assert_eq!(p1_metrics.failed_requests, 1);
    let p2_metrics = manager.llm.provider_metrics("P2").unwrap();
    assert_eq!(p2_metrics.total_requests, 1);
    assert_eq!(p2_metrics.failed_requests, 0);

    // Token and cost telemetry must be tagged with the winning provider
    // and the calling handler.
    let samples = telemetry.samples.lock().await;
    let tokens = samples
        .iter()
        .find(|(name, _, _, _)| name == "llm.tokens.total")
        .expect("token telemetry should be recorded");
    assert_eq!(tokens.1, 10.0);
    assert_eq!(tokens.3.get("service").map(String::as_str), Some("P2"));
    assert_eq!(tokens.3.get("handler").map(String::as_str), Some("H"));

    let cost = samples
        .iter()
        .find(|(name, _, _, _)| name == "llm.cost.cents")
        .expect("cost telemetry should be recorded");
    assert!((cost.1 - 0.01).abs() < 1e-9);
    assert_eq!(cost.3.get("service").map(String::as_str), Some("P2"));
}

#[tokio::test]
async fn lower_priority_group_is_only_reached_after_higher_fails() {
    let (manager, registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;

    let primary = ScriptedLlm::failing("primary");
    let backup = ScriptedLlm::ok("backup", json!({"answer": "backup"}), ResourceUsage::default());
    register_llm(&registry, Arc::clone(&primary), Priority::High).await;
    register_llm(&registry, Arc::clone(&backup), Priority::Low).await;

    let (answer, _usage) = manager
        .llm
        .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 256, 0.0)
        .await
        .unwrap();
    assert_eq!(answer.answer, "backup");
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn all_providers_failing_surfaces_last_error() {
    let (manager, registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;
    register_llm(&registry, ScriptedLlm::failing("only"), Priority::Normal).await;

    let result = manager
        .llm
        .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 256, 0.0)
        .await;
    let error = result.err().expect("call should fail").to_string();
    assert!(error.contains("all LLM services failed"), "got: {}", error);
    assert!(error.contains("only is broken"), "got: {}", error);
}

#[tokio::test]
async fn no_registered_provider_is_reported_distinctly() {
    let (manager, _registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;

    let error = manager
        .llm
        .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 256, 0.0)
        .await
        .err()
        .unwrap()
        .to_string();
    assert!(error.contains("no llm provider available"), "got: {}", error);
}

#[tokio::test]
async fn latency_based_routing_prefers_the_faster_provider() {
    let (manager, registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::LatencyBased).await;

    let fast = ScriptedLlm::slow("fast", Duration::from_millis(5));
    let slow = ScriptedLlm::slow("slow", Duration::from_millis(60));
    register_llm(&registry, Arc::clone(&fast), Priority::Normal).await;
    register_llm(&registry, Arc::clone(&slow), Priority::Normal).await;

    // Warm both providers up so each has a latency profile.
    for _ in 0..2 {
        manager
            .llm
            .generate_structured::<Answer>(&[ChatMessage::user("warm")], &json!({}), "H", 64, 0.0)
            .await
            .unwrap();
    }
    let fast_after_warmup = fast.calls.load(Ordering::SeqCst);

    let trials = 10;
    for _ in 0..trials {
        manager
            .llm
            .generate_structured::<Answer>(&[ChatMessage::user("go")], &json!({}), "H", 64, 0.0)
            .await
            .unwrap();
    }

    let fast_calls = fast.calls.load(Ordering::SeqCst) - fast_after_warmup;
    assert!(
        fast_calls * 10 >= trials * 8,
        "fast provider took only {}/{} routed calls",
        fast_calls,
        trials
    );
}

#[tokio::test]
async fn round_robin_rotates_within_the_priority_group() {
    let (manager, registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;

    let a = ScriptedLlm::ok("a", json!({"answer": "a"}), ResourceUsage::default());
    let b = ScriptedLlm::ok("b", json!({"answer": "b"}), ResourceUsage::default());
    register_llm(&registry, Arc::clone(&a), Priority::Normal).await;
    register_llm(&registry, Arc::clone(&b), Priority::Normal).await;

    for _ in 0..4 {
        manager
            .llm
            .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 64, 0.0)
            .await
            .unwrap();
    }
    assert_eq!(a.calls.load(Ordering::SeqCst), 2);
    assert_eq!(b.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures_and_skips_the_provider() {
    let (manager, registry, _telemetry) =
        fabric_with_strategy(DistributionStrategy::RoundRobin).await;

    let broken = ScriptedLlm::failing("broken");
    register_llm(&registry, Arc::clone(&broken), Priority::Normal).await;

    // Default breaker threshold is five consecutive failures.
    for _ in 0..5 {
        let _ = manager
            .llm
            .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 64, 0.0)
            .await;
    }
    assert_eq!(manager.llm.breaker_state("broken"), Some(BreakerState::Open));
    assert_eq!(broken.calls.load(Ordering::SeqCst), 5);

    // With the breaker open the provider is skipped without being invoked.
    let _ = manager
        .llm
        .generate_structured::<Answer>(&[ChatMessage::user("x")], &json!({}), "H", 64, 0.0)
        .await;
    assert_eq!(broken.calls.load(Ordering::SeqCst), 5);

    let stats = manager.llm.service_stats();
    assert_eq!(stats["broken"].circuit_breaker_state, "open");
    assert_eq!(stats["broken"].failed_requests, 5);
}
