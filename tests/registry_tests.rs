use async_trait::async_trait;
use mindfabric::registry::ServiceRegistry;
use mindfabric::service::{
    capability, ChatMessage, LlmService, Priority, ProviderResult, ResourceUsage, Service,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct StubLlm {
    name: String,
    healthy: AtomicBool,
}

impl StubLlm {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Service for StubLlm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for StubLlm {
    async fn call_llm_structured(
        &self,
        _messages: &[ChatMessage],
        _response_schema: &Value,
        _max_tokens: u32,
        _temperature: f64,
    ) -> ProviderResult<(Value, ResourceUsage)> {
        Ok((json!({"from": self.name}), ResourceUsage::default()))
    }
}

#[tokio::test]
async fn lowest_priority_number_wins_with_capability_coverage() {
    let registry = ServiceRegistry::new();

    registry
        .llm
        .register_global(
            "low-priority",
            StubLlm::new("low-priority"),
            Priority::Low,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
    registry
        .llm
        .register_global(
            "high-priority",
            StubLlm::new("high-priority"),
            Priority::High,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
    // Better priority but missing the required capability: must be skipped.
    registry
        .llm
        .register_global(
            "critical-but-capless",
            StubLlm::new("critical-but-capless"),
            Priority::Critical,
            &[],
            HashMap::new(),
        )
        .await;

    let selected = registry
        .llm
        .get("any_handler", &[capability::CALL_LLM_STRUCTURED])
        .await
        .expect("a provider should qualify");
    assert_eq!(selected.name, "high-priority");
}

#[tokio::test]
async fn handler_specific_beats_global_regardless_of_priority() {
    let registry = ServiceRegistry::new();

    registry
        .llm
        .register_global(
            "global-critical",
            StubLlm::new("global-critical"),
            Priority::Critical,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
    registry
        .llm
        .register(
            "speak_handler",
            "handler-low",
            StubLlm::new("handler-low"),
            Priority::Low,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;

    let selected = registry
        .llm
        .get("speak_handler", &[capability::CALL_LLM_STRUCTURED])
        .await
        .unwrap();
    assert_eq!(selected.name, "handler-low");

    // A different handler has no specific registration and falls through
    // to the global bucket.
    let fallback = registry
        .llm
        .get("other_handler", &[capability::CALL_LLM_STRUCTURED])
        .await
        .unwrap();
    assert_eq!(fallback.name, "global-critical");
}

#[tokio::test]
async fn equal_priority_ties_break_by_registration_order() {
    let registry = ServiceRegistry::new();
    for name in ["first", "second", "third"] {
        registry
            .llm
            .register_global(
                name,
                StubLlm::new(name),
                Priority::Normal,
                &[capability::CALL_LLM_STRUCTURED],
                HashMap::new(),
            )
            .await;
    }

    let selected = registry
        .llm
        .get("h", &[capability::CALL_LLM_STRUCTURED])
        .await
        .unwrap();
    assert_eq!(selected.name, "first");
}

#[tokio::test]
async fn unhealthy_providers_are_skipped() {
    let registry = ServiceRegistry::new();
    let sick = StubLlm::new("sick");
    sick.healthy.store(false, Ordering::SeqCst);

    registry
        .llm
        .register_global(
            "sick",
            sick,
            Priority::Critical,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
    registry
        .llm
        .register_global(
            "well",
            StubLlm::new("well"),
            Priority::Low,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;

    let selected = registry
        .llm
        .get("h", &[capability::CALL_LLM_STRUCTURED])
        .await
        .unwrap();
    assert_eq!(selected.name, "well");
}

#[tokio::test]
async fn no_qualifying_provider_returns_none() {
    let registry = ServiceRegistry::new();
    registry
        .llm
        .register_global(
            "capless",
            StubLlm::new("capless"),
            Priority::Normal,
            &["something_else"],
            HashMap::new(),
        )
        .await;

    assert!(registry
        .llm
        .get("h", &[capability::CALL_LLM_STRUCTURED])
        .await
        .is_none());
    assert!(registry
        .llm
        .get_all("h", &[capability::CALL_LLM_STRUCTURED])
        .await
        .is_empty());
}

#[tokio::test]
async fn get_all_lists_handler_then_global_in_priority_order() {
    let registry = ServiceRegistry::new();
    registry
        .llm
        .register(
            "h",
            "mine",
            StubLlm::new("mine"),
            Priority::Low,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;
    registry
        .llm
        .register_global(
            "shared",
            StubLlm::new("shared"),
            Priority::Critical,
            &[capability::CALL_LLM_STRUCTURED],
            HashMap::new(),
        )
        .await;

    let all = registry
        .llm
        .get_all("h", &[capability::CALL_LLM_STRUCTURED])
        .await;
    let names: Vec<&str> = all.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["mine", "shared"]);

    assert_eq!(registry.llm.len().await, 2);
    assert!(registry.tool.is_empty().await);
}
