use async_trait::async_trait;
use mindfabric::action::HandlerActionType;
use mindfabric::buses::manager::BusManager;
use mindfabric::config::FabricConfig;
use mindfabric::graph::{GraphNode, GraphScope, MemoryQuery, NodeType};
use mindfabric::persistence::{GraphStore, LocalGraphMemoryService};
use mindfabric::registry::ServiceRegistry;
use mindfabric::service::{
    capability, DeferralContext, GuidanceContext, MemoryService, Priority, ProviderResult,
    Service, WiseAuthorityService,
};
use mindfabric::variance::{AgentIdentity, IdentityVarianceMonitor};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Wise Authority provider that records every deferral it receives.
#[derive(Default)]
struct RecordingWise {
    deferrals: Mutex<Vec<DeferralContext>>,
}

#[async_trait]
impl Service for RecordingWise {
    fn name(&self) -> &str {
        "recording_wise"
    }
}

#[async_trait]
impl WiseAuthorityService for RecordingWise {
    async fn fetch_guidance(&self, _context: &GuidanceContext) -> ProviderResult<Option<String>> {
        Ok(None)
    }

    async fn send_deferral(&self, context: &DeferralContext) -> ProviderResult<bool> {
        self.deferrals.lock().await.push(context.clone());
        Ok(true)
    }
}

async fn variance_fixture() -> (BusManager, Arc<RecordingWise>, IdentityVarianceMonitor) {
    let registry = Arc::new(ServiceRegistry::new());
    let store = Arc::new(GraphStore::open_in_memory().unwrap());
    let memory = Arc::new(LocalGraphMemoryService::new(store));
    registry
        .memory
        .register_global(
            "local_graph_memory",
            memory as Arc<dyn MemoryService>,
            Priority::Normal,
            &[
                capability::MEMORIZE,
                capability::RECALL,
                capability::FORGET,
                capability::RECALL_TIMESERIES,
                capability::MEMORIZE_METRIC,
                capability::MEMORIZE_LOG,
            ],
            HashMap::new(),
        )
        .await;

    let wise = Arc::new(RecordingWise::default());
    registry
        .wise
        .register_global(
            "recording_wise",
            Arc::clone(&wise) as Arc<dyn WiseAuthorityService>,
            Priority::Normal,
            &[capability::SEND_DEFERRAL, capability::FETCH_GUIDANCE],
            HashMap::new(),
        )
        .await;

    let config = FabricConfig::default();
    let manager = BusManager::new(registry, &config);
    let monitor = IdentityVarianceMonitor::new(
        Arc::clone(&manager.memory),
        Arc::clone(&manager.wise),
        &config.variance,
    );
    (manager, wise, monitor)
}

fn seed_identity() -> AgentIdentity {
    let mut overrides = Map::new();
    overrides.insert("A".to_string(), json!(1));
    overrides.insert("B".to_string(), json!(2));
    AgentIdentity {
        agent_id: "agent-1".to_string(),
        purpose: "assist with care".to_string(),
        role_description: "general assistant".to_string(),
        permitted_actions: vec![HandlerActionType::Observe, HandlerActionType::Speak],
        restricted_capabilities: vec![],
        action_selection_overrides: overrides,
        trust_overrides: Map::new(),
    }
}

async fn memorize_capability(manager: &BusManager, capability_name: &str) {
    let node = GraphNode::new(
        format!("capability_change_{}", capability_name),
        NodeType::Agent,
        GraphScope::Identity,
    )
    .with_attribute("node_type", json!("capability_change"))
    .with_attribute("capability", json!(capability_name));
    manager.memory.memorize(&node, "test").await;
}

#[tokio::test]
async fn baseline_is_frozen_with_a_pointer_node() {
    let (manager, _wise, monitor) = variance_fixture().await;
    let baseline_id = monitor.initialize_baseline(&seed_identity()).await.unwrap();

    let pointer = manager
        .memory
        .recall(
            &MemoryQuery::exact("identity_baseline_current", GraphScope::Identity),
            "test",
        )
        .await;
    assert_eq!(pointer.len(), 1);
    assert_eq!(pointer[0].attr_str("baseline_id"), Some(baseline_id.as_str()));

    let baseline = manager
        .memory
        .recall(&MemoryQuery::exact(&baseline_id, GraphScope::Identity), "test")
        .await;
    assert_eq!(baseline[0].attr_bool("immutable"), Some(true));
    assert_eq!(baseline[0].attr_str("snapshot_type"), Some("baseline"));

    // The baseline resists overwriting.
    let overwrite = GraphNode::new(baseline_id, NodeType::Agent, GraphScope::Identity);
    let result = manager.memory.memorize(&overwrite, "test").await;
    assert_eq!(result.status, mindfabric::graph::MemoryOpStatus::Denied);
}

#[tokio::test]
async fn undrifted_identity_has_zero_variance() {
    let (_manager, wise, monitor) = variance_fixture().await;
    monitor.initialize_baseline(&seed_identity()).await.unwrap();

    let report = monitor.check_variance(true).await.unwrap();
    assert_eq!(report.total_variance, 0.0);
    assert!(!report.requires_wa_review);
    assert!(wise.deferrals.lock().await.is_empty());
}

#[tokio::test]
async fn staged_drift_crosses_the_review_threshold() {
    let (manager, wise, monitor) = variance_fixture().await;
    monitor.initialize_baseline(&seed_identity()).await.unwrap();

    // Stage 1: modify one boundary, add one, and grow two capabilities.
    // Two critical + two high = (2×5 + 2×3)/100 = 0.16, under the gate.
    let ethics = GraphNode::new(
        "config/ethical_boundaries/drift",
        NodeType::Config,
        GraphScope::Identity,
    )
    .with_attribute("config_type", json!("ethical_boundaries"))
    .with_attribute("values", json!({"A": 9, "B": 2, "C": 3}));
    manager.memory.memorize(&ethics, "test").await;

    for capability_name in ["OBSERVE", "SPEAK", "TOOL", "MEMORIZE"] {
        memorize_capability(&manager, capability_name).await;
    }

    let report = monitor.check_variance(true).await.unwrap();
    assert!((report.total_variance - 0.16).abs() < 1e-9, "got {}", report.total_variance);
    assert!(!report.requires_wa_review);
    assert_eq!(wise.deferrals.lock().await.len(), 0);

    // Stage 2: drop boundary B. Three critical + two high = 0.21 ≥ 0.20.
    let ethics = GraphNode::new(
        "config/ethical_boundaries/drift",
        NodeType::Config,
        GraphScope::Identity,
    )
    .with_attribute("config_type", json!("ethical_boundaries"))
    .with_attribute("values", json!({"A": 9, "C": 3}));
    manager.memory.memorize(&ethics, "test").await;

    let report = monitor.check_variance(true).await.unwrap();
    assert!((report.total_variance - 0.21).abs() < 1e-9, "got {}", report.total_variance);
    assert!(report.requires_wa_review);
    assert_eq!(wise.deferrals.lock().await.len(), 1);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("WA review required")));

    // Every check past the threshold emits exactly one more request.
    let report = monitor.check_variance(true).await.unwrap();
    assert!(report.requires_wa_review);
    assert_eq!(wise.deferrals.lock().await.len(), 2);
}

#[tokio::test]
async fn variance_report_is_persisted_to_the_graph() {
    let (manager, _wise, monitor) = variance_fixture().await;
    monitor.initialize_baseline(&seed_identity()).await.unwrap();
    monitor.check_variance(true).await.unwrap();

    let reports = manager
        .memory
        .recall(&MemoryQuery::wildcard("variance_report_", GraphScope::Identity), "test")
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].attr_str("report_type"), Some("identity_variance"));
}

#[tokio::test]
async fn baseline_pointer_survives_a_new_monitor_instance() {
    let (manager, _wise, monitor) = variance_fixture().await;
    monitor.initialize_baseline(&seed_identity()).await.unwrap();

    // A second monitor over the same graph resolves the baseline through
    // the pointer node rather than in-memory state.
    let config = FabricConfig::default();
    let fresh = IdentityVarianceMonitor::new(
        Arc::clone(&manager.memory),
        Arc::clone(&manager.wise),
        &config.variance,
    );
    let report = fresh.check_variance(true).await.unwrap();
    assert_eq!(report.total_variance, 0.0);
}
