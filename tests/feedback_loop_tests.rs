use chrono::{Duration, TimeZone, Utc};
use mindfabric::action::HandlerAction;
use mindfabric::buses::manager::BusManager;
use mindfabric::config::FabricConfig;
use mindfabric::feedback::ConfigurationFeedbackLoop;
use mindfabric::graph::{GraphScope, MemoryQuery, TsdbNode};
use mindfabric::persistence::{GraphStore, LocalGraphMemoryService};
use mindfabric::registry::ServiceRegistry;
use mindfabric::service::{capability, MemoryService, Priority};
use std::collections::HashMap;
use std::sync::Arc;

async fn feedback_fixture() -> (BusManager, Arc<GraphStore>, ConfigurationFeedbackLoop) {
    let registry = Arc::new(ServiceRegistry::new());
    let store = Arc::new(GraphStore::open_in_memory().unwrap());
    let memory = Arc::new(LocalGraphMemoryService::new(Arc::clone(&store)));
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

    let config = FabricConfig::default();
    let manager = BusManager::new(registry, &config);
    let feedback = ConfigurationFeedbackLoop::new(Arc::clone(&manager.memory), &config.feedback);
    (manager, store, feedback)
}

fn seed_audit_event(store: &GraphStore, index: usize, action: HandlerAction, at: chrono::DateTime<Utc>) {
    let kind = action.kind();
    let node = action.audit_node("success", GraphScope::Local).at(at);
    let mut graph_node = node.to_graph_node();
    graph_node.id = format!("audit_{}_{}", kind, index);
    store.add_node(&graph_node).unwrap();
}

fn speak() -> HandlerAction {
    HandlerAction::Speak {
        channel_id: "chan-1".to_string(),
        content: "on it".to_string(),
    }
}

fn tool(name: &str) -> HandlerAction {
    HandlerAction::Tool {
        name: name.to_string(),
        parameters: serde_json::json!({}),
    }
}

fn yesterday_at(hour: u32) -> chrono::DateTime<Utc> {
    let date = (Utc::now() - Duration::days(1)).date_naive();
    Utc.from_utc_datetime(&date.and_hms_opt(hour, 15, 0).unwrap())
}

#[tokio::test]
async fn dominant_action_yields_a_caching_proposal() {
    let (_manager, store, feedback) = feedback_fixture().await;

    let base = Utc::now() - Duration::hours(1);
    for i in 0..80 {
        seed_audit_event(&store, i, speak(), base + Duration::seconds(i as i64));
    }

    let patterns = feedback.detect_patterns().await;
    let dominant = patterns
        .iter()
        .find(|p| p.pattern_id == "freq_dominant_SPEAK")
        .expect("dominant pattern should be detected");
    assert!(dominant.confidence >= 0.7);

    let proposals = feedback.generate_proposals(&patterns);
    let caching = proposals
        .iter()
        .find(|p| p.proposed_changes.contains_key("response_templates"))
        .expect("a caching proposal should be generated");
    assert!(caching.auto_applicable);
    assert_eq!(caching.scope, GraphScope::Local);
    assert_eq!(
        caching.proposed_changes["response_templates"]["optimize_for_SPEAK"],
        serde_json::json!(true)
    );
}

#[tokio::test]
async fn unused_capabilities_propose_identity_scoped_limits() {
    let (_manager, _store, feedback) = feedback_fixture().await;

    // Nothing recorded at all: every capability is unused.
    let patterns = feedback.detect_patterns().await;
    let proposals = feedback.generate_proposals(&patterns);

    let limit = proposals
        .iter()
        .find(|p| {
            p.proposed_changes
                .get("capability_limits")
                .and_then(|v| v.get("disable_FORGET"))
                .is_some()
        })
        .expect("underused capability should propose a limit");
    assert_eq!(limit.scope, GraphScope::Identity);
    assert!(!limit.auto_applicable);
}

#[tokio::test]
async fn degraded_response_times_propose_behavior_changes() {
    let (_manager, store, feedback) = feedback_fixture().await;

    let base = Utc::now() - Duration::hours(2);
    for i in 0..20 {
        let value = if i < 10 { 100.0 } else { 200.0 };
        let node = TsdbNode::metric("handler_response_time", value, HashMap::new(), GraphScope::Local)
            .at(base + Duration::seconds(i));
        let mut graph_node = node.to_graph_node();
        graph_node.id = format!("metric_rt_{}", i);
        store.add_node(&graph_node).unwrap();
    }

    let patterns = feedback.detect_patterns().await;
    let degradation = patterns
        .iter()
        .find(|p| p.pattern_id == "perf_degradation_response_time")
        .expect("degradation should be detected");
    assert!((degradation.metrics["degradation"].as_f64().unwrap() - 2.0).abs() < 1e-9);

    let proposals = feedback.generate_proposals(&patterns);
    let behavior = proposals
        .iter()
        .find(|p| p.proposed_changes.contains_key("behavior_config"))
        .expect("behavior proposal should be generated");
    assert_eq!(behavior.scope, GraphScope::Identity);
    assert!(!behavior.auto_applicable);
}

#[tokio::test]
async fn recurring_timeouts_propose_longer_timeouts() {
    let (_manager, store, feedback) = feedback_fixture().await;

    let base = Utc::now() - Duration::hours(3);
    for i in 0..7 {
        let node = TsdbNode::log(
            "request timeout after 30s",
            "ERROR",
            HashMap::new(),
            GraphScope::Local,
        )
        .at(base + Duration::minutes(i));
        let mut graph_node = node.to_graph_node();
        graph_node.id = format!("log_timeout_{}", i);
        store.add_node(&graph_node).unwrap();
    }

    let patterns = feedback.detect_patterns().await;
    let recurring = patterns
        .iter()
        .find(|p| p.pattern_id == "error_recurring_timeout_error")
        .expect("recurring timeout should be detected");
    assert!((recurring.confidence - 0.7).abs() < 1e-9);

    let proposals = feedback.generate_proposals(&patterns);
    let timeouts = proposals
        .iter()
        .find(|p| p.proposed_changes.contains_key("behavior_config"))
        .expect("timeout proposal should be generated");
    assert_eq!(
        timeouts.proposed_changes["behavior_config"]["timeout_adjustments"]["global_multiplier"],
        serde_json::json!(1.5)
    );
}

#[tokio::test]
async fn split_tool_usage_by_daypart_proposes_time_based_selection() {
    let (_manager, store, feedback) = feedback_fixture().await;

    for i in 0..3 {
        seed_audit_event(&store, i, tool("calculator"), yesterday_at(8));
        seed_audit_event(&store, i + 10, tool("browser"), yesterday_at(19));
    }

    let patterns = feedback.detect_patterns().await;
    let temporal = patterns
        .iter()
        .find(|p| p.pattern_id == "tool_usage_by_hour")
        .expect("temporal pattern should be detected");
    assert!((temporal.confidence - 0.8).abs() < 1e-9);

    let proposals = feedback.generate_proposals(&patterns);
    let prefs = proposals
        .iter()
        .find(|p| p.proposed_changes.contains_key("tool_preferences"))
        .expect("tool preference proposal should be generated");
    assert!(prefs.auto_applicable);
    let tools = &prefs.proposed_changes["tool_preferences"];
    assert_eq!(tools["time_based_selection"], serde_json::json!(true));
    assert_eq!(tools["morning_tools"], serde_json::json!(["calculator"]));
    assert_eq!(tools["evening_tools"], serde_json::json!(["browser"]));
}

#[tokio::test]
async fn full_analysis_auto_applies_confident_local_proposals() {
    let (manager, store, feedback) = feedback_fixture().await;

    let base = Utc::now() - Duration::hours(1);
    for i in 0..80 {
        seed_audit_event(&store, i, speak(), base + Duration::seconds(i as i64));
    }

    let outcome = feedback.analyze_and_adapt(true).await;
    assert!(outcome.ran);
    assert!(outcome.patterns_detected > 0);
    assert_eq!(outcome.auto_applied.len(), 1);

    // The applied proposal wrote a config node through the update path.
    let configs = manager
        .memory
        .recall(
            &MemoryQuery::wildcard("config/response_templates/", GraphScope::Local),
            "test",
        )
        .await;
    assert_eq!(configs.len(), 1);

    // Identity-scoped proposals stayed pending.
    let pending = feedback.pending_proposals().await;
    assert!(pending.iter().all(|p| p.scope == GraphScope::Identity));
    assert!(!pending.is_empty());
}

#[tokio::test]
async fn analysis_respects_its_interval_unless_forced() {
    let (_manager, _store, feedback) = feedback_fixture().await;

    let first = feedback.detect_and_propose(false).await;
    assert!(first.ran);

    let second = feedback.detect_and_propose(false).await;
    assert!(!second.ran);

    let forced = feedback.detect_and_propose(true).await;
    assert!(forced.ran);
}
