use mindfabric::buses::manager::BusManager;
use mindfabric::config::FabricConfig;
use mindfabric::graph::{
    GraphEdge, GraphNode, GraphScope, MemoryQuery, NodeType, TsdbNode,
};
use mindfabric::persistence::{GraphStore, LocalGraphMemoryService};
use mindfabric::registry::ServiceRegistry;
use mindfabric::service::{capability, MemoryService, Priority};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

async fn fabric_with_graph_memory() -> (BusManager, Arc<GraphStore>) {
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
                capability::SEARCH_MEMORIES,
                capability::RECALL_TIMESERIES,
                capability::MEMORIZE_METRIC,
                capability::MEMORIZE_LOG,
                capability::EXPORT_IDENTITY_CONTEXT,
                capability::UPDATE_IDENTITY_GRAPH,
                capability::UPDATE_ENVIRONMENT_GRAPH,
            ],
            HashMap::new(),
        )
        .await;

    let manager = BusManager::new(registry, &FabricConfig::default());
    (manager, store)
}

#[tokio::test]
async fn memorize_then_recall_returns_an_equivalent_node() {
    let (manager, _store) = fabric_with_graph_memory().await;

    let node = GraphNode::new("concept_rust", NodeType::Concept, GraphScope::Local)
        .with_attribute("summary", json!("systems language"))
        .with_attribute("score", json!(9.5))
        .with_attribute("aliases", json!(["rs", "rustlang"]))
        .with_attribute("nested", json!({"a": {"b": [1, 2, 3]}}));

    assert!(manager.memory.memorize(&node, "test_handler").await.is_ok());

    let recalled = manager
        .memory
        .recall(
            &MemoryQuery::exact("concept_rust", GraphScope::Local),
            "test_handler",
        )
        .await;
    assert_eq!(recalled.len(), 1);
    assert_eq!(recalled[0].id, node.id);
    assert_eq!(recalled[0].kind, node.kind);
    assert_eq!(recalled[0].scope, node.scope);
    // Attribute maps must be JSON-equivalent after the round trip.
    assert_eq!(
        serde_json::to_value(&recalled[0].attributes).unwrap(),
        serde_json::to_value(&node.attributes).unwrap()
    );
}

#[tokio::test]
async fn wildcard_recall_matches_prefixes_within_scope() {
    let (manager, _store) = fabric_with_graph_memory().await;

    for key in ["config/tool_preferences/a", "config/tool_preferences/b", "config/filter_config/x"] {
        let node = GraphNode::new(key, NodeType::Config, GraphScope::Local);
        manager.memory.memorize(&node, "h").await;
    }

    let matches = manager
        .memory
        .recall(
            &MemoryQuery::wildcard("config/tool_preferences/", GraphScope::Local),
            "h",
        )
        .await;
    assert_eq!(matches.len(), 2);

    let all = manager
        .memory
        .recall(&MemoryQuery::exact("*", GraphScope::Local), "h")
        .await;
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn timeseries_recall_honors_the_window() {
    let (manager, store) = fabric_with_graph_memory().await;

    // A fresh point and one far outside any reasonable window.
    let recent = TsdbNode::metric("requests", 1.0, HashMap::new(), GraphScope::Local);
    store.add_node(&recent.to_graph_node()).unwrap();

    let stale = TsdbNode::metric("requests", 2.0, HashMap::new(), GraphScope::Local)
        .at(chrono::Utc::now() - chrono::Duration::hours(50));
    let mut stale_node = stale.to_graph_node();
    // Distinct id: the constructor derives ids from wall-clock seconds.
    stale_node.id = "metric_requests_old".to_string();
    store.add_node(&stale_node).unwrap();

    let points = manager
        .memory
        .recall_timeseries(GraphScope::Local, 24, Some(&["metric"]), None, "h")
        .await;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].metric_value, Some(1.0));

    // A wider window picks up both, oldest first.
    let points = manager
        .memory
        .recall_timeseries(GraphScope::Local, 72, Some(&["metric"]), None, "h")
        .await;
    assert_eq!(points.len(), 2);
    assert!(points[0].timestamp <= points[1].timestamp);
    assert_eq!(points[0].metric_value, Some(2.0));
}

#[tokio::test]
async fn timeseries_recall_applies_tag_filters() {
    let (manager, store) = fabric_with_graph_memory().await;

    let mut tags_a = HashMap::new();
    tags_a.insert("handler".to_string(), "alpha".to_string());
    let mut tags_b = HashMap::new();
    tags_b.insert("handler".to_string(), "beta".to_string());

    let a = TsdbNode::metric("m", 1.0, tags_a.clone(), GraphScope::Local);
    let mut a_node = a.to_graph_node();
    a_node.id = "metric_m_a".to_string();
    store.add_node(&a_node).unwrap();

    let b = TsdbNode::metric("m", 2.0, tags_b, GraphScope::Local);
    let mut b_node = b.to_graph_node();
    b_node.id = "metric_m_b".to_string();
    store.add_node(&b_node).unwrap();

    let points = manager
        .memory
        .recall_timeseries(GraphScope::Local, 24, Some(&["metric"]), Some(&tags_a), "h")
        .await;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].metric_value, Some(1.0));
}

#[tokio::test]
async fn forget_removes_node_and_timeseries_row() {
    let (manager, _store) = fabric_with_graph_memory().await;

    let mut tags = HashMap::new();
    tags.insert("k".to_string(), "v".to_string());
    manager
        .memory
        .memorize_metric("doomed", 1.0, tags, GraphScope::Local, "h")
        .await;

    let points = manager
        .memory
        .recall_timeseries(GraphScope::Local, 1, Some(&["metric"]), None, "h")
        .await;
    assert_eq!(points.len(), 1);
    let node_id = points[0].node_id.clone();

    assert!(manager.memory.forget(&node_id, GraphScope::Local, "h").await.is_ok());
    let points = manager
        .memory
        .recall_timeseries(GraphScope::Local, 1, Some(&["metric"]), None, "h")
        .await;
    assert!(points.is_empty());
}

#[tokio::test]
async fn edges_are_queryable_from_either_endpoint() {
    let (_manager, store) = fabric_with_graph_memory().await;

    store
        .add_node(&GraphNode::new("u1", NodeType::User, GraphScope::Community))
        .unwrap();
    store
        .add_node(&GraphNode::new("c1", NodeType::Channel, GraphScope::Community))
        .unwrap();
    let edge = GraphEdge::new("u1", "c1", "participates_in", GraphScope::Community);
    store.add_edge(&edge).unwrap();

    let from_user = store.edges_for_node("u1", GraphScope::Community).unwrap();
    let from_channel = store.edges_for_node("c1", GraphScope::Community).unwrap();
    assert_eq!(from_user.len(), 1);
    assert_eq!(from_channel.len(), 1);
    assert_eq!(from_user[0].edge_key(), "u1->c1->participates_in");
}

#[tokio::test]
async fn export_identity_context_renders_identity_nodes() {
    let (manager, _store) = fabric_with_graph_memory().await;

    let node = GraphNode::new("agent_core", NodeType::Agent, GraphScope::Identity)
        .with_attribute("agent_name", json!("sage"));
    manager.memory.memorize(&node, "h").await;

    let context = manager.memory.export_identity_context("h").await;
    assert!(context.contains("agent_core"));
    assert!(context.contains("sage"));
}

#[tokio::test]
async fn search_memories_matches_attribute_text() {
    let (manager, _store) = fabric_with_graph_memory().await;

    let node = GraphNode::new("note_1", NodeType::Concept, GraphScope::Local)
        .with_attribute("body", json!("the gradient descent diverged"));
    manager.memory.memorize(&node, "h").await;
    let other = GraphNode::new("note_2", NodeType::Concept, GraphScope::Local)
        .with_attribute("body", json!("lunch plans"));
    manager.memory.memorize(&other, "h").await;

    let hits = manager.memory.search_memories("gradient", GraphScope::Local, 10, "h").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].node.id, "note_1");
}
