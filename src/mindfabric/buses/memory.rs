//! Memory bus.
//!
//! Every graph write and read in the runtime goes through this facade. All
//! operations are synchronous pass-through: handlers need the result, so
//! nothing is queued. Provider failures surface as
//! [`MemoryOpStatus::Error`](crate::mindfabric::graph::MemoryOpStatus)
//! results or empty collections, never as panics or raised errors.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::graph::{
    GraphNode, GraphScope, MemoryOpResult, MemoryQuery, MemorySearchResult, TimeSeriesPoint,
};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{
    capability, EnvironmentUpdateRequest, IdentityUpdateRequest, ServiceType,
};
use log::error;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed facade over memory providers.
pub struct MemoryBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl MemoryBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Memory, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Memory)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Store a node. Upserts by `(id, scope)`.
    pub async fn memorize(&self, node: &GraphNode, handler_name: &str) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::MEMORIZE])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration.service.memorize(node).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to memorize {}: {}",
                    registration.name, node.id, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    /// Recall nodes matching a query. Empty on failure.
    pub async fn recall(&self, query: &MemoryQuery, handler_name: &str) -> Vec<GraphNode> {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::RECALL])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration.service.recall(query).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(
                    "memory provider {} failed to recall {}: {}",
                    registration.name, query.node_id, e
                );
                Vec::new()
            }
        }
    }

    /// Remove a node.
    pub async fn forget(
        &self,
        node_id: &str,
        scope: GraphScope,
        handler_name: &str,
    ) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::FORGET])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration.service.forget(node_id, scope).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to forget {}: {}",
                    registration.name, node_id, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    /// Free-text search over node attributes.
    pub async fn search_memories(
        &self,
        query: &str,
        scope: GraphScope,
        limit: usize,
        handler_name: &str,
    ) -> Vec<MemorySearchResult> {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::SEARCH_MEMORIES])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration.service.search_memories(query, scope, limit).await {
            Ok(results) => results,
            Err(e) => {
                error!(
                    "memory provider {} failed to search: {}",
                    registration.name, e
                );
                Vec::new()
            }
        }
    }

    /// Time-series recall over the trailing `hours` window.
    pub async fn recall_timeseries(
        &self,
        scope: GraphScope,
        hours: u32,
        data_types: Option<&[&str]>,
        tag_filters: Option<&HashMap<String, String>>,
        handler_name: &str,
    ) -> Vec<TimeSeriesPoint> {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::RECALL_TIMESERIES])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration
            .service
            .recall_timeseries(scope, hours, data_types, tag_filters)
            .await
        {
            Ok(points) => points,
            Err(e) => {
                error!(
                    "memory provider {} failed to recall timeseries: {}",
                    registration.name, e
                );
                Vec::new()
            }
        }
    }

    /// Store a metric as both a graph node and a time-series point.
    pub async fn memorize_metric(
        &self,
        metric_name: &str,
        value: f64,
        tags: HashMap<String, String>,
        scope: GraphScope,
        handler_name: &str,
    ) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::MEMORIZE_METRIC])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration
            .service
            .memorize_metric(metric_name, value, tags, scope)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to memorize metric {}: {}",
                    registration.name, metric_name, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    /// Store a log entry as both a graph node and a time-series point.
    pub async fn memorize_log(
        &self,
        log_message: &str,
        log_level: &str,
        tags: HashMap<String, String>,
        scope: GraphScope,
        handler_name: &str,
    ) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::MEMORIZE_LOG])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration
            .service
            .memorize_log(log_message, log_level, tags, scope)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to memorize log: {}",
                    registration.name, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    /// Render identity-scope nodes as text for prompt context.
    pub async fn export_identity_context(&self, handler_name: &str) -> String {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::EXPORT_IDENTITY_CONTEXT])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return String::new();
            }
        };

        match registration.service.export_identity_context().await {
            Ok(context) => context,
            Err(e) => {
                error!(
                    "memory provider {} failed to export identity context: {}",
                    registration.name, e
                );
                String::new()
            }
        }
    }

    /// Apply WA-approved updates to the identity graph.
    pub async fn update_identity_graph(
        &self,
        request: &IdentityUpdateRequest,
        handler_name: &str,
    ) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::UPDATE_IDENTITY_GRAPH])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration.service.update_identity_graph(request).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to update identity graph: {}",
                    registration.name, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    /// Apply updates to the environment graph.
    pub async fn update_environment_graph(
        &self,
        request: &EnvironmentUpdateRequest,
        handler_name: &str,
    ) -> MemoryOpResult {
        let registration = match self
            .registry
            .memory
            .get(handler_name, &[capability::UPDATE_ENVIRONMENT_GRAPH])
            .await
        {
            Some(r) => r,
            None => {
                error!("no memory service available for {}", handler_name);
                return MemoryOpResult::error("no memory service available");
            }
        };

        match registration.service.update_environment_graph(request).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "memory provider {} failed to update environment graph: {}",
                    registration.name, e
                );
                MemoryOpResult::error(e.to_string())
            }
        }
    }

    pub async fn is_healthy(&self, handler_name: &str) -> bool {
        match self.registry.memory.get(handler_name, &[]).await {
            Some(registration) => registration.service.is_healthy().await,
            None => false,
        }
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
