//! Tool bus.
//!
//! Synchronous facade over tool providers: execute a tool, enumerate what
//! is available, poll a long-running execution. A missing provider or a
//! provider failure comes back as a failed [`ToolResult`], never a panic.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, ServiceType, ToolInfo, ToolResult};
use log::error;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Typed facade over tool providers.
pub struct ToolBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl ToolBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Tool, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Tool)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Execute a tool and return its result.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        parameters: &Value,
        handler_name: &str,
    ) -> ToolResult {
        let registration = match self
            .registry
            .tool
            .get(handler_name, &[capability::EXECUTE_TOOL])
            .await
        {
            Some(r) => r,
            None => {
                error!("no tool service available for {}", handler_name);
                return ToolResult::failed(tool_name, "no tool service available");
            }
        };

        match registration.service.execute_tool(tool_name, parameters).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "tool provider {} failed to execute {}: {}",
                    registration.name, tool_name, e
                );
                ToolResult::failed(tool_name, e.to_string())
            }
        }
    }

    /// Enumerate tools offered by the preferred provider.
    pub async fn list_tools(&self, handler_name: &str) -> Vec<ToolInfo> {
        let registration = match self
            .registry
            .tool
            .get(handler_name, &[capability::GET_AVAILABLE_TOOLS])
            .await
        {
            Some(r) => r,
            None => {
                error!("no tool service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration.service.get_available_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                error!(
                    "tool provider {} failed to list tools: {}",
                    registration.name, e
                );
                Vec::new()
            }
        }
    }

    /// Describe a single tool, if the provider knows it.
    pub async fn get_tool_info(&self, tool_name: &str, handler_name: &str) -> Option<ToolInfo> {
        let registration = self
            .registry
            .tool
            .get(handler_name, &[capability::GET_AVAILABLE_TOOLS])
            .await?;

        match registration.service.get_tool_info(tool_name).await {
            Ok(info) => info,
            Err(e) => {
                error!(
                    "tool provider {} failed to describe {}: {}",
                    registration.name, tool_name, e
                );
                None
            }
        }
    }

    /// Poll for a long-running tool result by correlation id.
    pub async fn get_tool_result(
        &self,
        correlation_id: &str,
        timeout: Duration,
        handler_name: &str,
    ) -> Option<ToolResult> {
        let registration = self
            .registry
            .tool
            .get(handler_name, &[capability::EXECUTE_TOOL])
            .await?;

        match registration
            .service
            .get_tool_result(correlation_id, timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "tool provider {} failed to fetch result {}: {}",
                    registration.name, correlation_id, e
                );
                None
            }
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
