//! Runtime-control bus.
//!
//! Routes processor stepping and adapter lifecycle commands to the
//! registered [`RuntimeControlService`](crate::mindfabric::service::RuntimeControlService)
//! provider. All operations are synchronous; the operator issuing them
//! needs the outcome.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, AdapterInfo, ProcessorStatus, ServiceType};
use log::error;
use serde_json::Value;
use std::sync::Arc;

/// Typed facade over runtime-control providers.
pub struct RuntimeControlBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl RuntimeControlBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::RuntimeControl, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::RuntimeControl)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Advance the processor by one step.
    pub async fn single_step(&self, handler_name: &str) -> Option<ProcessorStatus> {
        let registration = self.provider(handler_name).await?;
        match registration.service.single_step().await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("runtime control {} single_step failed: {}", registration.name, e);
                None
            }
        }
    }

    pub async fn pause_processing(&self, handler_name: &str) -> Option<ProcessorStatus> {
        let registration = self.provider(handler_name).await?;
        match registration.service.pause_processing().await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("runtime control {} pause failed: {}", registration.name, e);
                None
            }
        }
    }

    pub async fn resume_processing(&self, handler_name: &str) -> Option<ProcessorStatus> {
        let registration = self.provider(handler_name).await?;
        match registration.service.resume_processing().await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("runtime control {} resume failed: {}", registration.name, e);
                None
            }
        }
    }

    /// Request a graceful shutdown. `true` if the provider accepted.
    pub async fn shutdown(&self, reason: &str, handler_name: &str) -> bool {
        let registration = match self.provider(handler_name).await {
            Some(r) => r,
            None => return false,
        };
        match registration.service.shutdown(reason).await {
            Ok(()) => true,
            Err(e) => {
                error!("runtime control {} shutdown failed: {}", registration.name, e);
                false
            }
        }
    }

    pub async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: &Value,
        handler_name: &str,
    ) -> Option<AdapterInfo> {
        let registration = self.provider(handler_name).await?;
        match registration
            .service
            .load_adapter(adapter_type, adapter_id, config)
            .await
        {
            Ok(info) => Some(info),
            Err(e) => {
                error!(
                    "runtime control {} failed to load adapter {}: {}",
                    registration.name, adapter_id, e
                );
                None
            }
        }
    }

    pub async fn unload_adapter(&self, adapter_id: &str, handler_name: &str) -> bool {
        let registration = match self.provider(handler_name).await {
            Some(r) => r,
            None => return false,
        };
        match registration.service.unload_adapter(adapter_id).await {
            Ok(unloaded) => unloaded,
            Err(e) => {
                error!(
                    "runtime control {} failed to unload adapter {}: {}",
                    registration.name, adapter_id, e
                );
                false
            }
        }
    }

    pub async fn list_adapters(&self, handler_name: &str) -> Vec<AdapterInfo> {
        let registration = match self.provider(handler_name).await {
            Some(r) => r,
            None => return Vec::new(),
        };
        match registration.service.list_adapters().await {
            Ok(adapters) => adapters,
            Err(e) => {
                error!(
                    "runtime control {} failed to list adapters: {}",
                    registration.name, e
                );
                Vec::new()
            }
        }
    }

    /// Snapshot of the provider-side runtime configuration.
    pub async fn get_runtime_config(&self, handler_name: &str) -> Option<Value> {
        let registration = self.provider(handler_name).await?;
        match registration.service.get_runtime_config().await {
            Ok(config) => Some(config),
            Err(e) => {
                error!(
                    "runtime control {} failed to fetch config: {}",
                    registration.name, e
                );
                None
            }
        }
    }

    async fn provider(
        &self,
        handler_name: &str,
    ) -> Option<crate::mindfabric::registry::Registration<dyn crate::mindfabric::service::RuntimeControlService>>
    {
        let registration = self
            .registry
            .runtime_control
            .get(handler_name, &[capability::RUNTIME_CONTROL])
            .await;
        if registration.is_none() {
            error!("no runtime control service available for {}", handler_name);
        }
        registration
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
