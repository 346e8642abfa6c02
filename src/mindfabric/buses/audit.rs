//! Audit bus.
//!
//! Audit writes are synchronous by design: `log_event` returns only after
//! the registered audit provider has made the entry durable, so a handler
//! that continues past the call can rely on the trail existing.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, AuditEntry, ServiceType};
use log::{error, warn};
use serde_json::Value;
use std::sync::Arc;

/// Typed facade over audit providers.
pub struct AuditBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl AuditBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Audit, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Audit)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Record an audit event. Returns once the write is durable; a missing
    /// provider is logged and swallowed so auditing never blocks the act
    /// being audited.
    pub async fn log_event(&self, event_type: &str, data: &Value, handler_name: &str) {
        let registration = match self
            .registry
            .audit
            .get(handler_name, &[capability::LOG_EVENT])
            .await
        {
            Some(r) => r,
            None => {
                warn!("no audit service available for {}", handler_name);
                return;
            }
        };

        if let Err(e) = registration.service.log_event(event_type, data).await {
            error!(
                "audit provider {} failed to log {} for {}: {}",
                registration.name, event_type, handler_name, e
            );
        }
    }

    /// Fetch the audit trail for an entity, most recent first.
    pub async fn get_audit_trail(
        &self,
        entity_id: &str,
        limit: usize,
        handler_name: &str,
    ) -> Vec<AuditEntry> {
        let registration = match self
            .registry
            .audit
            .get(handler_name, &[capability::GET_AUDIT_TRAIL])
            .await
        {
            Some(r) => r,
            None => {
                error!("no audit service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration.service.get_audit_trail(entity_id, limit).await {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "audit provider {} failed to fetch trail for {}: {}",
                    registration.name, entity_id, e
                );
                Vec::new()
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
