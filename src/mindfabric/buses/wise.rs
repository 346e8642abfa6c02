//! Wise Authority bus.
//!
//! Deferrals, guidance requests, and review requests all route through this
//! facade. `request_review` is the entry point the identity-variance
//! monitor uses when drift crosses the threshold: it wraps the review into
//! a deferral context so any Wise Authority provider can receive it.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, DeferralContext, GuidanceContext, ServiceType};
use log::{debug, error};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed facade over Wise Authority providers.
pub struct WiseBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl WiseBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::WiseAuthority, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::WiseAuthority)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Send a deferral to the Wise Authority.
    pub async fn send_deferral(&self, context: &DeferralContext, handler_name: &str) -> bool {
        let registration = match self
            .registry
            .wise
            .get(handler_name, &[capability::SEND_DEFERRAL])
            .await
        {
            Some(r) => r,
            None => {
                error!("no wise authority service available for {}", handler_name);
                return false;
            }
        };

        match registration.service.send_deferral(context).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "wise authority provider {} failed to send deferral: {}",
                    registration.name, e
                );
                false
            }
        }
    }

    /// Ask the Wise Authority for guidance. `None` when no provider is
    /// registered or the provider has nothing to say.
    pub async fn fetch_guidance(
        &self,
        context: &GuidanceContext,
        handler_name: &str,
    ) -> Option<String> {
        let registration = match self
            .registry
            .wise
            .get(handler_name, &[capability::FETCH_GUIDANCE])
            .await
        {
            Some(r) => r,
            None => {
                debug!("no wise authority service available for {}", handler_name);
                return None;
            }
        };

        match registration.service.fetch_guidance(context).await {
            Ok(guidance) => guidance,
            Err(e) => {
                error!(
                    "wise authority provider {} failed to fetch guidance: {}",
                    registration.name, e
                );
                None
            }
        }
    }

    /// Request a review (e.g. for identity variance). The review payload is
    /// folded into a deferral context so providers need no extra surface.
    pub async fn request_review(
        &self,
        review_type: &str,
        review_data: &Value,
        handler_name: &str,
    ) -> bool {
        let mut metadata = HashMap::new();
        metadata.insert("review_data".to_string(), review_data.to_string());
        metadata.insert("handler_name".to_string(), handler_name.to_string());

        let context = DeferralContext {
            thought_id: format!("review_{}_{}", review_type, handler_name),
            task_id: format!("review_task_{}", review_type),
            reason: format!("Review requested: {}", review_type),
            defer_until: None,
            priority: None,
            metadata,
        };

        self.send_deferral(&context, handler_name).await
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
