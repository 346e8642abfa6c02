//! Telemetry bus.
//!
//! Thin synchronous facade over telemetry providers. Failures to record a
//! metric are logged and reported as `false`; telemetry must never change
//! the outcome of the operation being measured.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, MetricRecord, ServiceType};
use chrono::{DateTime, Utc};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed facade over telemetry providers.
pub struct TelemetryBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
}

impl TelemetryBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Telemetry, max_queue_size),
            registry,
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Telemetry)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Record one metric sample.
    pub async fn record_metric(
        &self,
        metric_name: &str,
        value: f64,
        handler_name: &str,
        tags: &HashMap<String, String>,
    ) -> bool {
        let registration = match self
            .registry
            .telemetry
            .get(handler_name, &[capability::RECORD_METRIC])
            .await
        {
            Some(r) => r,
            None => {
                debug!("no telemetry service available for {}", handler_name);
                return false;
            }
        };

        match registration
            .service
            .record_metric(metric_name, value, handler_name, tags)
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(
                    "telemetry provider {} failed to record {}: {}",
                    registration.name, metric_name, e
                );
                false
            }
        }
    }

    /// Query recorded samples for a set of metric names.
    pub async fn query_telemetry(
        &self,
        metric_names: &[String],
        handler_name: &str,
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        tags: Option<&HashMap<String, String>>,
        limit: usize,
    ) -> Vec<MetricRecord> {
        let registration = match self
            .registry
            .telemetry
            .get(handler_name, &[capability::QUERY_TELEMETRY])
            .await
        {
            Some(r) => r,
            None => {
                debug!("no telemetry service available for {}", handler_name);
                return Vec::new();
            }
        };

        match registration
            .service
            .query_metrics(metric_names, time_range, tags, limit)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(
                    "telemetry provider {} failed to query metrics: {}",
                    registration.name, e
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
