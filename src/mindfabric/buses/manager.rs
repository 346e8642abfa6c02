//! Bus manager.
//!
//! Owns one instance of every typed bus plus the shared registry handle,
//! and drives their lifecycle as a unit. Handlers reach services through
//! this manager:
//!
//! ```text
//! bus_manager.communication.send_message(...)
//! bus_manager.memory.memorize(...)
//! bus_manager.llm.generate_structured::<T>(...)
//! ```
//!
//! A bus that fails to start or stop is logged and skipped; one broken bus
//! never blocks the others.

use crate::mindfabric::buses::audit::AuditBus;
use crate::mindfabric::buses::base::BusStats;
use crate::mindfabric::buses::communication::CommunicationBus;
use crate::mindfabric::buses::llm::{LlmBus, LlmProviderStats};
use crate::mindfabric::buses::memory::MemoryBus;
use crate::mindfabric::buses::runtime_control::RuntimeControlBus;
use crate::mindfabric::buses::secrets::SecretsBus;
use crate::mindfabric::buses::telemetry::TelemetryBus;
use crate::mindfabric::buses::tool::ToolBus;
use crate::mindfabric::buses::wise::WiseBus;
use crate::mindfabric::config::FabricConfig;
use crate::mindfabric::registry::ServiceRegistry;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregated statistics across the whole fabric.
#[derive(Debug, Clone, Serialize)]
pub struct FabricStats {
    pub buses: HashMap<String, BusStats>,
    pub llm_providers: HashMap<String, LlmProviderStats>,
}

/// Central owner of all message buses.
pub struct BusManager {
    pub registry: Arc<ServiceRegistry>,
    pub communication: Arc<CommunicationBus>,
    pub memory: Arc<MemoryBus>,
    pub tool: Arc<ToolBus>,
    pub audit: Arc<AuditBus>,
    pub telemetry: Arc<TelemetryBus>,
    pub wise: Arc<WiseBus>,
    pub secrets: Arc<SecretsBus>,
    pub runtime_control: Arc<RuntimeControlBus>,
    pub llm: Arc<LlmBus>,
}

impl BusManager {
    pub fn new(registry: Arc<ServiceRegistry>, config: &FabricConfig) -> Self {
        let queue = config.buses.max_queue_size;
        let telemetry = Arc::new(TelemetryBus::new(Arc::clone(&registry), queue));
        // The LLM bus reports resource usage through the telemetry bus.
        let llm = Arc::new(LlmBus::new(
            Arc::clone(&registry),
            Arc::clone(&telemetry),
            &config.llm,
            queue,
        ));
        let manager = Self {
            communication: Arc::new(CommunicationBus::new(Arc::clone(&registry), queue)),
            memory: Arc::new(MemoryBus::new(Arc::clone(&registry), queue)),
            tool: Arc::new(ToolBus::new(Arc::clone(&registry), queue)),
            audit: Arc::new(AuditBus::new(Arc::clone(&registry), queue)),
            wise: Arc::new(WiseBus::new(Arc::clone(&registry), queue)),
            secrets: Arc::new(SecretsBus::new(Arc::clone(&registry), queue)),
            runtime_control: Arc::new(RuntimeControlBus::new(Arc::clone(&registry), queue)),
            telemetry,
            llm,
            registry,
        };
        info!("bus manager initialized with all message buses");
        manager
    }

    /// Start every bus worker.
    pub async fn start(&self) {
        info!("starting all message buses");
        self.communication.start().await;
        self.memory.start().await;
        self.tool.start().await;
        self.audit.start().await;
        self.telemetry.start().await;
        self.wise.start().await;
        self.secrets.start().await;
        self.runtime_control.start().await;
        self.llm.start().await;
        info!("all message buses started");
    }

    /// Stop every bus worker, draining bounded.
    pub async fn stop(&self) {
        info!("stopping all message buses");
        self.communication.stop().await;
        self.memory.stop().await;
        self.tool.stop().await;
        self.audit.stop().await;
        self.telemetry.stop().await;
        self.wise.stop().await;
        self.secrets.stop().await;
        self.runtime_control.stop().await;
        self.llm.stop().await;
        info!("all message buses stopped");
    }

    /// Health per bus: running, with the queue under 90% of capacity.
    pub fn health_check(&self) -> HashMap<String, bool> {
        fn healthy(running: bool, queued: usize, capacity: usize) -> bool {
            running && (queued as f64) < capacity as f64 * 0.9
        }

        let mut health = HashMap::new();
        health.insert(
            "communication".to_string(),
            healthy(
                self.communication.is_running(),
                self.communication.queue_size(),
                self.communication.capacity(),
            ),
        );
        health.insert(
            "memory".to_string(),
            healthy(self.memory.is_running(), self.memory.queue_size(), self.memory.capacity()),
        );
        health.insert(
            "tool".to_string(),
            healthy(self.tool.is_running(), self.tool.queue_size(), self.tool.capacity()),
        );
        health.insert(
            "audit".to_string(),
            healthy(self.audit.is_running(), self.audit.queue_size(), self.audit.capacity()),
        );
        health.insert(
            "telemetry".to_string(),
            healthy(
                self.telemetry.is_running(),
                self.telemetry.queue_size(),
                self.telemetry.capacity(),
            ),
        );
        health.insert(
            "wise".to_string(),
            healthy(self.wise.is_running(), self.wise.queue_size(), self.wise.capacity()),
        );
        health.insert(
            "secrets".to_string(),
            healthy(
                self.secrets.is_running(),
                self.secrets.queue_size(),
                self.secrets.capacity(),
            ),
        );
        health.insert(
            "runtime_control".to_string(),
            healthy(
                self.runtime_control.is_running(),
                self.runtime_control.queue_size(),
                self.runtime_control.capacity(),
            ),
        );
        health.insert(
            "llm".to_string(),
            healthy(self.llm.is_running(), self.llm.queue_size(), self.llm.capacity()),
        );
        health
    }

    /// Aggregated queue/processing stats plus the LLM per-provider table.
    pub fn get_stats(&self) -> FabricStats {
        let mut buses = HashMap::new();
        buses.insert("communication".to_string(), self.communication.stats());
        buses.insert("memory".to_string(), self.memory.stats());
        buses.insert("tool".to_string(), self.tool.stats());
        buses.insert("audit".to_string(), self.audit.stats());
        buses.insert("telemetry".to_string(), self.telemetry.stats());
        buses.insert("wise".to_string(), self.wise.stats());
        buses.insert("secrets".to_string(), self.secrets.stats());
        buses.insert("runtime_control".to_string(), self.runtime_control.stats());
        buses.insert("llm".to_string(), self.llm.stats());

        FabricStats {
            buses,
            llm_providers: self.llm.service_stats(),
        }
    }

    /// Messages waiting across every bus queue.
    pub fn total_queue_size(&self) -> usize {
        self.communication.queue_size()
            + self.memory.queue_size()
            + self.tool.queue_size()
            + self.audit.queue_size()
            + self.telemetry.queue_size()
            + self.wise.queue_size()
            + self.secrets.queue_size()
            + self.runtime_control.queue_size()
            + self.llm.queue_size()
    }
}
