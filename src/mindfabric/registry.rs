//! Service registry.
//!
//! Providers are registered under a `(handler, service type)` binding with a
//! [`Priority`], a capability set, and optional metadata. Lookup walks the
//! handler-specific registrations in ascending priority order (registration
//! order breaks ties), skipping providers that do not cover the caller's
//! required capabilities or that fail a (briefly cached) health probe, and
//! then falls back to the `*global*` bucket the same way.
//!
//! Each service kind gets its own typed [`ProviderTable`], so a lookup hands
//! back `Arc<dyn LlmService>` rather than an untyped handle. The registry
//! is the only place in the runtime where provider wiring happens.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use mindfabric::registry::ServiceRegistry;
//! use mindfabric::service::{capability, Priority};
//! # use mindfabric::service::{LlmService};
//! # async fn demo(provider: Arc<dyn LlmService>) {
//! let registry = ServiceRegistry::new();
//! registry
//!     .llm
//!     .register_global(
//!         "primary-llm",
//!         provider,
//!         Priority::Normal,
//!         &[capability::CALL_LLM_STRUCTURED],
//!         HashMap::new(),
//!     )
//!     .await;
//! # }
//! ```

use crate::mindfabric::service::{
    AuditService, CommunicationService, LlmService, MemoryService, Priority,
    RuntimeControlService, SecretsService, Service, ServiceType, TelemetryService, ToolService,
    WiseAuthorityService,
};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Handler key of the global fallback bucket.
pub const GLOBAL_HANDLER: &str = "*global*";

/// How long a health-probe result stays valid before the provider is probed
/// again. Bounds the probe rate on hot lookup paths.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(2);

/// One registered provider.
pub struct Registration<S: ?Sized> {
    /// Provider name used for metrics, breakers, and logs.
    pub name: String,
    /// The provider itself.
    pub service: Arc<S>,
    /// Selection priority; lower is tried first.
    pub priority: Priority,
    /// Capabilities this registration covers.
    pub capabilities: HashSet<String>,
    /// Free-form registration metadata.
    pub metadata: HashMap<String, String>,
    seq: u64,
}

impl<S: ?Sized> Clone for Registration<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            service: Arc::clone(&self.service),
            priority: self.priority,
            capabilities: self.capabilities.clone(),
            metadata: self.metadata.clone(),
            seq: self.seq,
        }
    }
}

impl<S: ?Sized> Registration<S> {
    fn covers(&self, required: &[&str]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(*cap))
    }
}

/// Typed provider table for one service kind.
pub struct ProviderTable<S: Service + ?Sized> {
    service_type: ServiceType,
    entries: RwLock<HashMap<String, Vec<Registration<S>>>>,
    health_cache: RwLock<HashMap<u64, (Instant, bool)>>,
    next_seq: AtomicU64,
}

impl<S: Service + ?Sized> ProviderTable<S> {
    fn new(service_type: ServiceType) -> Self {
        Self {
            service_type,
            entries: RwLock::new(HashMap::new()),
            health_cache: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a provider for a specific handler.
    pub async fn register(
        &self,
        handler: &str,
        name: impl Into<String>,
        service: Arc<S>,
        priority: Priority,
        capabilities: &[&str],
        metadata: HashMap<String, String>,
    ) {
        let registration = Registration {
            name: name.into(),
            service,
            priority,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            metadata,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        debug!(
            "registering {} provider '{}' for handler '{}' at {:?}",
            self.service_type, registration.name, handler, priority
        );
        let mut entries = self.entries.write().await;
        let bucket = entries.entry(handler.to_string()).or_insert_with(Vec::new);
        // Keep the bucket sorted by (priority, registration order).
        let pos = bucket
            .binary_search_by_key(&(registration.priority, registration.seq), |r| {
                (r.priority, r.seq)
            })
            .unwrap_or_else(|p| p);
        bucket.insert(pos, registration);
    }

    /// Register a provider in the global fallback bucket.
    pub async fn register_global(
        &self,
        name: impl Into<String>,
        service: Arc<S>,
        priority: Priority,
        capabilities: &[&str],
        metadata: HashMap<String, String>,
    ) {
        self.register(GLOBAL_HANDLER, name, service, priority, capabilities, metadata)
            .await;
    }

    /// Look up the best provider for `handler` covering `required`
    /// capabilities, falling back to the global bucket.
    pub async fn get(&self, handler: &str, required: &[&str]) -> Option<Registration<S>> {
        self.get_with_fallback(handler, required, true).await
    }

    /// Same as [`get`](Self::get) with the global fallback made explicit.
    pub async fn get_with_fallback(
        &self,
        handler: &str,
        required: &[&str],
        fallback_to_global: bool,
    ) -> Option<Registration<S>> {
        let candidates = {
            let entries = self.entries.read().await;
            let mut out: Vec<Registration<S>> = Vec::new();
            if let Some(bucket) = entries.get(handler) {
                out.extend(bucket.iter().cloned());
            }
            if fallback_to_global && handler != GLOBAL_HANDLER {
                if let Some(bucket) = entries.get(GLOBAL_HANDLER) {
                    out.extend(bucket.iter().cloned());
                }
            }
            out
        };

        for registration in candidates {
            if !registration.covers(required) {
                continue;
            }
            if !self.probe_health(&registration).await {
                debug!(
                    "skipping unhealthy {} provider '{}'",
                    self.service_type, registration.name
                );
                continue;
            }
            return Some(registration);
        }
        None
    }

    /// All healthy providers for `handler` covering `required`, in lookup
    /// order (handler bucket first, then global), deduplicated by name.
    pub async fn get_all(&self, handler: &str, required: &[&str]) -> Vec<Registration<S>> {
        let candidates = {
            let entries = self.entries.read().await;
            let mut out: Vec<Registration<S>> = Vec::new();
            if let Some(bucket) = entries.get(handler) {
                out.extend(bucket.iter().cloned());
            }
            if handler != GLOBAL_HANDLER {
                if let Some(bucket) = entries.get(GLOBAL_HANDLER) {
                    out.extend(bucket.iter().cloned());
                }
            }
            out
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut result = Vec::new();
        for registration in candidates {
            if !registration.covers(required) || seen.contains(&registration.name) {
                continue;
            }
            if !self.probe_health(&registration).await {
                continue;
            }
            seen.insert(registration.name.clone());
            result.push(registration);
        }
        result
    }

    /// Number of registrations across all handlers (global included).
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn probe_health(&self, registration: &Registration<S>) -> bool {
        {
            let cache = self.health_cache.read().await;
            if let Some((checked_at, healthy)) = cache.get(&registration.seq) {
                if checked_at.elapsed() < HEALTH_CACHE_TTL {
                    return *healthy;
                }
            }
        }
        let healthy = registration.service.is_healthy().await;
        self.health_cache
            .write()
            .await
            .insert(registration.seq, (Instant::now(), healthy));
        healthy
    }
}

/// The root registry: one typed provider table per service kind.
///
/// Constructed once at startup and threaded through the
/// [`BusManager`](crate::mindfabric::buses::manager::BusManager); there is no
/// global singleton.
pub struct ServiceRegistry {
    pub communication: ProviderTable<dyn CommunicationService>,
    pub memory: ProviderTable<dyn MemoryService>,
    pub tool: ProviderTable<dyn ToolService>,
    pub audit: ProviderTable<dyn AuditService>,
    pub telemetry: ProviderTable<dyn TelemetryService>,
    pub wise: ProviderTable<dyn WiseAuthorityService>,
    pub llm: ProviderTable<dyn LlmService>,
    pub secrets: ProviderTable<dyn SecretsService>,
    pub runtime_control: ProviderTable<dyn RuntimeControlService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            communication: ProviderTable::new(ServiceType::Communication),
            memory: ProviderTable::new(ServiceType::Memory),
            tool: ProviderTable::new(ServiceType::Tool),
            audit: ProviderTable::new(ServiceType::Audit),
            telemetry: ProviderTable::new(ServiceType::Telemetry),
            wise: ProviderTable::new(ServiceType::WiseAuthority),
            llm: ProviderTable::new(ServiceType::Llm),
            secrets: ProviderTable::new(ServiceType::Secrets),
            runtime_control: ProviderTable::new(ServiceType::RuntimeControl),
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
