//! Secrets bus.
//!
//! Security-sensitive facade: every operation is rate-limited per handler
//! over a 60-second sliding window, and a denied call returns a safe
//! default (text unchanged, nothing recalled) rather than an error: a
//! handler that is being throttled must not learn anything it could not
//! learn otherwise. Denials and secret detections are logged for audit.

use crate::mindfabric::buses::base::{BusCore, BusEnvelope, BusStats, SyncOnlyProcessor};
use crate::mindfabric::registry::ServiceRegistry;
use crate::mindfabric::service::{capability, SecretInfo, SecretRef, ServiceType};
use log::{error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of the rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Per-operation call caps within one window.
fn max_calls_per_minute(operation: &str) -> usize {
    match operation {
        "process_incoming_text" => 100,
        "recall_secret" => 50,
        "forget_secret" => 20,
        "update_filter_config" => 10,
        "decapsulate_secrets" => 30,
        _ => 50,
    }
}

/// Sliding-window call tracker, keyed by (handler, operation).
struct RateLimiter {
    calls: StdMutex<HashMap<(String, String), Vec<Instant>>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            calls: StdMutex::new(HashMap::new()),
        }
    }

    /// Record-and-check: admitted calls count against the window, denied
    /// calls do not.
    fn check(&self, handler: &str, operation: &str) -> bool {
        let now = Instant::now();
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        let bucket = calls
            .entry((handler.to_string(), operation.to_string()))
            .or_insert_with(Vec::new);
        bucket.retain(|t| now.duration_since(*t) < RATE_WINDOW);
        if bucket.len() >= max_calls_per_minute(operation) {
            return false;
        }
        bucket.push(now);
        true
    }
}

/// Typed facade over secrets providers.
pub struct SecretsBus {
    core: BusCore<BusEnvelope>,
    registry: Arc<ServiceRegistry>,
    limiter: RateLimiter,
}

impl SecretsBus {
    pub fn new(registry: Arc<ServiceRegistry>, max_queue_size: usize) -> Self {
        Self {
            core: BusCore::new(ServiceType::Secrets, max_queue_size),
            registry,
            limiter: RateLimiter::new(),
        }
    }

    pub async fn start(&self) {
        self.core
            .start(Arc::new(SyncOnlyProcessor::new(ServiceType::Secrets)))
            .await;
    }

    pub async fn stop(&self) {
        self.core.stop().await;
    }

    /// Scan incoming text for secrets. Rate-limited; on denial or failure
    /// the original text comes back unchanged with no references.
    pub async fn process_incoming_text(
        &self,
        text: &str,
        context_hint: &str,
        source_message_id: Option<&str>,
        handler_name: &str,
    ) -> (String, Vec<SecretRef>) {
        if !self.limiter.check(handler_name, "process_incoming_text") {
            warn!(
                "rate limit exceeded for {} on process_incoming_text",
                handler_name
            );
            return (text.to_string(), Vec::new());
        }

        let registration = match self
            .registry
            .secrets
            .get(handler_name, &[capability::PROCESS_INCOMING_TEXT])
            .await
        {
            Some(r) => r,
            None => {
                error!("no secrets service available for {}", handler_name);
                return (text.to_string(), Vec::new());
            }
        };

        match registration
            .service
            .process_incoming_text(text, context_hint, source_message_id)
            .await
        {
            Ok((filtered, refs)) => {
                if !refs.is_empty() {
                    warn!("secrets detected by {}: count={}", handler_name, refs.len());
                }
                (filtered, refs)
            }
            Err(e) => {
                error!(
                    "secrets provider {} failed to process text: {}",
                    registration.name, e
                );
                (text.to_string(), Vec::new())
            }
        }
    }

    /// Recall a stored secret. Rate-limited; `None` on denial.
    pub async fn recall_secret(
        &self,
        secret_uuid: &str,
        purpose: &str,
        accessor: Option<&str>,
        decrypt: bool,
        handler_name: &str,
    ) -> Option<SecretInfo> {
        if !self.limiter.check(handler_name, "recall_secret") {
            warn!("rate limit exceeded for {} on recall_secret", handler_name);
            return None;
        }

        let accessor = accessor.unwrap_or(handler_name);
        info!(
            "secret recall requested by {}: uuid={}, purpose={}, decrypt={}",
            handler_name, secret_uuid, purpose, decrypt
        );

        let registration = self
            .registry
            .secrets
            .get(handler_name, &[capability::RECALL_SECRET])
            .await?;

        match registration
            .service
            .recall_secret(secret_uuid, purpose, accessor, decrypt)
            .await
        {
            Ok(Some(info)) => {
                info!("secret recalled by {}: uuid={}", handler_name, secret_uuid);
                Some(info)
            }
            Ok(None) => {
                warn!(
                    "secret not found or access denied for {}: uuid={}",
                    handler_name, secret_uuid
                );
                None
            }
            Err(e) => {
                error!(
                    "secrets provider {} failed to recall {}: {}",
                    registration.name, secret_uuid, e
                );
                None
            }
        }
    }

    /// Delete a secret. Rate-limited.
    pub async fn forget_secret(
        &self,
        secret_uuid: &str,
        accessor: Option<&str>,
        handler_name: &str,
    ) -> bool {
        if !self.limiter.check(handler_name, "forget_secret") {
            warn!("rate limit exceeded for {} on forget_secret", handler_name);
            return false;
        }

        let accessor = accessor.unwrap_or(handler_name);
        warn!(
            "secret deletion requested by {}: uuid={}, accessor={}",
            handler_name, secret_uuid, accessor
        );

        let registration = match self
            .registry
            .secrets
            .get(handler_name, &[capability::FORGET_SECRET])
            .await
        {
            Some(r) => r,
            None => {
                error!("no secrets service available for {}", handler_name);
                return false;
            }
        };

        match registration.service.forget_secret(secret_uuid, accessor).await {
            Ok(deleted) => {
                if deleted {
                    warn!("secret deleted by {}: uuid={}", handler_name, secret_uuid);
                }
                deleted
            }
            Err(e) => {
                error!(
                    "secrets provider {} failed to forget {}: {}",
                    registration.name, secret_uuid, e
                );
                false
            }
        }
    }

    /// Replace secret references in action parameters with decrypted
    /// values. Rate-limited; on denial the parameters pass through intact.
    pub async fn decapsulate_secrets_in_parameters(
        &self,
        parameters: &Value,
        action_type: &str,
        context: &HashMap<String, String>,
        handler_name: &str,
    ) -> Value {
        if !self.limiter.check(handler_name, "decapsulate_secrets") {
            warn!(
                "rate limit exceeded for {} on decapsulate_secrets",
                handler_name
            );
            return parameters.clone();
        }

        let registration = match self
            .registry
            .secrets
            .get(handler_name, &[capability::DECAPSULATE_SECRETS])
            .await
        {
            Some(r) => r,
            None => {
                error!("no secrets service available for {}", handler_name);
                return parameters.clone();
            }
        };

        match registration
            .service
            .decapsulate_secrets_in_parameters(parameters, action_type, context)
            .await
        {
            Ok(result) => {
                if &result != parameters {
                    info!(
                        "secrets decapsulated for {}: action={}",
                        handler_name, action_type
                    );
                }
                result
            }
            Err(e) => {
                error!(
                    "secrets provider {} failed to decapsulate: {}",
                    registration.name, e
                );
                parameters.clone()
            }
        }
    }

    /// Update the secrets filter configuration. Rate-limited.
    pub async fn update_filter_config(
        &self,
        updates: &Value,
        accessor: Option<&str>,
        handler_name: &str,
    ) -> Value {
        if !self.limiter.check(handler_name, "update_filter_config") {
            warn!(
                "rate limit exceeded for {} on update_filter_config",
                handler_name
            );
            return serde_json::json!({ "error": "rate limited" });
        }

        let accessor = accessor.unwrap_or(handler_name);
        info!("filter config update requested by {}", handler_name);

        let registration = match self
            .registry
            .secrets
            .get(handler_name, &[capability::UPDATE_FILTER_CONFIG])
            .await
        {
            Some(r) => r,
            None => {
                error!("no secrets service available for {}", handler_name);
                return serde_json::json!({ "error": "service unavailable" });
            }
        };

        match registration.service.update_filter_config(updates, accessor).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    "secrets provider {} failed to update filter config: {}",
                    registration.name, e
                );
                serde_json::json!({ "error": e.to_string() })
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
