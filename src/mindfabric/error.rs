//! Runtime error kinds.
//!
//! Expected operational failures travel as typed statuses on the result
//! structs (`MemoryOpResult`, `ToolResult`, and friends); buses never unwind for
//! those. [`FabricError`] covers everything else: infrastructure faults,
//! exhausted failover, and policy refusals that have no status channel.

use thiserror::Error;

/// Error kinds surfaced by the runtime core.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The registry had no provider satisfying the capability requirements.
    #[error("no {0} provider available")]
    ProviderUnavailable(&'static str),

    /// A provider call raised; the message carries the provider's reason.
    #[error("provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    /// Skipped a provider because its circuit breaker is open.
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Every candidate provider failed; wraps the last failure seen.
    #[error("all LLM services failed for {handler}: {last_error}")]
    AllProvidersFailed { handler: String, last_error: String },

    /// Enqueue was rejected because the bus queue is full or stopped.
    #[error("bus queue full")]
    QueueFull,

    /// The secrets bus denied the call under its sliding-window limit.
    #[error("rate limit exceeded for {handler} on {operation}")]
    RateLimited { handler: String, operation: String },

    /// A policy refusal (e.g. identity-scope write without WA approval).
    #[error("denied: {0}")]
    Denied(String),

    /// The orchestrator refused to apply or rolled back an adaptation.
    #[error("variance budget exceeded: {0}")]
    VarianceExceeded(String),

    /// Malformed node, edge, proposal, or schedule rejected at write time.
    #[error("validation error: {0}")]
    Validation(String),

    /// Relational store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Attribute maps or payloads that failed to round-trip through JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reserved for emergency-stop triggers.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the crate.
pub type FabricResult<T> = Result<T, FabricError>;
