//! Service provider contracts.
//!
//! Adapters plug concrete providers into the runtime by implementing one of
//! the traits in this module and registering it with the
//! [`ServiceRegistry`](crate::mindfabric::registry::ServiceRegistry). The
//! buses resolve providers through the registry and talk to them only via
//! these traits; no bus ever knows a concrete provider type.
//!
//! All traits are object-safe: structured LLM output travels as a
//! [`serde_json::Value`] validated against the caller-supplied schema, and
//! typed deserialization happens inside the LLM bus's generic wrapper.
//!
//! # Implementing a provider
//!
//! ```rust
//! use async_trait::async_trait;
//! use mindfabric::service::{ChatMessage, LlmService, ProviderResult, ResourceUsage, Service};
//! use serde_json::{json, Value};
//!
//! struct EchoProvider;
//!
//! #[async_trait]
//! impl Service for EchoProvider {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//! }
//!
//! #[async_trait]
//! impl LlmService for EchoProvider {
//!     async fn call_llm_structured(
//!         &self,
//!         messages: &[ChatMessage],
//!         _response_schema: &Value,
//!         _max_tokens: u32,
//!         _temperature: f64,
//!     ) -> ProviderResult<(Value, ResourceUsage)> {
//!         let content = messages.last().map(|m| m.content.clone()).unwrap_or_default();
//!         Ok((json!({ "answer": content }), ResourceUsage::default()))
//!     }
//! }
//! ```

use crate::mindfabric::graph::{
    GraphNode, GraphScope, MemoryOpResult, MemoryQuery, MemorySearchResult, TimeSeriesPoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Result type for provider calls. Providers report failures as boxed
/// errors; the owning bus catches them at its boundary and converts them to
/// typed statuses, so provider errors never cross a bus's public surface.
pub type ProviderResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// The closed set of service kinds routed by the bus fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Communication,
    Memory,
    Tool,
    Audit,
    Telemetry,
    WiseAuthority,
    Llm,
    Secrets,
    RuntimeControl,
    Filter,
    Config,
    Orchestrator,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Communication => "communication",
            ServiceType::Memory => "memory",
            ServiceType::Tool => "tool",
            ServiceType::Audit => "audit",
            ServiceType::Telemetry => "telemetry",
            ServiceType::WiseAuthority => "wise_authority",
            ServiceType::Llm => "llm",
            ServiceType::Secrets => "secrets",
            ServiceType::RuntimeControl => "runtime_control",
            ServiceType::Filter => "filter",
            ServiceType::Config => "config",
            ServiceType::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration priority. Lower values are tried first; within one priority
/// registration order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// Capability strings advertised at registration and required by callers.
/// A provider is eligible only when its capability set covers everything
/// the caller asks for.
pub mod capability {
    pub const SEND_MESSAGE: &str = "send_message";
    pub const FETCH_MESSAGES: &str = "fetch_messages";

    pub const CALL_LLM_STRUCTURED: &str = "call_llm_structured";

    pub const MEMORIZE: &str = "memorize";
    pub const RECALL: &str = "recall";
    pub const FORGET: &str = "forget";
    pub const SEARCH_MEMORIES: &str = "search_memories";
    pub const RECALL_TIMESERIES: &str = "recall_timeseries";
    pub const MEMORIZE_METRIC: &str = "memorize_metric";
    pub const MEMORIZE_LOG: &str = "memorize_log";
    pub const EXPORT_IDENTITY_CONTEXT: &str = "export_identity_context";
    pub const UPDATE_IDENTITY_GRAPH: &str = "update_identity_graph";
    pub const UPDATE_ENVIRONMENT_GRAPH: &str = "update_environment_graph";

    pub const EXECUTE_TOOL: &str = "execute_tool";
    pub const GET_AVAILABLE_TOOLS: &str = "get_available_tools";

    pub const LOG_EVENT: &str = "log_event";
    pub const GET_AUDIT_TRAIL: &str = "get_audit_trail";

    pub const RECORD_METRIC: &str = "record_metric";
    pub const QUERY_TELEMETRY: &str = "query_telemetry";

    pub const SEND_DEFERRAL: &str = "send_deferral";
    pub const FETCH_GUIDANCE: &str = "fetch_guidance";

    pub const PROCESS_INCOMING_TEXT: &str = "process_incoming_text";
    pub const RECALL_SECRET: &str = "recall_secret";
    pub const FORGET_SECRET: &str = "forget_secret";
    pub const DECAPSULATE_SECRETS: &str = "decapsulate_secrets_in_parameters";
    pub const UPDATE_FILTER_CONFIG: &str = "update_filter_config";

    pub const RUNTIME_CONTROL: &str = "runtime_control";
}

/// Base trait every provider implements.
///
/// `is_healthy` is probed (and briefly cached) by the registry before a
/// provider is handed out; a provider that reports unhealthy is skipped in
/// favour of the next registration in priority order.
#[async_trait]
pub trait Service: Send + Sync {
    /// Stable provider name, used for metrics, circuit breakers, and logs.
    fn name(&self) -> &str;

    /// Liveness probe. Defaults to healthy.
    async fn is_healthy(&self) -> bool {
        true
    }

    /// Capability strings this provider supports. Informational; the
    /// authoritative capability set is the one given at registration.
    async fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Chat role for LLM messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message handed to an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Resource accounting reported by an LLM provider after every call.
/// All figures are non-negative; unknown figures stay zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_total: u64,
    pub cost_cents: f64,
    pub water_ml: f64,
    pub carbon_g: f64,
    pub energy_kwh: f64,
    pub model_used: Option<String>,
}

/// A message fetched from a communication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Communication provider: chat adapters, mail bridges, anything that can
/// deliver text to a channel.
#[async_trait]
pub trait CommunicationService: Service {
    async fn send_message(&self, channel_id: &str, content: &str) -> ProviderResult<bool>;

    async fn fetch_messages(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> ProviderResult<Vec<FetchedMessage>>;
}

/// LLM provider. Must advertise the
/// [`capability::CALL_LLM_STRUCTURED`] capability at registration.
#[async_trait]
pub trait LlmService: Service {
    /// Generate a structured response conforming to `response_schema`
    /// (a JSON Schema value), together with resource accounting.
    async fn call_llm_structured(
        &self,
        messages: &[ChatMessage],
        response_schema: &Value,
        max_tokens: u32,
        temperature: f64,
    ) -> ProviderResult<(Value, ResourceUsage)>;
}

/// Request to update identity-scope graph nodes. Applied only when
/// `wa_approved` is set; the memory provider refuses it otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityUpdateRequest {
    pub node_updates: Vec<GraphNode>,
    pub source: String,
    pub wa_approved: bool,
    pub approval_reference: Option<String>,
}

/// Request to update environment-scope graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentUpdateRequest {
    pub node_updates: Vec<GraphNode>,
    pub source: String,
}

/// Memory provider: the graph store behind the memory bus.
#[async_trait]
pub trait MemoryService: Service {
    async fn memorize(&self, node: &GraphNode) -> ProviderResult<MemoryOpResult>;

    async fn recall(&self, query: &MemoryQuery) -> ProviderResult<Vec<GraphNode>>;

    async fn forget(&self, node_id: &str, scope: GraphScope) -> ProviderResult<MemoryOpResult>;

    async fn search_memories(
        &self,
        query: &str,
        scope: GraphScope,
        limit: usize,
    ) -> ProviderResult<Vec<MemorySearchResult>>;

    async fn recall_timeseries(
        &self,
        scope: GraphScope,
        hours: u32,
        data_types: Option<&[&str]>,
        tag_filters: Option<&HashMap<String, String>>,
    ) -> ProviderResult<Vec<TimeSeriesPoint>>;

    async fn memorize_metric(
        &self,
        metric_name: &str,
        value: f64,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> ProviderResult<MemoryOpResult>;

    async fn memorize_log(
        &self,
        log_message: &str,
        log_level: &str,
        tags: HashMap<String, String>,
        scope: GraphScope,
    ) -> ProviderResult<MemoryOpResult>;

    async fn export_identity_context(&self) -> ProviderResult<String>;

    async fn update_identity_graph(
        &self,
        request: &IdentityUpdateRequest,
    ) -> ProviderResult<MemoryOpResult>;

    async fn update_environment_graph(
        &self,
        request: &EnvironmentUpdateRequest,
    ) -> ProviderResult<MemoryOpResult>;
}

/// Outcome status of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionStatus {
    Success,
    Failed,
    Timeout,
    NotFound,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub status: ToolExecutionStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn failed(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            status: ToolExecutionStatus::Failed,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Descriptor for an available tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// Tool provider.
#[async_trait]
pub trait ToolService: Service {
    async fn execute_tool(&self, tool_name: &str, parameters: &Value) -> ProviderResult<ToolResult>;

    async fn get_available_tools(&self) -> ProviderResult<Vec<ToolInfo>>;

    async fn get_tool_info(&self, tool_name: &str) -> ProviderResult<Option<ToolInfo>>;

    /// Poll for the result of a long-running execution by correlation id.
    async fn get_tool_result(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> ProviderResult<Option<ToolResult>>;
}

/// One entry of an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: String,
    pub event_type: String,
    pub entity_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Audit provider. Writes are synchronous: `log_event` returns only after
/// the entry is durable.
#[async_trait]
pub trait AuditService: Service {
    async fn log_event(&self, event_type: &str, data: &Value) -> ProviderResult<()>;

    async fn get_audit_trail(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> ProviderResult<Vec<AuditEntry>>;
}

/// A recorded metric sample returned from telemetry queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub metric_name: String,
    pub value: f64,
    pub tags: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Resource ceilings a telemetry provider may enforce or report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_tokens_per_hour: Option<u64>,
    pub max_cost_cents_per_day: Option<f64>,
}

/// Telemetry provider.
#[async_trait]
pub trait TelemetryService: Service {
    async fn record_metric(
        &self,
        metric_name: &str,
        value: f64,
        handler_name: &str,
        tags: &HashMap<String, String>,
    ) -> ProviderResult<bool>;

    async fn record_resource_usage(
        &self,
        usage: &ResourceUsage,
        tags: &HashMap<String, String>,
    ) -> ProviderResult<bool>;

    async fn query_metrics(
        &self,
        metric_names: &[String],
        time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        tags: Option<&HashMap<String, String>>,
        limit: usize,
    ) -> ProviderResult<Vec<MetricRecord>>;

    async fn get_service_status(&self) -> ProviderResult<HashMap<String, bool>>;

    async fn get_resource_limits(&self) -> ProviderResult<ResourceLimits>;
}

/// Context for a guidance request to the Wise Authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceContext {
    pub thought_id: String,
    pub task_id: String,
    pub question: String,
    pub context: HashMap<String, String>,
}

/// Context for a deferral or review request to the Wise Authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralContext {
    pub thought_id: String,
    pub task_id: String,
    pub reason: String,
    pub defer_until: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Wise Authority provider: the external reviewer consulted on deferrals
/// and identity-scope changes.
#[async_trait]
pub trait WiseAuthorityService: Service {
    async fn fetch_guidance(&self, context: &GuidanceContext) -> ProviderResult<Option<String>>;

    async fn send_deferral(&self, context: &DeferralContext) -> ProviderResult<bool>;
}

/// An opaque reference to a detected-and-vaulted secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret_uuid: String,
    pub context_hint: String,
    pub sensitivity: String,
}

/// Metadata (and optionally the decrypted value) of a stored secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretInfo {
    pub secret_uuid: String,
    pub description: String,
    pub sensitivity: String,
    pub value: Option<String>,
}

/// Secrets provider: detection, vaulting, and decapsulation.
#[async_trait]
pub trait SecretsService: Service {
    /// Scan incoming text, replace detected secrets with references, and
    /// return the filtered text plus the references.
    async fn process_incoming_text(
        &self,
        text: &str,
        context_hint: &str,
        source_message_id: Option<&str>,
    ) -> ProviderResult<(String, Vec<SecretRef>)>;

    async fn recall_secret(
        &self,
        secret_uuid: &str,
        purpose: &str,
        accessor: &str,
        decrypt: bool,
    ) -> ProviderResult<Option<SecretInfo>>;

    async fn forget_secret(&self, secret_uuid: &str, accessor: &str) -> ProviderResult<bool>;

    /// Replace secret references inside action parameters with their
    /// decrypted values.
    async fn decapsulate_secrets_in_parameters(
        &self,
        parameters: &Value,
        action_type: &str,
        context: &HashMap<String, String>,
    ) -> ProviderResult<Value>;

    async fn update_filter_config(
        &self,
        updates: &Value,
        accessor: &str,
    ) -> ProviderResult<Value>;
}

/// Processor run state reported by runtime-control providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorStatus {
    Running,
    Paused,
    Stopped,
}

/// A loaded adapter, as reported by runtime control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub adapter_id: String,
    pub adapter_type: String,
    pub running: bool,
}

/// Runtime-control provider: processor stepping and adapter lifecycle.
#[async_trait]
pub trait RuntimeControlService: Service {
    async fn single_step(&self) -> ProviderResult<ProcessorStatus>;

    async fn pause_processing(&self) -> ProviderResult<ProcessorStatus>;

    async fn resume_processing(&self) -> ProviderResult<ProcessorStatus>;

    async fn shutdown(&self, reason: &str) -> ProviderResult<()>;

    async fn load_adapter(
        &self,
        adapter_type: &str,
        adapter_id: &str,
        config: &Value,
    ) -> ProviderResult<AdapterInfo>;

    async fn unload_adapter(&self, adapter_id: &str) -> ProviderResult<bool>;

    async fn list_adapters(&self) -> ProviderResult<Vec<AdapterInfo>>;

    async fn get_runtime_config(&self) -> ProviderResult<Value>;
}
