//! Tool catalog and mediated invocation.
//!
//! Tools register once at startup (before any worker runs) binding a name to
//! a description, a JSON-schema parameter spec, an async handler, a per-call
//! timeout, and a retry-on-failure flag. Workers never call handlers
//! directly: every call goes through [`ToolRegistry::invoke_tool`], which
//! enforces the timeout, captures handler failures into the returned
//! [`ToolCallRecord`] instead of propagating them, and keeps per-caller
//! history plus a global call counter for rate limiting.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskswarm::tool_registry::{ToolRegistry, ToolSpec};
//!
//! # async fn demo() {
//! let mut registry = ToolRegistry::new();
//! registry.register(ToolSpec::new(
//!     "echo",
//!     "Returns its arguments unchanged.",
//!     serde_json::json!({"type": "object", "properties": {}}),
//!     Arc::new(|args| Box::pin(async move { Ok(args) })),
//! ));
//!
//! let registry = Arc::new(registry);
//! let record = registry
//!     .invoke_tool("echo", serde_json::json!({"x": 1}), "agent-1")
//!     .await;
//! assert!(record.success);
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::taskswarm::clients::retry::{classify_message, ErrorClass};

/// Boxed future returned by tool handlers.
pub type ToolHandlerFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, Box<dyn Error + Send + Sync>>> + Send>>;

/// Async tool handler: JSON arguments in, JSON result out.
pub type ToolHandler = Arc<dyn Fn(serde_json::Value) -> ToolHandlerFuture + Send + Sync>;

/// Errors surfaced by registry configuration (invocation failures are
/// captured into records, never returned as `Err`).
#[derive(Debug, Clone)]
pub enum ToolRegistryError {
    /// A tool with the same name is already registered.
    DuplicateTool(String),
}

impl fmt::Display for ToolRegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolRegistryError::DuplicateTool(name) => {
                write!(f, "tool already registered: {}", name)
            }
        }
    }
}

impl Error for ToolRegistryError {}

/// A registered tool: identity, schema, handler, and execution policy.
pub struct ToolSpec {
    /// Unique tool name referenced by roles and by the model.
    pub name: String,
    /// Human-readable description surfaced to the model.
    pub description: String,
    /// JSON Schema describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
    handler: ToolHandler,
    /// Per-call timeout enforced by the registry.
    pub timeout: Duration,
    /// Retry the handler once when it fails with a transient error.
    pub retry_on_failure: bool,
}

impl ToolSpec {
    /// Define a tool with the default 30 s timeout and no retry.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: serde_json::Value,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            handler,
            timeout: Duration::from_secs(30),
            retry_on_failure: false,
        }
    }

    /// Override the per-call timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry the handler once on transient failure (builder pattern).
    pub fn with_retry(mut self) -> Self {
        self.retry_on_failure = true;
        self
    }
}

/// Full record of one mediated tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    /// Unique id of this invocation.
    pub call_id: String,
    /// Name of the invoked tool.
    pub tool_name: String,
    /// Arguments the caller supplied.
    pub arguments: serde_json::Value,
    /// Handler result on success, `None` on failure.
    pub result: Option<serde_json::Value>,
    /// Whether the handler completed without error inside the timeout.
    pub success: bool,
    /// Error description on failure (`"timeout"` category for deadline hits).
    pub error: Option<String>,
    /// When the registry dispatched the handler.
    pub started_at: DateTime<Utc>,
    /// When the handler returned or the timeout fired.
    pub finished_at: DateTime<Utc>,
    /// Identity of the calling worker.
    pub agent_id: String,
}

#[derive(Default)]
struct RegistryCounters {
    /// Per-caller call history, in invocation order.
    history: HashMap<String, Vec<ToolCallRecord>>,
    /// Total invocations across all callers. Exactly one increment per
    /// produced record.
    total_calls: u64,
}

/// Catalog of callable tools keyed by name.
///
/// Registration happens during startup on `&mut self`; after that the
/// registry is shared read-mostly behind an `Arc` and only the counters
/// mutate, guarded by their own lock.
pub struct ToolRegistry {
    tools: HashMap<String, ToolSpec>,
    counters: Mutex<RegistryCounters>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            counters: Mutex::new(RegistryCounters::default()),
        }
    }

    /// Register a tool. Replaces nothing: a duplicate name is an error so a
    /// sandbox tool cannot silently shadow another registration.
    pub fn register(&mut self, spec: ToolSpec) -> Result<(), ToolRegistryError> {
        if self.tools.contains_key(&spec.name) {
            return Err(ToolRegistryError::DuplicateTool(spec.name));
        }
        log::debug!("registered tool '{}'", spec.name);
        self.tools.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Borrow a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Names of all registered tools, sorted for stable output.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Invoke a tool on behalf of `agent_id`.
    ///
    /// Never returns `Err`: unknown tools, handler failures, and timeouts
    /// are all captured into the record so the worker can forward them to
    /// the model as tool-result messages.
    pub async fn invoke_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        agent_id: &str,
    ) -> ToolCallRecord {
        let call_id = format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let started_at = Utc::now();

        let outcome = match self.tools.get(name) {
            None => Err(format!("tool not found: {}", name)),
            Some(spec) => {
                let mut attempt_result = Self::run_handler(spec, arguments.clone()).await;
                if attempt_result.is_err() && spec.retry_on_failure {
                    let message = attempt_result.as_ref().err().cloned().unwrap_or_default();
                    if classify_message(&message) != ErrorClass::Permanent {
                        log::debug!("tool '{}' failed transiently, retrying once", name);
                        attempt_result = Self::run_handler(spec, arguments.clone()).await;
                    }
                }
                attempt_result
            }
        };

        let finished_at = Utc::now();
        let record = match outcome {
            Ok(result) => ToolCallRecord {
                call_id,
                tool_name: name.to_string(),
                arguments,
                result: Some(result),
                success: true,
                error: None,
                started_at,
                finished_at,
                agent_id: agent_id.to_string(),
            },
            Err(message) => {
                log::warn!("tool '{}' failed for {}: {}", name, agent_id, message);
                ToolCallRecord {
                    call_id,
                    tool_name: name.to_string(),
                    arguments,
                    result: None,
                    success: false,
                    error: Some(message),
                    started_at,
                    finished_at,
                    agent_id: agent_id.to_string(),
                }
            }
        };

        let mut counters = self.counters.lock().await;
        counters.total_calls += 1;
        counters
            .history
            .entry(agent_id.to_string())
            .or_insert_with(Vec::new)
            .push(record.clone());

        record
    }

    async fn run_handler(
        spec: &ToolSpec,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        match tokio::time::timeout(spec.timeout, (spec.handler)(arguments)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_elapsed) => Err(format!(
                "timeout: tool '{}' exceeded {:?}",
                spec.name, spec.timeout
            )),
        }
    }

    /// Call history for one caller, in invocation order.
    pub async fn call_history(&self, agent_id: &str) -> Vec<ToolCallRecord> {
        self.counters
            .lock()
            .await
            .history
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total invocations across all callers.
    pub async fn total_calls(&self) -> u64 {
        self.counters.lock().await.total_calls
    }
}
