//! Worker agent: one bounded tool-calling conversation per sub-task.
//!
//! A worker is created for exactly one sub-task and disposed once it reaches
//! a terminal state. Its lifecycle is a validated state machine
//! (`Idle → Running → {Completed | Failed | Terminated}`); transitions out
//! of a terminal state are rejected.
//!
//! # Capability routing
//!
//! Roles list *capability names* (`web_search`, `web_extractor`,
//! `code_interpreter`) alongside ordinary tool names. For each entry:
//!
//! - native capability + native model → not exposed as a function tool; the
//!   per-request configuration turns the capability on server-side;
//! - native capability + non-native model → substituted by the sandbox
//!   tools (`sandbox_browser` for both web capabilities, added once;
//!   `sandbox_code_interpreter` for the interpreter) and exposed through
//!   function calling;
//! - anything else → exposed as a function tool from the registry.
//!
//! The per-request configuration enables native search only when the role
//! carries a web capability on a native model, enables the native code
//! interpreter analogously, forces thinking on whenever the code interpreter
//! is on, and forces thinking off for the data-fetch roles (`searcher`,
//! `fact_checker`) and for models without a reasoning channel.

use chrono::Utc;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::taskswarm::board::{OutputPayload, SubTask, SubTaskResult};
use crate::taskswarm::event::{EventHandler, ProgressEvent};
use crate::taskswarm::executor::CancelSignal;
use crate::taskswarm::llm::{
    strip_thinking_markers, ChatMessage, ChatRole, LlmClient, TokenUsage, ToolDefinition,
};
use crate::taskswarm::media::{await_media_task, MediaGenerationClient, MediaGenerationOptions};
use crate::taskswarm::messaging::{MessageBus, MessageKind};
use crate::taskswarm::model::{capabilities, ModelConfig};
use crate::taskswarm::roles::{
    GeneratorKind, RoleSpec, NATIVE_CODE_INTERPRETER, NATIVE_WEB_EXTRACTOR, NATIVE_WEB_SEARCH,
};
use crate::taskswarm::tool_parsing::parse_inline_tool_calls;
use crate::taskswarm::tool_registry::{ToolCallRecord, ToolRegistry};
use crate::taskswarm::tools::{SANDBOX_BROWSER_TOOL, SANDBOX_CODE_INTERPRETER_TOOL};

/// Upper bound on conversation turns within one execution attempt.
pub const MAX_ITERATIONS: usize = 20;
/// Consecutive failed tool calls tolerated before the tool set is withdrawn.
const MAX_CONSECUTIVE_TOOL_ERRORS: usize = 3;
/// Whole-conversation retries after a failed attempt.
const MAX_CONVERSATION_RETRIES: u32 = 2;
/// Grace period [`WorkerAgent::stop`] waits before forcing termination.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Created, not yet executing.
    Idle,
    /// Executing its sub-task.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// Stopped by request or cancellation. Terminal.
    Terminated,
}

impl WorkerStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Terminated
        )
    }

    /// Lower-case name used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Terminated => "terminated",
        }
    }
}

/// Whether `from → to` is a legal lifecycle transition.
pub fn valid_transition(from: WorkerStatus, to: WorkerStatus) -> bool {
    use WorkerStatus::*;
    match from {
        Idle => matches!(to, Running | Terminated),
        Running => matches!(to, Completed | Failed | Terminated),
        Completed | Failed | Terminated => false,
    }
}

/// Worker lifecycle errors.
#[derive(Debug, Clone)]
pub enum WorkerError {
    /// A status change violated the lifecycle table.
    InvalidTransition {
        /// Status before the rejected transition.
        from: WorkerStatus,
        /// Status the caller asked for.
        to: WorkerStatus,
    },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::InvalidTransition { from, to } => write!(
                f,
                "invalid worker transition: {} -> {}",
                from.as_str(),
                to.as_str()
            ),
        }
    }
}

impl Error for WorkerError {}

/// An LLM-backed agent executing exactly one sub-task.
pub struct WorkerAgent {
    /// Stable worker identity, referenced by tool-call records and events.
    pub id: String,
    role: &'static RoleSpec,
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    media: Option<Arc<dyn MediaGenerationClient>>,
    bus: Option<Arc<dyn MessageBus>>,
    base_config: ModelConfig,
    agent_timeout: Duration,
    status: Mutex<WorkerStatus>,
    stop_requested: AtomicBool,
    cancel: Option<CancelSignal>,
    completed_at: Mutex<Option<chrono::DateTime<Utc>>>,
    events: Option<(Arc<dyn EventHandler>, String)>,
}

impl WorkerAgent {
    /// Create an idle worker for the given role.
    pub fn new(
        id: impl Into<String>,
        role: &'static RoleSpec,
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            client,
            registry,
            media: None,
            bus: None,
            base_config: role.model_config.clone(),
            agent_timeout: Duration::from_secs(600),
            status: Mutex::new(WorkerStatus::Idle),
            stop_requested: AtomicBool::new(false),
            cancel: None,
            completed_at: Mutex::new(None),
            events: None,
        }
    }

    /// Attach a media generation client; required for generator roles
    /// (builder pattern).
    pub fn with_media_client(mut self, media: Arc<dyn MediaGenerationClient>) -> Self {
        self.media = Some(media);
        self
    }

    /// Attach the inter-agent message bus (builder pattern). Without a bus
    /// the inbox drain is skipped entirely.
    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Observe a job-wide cancellation signal (builder pattern).
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Override the outer wall-clock cap across all iterations
    /// (builder pattern).
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Override the role's base model configuration (builder pattern).
    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.base_config = config;
        self
    }

    /// Report per-iteration output as `agent_stream` progress events for
    /// the given job (builder pattern).
    pub fn with_event_sink(mut self, events: Arc<dyn EventHandler>, job_id: String) -> Self {
        self.events = Some((events, job_id));
        self
    }

    async fn emit_stream(&self, chunk: &str, full_content: &str) {
        if chunk.is_empty() {
            return;
        }
        if let Some((events, job_id)) = &self.events {
            events
                .on_progress_event(&ProgressEvent::AgentStream {
                    task_id: job_id.clone(),
                    agent_id: self.id.clone(),
                    chunk: chunk.to_string(),
                    full_content: full_content.to_string(),
                })
                .await;
        }
    }

    /// Role this worker executes under.
    pub fn role(&self) -> &'static RoleSpec {
        self.role
    }

    /// Current lifecycle status.
    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the worker reached a terminal state, if it has.
    pub fn completed_at(&self) -> Option<chrono::DateTime<Utc>> {
        *self.completed_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, to: WorkerStatus) -> Result<(), WorkerError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == to {
            return Ok(());
        }
        if !valid_transition(*status, to) {
            return Err(WorkerError::InvalidTransition { from: *status, to });
        }
        log::debug!("worker {}: {} -> {}", self.id, status.as_str(), to.as_str());
        *status = to;
        if to.is_terminal() {
            *self.completed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
        Ok(())
    }

    fn stop_flag_raised(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            return true;
        }
        self.cancel
            .as_ref()
            .map(|signal| *signal.borrow())
            .unwrap_or(false)
    }

    /// Request a graceful stop.
    ///
    /// Sets the stop flag, waits up to 30 s for the execution loop to notice
    /// it and exit, then forces `Terminated` if the worker is still running.
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        while self.status() == WorkerStatus::Running && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if !status.is_terminal() {
            log::warn!("worker {} did not stop within grace period; forcing", self.id);
            *status = WorkerStatus::Terminated;
            *self.completed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
    }

    // ---- Capability routing ----

    fn uses_sandbox_browser(&self) -> bool {
        let has_web = self
            .role
            .allowed_tools
            .iter()
            .any(|t| *t == NATIVE_WEB_SEARCH || *t == NATIVE_WEB_EXTRACTOR);
        has_web && !capabilities(self.base_config.model).native
    }

    fn uses_sandbox_code_interpreter(&self) -> bool {
        let has_ci = self
            .role
            .allowed_tools
            .iter()
            .any(|t| *t == NATIVE_CODE_INTERPRETER);
        has_ci && !capabilities(self.base_config.model).native
    }

    /// Native capabilities that actually work for the current model.
    fn effective_native_capabilities(&self) -> HashSet<&'static str> {
        if !capabilities(self.base_config.model).native {
            return HashSet::new();
        }
        self.role
            .allowed_tools
            .iter()
            .copied()
            .filter(|t| {
                matches!(
                    *t,
                    NATIVE_WEB_SEARCH | NATIVE_WEB_EXTRACTOR | NATIVE_CODE_INTERPRETER
                )
            })
            .collect()
    }

    /// Function tools exposed to the model for this worker.
    pub(crate) fn function_tools(&self) -> Vec<ToolDefinition> {
        let native = self.effective_native_capabilities();
        let mut tools = Vec::new();
        let mut browser_added = false;

        for tool_name in self.role.allowed_tools {
            if native.contains(tool_name) {
                continue; // enabled through the request configuration instead
            }
            let resolved = match *tool_name {
                NATIVE_WEB_SEARCH | NATIVE_WEB_EXTRACTOR if self.uses_sandbox_browser() => {
                    if browser_added {
                        continue; // both web capabilities share one substitute
                    }
                    browser_added = true;
                    SANDBOX_BROWSER_TOOL
                }
                NATIVE_CODE_INTERPRETER if self.uses_sandbox_code_interpreter() => {
                    SANDBOX_CODE_INTERPRETER_TOOL
                }
                other => other,
            };
            match self.registry.get(resolved) {
                Some(spec) => tools.push(ToolDefinition {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters_schema: spec.parameters_schema.clone(),
                }),
                None => log::warn!(
                    "worker {}: tool '{}' for role '{}' is not registered",
                    self.id,
                    resolved,
                    self.role.name
                ),
            }
        }
        tools
    }

    /// Tool names this worker may invoke, sandbox substitutes included.
    fn allowed_tool_names(&self) -> HashSet<String> {
        let mut allowed: HashSet<String> = self
            .role
            .allowed_tools
            .iter()
            .map(|t| t.to_string())
            .collect();
        if self.uses_sandbox_browser() {
            allowed.insert(SANDBOX_BROWSER_TOOL.to_string());
        }
        if self.uses_sandbox_code_interpreter() {
            allowed.insert(SANDBOX_CODE_INTERPRETER_TOOL.to_string());
        }
        allowed
    }

    /// Derive the per-request configuration from the role and the model's
    /// capability flags.
    pub(crate) fn request_config(&self) -> ModelConfig {
        let caps = capabilities(self.base_config.model);
        let has_web = self
            .role
            .allowed_tools
            .iter()
            .any(|t| *t == NATIVE_WEB_SEARCH || *t == NATIVE_WEB_EXTRACTOR);
        let has_ci = self
            .role
            .allowed_tools
            .iter()
            .any(|t| *t == NATIVE_CODE_INTERPRETER);

        let enable_search = caps.native && has_web;
        let enable_code_interpreter = caps.native && has_ci;

        let is_data_role = matches!(self.role.name, "searcher" | "fact_checker");
        let mut enable_thinking = if enable_code_interpreter {
            true // the interpreter only runs with the reasoning channel on
        } else if is_data_role {
            false // latency matters more than depth for data fetching
        } else {
            self.base_config.enable_thinking
        };
        if !caps.supports_thinking {
            enable_thinking = false;
        }

        let mut cfg = self.base_config.clone();
        cfg.enable_search = enable_search;
        cfg.search_strategy = None;
        cfg.enable_code_interpreter = enable_code_interpreter;
        cfg.enable_thinking = enable_thinking;
        cfg
    }

    // ---- Prompt construction ----

    fn build_system_prompt(&self, subtask: &SubTask) -> String {
        let now = Utc::now();
        let time_line = format!(
            "[System time] {} UTC | Treat this date as authoritative: it overrides any \
             older date assumptions from training data.",
            now.format("%Y-%m-%d %H:%M:%S (%A)")
        );

        let native = self.effective_native_capabilities();
        let mut builtin_lines = Vec::new();
        if native.contains(NATIVE_WEB_SEARCH) {
            builtin_lines.push("- Web search: you can search the internet for current information.");
        }
        if native.contains(NATIVE_WEB_EXTRACTOR) {
            builtin_lines.push("- Page extraction: you can read the full content of web pages.");
        }
        if native.contains(NATIVE_CODE_INTERPRETER) {
            builtin_lines
                .push("- Code interpreter: you can write and execute Python for computation.");
        }

        let function_tools = self.function_tools();
        let mut tool_lines = Vec::new();
        for tool in &function_tools {
            tool_lines.push(format!("  - {}: {}", tool.name, tool.description));
        }

        let mut tools_section = String::new();
        if !builtin_lines.is_empty() {
            tools_section.push_str("## Built-in capabilities (enabled automatically)\n");
            tools_section.push_str(&builtin_lines.join("\n"));
            tools_section.push_str("\n\n");
        }
        if !tool_lines.is_empty() {
            tools_section.push_str("## Callable tools\n");
            tools_section.push_str(&tool_lines.join("\n"));
            tools_section.push_str(
                "\n\nStrategy: analyse what the task needs, pick the right tool, call it, \
                 and verify the result. Adjust keywords when a search disappoints; try \
                 another approach when a tool errors.",
            );
        }
        if tools_section.is_empty() {
            tools_section.push_str(
                "No external tools are available. Work from your own knowledge and reasoning.",
            );
        }

        format!(
            "{time}\n\n{role}\n\n# Current task\n{task}\n\n\
             # Topic constraint (highest priority)\n\
             Stay strictly on the task's subject. Search only with keywords directly \
             related to it, and discard any search results from unrelated domains. Do not \
             introduce entities the task does not mention, and do not pad the output with \
             off-topic data or analysis.\n\n\
             # Data provenance\n\
             Attribute every figure to its source and keep source citations from upstream \
             results intact; never replace them with vague phrases like \"per earlier \
             steps\". Report exact version numbers and dates as found, and flag values \
             that contradict common sense as unverified.\n\n\
             {tools}\n\n\
             # Output requirements\n\
             1. Produce the final deliverable directly, in Markdown.\n\
             2. Support claims with concrete data and examples.\n\
             3. Do not narrate your process or include filler like \"let me analyse\".\n\
             4. Mark uncertain statements with your confidence.",
            time = time_line,
            role = self.role.system_prompt,
            task = subtask.content,
            tools = tools_section,
        )
    }

    // ---- Execution ----

    /// Execute the sub-task to completion.
    ///
    /// `upstream_context` carries the rendered outputs of dependency steps;
    /// it is injected into the opening user message. The returned result
    /// always refers to `subtask.id`; its `success` flag reflects the
    /// conversation outcome.
    pub async fn execute(
        &self,
        subtask: &SubTask,
        upstream_context: &str,
    ) -> Result<SubTaskResult, WorkerError> {
        self.set_status(WorkerStatus::Running)?;
        let started = tokio::time::Instant::now();
        log::info!(
            "worker {} ({}) starting task {}",
            self.id,
            self.role.name,
            subtask.id
        );

        let mut usage = TokenUsage::default();
        let mut tool_records: Vec<ToolCallRecord> = Vec::new();

        let outcome = if self.role.is_generator() {
            self.execute_generator(subtask, upstream_context).await
        } else {
            self.execute_conversation(subtask, upstream_context, started, &mut usage, &mut tool_records)
                .await
        };

        let execution_time = started.elapsed().as_secs_f64();
        let (success, output, error) = match outcome {
            ExecutionOutcome::Success(payload) => (true, Some(payload), None),
            ExecutionOutcome::Failure(message) => (false, None, Some(message)),
            ExecutionOutcome::Stopped => (false, None, None),
        };

        let final_status = if !success && error.is_none() {
            // Stopped by request or cancellation: terminal, but not an error.
            WorkerStatus::Terminated
        } else if success {
            WorkerStatus::Completed
        } else {
            WorkerStatus::Failed
        };
        if let Err(e) = self.set_status(final_status) {
            // stop() may have forced termination while we were finishing.
            log::debug!("worker {}: final transition skipped ({})", self.id, e);
        }

        Ok(SubTaskResult {
            subtask_id: subtask.id.clone(),
            agent_id: self.id.clone(),
            success,
            output,
            error,
            tool_calls: tool_records,
            execution_time,
            token_usage: usage,
        })
    }

    async fn execute_conversation(
        &self,
        subtask: &SubTask,
        upstream_context: &str,
        started: tokio::time::Instant,
        usage: &mut TokenUsage,
        tool_records: &mut Vec<ToolCallRecord>,
    ) -> ExecutionOutcome {
        let request_config = self.request_config();
        let allowed = self.allowed_tool_names();
        let mut last_error: Option<String> = None;

        for attempt in 0..=MAX_CONVERSATION_RETRIES {
            if self.stop_flag_raised() {
                return ExecutionOutcome::Stopped;
            }

            let mut messages = vec![
                ChatMessage::new(ChatRole::System, self.build_system_prompt(subtask)),
                ChatMessage::new(ChatRole::User, opening_message(subtask, upstream_context)),
            ];
            if attempt > 0 {
                messages.push(ChatMessage::new(
                    ChatRole::User,
                    format!(
                        "[Retry {}/{}] The previous attempt failed: {}. Take a different \
                         approach this time.",
                        attempt,
                        MAX_CONVERSATION_RETRIES,
                        last_error.as_deref().unwrap_or("unknown error")
                    ),
                ));
            }

            let mut tools = self.function_tools();
            let mut consecutive_errors = 0usize;
            let mut iteration = 0usize;
            let mut attempt_error: Option<String> = None;
            let mut streamed_content = String::new();

            log::debug!(
                "worker {}: attempt {} with {} function tool(s), search={}, interpreter={}",
                self.id,
                attempt,
                tools.len(),
                request_config.enable_search,
                request_config.enable_code_interpreter
            );

            while iteration < MAX_ITERATIONS {
                if self.stop_flag_raised() {
                    return ExecutionOutcome::Stopped;
                }
                if started.elapsed() >= self.agent_timeout {
                    attempt_error = Some(format!(
                        "agent timeout after {}s",
                        self.agent_timeout.as_secs()
                    ));
                    break;
                }

                // Inbox drain: a Shutdown message stops the worker, anything
                // else becomes system context for the next model call.
                if let Some(bus) = &self.bus {
                    for message in bus.drain(&self.id).await {
                        if message.kind == MessageKind::Shutdown {
                            self.stop_requested.store(true, Ordering::SeqCst);
                        } else {
                            messages.push(ChatMessage::new(
                                ChatRole::System,
                                format!("[Message from {}]: {}", message.sender_id, message.content),
                            ));
                        }
                    }
                    if self.stop_flag_raised() {
                        return ExecutionOutcome::Stopped;
                    }
                }

                iteration += 1;
                let tool_slice = if tools.is_empty() {
                    None
                } else {
                    Some(tools.as_slice())
                };
                let response = match self.client.chat(&messages, tool_slice, &request_config).await
                {
                    Ok(response) => response,
                    Err(e) => {
                        attempt_error = Some(e.to_string());
                        break;
                    }
                };
                usage.absorb(&response.usage);
                streamed_content.push_str(&response.content);
                self.emit_stream(&response.content, &streamed_content).await;

                // Some non-native models emit tool calls as plain text.
                let mut calls = response.tool_calls.clone();
                if calls.is_empty() && !tools.is_empty() && !response.content.is_empty() {
                    calls = parse_inline_tool_calls(&response.content);
                    if !calls.is_empty() {
                        log::debug!(
                            "worker {}: recovered {} tool call(s) from text output",
                            self.id,
                            calls.len()
                        );
                    }
                }

                if calls.is_empty() {
                    let text = strip_thinking_markers(&response.content);
                    log::info!(
                        "worker {} finished task {} in {} iteration(s), {} chars",
                        self.id,
                        subtask.id,
                        iteration,
                        text.len()
                    );
                    return ExecutionOutcome::Success(OutputPayload::Text(text));
                }

                messages.push(ChatMessage::assistant_with_calls(
                    response.content.clone(),
                    calls.clone(),
                ));

                let mut errors_this_round = 0usize;
                for call in &calls {
                    // Calls outside the role's tool set are refused before
                    // they reach the registry, so they leave no record and
                    // do not disturb the exactly-once call accounting.
                    if !allowed.contains(&call.name) {
                        errors_this_round += 1;
                        messages.push(ChatMessage::tool_result(
                            call.id.clone(),
                            format!(
                                "Error: tool '{}' is not available to role '{}'",
                                call.name, self.role.name
                            ),
                        ));
                        continue;
                    }

                    let record = self
                        .registry
                        .invoke_tool(&call.name, call.arguments.clone(), &self.id)
                        .await;
                    let body = if record.success {
                        record
                            .result
                            .as_ref()
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "null".to_string())
                    } else {
                        errors_this_round += 1;
                        format!(
                            "Error: {}",
                            record.error.as_deref().unwrap_or("tool failed")
                        )
                    };
                    messages.push(ChatMessage::tool_result(call.id.clone(), body));
                    tool_records.push(record);
                }

                if errors_this_round > 0 {
                    consecutive_errors += errors_this_round;
                    log::warn!(
                        "worker {}: {} tool error(s) ({} consecutive)",
                        self.id,
                        errors_this_round,
                        consecutive_errors
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_TOOL_ERRORS {
                        tools.clear();
                        messages.push(ChatMessage::new(
                            ChatRole::User,
                            "Tool calls keep failing. Stop calling tools and answer from \
                             the information you already have.",
                        ));
                    }
                } else {
                    consecutive_errors = 0;
                }
            }

            if iteration >= MAX_ITERATIONS && attempt_error.is_none() {
                attempt_error = Some(format!(
                    "max iterations ({}) reached without completion",
                    MAX_ITERATIONS
                ));
            }

            last_error = attempt_error;
            if attempt < MAX_CONVERSATION_RETRIES {
                log::warn!(
                    "worker {}: attempt {} failed ({}), retrying",
                    self.id,
                    attempt,
                    last_error.as_deref().unwrap_or("unknown")
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        ExecutionOutcome::Failure(
            last_error.unwrap_or_else(|| "execution failed with no recorded error".to_string()),
        )
    }

    /// Generator roles bypass the conversation loop and drive the media
    /// APIs directly, producing a structured JSON payload.
    async fn execute_generator(
        &self,
        subtask: &SubTask,
        upstream_context: &str,
    ) -> ExecutionOutcome {
        let media = match &self.media {
            Some(media) => media.clone(),
            None => {
                return ExecutionOutcome::Failure(
                    "generator role has no media generation client configured".to_string(),
                )
            }
        };
        let kind = match self.role.generator {
            Some(kind) => kind,
            None => {
                return ExecutionOutcome::Failure(format!(
                    "role '{}' is not a media generator",
                    self.role.name
                ))
            }
        };

        let prompt = extract_media_prompt(upstream_context, &subtask.content);
        let options = MediaGenerationOptions::default();

        let result: Result<serde_json::Value, Box<dyn Error + Send + Sync>> = match kind {
            GeneratorKind::Image => media.text_to_image(&prompt, &options).await.map(|urls| {
                serde_json::json!({
                    "type": "image",
                    "media_urls": urls,
                    "text_content": prompt,
                })
            }),
            GeneratorKind::Video => match media.text_to_video(&prompt, &options).await {
                Ok(task_id) => await_media_task(
                    media.as_ref(),
                    &task_id,
                    Duration::from_secs(10),
                    Duration::from_secs(600),
                )
                .await
                .map(|urls| {
                    serde_json::json!({
                        "type": "video",
                        "media_urls": urls,
                        "text_content": prompt,
                    })
                }),
                Err(e) => Err(e),
            },
            GeneratorKind::ImageToVideo => {
                match extract_upstream_image_url(upstream_context) {
                    None => Err("no upstream image URL available to animate".into()),
                    Some(image_url) => {
                        match media.image_to_video(&image_url, &prompt, &options).await {
                            Ok(task_id) => await_media_task(
                                media.as_ref(),
                                &task_id,
                                Duration::from_secs(10),
                                Duration::from_secs(600),
                            )
                            .await
                            .map(|urls| {
                                serde_json::json!({
                                    "type": "video",
                                    "media_urls": urls,
                                    "source_image": image_url,
                                    "text_content": prompt,
                                })
                            }),
                            Err(e) => Err(e),
                        }
                    }
                }
            }
            GeneratorKind::Speech => media.text_to_speech(&prompt, &options).await.map(|url| {
                serde_json::json!({
                    "type": "audio",
                    "media_urls": [url],
                    "text_content": prompt,
                })
            }),
        };

        match result {
            Ok(payload) => ExecutionOutcome::Success(OutputPayload::Structured(payload)),
            Err(e) => ExecutionOutcome::Failure(e.to_string()),
        }
    }
}

enum ExecutionOutcome {
    Success(OutputPayload),
    Failure(String),
    Stopped,
}

fn opening_message(subtask: &SubTask, upstream_context: &str) -> String {
    if upstream_context.is_empty() {
        format!("Begin the task: {}", subtask.content)
    } else {
        format!(
            "## Upstream step results (input for your work)\n{}\n\nBegin the task: {}",
            upstream_context, subtask.content
        )
    }
}

/// Pull a generation prompt out of upstream context, preferring the
/// structured `text_content` field, else falling back to the task text.
fn extract_media_prompt(upstream_context: &str, fallback: &str) -> String {
    if upstream_context.is_empty() {
        return fallback.to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(upstream_context) {
        let candidate = match &value {
            serde_json::Value::Object(map) => map
                .get("text_content")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
            serde_json::Value::Array(items) => items.iter().find_map(|item| {
                item.get("text_content")
                    .and_then(|t| t.as_str())
                    .map(|s| s.to_string())
            }),
            _ => None,
        };
        if let Some(text) = candidate {
            let trimmed: String = text.chars().take(500).collect();
            if !trimmed.trim().is_empty() {
                return trimmed;
            }
        }
    }
    fallback.to_string()
}

/// Find an image URL in upstream context: structured `media_urls` of an
/// image payload first, then a bare URL with an image extension.
fn extract_upstream_image_url(upstream_context: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(upstream_context) {
        let items: Vec<&serde_json::Value> = match &value {
            serde_json::Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for item in items {
            if item.get("type").and_then(|t| t.as_str()) == Some("image") {
                if let Some(url) = item
                    .get("media_urls")
                    .and_then(|u| u.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|u| u.as_str())
                {
                    return Some(url.to_string());
                }
            }
        }
    }
    lazy_static::lazy_static! {
        static ref IMAGE_URL: regex::Regex = regex::Regex::new(
            r"https?://[^\s\x22')\]]+\.(?:png|jpg|jpeg|gif|webp|bmp)[^\s\x22')\]]*"
        )
        .expect("invalid image-url pattern");
    }
    IMAGE_URL
        .find(upstream_context)
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use WorkerStatus::*;
        assert!(valid_transition(Idle, Running));
        assert!(valid_transition(Idle, Terminated));
        assert!(valid_transition(Running, Completed));
        assert!(valid_transition(Running, Failed));
        assert!(valid_transition(Running, Terminated));
        assert!(!valid_transition(Idle, Completed));
        assert!(!valid_transition(Completed, Running));
        assert!(!valid_transition(Failed, Terminated));
        assert!(!valid_transition(Terminated, Running));
    }

    #[test]
    fn media_prompt_prefers_structured_text_content() {
        let ctx = r#"{"type": "text", "text_content": "a red fox at dawn"}"#;
        assert_eq!(extract_media_prompt(ctx, "fallback"), "a red fox at dawn");
        assert_eq!(extract_media_prompt("", "fallback"), "fallback");
        assert_eq!(extract_media_prompt("not json", "fallback"), "fallback");
    }

    #[test]
    fn upstream_image_url_extraction() {
        let structured = r#"{"type": "image", "media_urls": ["https://cdn/x.png"]}"#;
        assert_eq!(
            extract_upstream_image_url(structured).as_deref(),
            Some("https://cdn/x.png")
        );

        let textual = "see https://cdn.example.com/photo.jpeg?sig=abc for the render";
        assert_eq!(
            extract_upstream_image_url(textual).as_deref(),
            Some("https://cdn.example.com/photo.jpeg?sig=abc")
        );

        assert!(extract_upstream_image_url("no media here").is_none());
    }
}
