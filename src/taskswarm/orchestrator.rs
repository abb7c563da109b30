//! Orchestrator: planner JSON in, aggregated result out.
//!
//! The orchestrator glues the subsystems together: it validates the
//! planner's JSON, translates steps into sub-tasks on the [`TaskBoard`],
//! drives the [`WaveExecutor`] with a worker factory, routes completed
//! steps through the quality gate (applying any dynamic plan adjustments),
//! and finally hands every recorded result to the [`Aggregator`]. Progress
//! is reported through a host-provided [`EventHandler`]; the core neither
//! persists nor routes events itself.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::taskswarm::aggregator::{AggregationResult, Aggregator};
use crate::taskswarm::board::{BoardError, SubTask, SubTaskResult, TaskBoard};
use crate::taskswarm::config::EngineSettings;
use crate::taskswarm::event::{EventHandler, ProgressEvent};
use crate::taskswarm::executor::{
    cancellation_channel, CancelHandle, CancelSignal, WaveExecutor, WorkerFactory,
};
use crate::taskswarm::llm::LlmClient;
use crate::taskswarm::media::MediaGenerationClient;
use crate::taskswarm::messaging::MessageBus;
use crate::taskswarm::review::{PlanAdjustment, QualityGateReviewer, ReviewAction, ReviewResult};
use crate::taskswarm::roles::role_for_hint;
use crate::taskswarm::tool_registry::ToolRegistry;
use crate::taskswarm::worker::WorkerAgent;

/// One step of a planner-produced execution flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identity, unique within the plan.
    #[serde(default)]
    pub step_id: String,
    /// Ordinal used for dispatch priority and ordering.
    #[serde(default)]
    pub step_number: i32,
    /// Short display name.
    #[serde(default)]
    pub name: String,
    /// What the step should do; becomes the sub-task content.
    #[serde(default)]
    pub description: String,
    /// Role key; unknown values resolve to the default role.
    #[serde(default)]
    pub agent_type: String,
    /// Ids of steps this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// What the planner expects the step to produce.
    #[serde(default)]
    pub expected_output: String,
}

/// A validated plan.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// The planner's restatement of the job.
    pub refined_task: String,
    /// Key objectives listed by the planner.
    pub key_objectives: Vec<String>,
    /// Steps ordered by `step_number`, then id.
    pub steps: Vec<PlanStep>,
}

/// Orchestration errors.
#[derive(Debug)]
pub enum OrchestratorError {
    /// The planner JSON is structurally unusable.
    InvalidPlan(String),
    /// The board rejected the plan (duplicates, cycles).
    Board(BoardError),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::InvalidPlan(msg) => write!(f, "invalid plan: {}", msg),
            OrchestratorError::Board(e) => write!(f, "task board rejected plan: {}", e),
        }
    }
}

impl Error for OrchestratorError {}

impl From<BoardError> for OrchestratorError {
    fn from(e: BoardError) -> Self {
        OrchestratorError::Board(e)
    }
}

/// Parse and validate planner JSON.
///
/// Expected shape:
///
/// ```json
/// {
///   "refined_task": "...",
///   "key_objectives": ["..."],
///   "execution_flow": {
///     "steps": {
///       "step_1": {
///         "step_id": "step_1", "step_number": 1, "name": "...",
///         "description": "...", "agent_type": "researcher",
///         "dependencies": [], "expected_output": "..."
///       }
///     }
///   }
/// }
/// ```
///
/// Dependencies referencing ids outside the `steps` map are silently
/// dropped. An absent or empty `steps` map yields an empty plan, which
/// aggregates to an empty successful result.
pub fn parse_plan(value: &serde_json::Value) -> Result<Plan, OrchestratorError> {
    if !value.is_object() {
        return Err(OrchestratorError::InvalidPlan(
            "planner output is not a JSON object".to_string(),
        ));
    }

    let refined_task = value
        .get("refined_task")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();
    let key_objectives = value
        .get("key_objectives")
        .and_then(|o| o.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let steps_value = value
        .get("execution_flow")
        .and_then(|f| f.get("steps"))
        .and_then(|s| s.as_object());

    let mut steps: Vec<PlanStep> = Vec::new();
    if let Some(map) = steps_value {
        let known_ids: HashSet<&str> = map.keys().map(|k| k.as_str()).collect();
        for (key, step_value) in map {
            let mut step: PlanStep = serde_json::from_value(step_value.clone())
                .map_err(|e| OrchestratorError::InvalidPlan(format!("step {}: {}", key, e)))?;
            if step.step_id.is_empty() {
                step.step_id = key.clone();
            }
            if step.step_id != *key {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "step key '{}' disagrees with its step_id '{}'",
                    key, step.step_id
                )));
            }
            let before = step.dependencies.len();
            step.dependencies.retain(|dep| known_ids.contains(dep.as_str()));
            if step.dependencies.len() < before {
                log::debug!(
                    "step {}: dropped {} unknown dependency id(s)",
                    step.step_id,
                    before - step.dependencies.len()
                );
            }
            steps.push(step);
        }
    }
    steps.sort_by(|a, b| {
        a.step_number
            .cmp(&b.step_number)
            .then_with(|| a.step_id.cmp(&b.step_id))
    });

    Ok(Plan {
        refined_task,
        key_objectives,
        steps,
    })
}

/// Roles that consume upstream context as structured JSON rather than
/// readable text.
fn is_multimodal_consumer(role_key: &str) -> bool {
    matches!(
        role_key,
        "text_to_image"
            | "text_to_video"
            | "image_to_video"
            | "voice_synthesizer"
            | "image_analyst"
    )
}

/// Render the outputs of dependency steps into the opening context for a
/// worker. Multimodal consumers receive JSON they can parse structurally;
/// text roles receive readable sections.
fn render_upstream_context(
    dependencies: &[String],
    step_results: &HashMap<String, String>,
    step_names: &HashMap<String, String>,
    consumer_role: &str,
) -> String {
    let mut parts: Vec<serde_json::Value> = Vec::new();
    for dep_id in dependencies {
        let output = match step_results.get(dep_id) {
            Some(output) => output,
            None => continue,
        };
        let source = step_names
            .get(dep_id)
            .cloned()
            .unwrap_or_else(|| dep_id.clone());
        match serde_json::from_str::<serde_json::Value>(output) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.insert(
                    "_source_step".to_string(),
                    serde_json::Value::String(source),
                );
                parts.push(serde_json::Value::Object(map));
            }
            _ => {
                let truncated: String = output.chars().take(6000).collect();
                parts.push(serde_json::json!({
                    "_source_step": source,
                    "type": "text",
                    "text_content": truncated,
                }));
            }
        }
    }

    if parts.is_empty() {
        return String::new();
    }

    if is_multimodal_consumer(consumer_role) {
        let value = if parts.len() == 1 {
            parts.into_iter().next().unwrap_or_default()
        } else {
            serde_json::Value::Array(parts)
        };
        return value.to_string();
    }

    let mut sections = Vec::new();
    for part in &parts {
        let source = part
            .get("_source_step")
            .and_then(|s| s.as_str())
            .unwrap_or("upstream step");
        let kind = part.get("type").and_then(|t| t.as_str()).unwrap_or("text");
        if matches!(kind, "image" | "video" | "audio") {
            let urls = part
                .get("media_urls")
                .and_then(|u| u.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|u| u.as_str())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            sections.push(format!(
                "### Result of '{}':\nkind: {}\nmedia URLs:\n{}\n{}",
                source,
                kind,
                if urls.is_empty() { "(none)" } else { urls.as_str() },
                part.get("text_content").and_then(|t| t.as_str()).unwrap_or("")
            ));
        } else {
            let text = part
                .get("text_content")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| part.to_string());
            let truncated: String = text.chars().take(6000).collect();
            sections.push(format!("### Result of '{}':\n{}", source, truncated));
        }
    }
    sections.join("\n\n")
}

/// Shared per-job state the worker factory closes over.
struct JobState {
    task_id: String,
    board: Arc<TaskBoard>,
    steps: Mutex<HashMap<String, PlanStep>>,
    step_results: Mutex<HashMap<String, String>>,
    settings: EngineSettings,
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    media: Option<Arc<dyn MediaGenerationClient>>,
    bus: Option<Arc<dyn MessageBus>>,
    events: Option<Arc<dyn EventHandler>>,
    reviewer: Option<QualityGateReviewer>,
    cancel_signal: CancelSignal,
}

impl JobState {
    async fn emit(&self, event: ProgressEvent) {
        if let Some(handler) = &self.events {
            handler.on_progress_event(&event).await;
        }
    }

    async fn emit_progress(&self) {
        let counts = self.board.status_counts().await;
        let total = counts.total().max(1);
        let percent = (counts.completed * 100 / total).min(100) as u8;
        self.emit(ProgressEvent::TaskProgress {
            task_id: self.task_id.clone(),
            progress_percent: percent,
            status: if counts.unfinished() > 0 {
                "executing".to_string()
            } else {
                "aggregating".to_string()
            },
        })
        .await;
    }

    /// Apply reviewer-requested plan adjustments to the board.
    async fn apply_adjustments(&self, adjustments: &[PlanAdjustment]) {
        for adjustment in adjustments {
            match adjustment {
                PlanAdjustment::InsertStep { step } => {
                    let known: HashSet<String> = {
                        let steps = self.steps.lock().await;
                        steps.keys().cloned().collect()
                    };
                    let valid_deps: Vec<String> = step
                        .dependencies
                        .iter()
                        .filter(|d| known.contains(*d))
                        .cloned()
                        .collect();
                    let subtask = SubTask::new(
                        &step.step_id,
                        &self.task_id,
                        if step.description.is_empty() {
                            step.name.clone()
                        } else {
                            step.description.clone()
                        },
                        role_for_hint(&step.agent_type).name,
                    )
                    .with_dependencies(valid_deps)
                    .with_priority(step.step_number);

                    match self.board.publish_task(subtask).await {
                        Ok(()) => {
                            log::info!(
                                "quality gate inserted step {} into job {}",
                                step.step_id,
                                self.task_id
                            );
                            self.steps
                                .lock()
                                .await
                                .insert(step.step_id.clone(), step.clone());
                            self.emit(ProgressEvent::StepStatusChanged {
                                task_id: self.task_id.clone(),
                                step_id: step.step_id.clone(),
                                status: "pending".to_string(),
                                output_preview: None,
                                error: None,
                            })
                            .await;
                        }
                        Err(e) => log::warn!(
                            "could not insert adjustment step {}: {}",
                            step.step_id,
                            e
                        ),
                    }
                }
                PlanAdjustment::RaisePriority { step_id, priority } => {
                    match self.board.set_priority(step_id, *priority).await {
                        Ok(()) => log::info!(
                            "quality gate raised priority of {} to {}",
                            step_id,
                            priority
                        ),
                        Err(e) => {
                            log::warn!("could not adjust priority of {}: {}", step_id, e)
                        }
                    }
                }
            }
        }
    }

    /// Execute one sub-task: worker lifecycle, quality gate, bookkeeping.
    async fn run_step(self: Arc<Self>, subtask: SubTask) -> Result<SubTaskResult, Box<dyn Error + Send + Sync>> {
        let step = {
            let steps = self.steps.lock().await;
            steps.get(&subtask.id).cloned().unwrap_or_else(|| PlanStep {
                step_id: subtask.id.clone(),
                step_number: subtask.priority,
                name: subtask.id.clone(),
                description: subtask.content.clone(),
                agent_type: subtask.role_hint.clone(),
                dependencies: subtask.dependencies.iter().cloned().collect(),
                expected_output: String::new(),
            })
        };

        let role = role_for_hint(&subtask.role_hint);
        let upstream = {
            let step_results = self.step_results.lock().await;
            let step_names: HashMap<String, String> = {
                let steps = self.steps.lock().await;
                steps
                    .iter()
                    .map(|(id, s)| (id.clone(), s.name.clone()))
                    .collect()
            };
            let mut deps: Vec<String> = subtask.dependencies.iter().cloned().collect();
            deps.sort();
            render_upstream_context(&deps, &step_results, &step_names, role.name)
        };

        if self.registry.total_calls().await >= self.settings.max_tool_calls {
            log::warn!(
                "job {}: tool-call budget ({}) exhausted; workers proceed without headroom",
                self.task_id,
                self.settings.max_tool_calls
            );
        }

        let max_retries = self.settings.max_retry_on_failure;
        let mut attempt: u32 = 1;
        let mut result;

        loop {
            let worker_id = format!(
                "agent_{}_{}",
                role.name,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
            self.emit(ProgressEvent::AgentCreated {
                task_id: self.task_id.clone(),
                agent_id: worker_id.clone(),
                role: role.name.to_string(),
                step_id: subtask.id.clone(),
            })
            .await;

            let mut worker = WorkerAgent::new(
                worker_id.clone(),
                role,
                self.client.clone(),
                self.registry.clone(),
            )
            .with_agent_timeout(Duration::from_secs(self.settings.agent_timeout_secs))
            .with_cancel_signal(self.cancel_signal.clone());
            if let Some(media) = &self.media {
                worker = worker.with_media_client(media.clone());
            }
            if let Some(bus) = &self.bus {
                worker = worker.with_message_bus(bus.clone());
            }
            if let Some(events) = &self.events {
                worker = worker.with_event_sink(events.clone(), self.task_id.clone());
            }

            self.emit(ProgressEvent::AgentUpdated {
                task_id: self.task_id.clone(),
                agent_id: worker_id.clone(),
                status: "running".to_string(),
            })
            .await;

            result = worker.execute(&subtask, &upstream).await?;

            self.emit(ProgressEvent::AgentUpdated {
                task_id: self.task_id.clone(),
                agent_id: worker_id.clone(),
                status: worker.status().as_str().to_string(),
            })
            .await;
            self.emit(ProgressEvent::AgentRemoved {
                task_id: self.task_id.clone(),
                agent_id: worker_id,
            })
            .await;

            // Quality gate: only successful outputs are reviewed, and a
            // reviewer problem never blocks the step.
            let reviewer = match &self.reviewer {
                Some(reviewer) if result.success => reviewer,
                _ => break,
            };
            let output_text = result
                .output
                .as_ref()
                .map(|o| o.as_text())
                .unwrap_or_default();
            let prior: Vec<(String, String)> = {
                let step_results = self.step_results.lock().await;
                let steps = self.steps.lock().await;
                step_results
                    .iter()
                    .map(|(id, output)| {
                        let name = steps
                            .get(id)
                            .map(|s| s.name.clone())
                            .unwrap_or_else(|| id.clone());
                        (name, output.clone())
                    })
                    .collect()
            };

            let review = reviewer
                .review_step(&step, &output_text, &prior, attempt)
                .await;
            self.emit_review(&review).await;

            match review.action {
                ReviewAction::Accept | ReviewAction::AcceptWithWarning => {
                    self.apply_adjustments(&review.adjustments).await;
                    break;
                }
                ReviewAction::Retry if attempt <= max_retries => {
                    log::info!(
                        "quality gate demands retry of step {} (attempt {})",
                        subtask.id,
                        attempt
                    );
                    attempt += 1;
                    continue;
                }
                ReviewAction::Retry => {
                    let downgraded = QualityGateReviewer::downgrade_to_warning(review, max_retries);
                    self.emit_review(&downgraded).await;
                    self.apply_adjustments(&downgraded.adjustments).await;
                    break;
                }
            }
        }

        // Record the surviving output for downstream steps.
        if result.success {
            if let Some(output) = &result.output {
                self.step_results
                    .lock()
                    .await
                    .insert(subtask.id.clone(), output.as_text());
            }
        }

        let preview = result.output.as_ref().map(|o| {
            let text = o.as_text();
            text.chars().take(300).collect::<String>()
        });
        self.emit(ProgressEvent::StepStatusChanged {
            task_id: self.task_id.clone(),
            step_id: subtask.id.clone(),
            status: if result.success {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            output_preview: preview,
            error: result.error.clone(),
        })
        .await;
        self.emit_progress().await;

        Ok(result)
    }

    async fn emit_review(&self, review: &ReviewResult) {
        self.emit(ProgressEvent::StepReviewed {
            task_id: self.task_id.clone(),
            step_id: review.step_id.clone(),
            score: review.score,
            action: review.action.as_str().to_string(),
            reason: review.reason.clone(),
            attempt: review.attempt,
        })
        .await;
    }
}

/// The engine facade: owns the shared services and drives whole jobs.
pub struct Orchestrator {
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    media: Option<Arc<dyn MediaGenerationClient>>,
    bus: Option<Arc<dyn MessageBus>>,
    events: Option<Arc<dyn EventHandler>>,
    settings: EngineSettings,
    active_cancel: std::sync::Mutex<Option<CancelHandle>>,
}

impl Orchestrator {
    /// Create an orchestrator over a client and a fully-registered tool
    /// registry. Registration must be complete before the first job runs.
    pub fn new(client: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            registry,
            media: None,
            bus: None,
            events: None,
            settings: EngineSettings::default(),
            active_cancel: std::sync::Mutex::new(None),
        }
    }

    /// Attach a media generation client for generator roles (builder
    /// pattern).
    pub fn with_media_client(mut self, media: Arc<dyn MediaGenerationClient>) -> Self {
        self.media = Some(media);
        self
    }

    /// Attach an inter-agent message bus (builder pattern).
    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Attach a progress-event handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the engine settings (builder pattern).
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Cancel the currently running job, if any. In-flight workers are
    /// asked to stop and the executor drains before the job returns.
    pub fn cancel(&self) {
        if let Some(handle) = self
            .active_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            log::info!("job cancellation requested");
            handle.cancel();
        }
    }

    /// Run a job from raw planner JSON.
    pub async fn run_job(
        &self,
        task_id: &str,
        planner_json: &serde_json::Value,
    ) -> Result<AggregationResult, OrchestratorError> {
        let plan = parse_plan(planner_json)?;
        self.run_plan(task_id, plan).await
    }

    /// Run a job from a validated [`Plan`].
    pub async fn run_plan(
        &self,
        task_id: &str,
        plan: Plan,
    ) -> Result<AggregationResult, OrchestratorError> {
        log::info!(
            "job {}: {} step(s), task '{}'",
            task_id,
            plan.steps.len(),
            plan.refined_task
        );

        let board = Arc::new(TaskBoard::new());
        let subtasks: Vec<SubTask> = plan
            .steps
            .iter()
            .map(|step| {
                SubTask::new(
                    &step.step_id,
                    task_id,
                    if step.description.is_empty() {
                        step.name.clone()
                    } else {
                        step.description.clone()
                    },
                    role_for_hint(&step.agent_type).name,
                )
                .with_dependencies(step.dependencies.clone())
                .with_priority(step.step_number)
            })
            .collect();
        board.publish_tasks(subtasks).await?;

        let (cancel_handle, cancel_signal) = cancellation_channel();
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cancel_handle);

        let reviewer = if self.settings.enable_quality_gate {
            Some(QualityGateReviewer::new(
                self.client.clone(),
                self.settings.quality_threshold,
            ))
        } else {
            None
        };

        let steps_by_id: HashMap<String, PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), s.clone()))
            .collect();
        let state = Arc::new(JobState {
            task_id: task_id.to_string(),
            board: board.clone(),
            steps: Mutex::new(steps_by_id),
            step_results: Mutex::new(HashMap::new()),
            settings: self.settings.clone(),
            client: self.client.clone(),
            registry: self.registry.clone(),
            media: self.media.clone(),
            bus: self.bus.clone(),
            events: self.events.clone(),
            reviewer,
            cancel_signal: cancel_signal.clone(),
        });

        state
            .emit(ProgressEvent::TaskCreated {
                task_id: task_id.to_string(),
            })
            .await;

        let factory_state = state.clone();
        let factory: WorkerFactory = Arc::new(move |subtask: SubTask| {
            let state = factory_state.clone();
            Box::pin(state.run_step(subtask))
        });

        let mut executor = WaveExecutor::new().with_cancel_signal(cancel_signal);
        if let Some(cap) = self.settings.max_concurrent_workers {
            executor = executor.with_concurrency_cap(cap);
        }
        let outcome = executor.execute(board.clone(), factory).await;
        log::info!(
            "job {}: {} wave(s), {} completed, {} failed, {} blocked",
            task_id,
            outcome.total_waves,
            outcome.completed_tasks,
            outcome.failed_tasks,
            outcome.blocked_tasks
        );

        let results = board.take_results().await;
        let final_plan = board.subtasks().await;
        let aggregator = Aggregator::new(
            self.settings.conflict_resolution,
            self.settings.output_type,
        );
        let aggregation = aggregator.aggregate(task_id, &results, &final_plan);

        state
            .emit(ProgressEvent::TaskCompleted {
                task_id: task_id.to_string(),
                success: aggregation.success,
            })
            .await;

        *self
            .active_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        Ok(aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_drops_unknown_dependencies() {
        let value = serde_json::json!({
            "refined_task": "compare frameworks",
            "key_objectives": ["breadth", "accuracy"],
            "execution_flow": {
                "steps": {
                    "s1": {
                        "step_id": "s1", "step_number": 1, "name": "search",
                        "description": "find data", "agent_type": "searcher",
                        "dependencies": [], "expected_output": "raw data"
                    },
                    "s2": {
                        "step_id": "s2", "step_number": 2, "name": "write",
                        "description": "write it up", "agent_type": "writer",
                        "dependencies": ["s1", "ghost"], "expected_output": "report"
                    }
                }
            }
        });
        let plan = parse_plan(&value).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.refined_task, "compare frameworks");
        assert_eq!(plan.steps[0].step_id, "s1");
        assert_eq!(plan.steps[1].dependencies, vec!["s1"]);
    }

    #[test]
    fn plan_parsing_rejects_non_objects_and_key_mismatch() {
        assert!(parse_plan(&serde_json::json!("not a plan")).is_err());

        let mismatched = serde_json::json!({
            "execution_flow": {"steps": {"a": {"step_id": "b"}}}
        });
        assert!(parse_plan(&mismatched).is_err());
    }

    #[test]
    fn empty_plan_parses_to_zero_steps() {
        let plan = parse_plan(&serde_json::json!({})).unwrap();
        assert!(plan.steps.is_empty());

        let plan = parse_plan(&serde_json::json!({"execution_flow": {"steps": {}}})).unwrap();
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn steps_order_by_number_then_id() {
        let value = serde_json::json!({
            "execution_flow": {
                "steps": {
                    "b": {"step_id": "b", "step_number": 2},
                    "a": {"step_id": "a", "step_number": 1},
                    "c": {"step_id": "c", "step_number": 2}
                }
            }
        });
        let plan = parse_plan(&value).unwrap();
        let order: Vec<&str> = plan.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn upstream_context_renders_for_text_and_multimodal_consumers() {
        let mut results = HashMap::new();
        results.insert("s1".to_string(), "plain findings".to_string());
        results.insert(
            "s2".to_string(),
            serde_json::json!({"type": "image", "media_urls": ["https://cdn/i.png"], "text_content": "a fox"})
                .to_string(),
        );
        let mut names = HashMap::new();
        names.insert("s1".to_string(), "Search".to_string());
        names.insert("s2".to_string(), "Render".to_string());

        let deps = vec!["s1".to_string(), "s2".to_string()];
        let text_view = render_upstream_context(&deps, &results, &names, "writer");
        assert!(text_view.contains("### Result of 'Search'"));
        assert!(text_view.contains("plain findings"));
        assert!(text_view.contains("media URLs"));
        assert!(text_view.contains("https://cdn/i.png"));

        let json_view =
            render_upstream_context(&deps, &results, &names, "image_to_video");
        let parsed: serde_json::Value = serde_json::from_str(&json_view).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[1]["media_urls"][0], "https://cdn/i.png");

        assert_eq!(
            render_upstream_context(&[], &results, &names, "writer"),
            ""
        );
    }
}
