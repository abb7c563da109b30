//! Shared task board: sub-tasks, dependency tracking, atomic claiming.
//!
//! The board is the single owner of every sub-task's lifecycle state. All
//! mutating operations serialise on one internal lock; readiness computation
//! is linear in the number of entries and runs under that lock. No
//! CPU-heavy work ever holds it.
//!
//! Status semantics:
//!
//! - `Waiting` — at least one dependency is not `Completed`.
//! - `Pending` — every dependency is `Completed` and nobody has claimed it.
//! - `Claimed` / `Running` — a worker owns the task.
//! - `Completed` / `Failed` / `Blocked` — terminal; transitions out of a
//!   terminal state are rejected.
//!
//! A task becomes `Blocked` when any dependency (transitively) terminated as
//! `Failed` or `Blocked`; see [`TaskBoard::propagate_failure`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt;
use tokio::sync::Mutex;

use crate::taskswarm::llm::TokenUsage;
use crate::taskswarm::tool_registry::ToolCallRecord;

/// Canonical error text carried by the synthetic results of blocked tasks.
pub const BLOCKED_ERROR: &str = "blocked by failed dependency";

/// One planner-produced unit of work.
#[derive(Debug, Clone)]
pub struct SubTask {
    /// Opaque identity, unique within a job.
    pub id: String,
    /// Identity of the parent job.
    pub parent_task_id: String,
    /// Natural-language description of what to do.
    pub content: String,
    /// Key into the predefined role table.
    pub role_hint: String,
    /// Ids of sub-tasks that must complete first.
    pub dependencies: HashSet<String>,
    /// Dispatch priority; higher runs earlier when several tasks are ready.
    pub priority: i32,
    /// Planner's complexity estimate.
    pub estimated_complexity: f64,
}

impl SubTask {
    /// Build a sub-task with no dependencies, priority 0, complexity 1.0.
    pub fn new(
        id: impl Into<String>,
        parent_task_id: impl Into<String>,
        content: impl Into<String>,
        role_hint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_task_id: parent_task_id.into(),
            content: content.into(),
            role_hint: role_hint.into(),
            dependencies: HashSet::new(),
            priority: 0,
            estimated_complexity: 1.0,
        }
    }

    /// Set the dependency ids (builder pattern).
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(|d| d.into()).collect();
        self
    }

    /// Set the dispatch priority (builder pattern).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the complexity estimate (builder pattern).
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.estimated_complexity = complexity;
        self
    }
}

/// Lifecycle state of a board entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Ready to be claimed: all dependencies completed.
    Pending,
    /// At least one dependency has not completed.
    Waiting,
    /// Atomically claimed by a dispatcher, not yet running.
    Claimed,
    /// A worker is executing the task.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// A dependency failed or was blocked. Terminal.
    Blocked,
}

impl TaskStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    /// Lower-case name used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

/// Output payload of a finished sub-task.
///
/// Text roles produce [`OutputPayload::Text`]; generator roles produce
/// [`OutputPayload::Structured`] JSON of the shape
/// `{type, media_urls, text_content, …}` that downstream multimodal
/// consumers parse structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    /// Plain (usually Markdown) text.
    Text(String),
    /// Structured JSON, used by multimodal producers.
    Structured(serde_json::Value),
}

impl OutputPayload {
    /// Render the payload as text: structured payloads serialise to JSON.
    pub fn as_text(&self) -> String {
        match self {
            OutputPayload::Text(text) => text.clone(),
            OutputPayload::Structured(value) => value.to_string(),
        }
    }

    /// Borrow the structured form, if any.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            OutputPayload::Structured(value) => Some(value),
            OutputPayload::Text(_) => None,
        }
    }
}

/// Result of one sub-task execution.
#[derive(Debug, Clone)]
pub struct SubTaskResult {
    /// Id of the executed sub-task.
    pub subtask_id: String,
    /// Id of the worker that produced the result (empty for synthetic
    /// blocked results).
    pub agent_id: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Output payload; present on success.
    pub output: Option<OutputPayload>,
    /// Failure description; present on failure.
    pub error: Option<String>,
    /// Tool invocations made during execution.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    /// Token accounting across every model round-trip.
    pub token_usage: TokenUsage,
}

impl SubTaskResult {
    /// Synthetic result attached to a task blocked by an upstream failure.
    pub fn blocked(subtask_id: impl Into<String>) -> Self {
        Self {
            subtask_id: subtask_id.into(),
            agent_id: String::new(),
            success: false,
            output: None,
            error: Some(BLOCKED_ERROR.to_string()),
            tool_calls: Vec::new(),
            execution_time: 0.0,
            token_usage: TokenUsage::default(),
        }
    }

    /// Whether this is a synthetic blocked result.
    pub fn is_blocked(&self) -> bool {
        self.error.as_deref() == Some(BLOCKED_ERROR)
    }
}

/// Board operation errors.
#[derive(Debug, Clone)]
pub enum BoardError {
    /// A sub-task with this id is already published. Republishing is
    /// rejected rather than silently overwriting.
    DuplicateTask(String),
    /// A dependency references an id that is not on the board.
    UnknownDependency {
        /// Task declaring the dependency.
        task: String,
        /// The missing dependency id.
        dependency: String,
    },
    /// The published set contains a dependency cycle.
    CyclicDependencies(Vec<String>),
    /// The id is not on the board.
    UnknownTask(String),
    /// A status change violated monotonicity.
    InvalidTransition {
        /// Task whose transition was rejected.
        task: String,
        /// Status before the rejected transition.
        from: TaskStatus,
        /// Status the caller asked for.
        to: TaskStatus,
    },
}

impl fmt::Display for BoardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardError::DuplicateTask(id) => write!(f, "task already published: {}", id),
            BoardError::UnknownDependency { task, dependency } => {
                write!(f, "task {} depends on unknown task {}", task, dependency)
            }
            BoardError::CyclicDependencies(ids) => {
                write!(f, "dependency cycle among tasks: {}", ids.join(", "))
            }
            BoardError::UnknownTask(id) => write!(f, "unknown task: {}", id),
            BoardError::InvalidTransition { task, from, to } => write!(
                f,
                "invalid transition for {}: {} -> {}",
                task,
                from.as_str(),
                to.as_str()
            ),
        }
    }
}

impl Error for BoardError {}

/// Per-status counts snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub pending: usize,
    pub waiting: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusSnapshot {
    /// Total number of entries.
    pub fn total(&self) -> usize {
        self.pending
            + self.waiting
            + self.claimed
            + self.running
            + self.completed
            + self.failed
            + self.blocked
    }

    /// Number of entries not yet in a terminal state.
    pub fn unfinished(&self) -> usize {
        self.pending + self.waiting + self.claimed + self.running
    }
}

struct BoardEntry {
    subtask: SubTask,
    status: TaskStatus,
    publish_index: usize,
    result: Option<SubTaskResult>,
}

#[derive(Default)]
struct BoardInner {
    entries: HashMap<String, BoardEntry>,
    order: Vec<String>,
}

impl BoardInner {
    fn initial_status(&self, subtask: &SubTask) -> TaskStatus {
        let all_done = subtask.dependencies.iter().all(|dep| {
            self.entries
                .get(dep)
                .map(|e| e.status == TaskStatus::Completed)
                .unwrap_or(false)
        });
        if subtask.dependencies.is_empty() || all_done {
            TaskStatus::Pending
        } else {
            TaskStatus::Waiting
        }
    }

    /// Promote `Waiting` entries whose dependencies have all completed.
    fn refresh_readiness(&mut self) {
        let promotable: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.status == TaskStatus::Waiting)
            .filter(|entry| {
                entry.subtask.dependencies.iter().all(|dep| {
                    self.entries
                        .get(dep)
                        .map(|e| e.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .map(|entry| entry.subtask.id.clone())
            .collect();
        for id in promotable {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.status = TaskStatus::Pending;
            }
        }
    }

    fn reverse_dependents(&self) -> HashMap<String, Vec<String>> {
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        for id in &self.order {
            if let Some(entry) = self.entries.get(id) {
                for dep in &entry.subtask.dependencies {
                    reverse.entry(dep.clone()).or_insert_with(Vec::new).push(id.clone());
                }
            }
        }
        reverse
    }
}

/// Concurrency-safe queue of sub-tasks with dependency tracking.
pub struct TaskBoard {
    inner: Mutex<BoardInner>,
}

impl Default for TaskBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBoard {
    /// Create an empty board.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BoardInner::default()),
        }
    }

    /// Seed the board with a batch of sub-tasks.
    ///
    /// Entries with unmet dependencies start `Waiting`, the rest `Pending`.
    /// The whole batch is validated before anything is inserted: duplicate
    /// ids (including republished ones), dependencies on unknown ids, and
    /// dependency cycles are all rejected.
    pub async fn publish_tasks(&self, subtasks: Vec<SubTask>) -> Result<(), BoardError> {
        let mut inner = self.inner.lock().await;

        let mut batch_ids: HashSet<&str> = HashSet::new();
        for subtask in &subtasks {
            if inner.entries.contains_key(&subtask.id) || !batch_ids.insert(&subtask.id) {
                return Err(BoardError::DuplicateTask(subtask.id.clone()));
            }
        }
        for subtask in &subtasks {
            for dep in &subtask.dependencies {
                if !batch_ids.contains(dep.as_str()) && !inner.entries.contains_key(dep) {
                    return Err(BoardError::UnknownDependency {
                        task: subtask.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = find_cycle(&subtasks) {
            return Err(BoardError::CyclicDependencies(cycle));
        }

        for subtask in subtasks {
            let status = inner.initial_status(&subtask);
            let publish_index = inner.order.len();
            inner.order.push(subtask.id.clone());
            log::debug!(
                "published task {} ({}, priority {})",
                subtask.id,
                status.as_str(),
                subtask.priority
            );
            inner.entries.insert(
                subtask.id.clone(),
                BoardEntry {
                    subtask,
                    status,
                    publish_index,
                    result: None,
                },
            );
        }
        Ok(())
    }

    /// Append a single sub-task to an already-seeded board.
    ///
    /// Used for dynamic plan adjustments. Dependencies must reference tasks
    /// already on the board, so no cycle can form.
    pub async fn publish_task(&self, subtask: SubTask) -> Result<(), BoardError> {
        self.publish_tasks(vec![subtask]).await
    }

    /// Sub-tasks whose dependencies are all complete and that nobody has
    /// claimed, sorted by priority descending then publish order.
    pub async fn ready_tasks(&self) -> Vec<SubTask> {
        let inner = self.inner.lock().await;
        let mut ready: Vec<(&BoardEntry, &SubTask)> = inner
            .entries
            .values()
            .filter(|entry| entry.status == TaskStatus::Pending)
            .map(|entry| (entry, &entry.subtask))
            .collect();
        ready.sort_by(|a, b| {
            b.1.priority
                .cmp(&a.1.priority)
                .then(a.0.publish_index.cmp(&b.0.publish_index))
        });
        ready.into_iter().map(|(_, subtask)| subtask.clone()).collect()
    }

    /// Atomically claim a pending task.
    ///
    /// Returns `false` when the task is unknown, already claimed, or no
    /// longer pending; the second of two racing claimers always loses.
    pub async fn claim_task(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(id) {
            Some(entry) if entry.status == TaskStatus::Pending => {
                entry.status = TaskStatus::Claimed;
                true
            }
            _ => false,
        }
    }

    /// Transition a claimed task to `Running`.
    pub async fn mark_running(&self, id: &str) -> Result<(), BoardError> {
        self.transition(id, TaskStatus::Running, &[TaskStatus::Claimed], None)
            .await
    }

    /// Record a successful result and recompute dependent readiness.
    pub async fn mark_completed(&self, id: &str, result: SubTaskResult) -> Result<(), BoardError> {
        self.transition(
            id,
            TaskStatus::Completed,
            &[TaskStatus::Running, TaskStatus::Claimed],
            Some(result),
        )
        .await
    }

    /// Record a failure result.
    ///
    /// Descendant blocking is a separate step; call
    /// [`TaskBoard::propagate_failure`] afterwards.
    pub async fn mark_failed(&self, id: &str, result: SubTaskResult) -> Result<(), BoardError> {
        self.transition(
            id,
            TaskStatus::Failed,
            &[TaskStatus::Running, TaskStatus::Claimed],
            Some(result),
        )
        .await
    }

    async fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        allowed_from: &[TaskStatus],
        result: Option<SubTaskResult>,
    ) -> Result<(), BoardError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| BoardError::UnknownTask(id.to_string()))?;
        if !allowed_from.contains(&entry.status) {
            return Err(BoardError::InvalidTransition {
                task: id.to_string(),
                from: entry.status,
                to,
            });
        }
        entry.status = to;
        if let Some(result) = result {
            entry.result = Some(result);
        }
        log::debug!("task {} -> {}", id, to.as_str());
        if to == TaskStatus::Completed {
            inner.refresh_readiness();
        }
        Ok(())
    }

    /// Transitively mark every `Waiting`/`Pending` descendant of `id` as
    /// `Blocked`, attaching a synthetic result to each. Returns the blocked
    /// ids in publish order.
    pub async fn propagate_failure(&self, id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let reverse = inner.reverse_dependents();

        let mut to_visit: VecDeque<String> =
            reverse.get(id).cloned().unwrap_or_default().into();
        let mut affected: HashSet<String> = HashSet::new();
        while let Some(current) = to_visit.pop_front() {
            if affected.insert(current.clone()) {
                if let Some(children) = reverse.get(&current) {
                    to_visit.extend(children.iter().cloned());
                }
            }
        }

        let mut blocked: Vec<(usize, String)> = Vec::new();
        for task_id in affected {
            if let Some(entry) = inner.entries.get_mut(&task_id) {
                if matches!(entry.status, TaskStatus::Waiting | TaskStatus::Pending) {
                    entry.status = TaskStatus::Blocked;
                    entry.result = Some(SubTaskResult::blocked(&task_id));
                    blocked.push((entry.publish_index, task_id.clone()));
                    log::info!("task {} blocked by failure of {}", task_id, id);
                }
            }
        }
        blocked.sort_by_key(|(index, _)| *index);
        blocked.into_iter().map(|(_, id)| id).collect()
    }

    /// Raise (or lower) the priority of a not-yet-claimed task.
    pub async fn set_priority(&self, id: &str, priority: i32) -> Result<(), BoardError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| BoardError::UnknownTask(id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(BoardError::InvalidTransition {
                task: id.to_string(),
                from: entry.status,
                to: entry.status,
            });
        }
        entry.subtask.priority = priority;
        Ok(())
    }

    /// Current status of one task.
    pub async fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.inner.lock().await.entries.get(id).map(|e| e.status)
    }

    /// Snapshot of per-status counts.
    pub async fn status_counts(&self) -> StatusSnapshot {
        let inner = self.inner.lock().await;
        let mut snapshot = StatusSnapshot::default();
        for entry in inner.entries.values() {
            match entry.status {
                TaskStatus::Pending => snapshot.pending += 1,
                TaskStatus::Waiting => snapshot.waiting += 1,
                TaskStatus::Claimed => snapshot.claimed += 1,
                TaskStatus::Running => snapshot.running += 1,
                TaskStatus::Completed => snapshot.completed += 1,
                TaskStatus::Failed => snapshot.failed += 1,
                TaskStatus::Blocked => snapshot.blocked += 1,
            }
        }
        snapshot
    }

    /// Whether any entry is still in a non-terminal state.
    pub async fn has_unfinished(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.entries.values().any(|e| !e.status.is_terminal())
    }

    /// All published sub-tasks, in publish order.
    pub async fn subtasks(&self) -> Vec<SubTask> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| entry.subtask.clone())
            .collect()
    }

    /// Move recorded results out of the board, in publish order.
    pub async fn take_results(&self) -> Vec<SubTaskResult> {
        let mut inner = self.inner.lock().await;
        let order = inner.order.clone();
        order
            .iter()
            .filter_map(|id| inner.entries.get_mut(id).and_then(|e| e.result.take()))
            .collect()
    }

    /// Safety net for degraded graphs: when nothing is ready, claimed, or
    /// running but non-terminal `Waiting` entries remain, force the best
    /// candidate (highest priority, then publish order) to `Pending` and
    /// return it. This preserves forward progress at the cost of the stuck
    /// subgraph's dependency semantics; healthy graphs never reach it
    /// because cycles are rejected at publish time.
    pub async fn force_ready_stuck(&self) -> Option<SubTask> {
        let mut inner = self.inner.lock().await;
        let any_active = inner.entries.values().any(|e| {
            matches!(
                e.status,
                TaskStatus::Pending | TaskStatus::Claimed | TaskStatus::Running
            )
        });
        if any_active {
            return None;
        }
        let candidate = inner
            .entries
            .values()
            .filter(|e| e.status == TaskStatus::Waiting)
            .map(|e| (e.subtask.priority, e.publish_index, e.subtask.id.clone()))
            .min_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)))?;
        let id = candidate.2;
        if let Some(entry) = inner.entries.get_mut(&id) {
            log::warn!(
                "dependency graph stalled; forcing {} ready to preserve progress",
                id
            );
            entry.status = TaskStatus::Pending;
            return Some(entry.subtask.clone());
        }
        None
    }
}

/// Detect a dependency cycle in a batch via Kahn's algorithm. Dependencies
/// pointing outside the batch are treated as satisfied. Returns the ids left
/// with unresolved in-batch dependencies, in input order.
fn find_cycle(subtasks: &[SubTask]) -> Option<Vec<String>> {
    let ids: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for subtask in subtasks {
        let in_batch_deps = subtask
            .dependencies
            .iter()
            .filter(|d| ids.contains(d.as_str()))
            .count();
        in_degree.insert(&subtask.id, in_batch_deps);
        for dep in &subtask.dependencies {
            if ids.contains(dep.as_str()) {
                dependents
                    .entry(dep.as_str())
                    .or_insert_with(Vec::new)
                    .push(&subtask.id);
            }
        }
    }

    let mut queue: VecDeque<&str> = subtasks
        .iter()
        .filter(|s| in_degree[s.id.as_str()] == 0)
        .map(|s| s.id.as_str())
        .collect();
    let mut resolved = 0usize;
    while let Some(id) = queue.pop_front() {
        resolved += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                let degree = in_degree.get_mut(child).map(|d| {
                    *d -= 1;
                    *d
                });
                if degree == Some(0) {
                    queue.push_back(child);
                }
            }
        }
    }

    if resolved == subtasks.len() {
        None
    } else {
        Some(
            subtasks
                .iter()
                .filter(|s| in_degree[s.id.as_str()] > 0)
                .map(|s| s.id.clone())
                .collect(),
        )
    }
}

/// Group sub-tasks into dependency layers: each layer's tasks depend only on
/// earlier layers. Within a layer, ids are ordered by priority descending
/// then input order. Cycles (possible only for graphs assembled outside the
/// board) are broken by promoting the highest-priority stuck task.
pub fn dependency_layers(subtasks: &[SubTask]) -> Vec<Vec<String>> {
    let index_of: HashMap<&str, usize> = subtasks
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let ids: HashSet<&str> = index_of.keys().copied().collect();

    let mut remaining: HashSet<&str> = ids.clone();
    let mut done: HashSet<&str> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let mut layer: Vec<&SubTask> = remaining
            .iter()
            .map(|id| &subtasks[index_of[id]])
            .filter(|s| {
                s.dependencies
                    .iter()
                    .all(|d| !ids.contains(d.as_str()) || done.contains(d.as_str()))
            })
            .collect();

        if layer.is_empty() {
            // Stuck set: take the single best candidate to restore progress.
            let best = remaining
                .iter()
                .map(|id| &subtasks[index_of[id]])
                .min_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(index_of[a.id.as_str()].cmp(&index_of[b.id.as_str()]))
                });
            match best {
                Some(task) => layer = vec![task],
                None => break,
            }
        }

        layer.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(index_of[a.id.as_str()].cmp(&index_of[b.id.as_str()]))
        });
        let layer_ids: Vec<String> = layer.iter().map(|s| s.id.clone()).collect();
        for id in &layer_ids {
            remaining.remove(id.as_str());
            done.insert(
                subtasks[index_of[id.as_str()]].id.as_str(),
            );
        }
        layers.push(layer_ids);
    }

    layers
}
