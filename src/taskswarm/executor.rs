//! Event-driven wave executor.
//!
//! The executor repeatedly claims every ready task off the board, spawns a
//! worker future for each through the caller-supplied factory, and then
//! waits for *any* running worker to finish before re-evaluating readiness.
//! It is deliberately not level-synchronous: a task that becomes ready
//! because some-but-not-all of its siblings finished is dispatched
//! immediately, while workers from earlier waves are still running.
//!
//! A "wave" is the group of tasks spawned together in one dispatch round;
//! its statistics record the task count, completions, failures, and the
//! maximum concurrency observed while the wave had members in flight.

use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::taskswarm::board::{SubTask, SubTaskResult, TaskBoard};

/// Future type produced by the worker factory.
pub type WorkerFuture =
    Pin<Box<dyn Future<Output = Result<SubTaskResult, Box<dyn Error + Send + Sync>>> + Send>>;

/// Factory building one worker future per claimed sub-task.
///
/// The future resolves to the sub-task's result; an `Err` return is treated
/// exactly like a failed result with the error text attached.
pub type WorkerFactory = Arc<dyn Fn(SubTask) -> WorkerFuture + Send + Sync>;

/// Handle used to cancel a running execution.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal cancellation: no new workers are spawned, in-flight workers
    /// are asked to stop, and the executor drains before returning.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal observed by the executor and by workers.
pub type CancelSignal = watch::Receiver<bool>;

/// Create a connected cancel handle/signal pair.
pub fn cancellation_channel() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, rx)
}

/// Statistics for one dispatch wave.
#[derive(Debug, Clone, Default)]
pub struct WaveStats {
    /// 0-based wave number.
    pub wave_number: usize,
    /// Tasks dispatched in this wave.
    pub task_count: usize,
    /// Tasks from this wave that completed successfully.
    pub completed: usize,
    /// Tasks from this wave that failed.
    pub failed: usize,
    /// Maximum workers running concurrently while this wave was in flight
    /// (includes still-running members of earlier waves).
    pub parallelism: usize,
}

/// Final outcome of one execution run.
#[derive(Debug, Clone, Default)]
pub struct WaveOutcome {
    /// Number of dispatch waves.
    pub total_waves: usize,
    /// Total tasks on the board when the run finished.
    pub total_tasks: usize,
    /// Tasks that completed successfully.
    pub completed_tasks: usize,
    /// Tasks that failed.
    pub failed_tasks: usize,
    /// Tasks blocked by upstream failures.
    pub blocked_tasks: usize,
    /// Whether the run was cancelled before the board drained.
    pub cancelled: bool,
    /// Per-wave statistics, in dispatch order.
    pub waves: Vec<WaveStats>,
}

/// Event-driven parallel dispatcher over a [`TaskBoard`].
pub struct WaveExecutor {
    concurrency_cap: Option<usize>,
    cancel: Option<CancelSignal>,
}

impl Default for WaveExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl WaveExecutor {
    /// Create an executor with no concurrency cap and no cancel signal.
    pub fn new() -> Self {
        Self {
            concurrency_cap: None,
            cancel: None,
        }
    }

    /// Cap the number of simultaneously running workers (builder pattern).
    ///
    /// Ready tasks beyond the cap stay claimed-later: they are simply not
    /// claimed until a slot frees, so their board state remains `Pending`.
    pub fn with_concurrency_cap(mut self, cap: usize) -> Self {
        self.concurrency_cap = Some(cap.max(1));
        self
    }

    /// Observe a cancellation signal (builder pattern).
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|signal| *signal.borrow())
            .unwrap_or(false)
    }

    /// Run the dispatch loop until every board entry is terminal (or the
    /// run is cancelled). Returns aggregate and per-wave statistics.
    pub async fn execute(&self, board: Arc<TaskBoard>, factory: WorkerFactory) -> WaveOutcome {
        let semaphore = self
            .concurrency_cap
            .map(|cap| Arc::new(Semaphore::new(cap)));

        let mut join_set: JoinSet<(String, Result<SubTaskResult, String>)> = JoinSet::new();
        let mut waves: Vec<WaveStats> = Vec::new();
        let mut wave_of_task: HashMap<String, usize> = HashMap::new();
        let mut cancelled = false;

        loop {
            if self.cancelled() {
                cancelled = true;
                break;
            }
            if !board.has_unfinished().await && join_set.is_empty() {
                break;
            }

            // Dispatch round: claim and spawn everything ready, up to the cap.
            let ready = board.ready_tasks().await;
            let mut spawned_this_wave = 0usize;
            let wave_number = waves.len();

            for subtask in ready {
                let permit = match &semaphore {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        // Saturated: defer the rest of the ready set until a
                        // slot frees. No preemption of running workers.
                        Err(_) => break,
                    },
                    None => None,
                };

                if !board.claim_task(&subtask.id).await {
                    continue; // raced with another dispatcher
                }
                if let Err(e) = board.mark_running(&subtask.id).await {
                    log::error!("could not mark {} running: {}", subtask.id, e);
                    continue;
                }

                let id = subtask.id.clone();
                wave_of_task.insert(id.clone(), wave_number);
                let fut = factory(subtask);
                join_set.spawn(async move {
                    let result = fut.await.map_err(|e| e.to_string());
                    drop(permit);
                    (id, result)
                });
                spawned_this_wave += 1;
            }

            if spawned_this_wave > 0 {
                let parallelism = join_set.len();
                log::info!(
                    "wave {}: dispatched {} task(s), {} in flight",
                    wave_number,
                    spawned_this_wave,
                    parallelism
                );
                waves.push(WaveStats {
                    wave_number,
                    task_count: spawned_this_wave,
                    completed: 0,
                    failed: 0,
                    parallelism,
                });
            }

            if join_set.is_empty() {
                // Nothing in flight and nothing spawnable. Either the board
                // is done, or the graph degraded into a stuck set.
                if !board.has_unfinished().await {
                    break;
                }
                if board.force_ready_stuck().await.is_none() {
                    // Claimed-but-never-spawned entries would land here;
                    // bail rather than spin.
                    log::error!("board has unfinished tasks but no way to make progress");
                    break;
                }
                continue;
            }

            // Wait for ANY worker to finish, watching for cancellation.
            let joined = if let Some(signal) = &self.cancel {
                let mut signal = signal.clone();
                tokio::select! {
                    joined = join_set.join_next() => joined,
                    _ = signal.changed() => {
                        if *signal.borrow() {
                            cancelled = true;
                        }
                        continue;
                    }
                }
            } else {
                join_set.join_next().await
            };

            if let Some(joined) = joined {
                self.settle(&board, &mut waves, &wave_of_task, joined).await;
            }
        }

        // Drain in-flight workers. Cancellation is signalled to workers via
        // the shared signal; here we only wait for them to come home.
        while let Some(joined) = join_set.join_next().await {
            self.settle(&board, &mut waves, &wave_of_task, joined).await;
        }

        let counts = board.status_counts().await;
        let outcome = WaveOutcome {
            total_waves: waves.len(),
            total_tasks: counts.total(),
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            blocked_tasks: counts.blocked,
            cancelled,
            waves,
        };
        log::info!(
            "execution finished: {} wave(s), {}/{} completed, {} failed, {} blocked{}",
            outcome.total_waves,
            outcome.completed_tasks,
            outcome.total_tasks,
            outcome.failed_tasks,
            outcome.blocked_tasks,
            if outcome.cancelled { " (cancelled)" } else { "" }
        );
        outcome
    }

    async fn settle(
        &self,
        board: &TaskBoard,
        waves: &mut [WaveStats],
        wave_of_task: &HashMap<String, usize>,
        joined: Result<(String, Result<SubTaskResult, String>), tokio::task::JoinError>,
    ) {
        let (id, result) = match joined {
            Ok(pair) => pair,
            Err(join_error) => {
                log::error!("worker task panicked or was aborted: {}", join_error);
                return;
            }
        };

        let wave = wave_of_task.get(&id).copied();
        match result {
            Ok(result) if result.success => {
                if let Err(e) = board.mark_completed(&id, result).await {
                    log::error!("could not record completion of {}: {}", id, e);
                }
                if let Some(w) = wave.and_then(|w| waves.get_mut(w)) {
                    w.completed += 1;
                }
            }
            Ok(result) => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified worker failure".to_string());
                log::warn!("task {} failed: {}", id, error);
                if let Err(e) = board.mark_failed(&id, result).await {
                    log::error!("could not record failure of {}: {}", id, e);
                }
                board.propagate_failure(&id).await;
                if let Some(w) = wave.and_then(|w| waves.get_mut(w)) {
                    w.failed += 1;
                }
            }
            Err(message) => {
                log::warn!("worker for {} errored: {}", id, message);
                let result = SubTaskResult {
                    subtask_id: id.clone(),
                    agent_id: String::new(),
                    success: false,
                    output: None,
                    error: Some(message),
                    tool_calls: Vec::new(),
                    execution_time: 0.0,
                    token_usage: Default::default(),
                };
                if let Err(e) = board.mark_failed(&id, result).await {
                    log::error!("could not record failure of {}: {}", id, e);
                }
                board.propagate_failure(&id).await;
                if let Some(w) = wave.and_then(|w| waves.get_mut(w)) {
                    w.failed += 1;
                }
            }
        }
    }
}
