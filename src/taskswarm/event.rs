//! Progress events emitted to a host-provided callback.
//!
//! The core does not persist or route these events; it hands every
//! [`ProgressEvent`] to whatever [`EventHandler`] the host wired in.
//! The handler's method has a default no-op implementation, so hosts only
//! implement what they display. Handlers are shared across workers via
//! `Arc<dyn EventHandler>` and must therefore synchronise any internal
//! state themselves.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use taskswarm::event::{EventHandler, ProgressEvent};
//!
//! struct ConsoleHandler;
//!
//! #[async_trait]
//! impl EventHandler for ConsoleHandler {
//!     async fn on_progress_event(&self, event: &ProgressEvent) {
//!         match event {
//!             ProgressEvent::TaskProgress { task_id, progress_percent, .. } => {
//!                 println!("[{}] {}%", task_id, progress_percent);
//!             }
//!             other => println!("{:?}", other),
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;

/// Events describing the lifecycle of a job and its agents.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A job was accepted and its plan published.
    TaskCreated {
        /// Job id.
        task_id: String,
    },

    /// Overall progress changed.
    TaskProgress {
        /// Job id.
        task_id: String,
        /// Completed steps as a percentage of all steps.
        progress_percent: u8,
        /// Current job status string.
        status: String,
    },

    /// One step changed status.
    StepStatusChanged {
        /// Job id.
        task_id: String,
        /// Step id.
        step_id: String,
        /// New status string (board status names).
        status: String,
        /// Preview of the step output, if any.
        output_preview: Option<String>,
        /// Error text for failed steps.
        error: Option<String>,
    },

    /// The quality gate reviewed a step.
    StepReviewed {
        /// Job id.
        task_id: String,
        /// Step id.
        step_id: String,
        /// Review score, 1-10.
        score: f64,
        /// Decision string (`accept`, `retry`, `accept_with_warning`).
        action: String,
        /// Reviewer's reason.
        reason: String,
        /// 1-based attempt the review refers to.
        attempt: u32,
    },

    /// A worker was created for a step.
    AgentCreated {
        /// Job id.
        task_id: String,
        /// Worker id.
        agent_id: String,
        /// Role key of the worker.
        role: String,
        /// Step the worker executes.
        step_id: String,
    },

    /// A worker's status changed.
    AgentUpdated {
        /// Job id.
        task_id: String,
        /// Worker id.
        agent_id: String,
        /// New worker status string.
        status: String,
    },

    /// A worker finished and was disposed.
    AgentRemoved {
        /// Job id.
        task_id: String,
        /// Worker id.
        agent_id: String,
    },

    /// Incremental streamed output from a worker's model call.
    AgentStream {
        /// Job id.
        task_id: String,
        /// Worker id.
        agent_id: String,
        /// The new chunk.
        chunk: String,
        /// Accumulated content so far.
        full_content: String,
    },

    /// The job finished (successfully or not).
    TaskCompleted {
        /// Job id.
        task_id: String,
        /// Whether every planned step produced a successful result.
        success: bool,
    },

    /// The job was removed by the host.
    TaskDeleted {
        /// Job id.
        task_id: String,
    },
}

/// Host-provided sink for [`ProgressEvent`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event the engine emits. Default: no-op.
    async fn on_progress_event(&self, _event: &ProgressEvent) {}
}

/// Handler that drops every event; used when the host wires nothing.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_progress_event(&self, event: &ProgressEvent) {
            self.seen.lock().unwrap().push(format!("{:?}", event));
        }
    }

    #[tokio::test]
    async fn default_handler_is_a_no_op() {
        NullEventHandler
            .on_progress_event(&ProgressEvent::TaskCreated {
                task_id: "t".into(),
            })
            .await;
    }

    #[tokio::test]
    async fn custom_handler_receives_events() {
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
        };
        recorder
            .on_progress_event(&ProgressEvent::TaskCompleted {
                task_id: "t".into(),
                success: true,
            })
            .await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }
}
