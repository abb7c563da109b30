//! Optional inter-agent message bus.
//!
//! Workers drain their inbox at the top of each execution-loop iteration
//! when a bus is wired; a `Shutdown` message stops the worker, anything else
//! is injected into the conversation as system context. The engine is
//! correct without a bus — workers simply skip the drain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use tokio::sync::Mutex;

/// Kind of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Free-form informational note.
    Info,
    /// Structured data handed between agents.
    Data,
    /// Stop request; the receiving worker terminates gracefully.
    Shutdown,
}

/// One message between agents.
#[derive(Debug, Clone)]
pub struct AgentMessage {
    /// Unique message id.
    pub id: String,
    /// Sender agent id (or an orchestrator-reserved id).
    pub sender_id: String,
    /// Recipient agent id.
    pub recipient_id: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Message body.
    pub content: String,
    /// Send timestamp.
    pub sent_at: DateTime<Utc>,
}

impl AgentMessage {
    /// Build a message, stamping id and send time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            kind,
            content: content.into(),
            sent_at: Utc::now(),
        }
    }
}

/// Message transport between agents.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver a message to its recipient's inbox.
    async fn send(&self, message: AgentMessage) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Remove and return every pending message for `agent_id`. Non-blocking.
    async fn drain(&self, agent_id: &str) -> Vec<AgentMessage>;
}

/// Process-local bus backed by per-agent vectors.
#[derive(Default)]
pub struct InMemoryMessageBus {
    inboxes: Mutex<HashMap<String, Vec<AgentMessage>>>,
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, message: AgentMessage) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.inboxes
            .lock()
            .await
            .entry(message.recipient_id.clone())
            .or_insert_with(Vec::new)
            .push(message);
        Ok(())
    }

    async fn drain(&self, agent_id: &str) -> Vec<AgentMessage> {
        self.inboxes
            .lock()
            .await
            .remove(agent_id)
            .unwrap_or_default()
    }
}
