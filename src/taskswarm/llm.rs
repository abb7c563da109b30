//! Provider-agnostic LLM client trait and the chat data types.
//!
//! The engine interacts with language models exclusively through the
//! [`LlmClient`] trait so that workers, the quality gate, and tests can swap
//! the concrete provider for mocks.  The supporting structs describe chat
//! messages, streamed chunks, tool definitions, and token accounting.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use taskswarm::clients::dashscope::DashScopeClient;
//! use taskswarm::llm::{ChatMessage, ChatRole, LlmClient};
//! use taskswarm::model::ModelConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let client = DashScopeClient::from_env()?;
//!     let response = client
//!         .chat(
//!             &[ChatMessage {
//!                 role: ChatRole::User,
//!                 content: Arc::from("Who are you?"),
//!                 tool_calls: vec![],
//!             }],
//!             None,
//!             &ModelConfig::default(),
//!         )
//!         .await?;
//!     println!("Assistant: {}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

use crate::taskswarm::model::{context_window, ModelConfig, ModelId};

/// A single tool call requested by the model in a function-calling response.
///
/// Providers assign an opaque [`id`](ToolCallRequest::id) to each call so the
/// tool result can be correlated back in a follow-up `ChatRole::Tool`
/// message. Calls recovered from plain-text output (see
/// [`parse_inline_tool_calls`](crate::taskswarm::tool_parsing::parse_inline_tool_calls))
/// carry synthesised ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Provider-assigned or synthesised call id, e.g. `"call_9f2b41aa"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent with the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model.
    pub arguments: serde_json::Value,
}

/// Tool schema passed to the model along with a chat request.
///
/// Serialised as an OpenAI-compatible `tools` array entry before
/// transmission.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Conversation roles accepted by the chat endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatRole {
    /// A system authored message that primes or constrains the model.
    System,
    /// A user authored message.
    User,
    /// A model authored message (may carry tool calls).
    Assistant,
    /// A tool-result message correlating with a prior [`ToolCallRequest`].
    ///
    /// Serialises as `{"role": "tool", "tool_call_id": "<id>", "content": "…"}`.
    Tool {
        /// Id of the call this result answers.
        call_id: String,
    },
}

/// Token accounting for one or more requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage record into this one. Workers accumulate usage
    /// across every round-trip of their execution loop with this.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A chat message in engine-internal form.
///
/// The body is stored as `Arc<str>` so conversation histories can be cloned
/// cheaply when they are replayed across retries.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Role of the author.
    pub role: ChatRole,
    /// Message body.
    pub content: Arc<str>,
    /// Tool calls attached to an assistant message; empty otherwise.
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ChatMessage {
    /// Build a message with no tool calls.
    pub fn new(role: ChatRole, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }

    /// Build an assistant message carrying the given tool calls.
    pub fn assistant_with_calls(content: impl AsRef<str>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Arc::from(content.as_ref()),
            tool_calls: calls,
        }
    }

    /// Build a tool-result message for the given call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl AsRef<str>) -> Self {
        Self {
            role: ChatRole::Tool {
                call_id: call_id.into(),
            },
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }
}

/// The synthesised result of one full chat round-trip.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Assistant text content (empty when the model only requested tools).
    pub content: String,
    /// Structured tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Provider finish reason (`"stop"`, `"tool_calls"`, `"length"`, …).
    pub finish_reason: String,
    /// Token accounting for this round-trip.
    pub usage: TokenUsage,
}

/// One increment of a streamed response.
///
/// Reasoning-channel deltas arrive wrapped as `[THINKING]…[/THINKING]` so
/// downstream consumers can separate them from user-visible content. A
/// marker is always emitted whole within a single chunk, never split across
/// chunk boundaries.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    /// Incremental content delta; may be empty on finish-reason chunks.
    pub content: String,
    /// Provider finish reason once the stream ends.
    pub finish_reason: Option<String>,
}

/// A finite, non-restartable stream of [`ChatChunk`]s.
pub type ChatChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Opening sentinel for reasoning-channel chunks.
pub const THINKING_OPEN: &str = "[THINKING]";
/// Closing sentinel for reasoning-channel chunks.
pub const THINKING_CLOSE: &str = "[/THINKING]";

/// Remove every `[THINKING]…[/THINKING]` span from collected stream output.
///
/// Used when a collected stream becomes a final answer: the reasoning trace
/// is diagnostic, not deliverable content. Single pass, no allocation per
/// marker.
pub fn strip_thinking_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(THINKING_OPEN) {
            None => {
                out.push_str(rest);
                return out;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after_open = &rest[open + THINKING_OPEN.len()..];
                match after_open.find(THINKING_CLOSE) {
                    Some(close) => {
                        rest = &after_open[close + THINKING_CLOSE.len()..];
                    }
                    None => {
                        // Unterminated marker: drop the remainder of the trace.
                        return out;
                    }
                }
            }
        }
    }
}

/// Cheap token estimator used for budget decisions when the provider has not
/// reported usage yet. CJK characters count as one token each; everything
/// else as one token per four characters.
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for ch in text.chars() {
        let code = ch as u32;
        if (0x4E00..=0x9FFF).contains(&code)
            || (0x3400..=0x4DBF).contains(&code)
            || (0x3000..=0x303F).contains(&code)
        {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + (other + 3) / 4
}

/// Trait-driven abstraction over a concrete provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so a single
/// client can be shared between concurrently executing workers. Transparent
/// retry of transient failures is an implementation responsibility — callers
/// see a failure only after the retry budget is exhausted.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One synchronous chat round-trip.
    ///
    /// When the request enables a native capability that the provider only
    /// serves over streaming (search agent or code interpreter mode),
    /// implementations collect the stream internally and synthesise a
    /// [`ChatResponse`].
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>>;

    /// Request a streamed response.
    ///
    /// The returned stream is finite and cannot be restarted; a connection
    /// drop mid-stream surfaces as an `Err` item and the partial content is
    /// discarded by the retrying caller.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<ChatChunkStream, Box<dyn Error + Send + Sync>>;

    /// Probe provider reachability with a minimal request.
    async fn health_check(&self) -> bool;

    /// Context window for the given model, in tokens.
    fn context_window(&self, model: ModelId) -> usize {
        context_window(model)
    }

    /// Estimate the token count of a text without a provider round-trip.
    fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}
