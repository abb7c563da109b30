//! DashScope compatible-mode client.
//!
//! Talks to the DashScope OpenAI-compatible endpoint with transparent retry
//! of transient failures. Two behaviours are specific to this provider:
//!
//! - Models used in search-agent or code-interpreter mode are only served
//!   over streaming; [`DashScopeClient::chat`] collects the stream and
//!   synthesises a regular [`ChatResponse`] for such requests.
//! - Reasoning-channel deltas (`reasoning_content`) are wrapped in
//!   `[THINKING]…[/THINKING]` sentinels, one whole marker per chunk, so
//!   downstream consumers can separate the trace from the answer without
//!   stateful scanning.

use async_trait::async_trait;
use std::error::Error;
use std::time::Duration;

use crate::taskswarm::clients::common::{
    chat_request_body, get_shared_http_client, parse_usage, send_chat_request,
};
use crate::taskswarm::clients::retry::with_retries;
use crate::taskswarm::config;
use crate::taskswarm::llm::{
    strip_thinking_markers, ChatChunk, ChatChunkStream, ChatMessage, ChatResponse, ChatRole,
    LlmClient, TokenUsage, ToolDefinition, THINKING_CLOSE, THINKING_OPEN,
};
use crate::taskswarm::model::ModelConfig;

/// Default compatible-mode endpoint.
pub const DASHSCOPE_COMPAT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Client wrapper for the DashScope compatible-mode chat API.
pub struct DashScopeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl DashScopeClient {
    /// Construct a client with an explicit API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            api_key: api_key.into(),
            base_url: DASHSCOPE_COMPAT_BASE_URL.to_string(),
        }
    }

    /// Construct a client reading the API key from the environment.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self::new(config::api_key_from_env()?))
    }

    /// Point the client at a different base URL (builder pattern).
    ///
    /// Used for self-hosted compatible deployments and by tests that stand
    /// up a local stub server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Borrow the API key (used by the media extension in this module tree).
    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Borrow the underlying HTTP client.
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Whether this request can only be served over streaming.
    fn requires_stream(config: &ModelConfig) -> bool {
        let effective = config.sanitized();
        effective.enable_code_interpreter
            || (effective.enable_search && effective.search_strategy.is_some())
    }

    /// Open the streaming request and return the raw HTTP response.
    async fn open_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<reqwest::Response, Box<dyn Error + Send + Sync>> {
        let body = chat_request_body(messages, tools, config, true);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            log::error!("streaming chat HTTP {}: {}", status, text);
            return Err(format!("streaming chat failed: HTTP {} — {}", status, text).into());
        }
        Ok(resp)
    }

    /// Collect a streamed response into a synthesised [`ChatResponse`].
    ///
    /// Reasoning markers are stripped from the synthesised content: callers
    /// of `chat` asked for an answer, not the trace. A connection drop
    /// mid-stream discards the partial content; the retry wrapper restarts
    /// the call from scratch.
    async fn collect_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        let mut resp = self.open_stream(messages, tools, config).await?;
        let mut buffer = String::new();
        let mut content = String::new();
        let mut finish_reason = String::from("stop");
        let mut usage = TokenUsage::default();

        while let Some(bytes) = resp
            .chunk()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?
        {
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            for payload in drain_sse_payloads(&mut buffer) {
                if payload == "[DONE]" {
                    continue;
                }
                let value: serde_json::Value = match serde_json::from_str(&payload) {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("skipping unparseable stream payload: {}", e);
                        continue;
                    }
                };
                if value.get("usage").map(|u| !u.is_null()).unwrap_or(false) {
                    usage = parse_usage(&value);
                }
                if let Some(delta) = value
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                {
                    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                        content.push_str(text);
                    }
                }
                if let Some(reason) = value
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("finish_reason"))
                    .and_then(|f| f.as_str())
                {
                    finish_reason = reason.to_string();
                }
            }
        }

        Ok(ChatResponse {
            content: strip_thinking_markers(&content),
            tool_calls: Vec::new(),
            finish_reason,
            usage,
        })
    }
}

/// Pull every complete `data:` payload out of the SSE line buffer, leaving
/// any trailing partial line in place for the next read.
fn drain_sse_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

/// Convert one parsed stream payload into at most one [`ChatChunk`].
///
/// Reasoning deltas are wrapped whole — a `[THINKING]…[/THINKING]` marker is
/// never split across chunk boundaries because each delta is wrapped
/// independently in this single pass.
fn chunk_from_payload(value: &serde_json::Value) -> Option<ChatChunk> {
    let choice = value.get("choices").and_then(|c| c.get(0))?;
    let delta = choice.get("delta");
    let mut content = String::new();

    if let Some(delta) = delta {
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
            if !reasoning.is_empty() {
                content.push_str(THINKING_OPEN);
                content.push_str(reasoning);
                content.push_str(THINKING_CLOSE);
            }
        }
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            content.push_str(text);
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .map(|s| s.to_string());

    if content.is_empty() && finish_reason.is_none() {
        return None;
    }
    Some(ChatChunk {
        content,
        finish_reason,
    })
}

#[async_trait]
impl LlmClient for DashScopeClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        let effective = config.sanitized();

        if Self::requires_stream(&effective) {
            return with_retries(effective.retry_attempts, |_attempt| {
                self.collect_stream(messages, tools, &effective)
            })
            .await;
        }

        with_retries(effective.retry_attempts, |_attempt| {
            send_chat_request(
                &self.base_url,
                &self.api_key,
                messages,
                tools,
                &effective,
                &self.http,
            )
        })
        .await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        config: &ModelConfig,
    ) -> Result<ChatChunkStream, Box<dyn Error + Send + Sync>> {
        let effective = config.sanitized();
        let mut resp = self.open_stream(messages, tools, &effective).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<
            Result<ChatChunk, Box<dyn Error + Send + Sync>>,
        >(32);

        tokio::spawn(async move {
            let mut buffer = String::new();
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for payload in drain_sse_payloads(&mut buffer) {
                            if payload == "[DONE]" {
                                return;
                            }
                            let value: serde_json::Value = match serde_json::from_str(&payload) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            if let Some(chunk) = chunk_from_payload(&value) {
                                if tx.send(Ok(chunk)).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Box::new(crate::taskswarm::clients::common::StreamError(
                                format!("stream interrupted: {}", e),
                            ))
                                as Box<dyn Error + Send + Sync>))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn health_check(&self) -> bool {
        let probe = [ChatMessage::new(ChatRole::User, "ping")];
        let mut cfg = ModelConfig::default();
        cfg.timeout_secs = 10;
        cfg.retry_attempts = 1;
        cfg.enable_search = false;
        cfg.enable_thinking = false;
        cfg.max_tokens = Some(8);
        match send_chat_request(
            &self.base_url,
            &self.api_key,
            &probe,
            None,
            &cfg,
            &self.http,
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                log::warn!("health check failed: {}", e);
                false
            }
        }
    }
}
