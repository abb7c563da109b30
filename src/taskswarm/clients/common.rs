//! Shared plumbing for provider client implementations.
//!
//! Provides the tuned [`reqwest`] client shared by every component that
//! talks HTTP, the OpenAI-compatible chat-completions wire send used by the
//! provider client, and adapters for streaming responses.

use lazy_static::lazy_static;
use std::error::Error;
use std::time::Duration;

use crate::taskswarm::llm::{
    ChatChunk, ChatChunkStream, ChatMessage, ChatResponse, ChatRole, TokenUsage, ToolCallRequest,
    ToolDefinition,
};
use crate::taskswarm::model::{capabilities, ModelConfig};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm,
    /// which matters when a wave dispatches many workers at once and each
    /// one opens a conversation with the provider.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Thin error wrapper used when streaming responses fail mid-flight.
#[derive(Debug, Clone)]
pub struct StreamError(pub String);

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StreamError {}

/// Serialise engine-internal messages to the OpenAI-compatible wire shape.
///
/// | [`ChatRole`] variant | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"…"}` |
/// | `User` | `{"role":"user","content":"…"}` |
/// | `Assistant` with tool calls | `{"role":"assistant","content":null,"tool_calls":[…]}` |
/// | `Assistant` without | `{"role":"assistant","content":"…"}` |
/// | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"…"}` |
pub fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| match &msg.role {
            ChatRole::System => serde_json::json!({
                "role": "system",
                "content": msg.content.as_ref()
            }),
            ChatRole::User => serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref()
            }),
            ChatRole::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref()
                    })
                } else {
                    let tool_calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            serde_json::json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": serde_json::to_string(&tc.arguments)
                                        .unwrap_or_else(|_| "{}".to_string())
                                }
                            })
                        })
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": serde_json::Value::Null,
                        "tool_calls": tool_calls
                    })
                }
            }
            ChatRole::Tool { call_id } => serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": msg.content.as_ref()
            }),
        })
        .collect()
}

/// Serialise tool definitions to the OpenAI-compatible `tools` array.
pub fn wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema
                }
            })
        })
        .collect()
}

/// Build the full request body for a chat completion.
///
/// Provider-native switches (`enable_search`, `search_options`,
/// `enable_code_interpreter`, `enable_thinking`) are only attached when the
/// target model actually honours them; the rest ride in the standard
/// OpenAI-compatible fields.
pub fn chat_request_body(
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    config: &ModelConfig,
    stream: bool,
) -> serde_json::Value {
    let caps = capabilities(config.model);
    let mut body = serde_json::json!({
        "model": config.model.as_str(),
        "messages": wire_messages(messages),
        "temperature": config.temperature,
        "top_p": config.top_p,
    });

    if let Some(obj) = body.as_object_mut() {
        if let Some(max_tokens) = config.max_tokens {
            obj.insert("max_tokens".to_string(), serde_json::json!(max_tokens));
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                obj.insert("tools".to_string(), serde_json::json!(wire_tools(tools)));
            }
        }
        if stream {
            obj.insert("stream".to_string(), serde_json::json!(true));
            obj.insert(
                "stream_options".to_string(),
                serde_json::json!({"include_usage": true}),
            );
        }
        if caps.native {
            if config.enable_search {
                obj.insert("enable_search".to_string(), serde_json::json!(true));
                if let Some(strategy) = &config.search_strategy {
                    obj.insert(
                        "search_options".to_string(),
                        serde_json::json!({ "search_strategy": strategy }),
                    );
                }
            }
            if config.enable_code_interpreter {
                obj.insert(
                    "enable_code_interpreter".to_string(),
                    serde_json::json!(true),
                );
            }
        }
        if caps.supports_thinking {
            obj.insert(
                "enable_thinking".to_string(),
                serde_json::json!(config.enable_thinking),
            );
        }
    }

    body
}

/// Extract token usage from a provider response body.
pub fn parse_usage(value: &serde_json::Value) -> TokenUsage {
    let usage = value.get("usage");
    let input = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let total = usage
        .and_then(|u| u.get("total_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or((input + output) as u64) as usize;
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
    }
}

/// Extract tool calls from a `message` or streamed `delta` object.
pub fn parse_tool_calls(message: &serde_json::Value) -> Vec<ToolCallRequest> {
    message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    let arguments: serde_json::Value = serde_json::from_str(args_str)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(ToolCallRequest {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Call the chat-completions endpoint once and parse the response.
///
/// Posts to `{base_url}/chat/completions` with a bearer token. No retry is
/// performed here — callers wrap this in
/// [`with_retries`](crate::taskswarm::clients::retry::with_retries).
pub async fn send_chat_request(
    base_url: &str,
    api_key: &str,
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    config: &ModelConfig,
    http_client: &reqwest::Client,
) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
    let body = chat_request_body(messages, tools, config, false);
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let resp = http_client
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .timeout(Duration::from_secs(config.timeout_secs))
        .json(&body)
        .send()
        .await
        .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

    if !status.is_success() {
        log::error!("chat completion HTTP {} from {}: {}", status, url, text);
        return Err(format!("chat completion failed: HTTP {} — {}", status, text).into());
    }

    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

    let choice = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| -> Box<dyn Error + Send + Sync> {
            "chat completion response carried no choices".into()
        })?;
    let message = choice.get("message").cloned().unwrap_or_default();

    Ok(ChatResponse {
        content: message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string(),
        tool_calls: parse_tool_calls(&message),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .unwrap_or("stop")
            .to_string(),
        usage: parse_usage(&parsed),
    })
}

/// Convert eagerly collected chunks into a boxed stream.
///
/// Useful for implementations that buffer upstream output but still expose
/// the streaming surface.
pub fn chunks_to_stream(chunks: Vec<Result<ChatChunk, StreamError>>) -> ChatChunkStream {
    let stream = futures_util::stream::iter(
        chunks
            .into_iter()
            .map(|r| r.map_err(|e| Box::new(e) as Box<dyn Error + Send + Sync>)),
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskswarm::model::ModelId;

    #[test]
    fn wire_roles_map_to_expected_shapes() {
        let messages = vec![
            ChatMessage::new(ChatRole::System, "be brief"),
            ChatMessage::new(ChatRole::User, "hello"),
            ChatMessage::assistant_with_calls(
                "",
                vec![ToolCallRequest {
                    id: "call_1".into(),
                    name: "sandbox_browser".into(),
                    arguments: serde_json::json!({"action": "search", "query": "rust"}),
                }],
            ),
            ChatMessage::tool_result("call_1", "{\"ok\":true}"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "hello");
        assert!(wire[2]["content"].is_null());
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "sandbox_browser");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn native_switches_attach_only_for_native_models() {
        let messages = vec![ChatMessage::new(ChatRole::User, "hi")];
        let mut cfg = ModelConfig::for_model(ModelId::Qwen3Max);
        cfg.enable_search = true;
        cfg.enable_code_interpreter = true;
        let body = chat_request_body(&messages, None, &cfg, false);
        assert_eq!(body["enable_search"], true);
        assert_eq!(body["enable_code_interpreter"], true);
        assert_eq!(body["enable_thinking"], true);

        let mut cfg = ModelConfig::for_model(ModelId::DeepSeekV3);
        cfg.enable_search = true;
        cfg.enable_code_interpreter = true;
        let body = chat_request_body(&messages, None, &cfg, false);
        assert!(body.get("enable_search").is_none());
        assert!(body.get("enable_code_interpreter").is_none());
        // deepseek-v3 still honours the reasoning switch
        assert!(body.get("enable_thinking").is_some());
    }

    #[test]
    fn usage_and_tool_calls_parse_from_response_json() {
        let parsed: serde_json::Value = serde_json::json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42},
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "sandbox_browser", "arguments": "{\"action\":\"search\"}"}
                    }]
                }
            }]
        });
        let usage = parse_usage(&parsed);
        assert_eq!(usage.total_tokens, 42);
        let calls = parse_tool_calls(&parsed["choices"][0]["message"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "sandbox_browser");
        assert_eq!(calls[0].arguments["action"], "search");
    }

    #[tokio::test]
    async fn chunks_to_stream_yields_in_order() {
        use futures_util::StreamExt;
        let mut stream = chunks_to_stream(vec![
            Ok(ChatChunk {
                content: "a".into(),
                finish_reason: None,
            }),
            Ok(ChatChunk {
                content: "b".into(),
                finish_reason: Some("stop".into()),
            }),
        ]);
        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&chunk.unwrap().content);
        }
        assert_eq!(collected, "ab");
    }
}
