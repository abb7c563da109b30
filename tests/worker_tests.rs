use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taskswarm::board::SubTask;
use taskswarm::llm::{
    ChatChunkStream, ChatMessage, ChatResponse, LlmClient, TokenUsage, ToolCallRequest,
    ToolDefinition,
};
use taskswarm::media::{MediaGenerationClient, MediaGenerationOptions, MediaTaskStatus};
use taskswarm::messaging::{AgentMessage, InMemoryMessageBus, MessageBus, MessageKind};
use taskswarm::model::{ModelConfig, ModelId};
use taskswarm::roles::role_for_hint;
use taskswarm::tool_registry::{ToolRegistry, ToolSpec};
use taskswarm::tools::SANDBOX_BROWSER_TOOL;
use taskswarm::worker::{WorkerAgent, WorkerStatus, MAX_ITERATIONS};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scripted responses, then an optional endlessly-repeated response.
struct ScriptedClient {
    responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    repeat: Option<ChatResponse>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new(responses: Vec<Result<ChatResponse, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            repeat: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn repeating(response: ChatResponse) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            repeat: Some(response),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: vec![],
        finish_reason: "stop".to_string(),
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
    }
}

fn tool_call_response(tool: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCallRequest {
            id: "call_test".to_string(),
            name: tool.to_string(),
            arguments: args,
        }],
        finish_reason: "tool_calls".to_string(),
        usage: TokenUsage {
            input_tokens: 10,
            output_tokens: 2,
            total_tokens: 12,
        },
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _config: &ModelConfig,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(message.into()),
            None => match &self.repeat {
                Some(response) => Ok(response.clone()),
                None => Err("scripted client ran out of responses".into()),
            },
        }
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _config: &ModelConfig,
    ) -> Result<ChatChunkStream, Box<dyn Error + Send + Sync>> {
        Ok(taskswarm::clients::common::chunks_to_stream(vec![]))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn echo_registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec::new(
            SANDBOX_BROWSER_TOOL,
            "stub browser",
            serde_json::json!({"type": "object", "properties": {}}),
            Arc::new(|args| Box::pin(async move { Ok(serde_json::json!({"echo": args})) })),
        ))
        .unwrap();
    registry
        .register(ToolSpec::new(
            "always_fails",
            "stub that always errors",
            serde_json::json!({"type": "object", "properties": {}}),
            Arc::new(|_args| Box::pin(async { Err("selector crashed".into()) })),
        ))
        .unwrap();
    Arc::new(registry)
}

fn subtask(content: &str) -> SubTask {
    SubTask::new("step-1", "job-1", content, "researcher")
}

/// Non-native model so the web capabilities route to the sandbox browser.
fn non_native_config() -> ModelConfig {
    ModelConfig::for_model(ModelId::DeepSeekV3)
}

#[tokio::test]
async fn tool_loop_runs_calls_then_finishes() {
    init_logs();
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(tool_call_response(
            SANDBOX_BROWSER_TOOL,
            serde_json::json!({"action": "search", "query": "rust"}),
        )),
        Ok(text_response("Final findings with citations.")),
    ]));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w1", role_for_hint("researcher"), client.clone(), registry.clone())
        .with_model_config(non_native_config());

    let result = worker.execute(&subtask("research rust"), "").await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.output.as_ref().map(|o| o.as_text()).as_deref(),
        Some("Final findings with citations.")
    );
    assert_eq!(result.tool_calls.len(), 1);
    assert!(result.tool_calls[0].success);
    assert_eq!(result.token_usage.total_tokens, 27);
    assert_eq!(worker.status(), WorkerStatus::Completed);
    assert!(worker.completed_at().is_some());
    assert_eq!(registry.total_calls().await, 1);
}

#[tokio::test]
async fn textual_tool_calls_are_recovered() {
    init_logs();
    let marker = format!(
        "function<｜tool▁sep｜>{}\n```json\n{{\"action\": \"search\", \"query\": \"tokio\"}}\n```",
        SANDBOX_BROWSER_TOOL
    );
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(text_response(&marker)),
        Ok(text_response("done")),
    ]));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w2", role_for_hint("researcher"), client, registry.clone())
        .with_model_config(non_native_config());

    let result = worker.execute(&subtask("look things up"), "").await.unwrap();

    assert!(result.success);
    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(result.tool_calls[0].tool_name, SANDBOX_BROWSER_TOOL);
    assert_eq!(registry.total_calls().await, 1);
}

#[tokio::test]
async fn endless_tool_calls_hit_max_iterations() {
    init_logs();
    let client = Arc::new(ScriptedClient::repeating(tool_call_response(
        SANDBOX_BROWSER_TOOL,
        serde_json::json!({"action": "search", "query": "loop"}),
    )));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w3", role_for_hint("researcher"), client.clone(), registry)
        .with_model_config(non_native_config());

    let result = worker.execute(&subtask("never finish"), "").await.unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .contains("max iterations"));
    assert_eq!(worker.status(), WorkerStatus::Failed);
    // Initial attempt plus two whole-conversation retries.
    assert_eq!(client.call_count(), MAX_ITERATIONS * 3);
}

#[tokio::test]
async fn three_consecutive_tool_errors_withdraw_the_tools() {
    init_logs();
    // The searcher role only carries web_search; point its substitute at a
    // failing handler by scripting calls against a tool that always errors.
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(tool_call_response("always_fails", serde_json::json!({}))),
        Ok(tool_call_response("always_fails", serde_json::json!({}))),
        Ok(tool_call_response("always_fails", serde_json::json!({}))),
        Ok(text_response("answered from knowledge")),
    ]));
    let mut registry = ToolRegistry::new();
    registry
        .register(ToolSpec::new(
            SANDBOX_BROWSER_TOOL,
            "stub browser that always errors",
            serde_json::json!({"type": "object", "properties": {}}),
            Arc::new(|_args| Box::pin(async { Err("connection reset".into()) })),
        ))
        .unwrap();
    registry
        .register(ToolSpec::new(
            "always_fails",
            "stub",
            serde_json::json!({"type": "object", "properties": {}}),
            Arc::new(|_args| Box::pin(async { Err("selector crashed".into()) })),
        ))
        .unwrap();
    let registry = Arc::new(registry);

    // always_fails is not in the researcher's allowed set, so each call is
    // refused without touching the registry; after three consecutive
    // refusals the worker strips the tool list and the model answers.
    let worker = WorkerAgent::new("w4", role_for_hint("researcher"), client.clone(), registry.clone())
        .with_model_config(non_native_config());
    let result = worker.execute(&subtask("fragile tools"), "").await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.output.as_ref().map(|o| o.as_text()).as_deref(),
        Some("answered from knowledge")
    );
    // Denied calls never reach the registry.
    assert_eq!(registry.total_calls().await, 0);
    assert_eq!(client.call_count(), 4);
}

#[tokio::test]
async fn rate_limit_spike_exhausts_worker_retries() {
    init_logs();
    let client = Arc::new(ScriptedClient::new(vec![
        Err("HTTP 429 Too Many Requests".to_string()),
        Err("HTTP 429 Too Many Requests".to_string()),
        Err("HTTP 429 Too Many Requests".to_string()),
    ]));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w5", role_for_hint("writer"), client.clone(), registry);

    let result = worker.execute(&subtask("write something"), "").await.unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("429"));
    assert_eq!(worker.status(), WorkerStatus::Failed);
    // One call per conversation attempt: initial plus two retries.
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn stop_terminates_between_iterations() {
    init_logs();
    let client = Arc::new(
        ScriptedClient::repeating(tool_call_response(
            SANDBOX_BROWSER_TOOL,
            serde_json::json!({"action": "search", "query": "slow"}),
        ))
        .with_delay(Duration::from_millis(100)),
    );
    let registry = echo_registry();
    let worker = Arc::new(
        WorkerAgent::new("w6", role_for_hint("researcher"), client, registry)
            .with_model_config(non_native_config()),
    );

    let runner = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.execute(&subtask("long haul"), "").await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    worker.stop().await;
    let result = runner.await.unwrap();

    assert!(!result.success);
    assert!(result.error.is_none(), "stop is not an error: {:?}", result.error);
    assert_eq!(worker.status(), WorkerStatus::Terminated);
}

#[tokio::test]
async fn shutdown_message_stops_the_worker() {
    init_logs();
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
    bus.send(AgentMessage::new(
        "orchestrator",
        "w7",
        MessageKind::Shutdown,
        "wind down",
    ))
    .await
    .unwrap();

    let client = Arc::new(ScriptedClient::repeating(text_response("never reached")));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w7", role_for_hint("writer"), client.clone(), registry)
        .with_message_bus(bus);

    let result = worker.execute(&subtask("anything"), "").await.unwrap();

    assert!(!result.success);
    assert!(result.error.is_none());
    assert_eq!(worker.status(), WorkerStatus::Terminated);
    // The shutdown arrived before the first model call.
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn second_execution_is_an_invalid_transition() {
    init_logs();
    let client = Arc::new(ScriptedClient::new(vec![Ok(text_response("once"))]));
    let registry = echo_registry();
    let worker = WorkerAgent::new("w8", role_for_hint("writer"), client, registry);

    let first = worker.execute(&subtask("one shot"), "").await;
    assert!(first.is_ok());
    let second = worker.execute(&subtask("again"), "").await;
    assert!(second.is_err());
}

struct StubMedia;

#[async_trait]
impl MediaGenerationClient for StubMedia {
    async fn text_to_image(
        &self,
        prompt: &str,
        _options: &MediaGenerationOptions,
    ) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        Ok(vec![format!("https://cdn.example.com/{}.png", prompt.len())])
    }
    async fn text_to_video(
        &self,
        _prompt: &str,
        _options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok("vid-task".to_string())
    }
    async fn image_to_video(
        &self,
        _image_url: &str,
        _prompt: &str,
        _options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok("i2v-task".to_string())
    }
    async fn poll_media_task(
        &self,
        _task_id: &str,
    ) -> Result<MediaTaskStatus, Box<dyn Error + Send + Sync>> {
        Ok(MediaTaskStatus::Succeeded {
            urls: vec!["https://cdn.example.com/clip.mp4".to_string()],
        })
    }
    async fn text_to_speech(
        &self,
        _text: &str,
        _options: &MediaGenerationOptions,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok("https://cdn.example.com/voice.mp3".to_string())
    }
}

#[tokio::test]
async fn generator_role_produces_structured_payload() {
    init_logs();
    let client = Arc::new(ScriptedClient::new(vec![]));
    let registry = Arc::new(ToolRegistry::new());
    let worker = WorkerAgent::new("w9", role_for_hint("text_to_image"), client, registry)
        .with_media_client(Arc::new(StubMedia));

    let upstream = serde_json::json!({"type": "text", "text_content": "a lighthouse at dusk"});
    let result = worker
        .execute(
            &SubTask::new("img-1", "job-1", "render the scene", "text_to_image"),
            &upstream.to_string(),
        )
        .await
        .unwrap();

    assert!(result.success);
    let payload = result
        .output
        .as_ref()
        .and_then(|o| o.as_json())
        .expect("generator output must be structured");
    assert_eq!(payload["type"], "image");
    assert_eq!(payload["text_content"], "a lighthouse at dusk");
    assert!(payload["media_urls"][0]
        .as_str()
        .unwrap()
        .starts_with("https://cdn.example.com/"));
}

#[tokio::test]
async fn generator_without_media_client_fails_cleanly() {
    init_logs();
    let client = Arc::new(ScriptedClient::new(vec![]));
    let registry = Arc::new(ToolRegistry::new());
    let worker = WorkerAgent::new("w10", role_for_hint("text_to_video"), client, registry);

    let result = worker
        .execute(
            &SubTask::new("vid-1", "job-1", "make a clip", "text_to_video"),
            "",
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .contains("media generation client"));
}
