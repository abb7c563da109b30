use async_trait::async_trait;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use taskswarm::config::EngineSettings;
use taskswarm::event::{EventHandler, ProgressEvent};
use taskswarm::llm::{
    ChatChunkStream, ChatMessage, ChatResponse, ChatRole, LlmClient, TokenUsage, ToolDefinition,
};
use taskswarm::model::ModelConfig;
use taskswarm::orchestrator::Orchestrator;
use taskswarm::tool_registry::ToolRegistry;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: vec![],
        finish_reason: "stop".to_string(),
        usage: TokenUsage {
            input_tokens: 20,
            output_tokens: 10,
            total_tokens: 30,
        },
    }
}

/// Serves worker calls and reviewer calls from separate scripts, routed by
/// the reviewer's distinctive prompt preamble.
struct DispatchClient {
    worker_responses: Mutex<VecDeque<Result<ChatResponse, String>>>,
    review_responses: Mutex<VecDeque<ChatResponse>>,
    worker_calls: AtomicUsize,
    review_calls: AtomicUsize,
}

impl DispatchClient {
    fn new(
        worker_responses: Vec<Result<ChatResponse, String>>,
        review_responses: Vec<ChatResponse>,
    ) -> Self {
        Self {
            worker_responses: Mutex::new(worker_responses.into_iter().collect()),
            review_responses: Mutex::new(review_responses.into_iter().collect()),
            worker_calls: AtomicUsize::new(0),
            review_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for DispatchClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _config: &ModelConfig,
    ) -> Result<ChatResponse, Box<dyn Error + Send + Sync>> {
        let is_review = messages.iter().any(|m| {
            matches!(m.role, ChatRole::User) && m.content.contains("quality assessor")
        });
        if is_review {
            self.review_calls.fetch_add(1, Ordering::SeqCst);
            return self
                .review_responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| -> Box<dyn Error + Send + Sync> {
                    "no scripted review response left".into()
                });
        }
        self.worker_calls.fetch_add(1, Ordering::SeqCst);
        match self.worker_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(message.into()),
            None => Err("no scripted worker response left".into()),
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

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                ProgressEvent::TaskCreated { .. } => "task_created",
                ProgressEvent::TaskProgress { .. } => "task_progress",
                ProgressEvent::StepStatusChanged { .. } => "step_status_changed",
                ProgressEvent::StepReviewed { .. } => "step_reviewed",
                ProgressEvent::AgentCreated { .. } => "agent_created",
                ProgressEvent::AgentUpdated { .. } => "agent_updated",
                ProgressEvent::AgentRemoved { .. } => "agent_removed",
                ProgressEvent::AgentStream { .. } => "agent_stream",
                ProgressEvent::TaskCompleted { .. } => "task_completed",
                ProgressEvent::TaskDeleted { .. } => "task_deleted",
            })
            .collect()
    }

    fn reviews(&self) -> Vec<(f64, String, u32)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::StepReviewed {
                    score,
                    action,
                    attempt,
                    ..
                } => Some((*score, action.clone(), *attempt)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_progress_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn two_step_plan() -> serde_json::Value {
    serde_json::json!({
        "refined_task": "summarise the ecosystem",
        "key_objectives": ["coverage"],
        "execution_flow": {
            "steps": {
                "s1": {
                    "step_id": "s1", "step_number": 1, "name": "gather",
                    "description": "gather the facts", "agent_type": "searcher",
                    "dependencies": [], "expected_output": "facts"
                },
                "s2": {
                    "step_id": "s2", "step_number": 2, "name": "write",
                    "description": "write the summary", "agent_type": "writer",
                    "dependencies": ["s1"], "expected_output": "summary"
                }
            }
        }
    })
}

#[tokio::test]
async fn happy_path_job_produces_writer_report() {
    init_logs();
    let client = Arc::new(DispatchClient::new(
        vec![
            Ok(text_response("fact one, fact two")),
            Ok(text_response("The final summary of the ecosystem.")),
        ],
        vec![],
    ));
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_event_handler(recorder.clone())
        .with_settings(EngineSettings::default().without_quality_gate());

    let aggregation = orchestrator
        .run_job("job-1", &two_step_plan())
        .await
        .unwrap();

    assert!(aggregation.success);
    assert_eq!(aggregation.summary.total, 2);
    assert_eq!(aggregation.summary.completed, 2);
    assert_eq!(aggregation.summary.missing, 0);
    // Report mode: the writer's output is the main body.
    assert_eq!(
        aggregation.combined_output,
        serde_json::json!("The final summary of the ecosystem.")
    );
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 2);

    let kinds = recorder.kinds();
    assert_eq!(kinds.first(), Some(&"task_created"));
    assert_eq!(kinds.last(), Some(&"task_completed"));
    assert!(kinds.contains(&"agent_created"));
    assert!(kinds.contains(&"agent_removed"));
    assert!(kinds.contains(&"step_status_changed"));
    assert!(kinds.contains(&"task_progress"));
    assert!(kinds.contains(&"agent_stream"));
}

#[tokio::test]
async fn quality_gate_retries_then_accepts() {
    init_logs();
    let review_low = text_response(
        "```json\n{\"score\": 4.5, \"dimensions\": {}, \"issues\": [\"too thin\"], \
         \"suggestions\": [], \"adjustments\": []}\n```",
    );
    let review_good = text_response(
        "```json\n{\"score\": 7.0, \"dimensions\": {}, \"issues\": [], \
         \"suggestions\": [], \"adjustments\": []}\n```",
    );
    let client = Arc::new(DispatchClient::new(
        vec![
            Ok(text_response("first draft")),
            Ok(text_response("second, better draft")),
        ],
        vec![review_low, review_good],
    ));
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_event_handler(recorder.clone());

    let plan = serde_json::json!({
        "refined_task": "write",
        "execution_flow": {
            "steps": {
                "w1": {
                    "step_id": "w1", "step_number": 1, "name": "write",
                    "description": "write the piece", "agent_type": "writer",
                    "dependencies": [], "expected_output": "a piece"
                }
            }
        }
    });
    let aggregation = orchestrator.run_job("job-2", &plan).await.unwrap();

    assert!(aggregation.success);
    // Exactly one result survives despite two executions.
    assert_eq!(aggregation.outputs.len(), 1);
    assert_eq!(
        aggregation.combined_output,
        serde_json::json!("second, better draft")
    );
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.review_calls.load(Ordering::SeqCst), 2);

    let reviews = recorder.reviews();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0], (4.5, "retry".to_string(), 1));
    assert_eq!(reviews[1], (7.0, "accept".to_string(), 2));
}

#[tokio::test]
async fn retry_budget_exhaustion_downgrades_to_warning() {
    init_logs();
    let low = || {
        text_response(
            "```json\n{\"score\": 3.0, \"dimensions\": {}, \"issues\": [\"weak\"], \
             \"suggestions\": [], \"adjustments\": []}\n```",
        )
    };
    let client = Arc::new(DispatchClient::new(
        vec![
            Ok(text_response("draft 1")),
            Ok(text_response("draft 2")),
            Ok(text_response("draft 3")),
        ],
        vec![low(), low(), low()],
    ));
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_event_handler(recorder.clone());

    let plan = serde_json::json!({
        "execution_flow": {
            "steps": {
                "w1": {
                    "step_id": "w1", "step_number": 1, "name": "write",
                    "description": "write the piece", "agent_type": "writer",
                    "dependencies": [], "expected_output": "a piece"
                }
            }
        }
    });
    let aggregation = orchestrator.run_job("job-3", &plan).await.unwrap();

    // Accepted under protest: the job is not blocked by the gate.
    assert!(aggregation.success);
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 3);
    let reviews = recorder.reviews();
    assert_eq!(
        reviews.last().map(|(_, action, _)| action.as_str()),
        Some("accept_with_warning")
    );
}

#[tokio::test]
async fn reviewer_failure_is_fail_open() {
    init_logs();
    // Quality gate on, but no scripted review responses: every review call
    // errors. The step must still be accepted.
    let client = Arc::new(DispatchClient::new(
        vec![Ok(text_response("a perfectly fine answer"))],
        vec![],
    ));
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_event_handler(recorder.clone());

    let plan = serde_json::json!({
        "execution_flow": {
            "steps": {
                "w1": {
                    "step_id": "w1", "step_number": 1, "name": "write",
                    "description": "write the piece", "agent_type": "writer",
                    "dependencies": [], "expected_output": "a piece"
                }
            }
        }
    });
    let aggregation = orchestrator.run_job("job-8", &plan).await.unwrap();

    assert!(aggregation.success);
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 1);
    let reviews = recorder.reviews();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].1, "accept");
}

#[tokio::test]
async fn failing_root_blocks_every_descendant() {
    init_logs();
    // Root worker errors permanently on all three conversation attempts;
    // the children never reach the model.
    let client = Arc::new(DispatchClient::new(
        vec![
            Err("invalid request: prompt rejected".to_string()),
            Err("invalid request: prompt rejected".to_string()),
            Err("invalid request: prompt rejected".to_string()),
        ],
        vec![],
    ));
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_settings(EngineSettings::default().without_quality_gate());

    let plan = serde_json::json!({
        "execution_flow": {
            "steps": {
                "root": {
                    "step_id": "root", "step_number": 1, "name": "root",
                    "description": "the root", "agent_type": "writer",
                    "dependencies": [], "expected_output": "x"
                },
                "c1": {
                    "step_id": "c1", "step_number": 2, "name": "child 1",
                    "description": "child", "agent_type": "writer",
                    "dependencies": ["root"], "expected_output": "x"
                },
                "c2": {
                    "step_id": "c2", "step_number": 3, "name": "child 2",
                    "description": "child", "agent_type": "writer",
                    "dependencies": ["root"], "expected_output": "x"
                },
                "c3": {
                    "step_id": "c3", "step_number": 4, "name": "child 3",
                    "description": "child", "agent_type": "writer",
                    "dependencies": ["root"], "expected_output": "x"
                }
            }
        }
    });
    let aggregation = orchestrator.run_job("job-4", &plan).await.unwrap();

    assert!(!aggregation.success);
    assert_eq!(aggregation.summary.total, 4);
    assert_eq!(aggregation.summary.failed, 1);
    assert_eq!(aggregation.summary.blocked, 3);
    assert_eq!(aggregation.summary.missing, 0);
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_plan_short_circuits_to_success() {
    init_logs();
    let client = Arc::new(DispatchClient::new(vec![], vec![]));
    let orchestrator = Orchestrator::new(client.clone(), Arc::new(ToolRegistry::new()))
        .with_settings(EngineSettings::default().without_quality_gate());

    let aggregation = orchestrator
        .run_job("job-5", &serde_json::json!({}))
        .await
        .unwrap();

    assert!(aggregation.success);
    assert_eq!(aggregation.combined_output, serde_json::json!(""));
    assert_eq!(client.worker_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cyclic_plans_are_rejected_up_front() {
    init_logs();
    let client = Arc::new(DispatchClient::new(vec![], vec![]));
    let orchestrator = Orchestrator::new(client, Arc::new(ToolRegistry::new()));

    let plan = serde_json::json!({
        "execution_flow": {
            "steps": {
                "a": {
                    "step_id": "a", "step_number": 1, "name": "a",
                    "description": "a", "agent_type": "writer",
                    "dependencies": ["b"], "expected_output": "x"
                },
                "b": {
                    "step_id": "b", "step_number": 2, "name": "b",
                    "description": "b", "agent_type": "writer",
                    "dependencies": ["a"], "expected_output": "x"
                }
            }
        }
    });
    let error = orchestrator.run_job("job-6", &plan).await.unwrap_err();
    assert!(error.to_string().contains("cycle"));
}

#[tokio::test]
async fn unknown_agent_type_falls_back_to_researcher() {
    init_logs();
    let client = Arc::new(DispatchClient::new(
        vec![Ok(text_response("handled by the default role"))],
        vec![],
    ));
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(client, Arc::new(ToolRegistry::new()))
        .with_event_handler(recorder.clone())
        .with_settings(EngineSettings::default().without_quality_gate());

    let plan = serde_json::json!({
        "execution_flow": {
            "steps": {
                "s1": {
                    "step_id": "s1", "step_number": 1, "name": "mystery",
                    "description": "do the thing", "agent_type": "quantum_wizard",
                    "dependencies": [], "expected_output": "x"
                }
            }
        }
    });
    let aggregation = orchestrator.run_job("job-7", &plan).await.unwrap();

    assert!(aggregation.success);
    let roles: Vec<String> = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::AgentCreated { role, .. } => Some(role.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(roles, vec!["researcher"]);
}
