//! Quality gate: LLM-scored review of completed steps.
//!
//! After a worker completes successfully, the reviewer scores the output
//! against the step description, the role, and prior-step context, and
//! decides whether to accept the step, demand a re-run, or — once the retry
//! budget is spent — accept it with a warning. Reviewer failures are
//! swallowed: a broken reviewer must never block delivery, so any internal
//! error results in acceptance of the output as-is.
//!
//! The reviewer may also attach dynamic plan adjustments (insert a new
//! step, raise a step's priority) that the orchestrator applies to the task
//! board before further scheduling.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::taskswarm::llm::{ChatMessage, ChatRole, LlmClient};
use crate::taskswarm::model::{ModelConfig, ModelId};
use crate::taskswarm::orchestrator::PlanStep;

/// Categorical quality band derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityLevel {
    /// 9-10: exceeds expectations.
    Excellent,
    /// 7-8: meets expectations.
    Good,
    /// 5-6: basically complete.
    Acceptable,
    /// 3-4: needs rework.
    Poor,
    /// 1-2: did not accomplish the task.
    Failed,
}

impl QualityLevel {
    /// Band for a 1-10 score.
    pub fn from_score(score: f64) -> Self {
        if score >= 9.0 {
            QualityLevel::Excellent
        } else if score >= 7.0 {
            QualityLevel::Good
        } else if score >= 5.0 {
            QualityLevel::Acceptable
        } else if score >= 3.0 {
            QualityLevel::Poor
        } else {
            QualityLevel::Failed
        }
    }
}

/// Full quality assessment of one output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    /// Overall score, 1-10.
    pub score: f64,
    /// Categorical band for the score.
    pub level: QualityLevel,
    /// Per-dimension scores: accuracy, completeness, relevance, clarity,
    /// structure, usefulness.
    pub dimensions: std::collections::BTreeMap<String, f64>,
    /// Issues the reviewer found.
    pub issues: Vec<String>,
    /// Concrete improvement suggestions.
    pub suggestions: Vec<String>,
    /// Whether the score clears the configured threshold.
    pub passed: bool,
}

/// Decision taken for a reviewed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewAction {
    /// Output accepted.
    Accept,
    /// Output rejected; the step should be re-executed.
    Retry,
    /// Retry budget exhausted; output accepted under protest.
    AcceptWithWarning,
}

impl ReviewAction {
    /// Lower-case name used in events.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Accept => "accept",
            ReviewAction::Retry => "retry",
            ReviewAction::AcceptWithWarning => "accept_with_warning",
        }
    }
}

/// A dynamic change to the remaining plan requested by the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanAdjustment {
    /// Insert a new step into the plan.
    InsertStep {
        /// The step to insert; its dependencies must name existing steps.
        step: PlanStep,
    },
    /// Raise (or lower) the dispatch priority of a not-yet-started step.
    RaisePriority {
        /// Target step id.
        step_id: String,
        /// New priority value.
        priority: i32,
    },
}

/// Outcome of reviewing one step.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    /// Reviewed step id.
    pub step_id: String,
    /// Numeric score, 1-10.
    pub score: f64,
    /// Decision for the step.
    pub action: ReviewAction,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// Plan adjustments to apply before further scheduling.
    pub adjustments: Vec<PlanAdjustment>,
    /// 1-based attempt number this review refers to.
    pub attempt: u32,
}

/// LLM-backed step reviewer.
pub struct QualityGateReviewer {
    client: Arc<dyn LlmClient>,
    threshold: f64,
}

impl QualityGateReviewer {
    /// Create a reviewer with the given pass threshold (default 6.0 at the
    /// engine level).
    pub fn new(client: Arc<dyn LlmClient>, threshold: f64) -> Self {
        Self { client, threshold }
    }

    /// Score a completed step and decide whether to accept it.
    ///
    /// Fail-open: every internal failure (model error, unparseable
    /// response) is logged and converted into an acceptance so reviewer
    /// bugs never block the job.
    pub async fn review_step(
        &self,
        step: &PlanStep,
        output: &str,
        prior_outputs: &[(String, String)],
        attempt: u32,
    ) -> ReviewResult {
        match self.try_review(step, output, prior_outputs, attempt).await {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "quality review of step {} failed, accepting output as-is: {}",
                    step.step_id,
                    e
                );
                ReviewResult {
                    step_id: step.step_id.clone(),
                    score: self.threshold,
                    action: ReviewAction::Accept,
                    reason: format!("reviewer unavailable ({}); accepted without scoring", e),
                    adjustments: Vec::new(),
                    attempt,
                }
            }
        }
    }

    async fn try_review(
        &self,
        step: &PlanStep,
        output: &str,
        prior_outputs: &[(String, String)],
        attempt: u32,
    ) -> Result<ReviewResult, Box<dyn std::error::Error + Send + Sync>> {
        let prompt = build_review_prompt(step, output, prior_outputs);
        let mut config = ModelConfig::for_model(ModelId::Qwen3Max).with_temperature(0.1);
        config.enable_search = false;
        config.enable_thinking = false;

        let messages = [ChatMessage::new(ChatRole::User, prompt)];
        let response = self.client.chat(&messages, None, &config).await?;

        let report = parse_quality_json(&response.content, self.threshold)
            .ok_or_else(|| -> Box<dyn std::error::Error + Send + Sync> {
                "reviewer returned no parseable JSON".into()
            })?;

        let adjustments = parse_adjustments(&response.content);
        let action = if report.passed {
            ReviewAction::Accept
        } else {
            ReviewAction::Retry
        };
        let reason = if report.issues.is_empty() {
            format!("scored {:.1}/10", report.score)
        } else {
            format!("scored {:.1}/10: {}", report.score, report.issues.join("; "))
        };

        Ok(ReviewResult {
            step_id: step.step_id.clone(),
            score: report.score,
            action,
            reason,
            adjustments,
            attempt,
        })
    }

    /// Downgrade a `Retry` decision once the retry budget is exhausted.
    pub fn downgrade_to_warning(result: ReviewResult, budget: u32) -> ReviewResult {
        ReviewResult {
            action: ReviewAction::AcceptWithWarning,
            reason: format!(
                "still below threshold after {} retr{}; accepting current output ({})",
                budget,
                if budget == 1 { "y" } else { "ies" },
                result.reason
            ),
            ..result
        }
    }
}

fn build_review_prompt(step: &PlanStep, output: &str, prior_outputs: &[(String, String)]) -> String {
    let mut context = String::new();
    for (name, text) in prior_outputs.iter().take(5) {
        let preview: String = text.chars().take(500).collect();
        context.push_str(&format!("### Result of '{}'\n{}\n\n", name, preview));
    }
    if context.is_empty() {
        context.push_str("(no prior steps)\n");
    }

    let output_preview: String = output.chars().take(4000).collect();

    format!(
        "You are a rigorous quality assessor for a multi-agent pipeline. Evaluate the \
         following step output.\n\n\
         ## Step\n- Name: {name}\n- Description: {description}\n- Agent role: {role}\n\
         - Expected output: {expected}\n\n\
         ## Prior step context\n{context}\n\
         ## Output under review ({len} chars)\n{output}\n\n\
         ## Scoring\nScore 1-10 overall and per dimension (accuracy, completeness, \
         relevance, clarity, structure, usefulness). 9-10 exceeds expectations, 7-8 meets \
         them, 5-6 is basically complete, 3-4 needs rework, 1-2 failed. Do not punish \
         short outputs that fully answer the task.\n\n\
         ## Response format\nReply with JSON only:\n\
         ```json\n{{\n  \"score\": 0,\n  \"dimensions\": {{\"accuracy\": 0, \
         \"completeness\": 0, \"relevance\": 0, \"clarity\": 0, \"structure\": 0, \
         \"usefulness\": 0}},\n  \"issues\": [\"...\"],\n  \"suggestions\": [\"...\"],\n  \
         \"adjustments\": []\n}}\n```\n\
         An adjustment entry is either {{\"action\": \"insert_step\", \"step\": {{...}}}} \
         or {{\"action\": \"raise_priority\", \"step_id\": \"...\", \"priority\": 0}}. \
         Leave \"adjustments\" empty unless the remaining plan genuinely needs to change.",
        name = step.name,
        description = step.description,
        role = step.agent_type,
        expected = step.expected_output,
        context = context,
        len = output.chars().count(),
        output = output_preview,
    )
}

/// Extract the first fenced or bare JSON object from reviewer output and
/// lift it into a [`QualityReport`].
pub fn parse_quality_json(content: &str, threshold: f64) -> Option<QualityReport> {
    let json_text = extract_json_block(content)?;
    let value: serde_json::Value = serde_json::from_str(&json_text).ok()?;

    let score = value.get("score").and_then(|s| s.as_f64())?;
    let score = score.max(1.0).min(10.0);

    let mut dimensions = std::collections::BTreeMap::new();
    if let Some(map) = value.get("dimensions").and_then(|d| d.as_object()) {
        for (key, dim_score) in map {
            if let Some(dim_score) = dim_score.as_f64() {
                dimensions.insert(key.clone(), dim_score);
            }
        }
    }

    let issues = value
        .get("issues")
        .and_then(|i| i.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| match item {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(obj) => obj
                        .get("description")
                        .and_then(|d| d.as_str())
                        .map(|s| s.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let suggestions = value
        .get("suggestions")
        .and_then(|s| s.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    Some(QualityReport {
        score,
        level: QualityLevel::from_score(score),
        dimensions,
        issues,
        suggestions,
        passed: score >= threshold,
    })
}

/// Parse adjustment directives from reviewer output; malformed entries are
/// dropped rather than guessed at.
pub fn parse_adjustments(content: &str) -> Vec<PlanAdjustment> {
    let json_text = match extract_json_block(content) {
        Some(text) => text,
        None => return Vec::new(),
    };
    let value: serde_json::Value = match serde_json::from_str(&json_text) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };

    let mut adjustments = Vec::new();
    if let Some(items) = value.get("adjustments").and_then(|a| a.as_array()) {
        for item in items {
            match item.get("action").and_then(|a| a.as_str()) {
                Some("insert_step") => {
                    if let Some(step) = item.get("step") {
                        if let Ok(step) = serde_json::from_value::<PlanStep>(step.clone()) {
                            if !step.step_id.is_empty() {
                                adjustments.push(PlanAdjustment::InsertStep { step });
                            }
                        }
                    }
                }
                Some("raise_priority") => {
                    let step_id = item.get("step_id").and_then(|s| s.as_str()).unwrap_or("");
                    let priority = item.get("priority").and_then(|p| p.as_i64());
                    if !step_id.is_empty() {
                        if let Some(priority) = priority {
                            adjustments.push(PlanAdjustment::RaisePriority {
                                step_id: step_id.to_string(),
                                priority: priority as i32,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }
    adjustments
}

fn extract_json_block(content: &str) -> Option<String> {
    // Fenced block first.
    if let Some(start) = content.find("```json") {
        let rest = &content[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }
    if let Some(start) = content.find("```") {
        let rest = &content[start + 3..];
        if let Some(end) = rest.find("```") {
            let candidate = rest[..end].trim();
            if candidate.starts_with('{') {
                return Some(candidate.to_string());
            }
        }
    }
    // Bare object: first '{' to last '}'.
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        Some(content[start..=end].to_string())
    } else {
        None
    }
}
