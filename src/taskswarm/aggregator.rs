//! Result aggregation: validation, conflict resolution, typed assembly.
//!
//! Runs after every board entry has terminated. The pipeline is
//! deterministic for a fixed multiset of results and a fixed strategy:
//! grouping preserves first-appearance order, missing sub-tasks follow plan
//! order, and code output uses an ordered map.
//!
//! 1. Validate each result (errors are recorded, never discarded).
//! 2. Detect conflicts: duplicate results per sub-task id (inconsistent
//!    when their success flags disagree) and numeric output divergence
//!    (max/min ratio above 10).
//! 3. Resolve duplicates per the chosen [`ConflictResolution`].
//! 4. Identify plan sub-tasks with no result at all.
//! 5. Integrate successful outputs according to the [`OutputType`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::taskswarm::board::{dependency_layers, OutputPayload, SubTask, SubTaskResult};

/// Strategy applied when several results exist for one sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Keep the first result in arrival order.
    FirstWins,
    /// Keep the last result in arrival order.
    LastWins,
    /// Majority vote on the success flag (ties side with success); the
    /// first result matching the majority wins.
    MajorityVote,
    /// Leave the conflict unresolved; the first result is carried forward
    /// but the conflict stays marked unresolved.
    Manual,
}

/// Target shape of the aggregated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    /// Concatenated prose, writer/summarizer outputs preferred.
    Report,
    /// Code snippets grouped by file path.
    Code,
    /// Website bundle; aggregated report-style.
    Website,
    /// Image artifacts; aggregated report-style.
    Image,
    /// Video artifacts; aggregated report-style.
    Video,
    /// Tabular data; aggregated report-style.
    Dataset,
    /// A single document; aggregated report-style.
    Document,
    /// Outputs bucketed by their own declared type.
    Composite,
}

/// A detected conflict between results.
#[derive(Debug, Clone, Serialize)]
pub struct ResultConflict {
    /// Sub-task ids involved.
    pub subtask_ids: Vec<String>,
    /// Conflict category: `duplicate`, `duplicate_inconsistent`, or
    /// `output_divergence`.
    pub conflict_type: String,
    /// Human-readable description.
    pub description: String,
    /// How the conflict was resolved, `None` when left unresolved.
    pub resolution: Option<String>,
}

/// Validation problems found on one result. Recorded, not fatal.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// Sub-task id of the offending result.
    pub subtask_id: String,
    /// Worker id of the offending result.
    pub agent_id: String,
    /// Individual validation errors.
    pub errors: Vec<String>,
}

/// Count summary of an aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationSummary {
    /// Sub-tasks in the plan.
    pub total: usize,
    /// Results that succeeded.
    pub completed: usize,
    /// Results that failed (blocked ones counted separately).
    pub failed: usize,
    /// Results blocked by upstream failures.
    pub blocked: usize,
    /// Plan sub-tasks with no result at all.
    pub missing: usize,
    /// `completed / results * 100`.
    pub success_rate_percent: f64,
}

/// One entry in the per-layer execution breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct LayerEntry {
    pub subtask_id: String,
    pub subtask_content: String,
    pub role: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: f64,
}

/// Results of one dependency layer.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLayer {
    /// 0-based layer index.
    pub layer: usize,
    /// Entries in layer order.
    pub results: Vec<LayerEntry>,
}

/// One successful output in the flat `outputs` list.
#[derive(Debug, Clone, Serialize)]
pub struct CollectedOutput {
    pub subtask_id: String,
    pub subtask_content: String,
    pub role: String,
    pub output: serde_json::Value,
}

/// Final aggregated job output.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    /// Parent job id.
    pub task_id: String,
    /// `true` only when every planned sub-task has a successful result.
    pub success: bool,
    /// Integrated output: a string for report-style types, an object for
    /// `Code` (file path → merged content) and `Composite` (declared type →
    /// outputs).
    pub combined_output: serde_json::Value,
    /// Count summary.
    pub summary: AggregationSummary,
    /// Per-dependency-layer breakdown.
    pub execution_layers: Vec<ExecutionLayer>,
    /// Successful outputs in resolution order.
    pub outputs: Vec<CollectedOutput>,
    /// Detected conflicts.
    pub conflicts: Vec<ResultConflict>,
    /// Plan sub-tasks with no result, in plan order.
    pub missing_subtasks: Vec<String>,
    /// Validation problems, recorded per result.
    pub validation_errors: Vec<ValidationIssue>,
}

/// Aggregates worker results into the final job output.
pub struct Aggregator {
    strategy: ConflictResolution,
    output_type: OutputType,
}

impl Aggregator {
    /// Create an aggregator for the given strategy and output type.
    pub fn new(strategy: ConflictResolution, output_type: OutputType) -> Self {
        Self {
            strategy,
            output_type,
        }
    }

    /// Run the full aggregation pipeline.
    pub fn aggregate(
        &self,
        task_id: &str,
        results: &[SubTaskResult],
        plan: &[SubTask],
    ) -> AggregationResult {
        let validation_errors = validate_results(results);
        let mut conflicts = detect_conflicts(results);
        let resolved = resolve_duplicates(results, &mut conflicts, self.strategy);

        let plan_ids: Vec<&str> = plan.iter().map(|s| s.id.as_str()).collect();
        let result_ids: HashSet<&str> = resolved.iter().map(|r| r.subtask_id.as_str()).collect();
        let missing_subtasks: Vec<String> = plan_ids
            .iter()
            .filter(|id| !result_ids.contains(**id))
            .map(|id| id.to_string())
            .collect();

        let outputs = collect_successful_outputs(&resolved, plan);
        let combined_output = match self.output_type {
            OutputType::Code => integrate_code(&outputs),
            OutputType::Composite => integrate_composite(&outputs),
            _ => serde_json::Value::String(integrate_report(&outputs)),
        };

        let completed = resolved.iter().filter(|r| r.success).count();
        let blocked = resolved.iter().filter(|r| r.is_blocked()).count();
        let failed = resolved
            .iter()
            .filter(|r| !r.success && !r.is_blocked())
            .count();
        let summary = AggregationSummary {
            total: plan.len(),
            completed,
            failed,
            blocked,
            missing: missing_subtasks.len(),
            success_rate_percent: completed as f64 / (resolved.len().max(1)) as f64 * 100.0,
        };

        // An empty plan aggregates to an empty, successful report.
        let success = if plan.is_empty() {
            true
        } else {
            missing_subtasks.is_empty() && !resolved.is_empty() && resolved.iter().all(|r| r.success)
        };

        let execution_layers = build_execution_layers(&resolved, plan, &missing_subtasks);

        log::info!(
            "aggregated job {}: {}/{} completed, {} failed, {} blocked, {} missing, success={}",
            task_id,
            completed,
            plan.len(),
            failed,
            blocked,
            missing_subtasks.len(),
            success
        );

        AggregationResult {
            task_id: task_id.to_string(),
            success,
            combined_output,
            summary,
            execution_layers,
            outputs,
            conflicts,
            missing_subtasks,
            validation_errors,
        }
    }
}

fn validate_results(results: &[SubTaskResult]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for result in results {
        let mut errors = Vec::new();
        if result.subtask_id.is_empty() {
            errors.push("missing subtask_id".to_string());
        }
        if result.agent_id.is_empty() {
            errors.push("missing agent_id".to_string());
        }
        if result.execution_time < 0.0 {
            errors.push("negative execution_time".to_string());
        }
        if result.success && result.output.is_none() {
            errors.push("successful result must have output".to_string());
        }
        if !result.success && result.error.is_none() {
            errors.push("failed result should have an error message".to_string());
        }
        if !errors.is_empty() {
            issues.push(ValidationIssue {
                subtask_id: result.subtask_id.clone(),
                agent_id: result.agent_id.clone(),
                errors,
            });
        }
    }
    issues
}

/// Group results by sub-task id, preserving first-appearance order.
fn group_by_subtask(results: &[SubTaskResult]) -> Vec<(String, Vec<&SubTaskResult>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&SubTaskResult>> = BTreeMap::new();
    for result in results {
        if !groups.contains_key(&result.subtask_id) {
            order.push(result.subtask_id.clone());
        }
        groups
            .entry(result.subtask_id.clone())
            .or_insert_with(Vec::new)
            .push(result);
    }
    order
        .into_iter()
        .map(|id| {
            let group = groups.remove(&id).unwrap_or_default();
            (id, group)
        })
        .collect()
}

fn detect_conflicts(results: &[SubTaskResult]) -> Vec<ResultConflict> {
    let mut conflicts = Vec::new();

    for (id, group) in group_by_subtask(results) {
        if group.len() > 1 {
            let mut flags: Vec<bool> = group.iter().map(|r| r.success).collect();
            flags.dedup();
            let inconsistent = flags.len() > 1;
            conflicts.push(ResultConflict {
                subtask_ids: vec![id.clone()],
                conflict_type: if inconsistent {
                    "duplicate_inconsistent".to_string()
                } else {
                    "duplicate".to_string()
                },
                description: format!(
                    "subtask {} has {} results{}",
                    id,
                    group.len(),
                    if inconsistent {
                        " with inconsistent success status"
                    } else {
                        ""
                    }
                ),
                resolution: None,
            });
        }
    }

    // Numeric divergence across successful structured numeric outputs.
    let numeric: Vec<(&str, f64)> = results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| match &r.output {
            Some(OutputPayload::Structured(serde_json::Value::Number(n))) => {
                n.as_f64().map(|v| (r.subtask_id.as_str(), v))
            }
            _ => None,
        })
        .collect();
    if numeric.len() > 1 {
        let values: Vec<f64> = numeric.iter().map(|(_, v)| *v).collect();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        if min > 0.0 && max / min > 10.0 {
            conflicts.push(ResultConflict {
                subtask_ids: numeric.iter().map(|(id, _)| id.to_string()).collect(),
                conflict_type: "output_divergence".to_string(),
                description: format!(
                    "numeric outputs diverge significantly (ratio {:.2})",
                    max / min
                ),
                resolution: None,
            });
        }
    }

    conflicts
}

fn resolve_duplicates(
    results: &[SubTaskResult],
    conflicts: &mut [ResultConflict],
    strategy: ConflictResolution,
) -> Vec<SubTaskResult> {
    let mut resolved = Vec::new();

    for (id, group) in group_by_subtask(results) {
        if group.len() == 1 {
            resolved.push(group[0].clone());
            continue;
        }

        let (winner, note): (&SubTaskResult, Option<String>) = match strategy {
            ConflictResolution::FirstWins => (group[0], Some("selected first result".to_string())),
            ConflictResolution::LastWins => (
                group[group.len() - 1],
                Some("selected last result".to_string()),
            ),
            ConflictResolution::MajorityVote => {
                let successes = group.iter().filter(|r| r.success).count();
                let failures = group.len() - successes;
                let majority_success = successes >= failures;
                let winner = group
                    .iter()
                    .find(|r| r.success == majority_success)
                    .copied()
                    .unwrap_or(group[0]);
                (
                    winner,
                    Some(format!(
                        "majority vote: {} ({}/{})",
                        if majority_success { "success" } else { "failure" },
                        if majority_success { successes } else { failures },
                        group.len()
                    )),
                )
            }
            ConflictResolution::Manual => (group[0], None),
        };

        for conflict in conflicts.iter_mut() {
            if conflict.conflict_type.starts_with("duplicate")
                && conflict.subtask_ids.contains(&id)
            {
                // Manual strategy leaves `resolution` as None on purpose.
                conflict.resolution = note.clone();
            }
        }

        resolved.push(winner.clone());
    }

    resolved
}

fn output_as_json(payload: &OutputPayload) -> serde_json::Value {
    match payload {
        OutputPayload::Text(text) => serde_json::Value::String(text.clone()),
        OutputPayload::Structured(value) => value.clone(),
    }
}

fn collect_successful_outputs(results: &[SubTaskResult], plan: &[SubTask]) -> Vec<CollectedOutput> {
    let by_id: BTreeMap<&str, &SubTask> = plan.iter().map(|s| (s.id.as_str(), s)).collect();
    results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| {
            let payload = r.output.as_ref()?;
            let subtask = by_id.get(r.subtask_id.as_str());
            Some(CollectedOutput {
                subtask_id: r.subtask_id.clone(),
                subtask_content: subtask.map(|s| s.content.clone()).unwrap_or_default(),
                role: subtask
                    .map(|s| s.role_hint.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                output: output_as_json(payload),
            })
        })
        .collect()
}

fn output_text(output: &serde_json::Value) -> String {
    match output {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Report integration: writer/summarizer output is the main body, analyst /
/// researcher output supplements a thin body, raw data-role output appears
/// only when nothing higher-level exists.
fn integrate_report(outputs: &[CollectedOutput]) -> String {
    if outputs.is_empty() {
        return String::new();
    }

    let mut writer_layer: Vec<&CollectedOutput> = Vec::new();
    let mut analyst_layer: Vec<&CollectedOutput> = Vec::new();
    let mut data_layer: Vec<&CollectedOutput> = Vec::new();
    for output in outputs {
        if output_text(&output.output).trim().is_empty() {
            continue;
        }
        match output.role.as_str() {
            "writer" | "summarizer" => writer_layer.push(output),
            "analyst" | "researcher" => analyst_layer.push(output),
            _ => data_layer.push(output),
        }
    }

    if !writer_layer.is_empty() {
        let main = writer_layer
            .iter()
            .max_by_key(|o| output_text(&o.output).chars().count())
            .map(|o| output_text(&o.output))
            .unwrap_or_default();
        if main.chars().count() < 3000 && !analyst_layer.is_empty() {
            let supplements: Vec<String> =
                analyst_layer.iter().map(|o| output_text(&o.output)).collect();
            return format!("{}\n\n---\n\n{}", main, supplements.join("\n\n"));
        }
        return main;
    }

    if !analyst_layer.is_empty() {
        let body: Vec<String> = analyst_layer.iter().map(|o| output_text(&o.output)).collect();
        let body = body.join("\n\n");
        if body.chars().count() < 3000 && !data_layer.is_empty() {
            let data: Vec<String> = data_layer.iter().map(|o| output_text(&o.output)).collect();
            return format!("{}\n\n---\n## Supporting data\n\n{}", body, data.join("\n\n"));
        }
        return body;
    }

    data_layer
        .iter()
        .map(|o| output_text(&o.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

lazy_static::lazy_static! {
    static ref FILE_MARKER: regex::Regex =
        regex::Regex::new(r"(?m)^\s*(?:#|//)\s*file:\s*(\S+)\s*$").expect("invalid file marker");
}

/// Split text on `# file: path` / `// file: path` markers into per-file
/// snippets. Returns an empty map when no marker is present.
pub fn extract_file_snippets(content: &str) -> BTreeMap<String, String> {
    let markers: Vec<(usize, usize, String)> = FILE_MARKER
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let path = caps.get(1)?.as_str().to_string();
            Some((whole.start(), whole.end(), path))
        })
        .collect();

    let mut snippets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (i, (_, end, path)) in markers.iter().enumerate() {
        let slice_end = markers
            .get(i + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(content.len());
        let code = content[*end..slice_end].trim();
        if !code.is_empty() {
            snippets
                .entry(path.clone())
                .or_insert_with(Vec::new)
                .push(code.to_string());
        }
    }

    snippets
        .into_iter()
        .map(|(path, parts)| (path, parts.join("\n")))
        .collect()
}

/// Code integration: group snippets by file path from structured
/// `{file_path, content}` outputs or inline markers; unattributed snippets
/// land under `_unclassified`.
fn integrate_code(outputs: &[CollectedOutput]) -> serde_json::Value {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for output in outputs {
        match &output.output {
            serde_json::Value::Object(map) => {
                let file_path = map
                    .get("file_path")
                    .and_then(|p| p.as_str())
                    .unwrap_or("")
                    .to_string();
                let content = map
                    .get("content")
                    .or_else(|| map.get("output"))
                    .map(output_text)
                    .unwrap_or_default();
                let key = if file_path.is_empty() {
                    "_unclassified".to_string()
                } else {
                    file_path
                };
                groups.entry(key).or_insert_with(Vec::new).push(content);
            }
            serde_json::Value::String(text) => {
                let extracted = extract_file_snippets(text);
                if extracted.is_empty() {
                    groups
                        .entry("_unclassified".to_string())
                        .or_insert_with(Vec::new)
                        .push(text.clone());
                } else {
                    for (path, code) in extracted {
                        groups.entry(path).or_insert_with(Vec::new).push(code);
                    }
                }
            }
            other => {
                groups
                    .entry("_unclassified".to_string())
                    .or_insert_with(Vec::new)
                    .push(other.to_string());
            }
        }
    }

    let merged: serde_json::Map<String, serde_json::Value> = groups
        .into_iter()
        .map(|(path, snippets)| (path, serde_json::Value::String(snippets.join("\n"))))
        .collect();
    serde_json::Value::Object(merged)
}

/// Composite integration: bucket outputs by their own declared
/// `output_type`, defaulting to `report`.
fn integrate_composite(outputs: &[CollectedOutput]) -> serde_json::Value {
    let mut groups: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for output in outputs {
        let declared = output
            .output
            .get("output_type")
            .and_then(|t| t.as_str())
            .unwrap_or("report")
            .to_string();
        groups
            .entry(declared)
            .or_insert_with(Vec::new)
            .push(serde_json::json!({
                "subtask_id": output.subtask_id,
                "role": output.role,
                "output": output.output,
            }));
    }
    let map: serde_json::Map<String, serde_json::Value> = groups
        .into_iter()
        .map(|(key, items)| (key, serde_json::Value::Array(items)))
        .collect();
    serde_json::Value::Object(map)
}

fn build_execution_layers(
    results: &[SubTaskResult],
    plan: &[SubTask],
    missing: &[String],
) -> Vec<ExecutionLayer> {
    let by_id: BTreeMap<&str, &SubTaskResult> =
        results.iter().map(|r| (r.subtask_id.as_str(), r)).collect();
    let plan_by_id: BTreeMap<&str, &SubTask> = plan.iter().map(|s| (s.id.as_str(), s)).collect();
    let missing: HashSet<&str> = missing.iter().map(|s| s.as_str()).collect();

    dependency_layers(plan)
        .into_iter()
        .enumerate()
        .map(|(layer_index, ids)| {
            let entries = ids
                .iter()
                .filter_map(|id| {
                    let subtask = plan_by_id.get(id.as_str())?;
                    if let Some(result) = by_id.get(id.as_str()) {
                        Some(LayerEntry {
                            subtask_id: id.clone(),
                            subtask_content: subtask.content.clone(),
                            role: subtask.role_hint.clone(),
                            success: result.success,
                            output: result.output.as_ref().map(output_as_json),
                            error: result.error.clone(),
                            execution_time: result.execution_time,
                        })
                    } else if missing.contains(id.as_str()) {
                        Some(LayerEntry {
                            subtask_id: id.clone(),
                            subtask_content: subtask.content.clone(),
                            role: subtask.role_hint.clone(),
                            success: false,
                            output: None,
                            error: Some("MISSING: no result received for this subtask".to_string()),
                            execution_time: 0.0,
                        })
                    } else {
                        None
                    }
                })
                .collect();
            ExecutionLayer {
                layer: layer_index,
                results: entries,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskswarm::llm::TokenUsage;

    fn plan_task(id: &str, role: &str, deps: &[&str]) -> SubTask {
        SubTask::new(id, "job", format!("step {}", id), role)
            .with_dependencies(deps.iter().copied())
    }

    fn text_result(id: &str, text: &str) -> SubTaskResult {
        SubTaskResult {
            subtask_id: id.to_string(),
            agent_id: format!("agent-{}", id),
            success: true,
            output: Some(OutputPayload::Text(text.to_string())),
            error: None,
            tool_calls: Vec::new(),
            execution_time: 1.0,
            token_usage: TokenUsage::default(),
        }
    }

    fn failure(id: &str, error: &str) -> SubTaskResult {
        SubTaskResult {
            subtask_id: id.to_string(),
            agent_id: format!("agent-{}", id),
            success: false,
            output: None,
            error: Some(error.to_string()),
            tool_calls: Vec::new(),
            execution_time: 1.0,
            token_usage: TokenUsage::default(),
        }
    }

    #[test]
    fn empty_plan_is_a_successful_empty_report() {
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let result = aggregator.aggregate("job", &[], &[]);
        assert!(result.success);
        assert_eq!(result.combined_output, serde_json::json!(""));
        assert_eq!(result.summary.total, 0);
        assert_eq!(result.summary.missing, 0);
    }

    #[test]
    fn majority_vote_keeps_first_matching_result() {
        let plan = vec![plan_task("a", "researcher", &[])];
        let results = vec![
            text_result("a", "first true"),
            text_result("a", "second true"),
            failure("a", "flaked"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);

        assert!(outcome.success);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs[0].output, serde_json::json!("first true"));
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].conflict_type, "duplicate_inconsistent");
        assert!(outcome.conflicts[0]
            .resolution
            .as_deref()
            .unwrap()
            .contains("majority vote: success (2/3)"));
    }

    #[test]
    fn manual_strategy_leaves_conflict_unresolved() {
        let plan = vec![plan_task("a", "researcher", &[])];
        let results = vec![text_result("a", "one"), text_result("a", "two")];
        let aggregator = Aggregator::new(ConflictResolution::Manual, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);
        assert_eq!(outcome.conflicts[0].conflict_type, "duplicate");
        assert!(outcome.conflicts[0].resolution.is_none());
    }

    #[test]
    fn code_outputs_group_by_file_path() {
        let plan = vec![
            plan_task("s1", "coder", &[]),
            plan_task("s2", "coder", &[]),
            plan_task("s3", "coder", &[]),
        ];
        let results = vec![
            SubTaskResult {
                output: Some(OutputPayload::Structured(
                    serde_json::json!({"file_path": "a.py", "content": "x"}),
                )),
                ..text_result("s1", "")
            },
            SubTaskResult {
                output: Some(OutputPayload::Structured(
                    serde_json::json!({"file_path": "a.py", "content": "y"}),
                )),
                ..text_result("s2", "")
            },
            text_result("s3", "# file: b.py\nz"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Code);
        let outcome = aggregator.aggregate("job", &results, &plan);
        assert_eq!(
            outcome.combined_output,
            serde_json::json!({"a.py": "x\ny", "b.py": "z"})
        );
    }

    #[test]
    fn inline_markers_support_both_comment_styles() {
        let snippets =
            extract_file_snippets("# file: src/main.rs\nfn main() {}\n// file: lib.rs\npub fn f() {}");
        assert_eq!(snippets["src/main.rs"], "fn main() {}");
        assert_eq!(snippets["lib.rs"], "pub fn f() {}");
        assert!(extract_file_snippets("no markers at all").is_empty());
    }

    #[test]
    fn report_prefers_writer_and_supplements_thin_body() {
        let plan = vec![
            plan_task("search", "searcher", &[]),
            plan_task("analyse", "analyst", &["search"]),
            plan_task("write", "writer", &["analyse"]),
        ];
        let results = vec![
            text_result("search", "raw data points"),
            text_result("analyse", "analysis section"),
            text_result("write", "short final report"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);
        let combined = outcome.combined_output.as_str().unwrap();
        // Thin writer body pulls in the analyst layer, not the raw data.
        assert!(combined.starts_with("short final report"));
        assert!(combined.contains("analysis section"));
        assert!(!combined.contains("raw data points"));
    }

    #[test]
    fn report_without_writer_falls_back_to_analyst_then_data() {
        let plan = vec![
            plan_task("search", "searcher", &[]),
            plan_task("analyse", "analyst", &["search"]),
        ];
        let results = vec![
            text_result("search", "raw data"),
            text_result("analyse", "the analysis"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);
        let combined = outcome.combined_output.as_str().unwrap();
        assert!(combined.starts_with("the analysis"));
        assert!(combined.contains("raw data")); // thin analysis pulls data layer

        let data_only = aggregator.aggregate(
            "job2",
            &[text_result("search", "just data")],
            &[plan_task("search", "searcher", &[])],
        );
        assert_eq!(data_only.combined_output, serde_json::json!("just data"));
    }

    #[test]
    fn missing_and_failed_subtasks_fail_the_job() {
        let plan = vec![
            plan_task("a", "researcher", &[]),
            plan_task("b", "researcher", &["a"]),
            plan_task("c", "researcher", &["b"]),
        ];
        // a completed, b failed, c blocked.
        let results = vec![
            text_result("a", "done"),
            failure("b", "model refused"),
            SubTaskResult::blocked("c"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);

        assert!(!outcome.success);
        assert_eq!(outcome.summary.total, 3);
        assert_eq!(outcome.summary.completed, 1);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.summary.blocked, 1);
        assert_eq!(outcome.summary.missing, 0);
        // Blocked synthetic results carry no agent id; that is recorded as a
        // validation issue, not discarded.
        assert!(outcome
            .validation_errors
            .iter()
            .any(|v| v.subtask_id == "c" && v.errors.iter().any(|e| e.contains("agent_id"))));
    }

    #[test]
    fn numeric_divergence_is_flagged() {
        let plan = vec![
            plan_task("x", "analyst", &[]),
            plan_task("y", "analyst", &[]),
        ];
        let results = vec![
            SubTaskResult {
                output: Some(OutputPayload::Structured(serde_json::json!(3.0))),
                ..text_result("x", "")
            },
            SubTaskResult {
                output: Some(OutputPayload::Structured(serde_json::json!(99.0))),
                ..text_result("y", "")
            },
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);
        assert!(outcome
            .conflicts
            .iter()
            .any(|c| c.conflict_type == "output_divergence"));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let plan = vec![
            plan_task("a", "writer", &[]),
            plan_task("b", "analyst", &[]),
        ];
        let results = vec![
            text_result("a", "alpha"),
            text_result("b", "beta"),
            text_result("a", "alpha-duplicate"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::FirstWins, OutputType::Report);
        let first = aggregator.aggregate("job", &results, &plan);
        let second = aggregator.aggregate("job", &results, &plan);
        assert_eq!(first.combined_output, second.combined_output);
        assert_eq!(first.summary, second.summary);
    }

    #[test]
    fn composite_buckets_by_declared_type() {
        let plan = vec![
            plan_task("img", "text_to_image", &[]),
            plan_task("txt", "writer", &[]),
        ];
        let results = vec![
            SubTaskResult {
                output: Some(OutputPayload::Structured(serde_json::json!({
                    "output_type": "image",
                    "media_urls": ["https://cdn/i.png"],
                }))),
                ..text_result("img", "")
            },
            text_result("txt", "prose"),
        ];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Composite);
        let outcome = aggregator.aggregate("job", &results, &plan);
        let buckets = outcome.combined_output.as_object().unwrap();
        assert!(buckets.contains_key("image"));
        assert!(buckets.contains_key("report"));
    }

    #[test]
    fn execution_layers_follow_plan_dependencies() {
        let plan = vec![
            plan_task("a", "searcher", &[]),
            plan_task("b", "analyst", &["a"]),
        ];
        let results = vec![text_result("a", "data")];
        let aggregator = Aggregator::new(ConflictResolution::MajorityVote, OutputType::Report);
        let outcome = aggregator.aggregate("job", &results, &plan);

        assert_eq!(outcome.execution_layers.len(), 2);
        assert_eq!(outcome.execution_layers[0].results[0].subtask_id, "a");
        let missing_entry = &outcome.execution_layers[1].results[0];
        assert!(!missing_entry.success);
        assert!(missing_entry.error.as_deref().unwrap().contains("MISSING"));
        assert_eq!(outcome.summary.missing, 1);
        assert!(!outcome.success);
    }
}
