//! Textual tool-call recovery for models without structured function calling.
//!
//! Some hosted models (deepseek-r1 in particular) emit tool calls as plain
//! text instead of populating the structured `tool_calls` field. Two shapes
//! are recognised and lifted into canonical [`ToolCallRequest`]s:
//!
//! Shape 1 — separator marker:
//!
//! ```text
//! function<｜tool▁sep｜>sandbox_browser
//! {"action": "search", "query": "rust async"}
//! ```
//!
//! (the JSON payload may also arrive inside a fenced ` ```json ` block,
//! terminated by the provider's `tool▁call▁end` token).
//!
//! Shape 2 — a fenced ` ```json ` block holding an array of
//! `{"name": …, "arguments": {…}}` objects.
//!
//! Parsing is a pure function over the content string, independent of the
//! worker loop that uses it.

use lazy_static::lazy_static;
use regex::Regex;

use crate::taskswarm::llm::ToolCallRequest;

lazy_static! {
    // Shape 1. The separator token appears with fullwidth or ASCII angle
    // brackets depending on the serving stack, and the separator itself may
    // use '▁', '_' or whitespace.
    static ref SEPARATOR_CALL: Regex = Regex::new(
        r"(?m)function\s*[<＜][^>＞]*tool[\s▁_]?sep[^>＞]*[>＞]\s*(\w+)\s*(?:```(?:json)?\s*)?(\{[\s\S]*?\})(?:\s*```)?"
    )
    .expect("invalid separator-call pattern");

    // Shape 2: fenced block holding a JSON array.
    static ref FENCED_ARRAY: Regex =
        Regex::new(r"```(?:json)?\s*(\[[\s\S]*?\])\s*```").expect("invalid fenced-array pattern");
}

fn synthesised_call_id() -> String {
    format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Parse tool calls embedded in plain model output.
///
/// Returns an empty vector when no recognisable call is present. Candidates
/// whose argument payload is not valid JSON are skipped rather than guessed
/// at. When shape 1 matches anything, shape 2 is not attempted: mixing the
/// two in one message has not been observed and the fenced array would
/// re-match shape 1's fenced arguments.
pub fn parse_inline_tool_calls(content: &str) -> Vec<ToolCallRequest> {
    if content.is_empty() {
        return Vec::new();
    }

    let mut calls = Vec::new();

    for caps in SEPARATOR_CALL.captures_iter(content) {
        let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        let args_str = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let arguments: serde_json::Value = match serde_json::from_str(args_str) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if name.is_empty() {
            continue;
        }
        calls.push(ToolCallRequest {
            id: synthesised_call_id(),
            name: name.to_string(),
            arguments,
        });
    }

    if !calls.is_empty() {
        return calls;
    }

    for caps in FENCED_ARRAY.captures_iter(content) {
        let array: serde_json::Value = match serde_json::from_str(caps[1].trim()) {
            Ok(value) => value,
            Err(_) => continue,
        };
        let items = match array.as_array() {
            Some(items) if !items.is_empty() => items,
            _ => continue,
        };
        // Only treat the block as tool calls when it looks like a call list.
        if !items[0].get("name").map(|n| n.is_string()).unwrap_or(false) {
            continue;
        }
        for item in items {
            let name = item.get("name").and_then(|n| n.as_str()).unwrap_or("");
            if name.is_empty() {
                continue;
            }
            let arguments = item
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            calls.push(ToolCallRequest {
                id: synthesised_call_id(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    calls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_marker_is_parsed() {
        let content = "I will search first.\n\
            function<｜tool▁sep｜>sandbox_browser\n\
            ```json\n{\"action\": \"search\", \"query\": \"rust async runtime\"}\n```<｜tool▁call▁end｜>";
        let calls = parse_inline_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "sandbox_browser");
        assert_eq!(calls[0].arguments["query"], "rust async runtime");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn ascii_bracket_variant_is_parsed() {
        let content = "function<tool_sep>sandbox_code_interpreter\n{\"code\": \"print(1)\"}";
        let calls = parse_inline_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "sandbox_code_interpreter");
    }

    #[test]
    fn fenced_array_is_parsed() {
        let content = "Here are my calls:\n```json\n\
            [{\"name\": \"sandbox_browser\", \"arguments\": {\"action\": \"fetch\", \"url\": \"https://example.com\"}},\n\
             {\"name\": \"sandbox_browser\", \"arguments\": {\"action\": \"search\", \"query\": \"x\"}}]\n```";
        let calls = parse_inline_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments["action"], "fetch");
        assert_eq!(calls[1].arguments["action"], "search");
    }

    #[test]
    fn fenced_array_without_name_keys_is_not_a_call_list() {
        let content = "```json\n[{\"value\": 1}, {\"value\": 2}]\n```";
        assert!(parse_inline_tool_calls(content).is_empty());
    }

    #[test]
    fn invalid_json_arguments_are_skipped() {
        let content = "function<｜tool▁sep｜>sandbox_browser\n```json\n{not json}\n```";
        assert!(parse_inline_tool_calls(content).is_empty());
    }

    #[test]
    fn prose_and_ordinary_code_blocks_yield_nothing() {
        assert!(parse_inline_tool_calls("The answer is 42.").is_empty());
        assert!(parse_inline_tool_calls("```python\nprint('hi')\n```").is_empty());
        assert!(parse_inline_tool_calls("").is_empty());
    }
}
