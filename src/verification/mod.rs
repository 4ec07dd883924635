//! Verification of agent runs
//!
//! Tool coverage is a pure function of a trace and the tool set the agent
//! was given. Topic adherence is a classifier call (see `adherence`).

use crate::models::{
    ExecutionTrace, InvalidToolAttempt, ToolErrors, ToolEvalResult, ToolFailure, ToolStatus,
    INVALID_TOOL_MARKER, PARSER_ERROR_TOOL,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub mod adherence;
pub use adherence::TopicAdherenceEvaluator;

/// Classify one observation by tool name and payload shape.
///
/// Order matters: the parser sentinel wins over any payload, and an
/// invalid-tool marker wins over an error-shaped payload.
pub fn classify_observation(tool_name: &str, output: &Value) -> ToolStatus {
    if tool_name == PARSER_ERROR_TOOL {
        return ToolStatus::ParserError;
    }

    if output
        .as_object()
        .map(|obj| obj.contains_key(INVALID_TOOL_MARKER))
        .unwrap_or(false)
    {
        return ToolStatus::InvalidTool;
    }

    if is_error_shaped(output) {
        return ToolStatus::ExecutionError;
    }

    ToolStatus::Success
}

/// Keys a failing tool reports its error under, compared without case or separators.
const ERROR_KEYS: &[&str] = &["error", "errors", "errormessage", "errormsg", "errordetail", "errordetails"];

/// An error key carrying a message or an error object. Data fields that merely
/// start with "error" (`error_margin`, `errors_seen`) are not errors.
fn is_error_entry(key: &str, value: &Value) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    ERROR_KEYS.contains(&normalized.as_str())
        && match value {
            Value::String(s) => !s.trim().is_empty(),
            Value::Object(obj) => !obj.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => false,
        }
}

/// An object carrying an error entry, or a string starting with "error".
pub fn is_error_shaped(output: &Value) -> bool {
    match output {
        Value::Object(obj) => obj.iter().any(|(k, v)| is_error_entry(k, v)),
        Value::String(s) => s.trim_start().to_ascii_lowercase().starts_with("error"),
        _ => false,
    }
}

fn error_payload(output: &Value) -> Value {
    match output {
        Value::Object(obj) => obj
            .iter()
            .find(|(k, v)| is_error_entry(k, v))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| output.clone()),
        other => other.clone(),
    }
}

/// Score a trace against the tools the agent was given.
///
/// Every available tool starts at a call count of zero. Only successful
/// entries for available tools credit `used`; a successful call to anything
/// else is recorded as an invalid attempt.
pub fn evaluate(trace: &ExecutionTrace, available: &BTreeSet<String>) -> ToolEvalResult {
    let mut call_counts: BTreeMap<String, usize> =
        available.iter().map(|name| (name.clone(), 0)).collect();
    let mut used = BTreeSet::new();
    let mut errors = ToolErrors::default();
    let available_list: Vec<String> = available.iter().cloned().collect();

    for entry in &trace.entries {
        match entry.status() {
            ToolStatus::ParserError => errors.parser.push(ToolFailure {
                tool: entry.tool_name.clone(),
                input: entry.input.clone(),
                error: entry.output.clone(),
            }),
            ToolStatus::InvalidTool => {
                let requested = entry
                    .output
                    .get(INVALID_TOOL_MARKER)
                    .and_then(Value::as_str)
                    .unwrap_or(&entry.tool_name)
                    .to_string();
                errors.invalid.push(InvalidToolAttempt {
                    requested,
                    available: available_list.clone(),
                });
            }
            ToolStatus::ExecutionError => errors.execution.push(ToolFailure {
                tool: entry.tool_name.clone(),
                input: entry.input.clone(),
                error: error_payload(&entry.output),
            }),
            ToolStatus::Success => {
                if let Some(count) = call_counts.get_mut(&entry.tool_name) {
                    *count += 1;
                    used.insert(entry.tool_name.clone());
                } else {
                    errors.invalid.push(InvalidToolAttempt {
                        requested: entry.tool_name.clone(),
                        available: available_list.clone(),
                    });
                }
            }
        }
    }

    let unused = available.difference(&used).cloned().collect();

    ToolEvalResult {
        available: available.clone(),
        used,
        unused,
        call_counts,
        errors,
        evaluated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TraceEntry;
    use serde_json::json;

    fn tools(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn trace(entries: Vec<TraceEntry>) -> ExecutionTrace {
        ExecutionTrace {
            entries,
            final_answer: "done".into(),
        }
    }

    fn assert_partition(result: &ToolEvalResult) {
        let union: BTreeSet<String> = result.used.union(&result.unused).cloned().collect();
        assert_eq!(union, result.available);
        assert!(result.used.is_disjoint(&result.unused));
        assert_eq!(result.all_tools_used(), result.unused.is_empty());
    }

    #[test]
    fn classification_order() {
        assert_eq!(
            classify_observation("_Exception", &json!({"price": 1})),
            ToolStatus::ParserError
        );
        assert_eq!(
            classify_observation("x", &json!({"requested_tool_name": "x", "error": "nope"})),
            ToolStatus::InvalidTool
        );
        assert_eq!(
            classify_observation("x", &json!({"Error message": "timeout"})),
            ToolStatus::ExecutionError
        );
        assert_eq!(
            classify_observation("x", &json!("Error: boom")),
            ToolStatus::ExecutionError
        );
        assert_eq!(
            classify_observation("x", &json!({"error": {"code": 429}})),
            ToolStatus::ExecutionError
        );
        assert_eq!(
            classify_observation("x", &json!({"price": 187.2})),
            ToolStatus::Success
        );
        assert_eq!(classify_observation("x", &json!([1, 2])), ToolStatus::Success);
    }

    #[test]
    fn partial_coverage_from_pe_ratio_question() {
        let available = tools(&["get_stock_price", "get_company_financials"]);
        let result = evaluate(
            &trace(vec![TraceEntry::new(
                "get_stock_price",
                json!({"symbol": "AAPL"}),
                json!({"price": 187.2, "pe": 29.1}),
            )]),
            &available,
        );

        assert_eq!(result.unused, tools(&["get_company_financials"]));
        assert!(!result.all_tools_used());
        assert_eq!(result.call_counts["get_stock_price"], 1);
        assert_eq!(result.call_counts["get_company_financials"], 0);
        assert_partition(&result);
    }

    #[test]
    fn failures_never_credit_tools() {
        let available = tools(&["company_news", "industry_news"]);
        let result = evaluate(
            &trace(vec![
                TraceEntry::new("company_news", json!({}), json!({"error": "rate limited"})),
                TraceEntry::new("_Exception", json!("garbage"), json!("Invalid Format")),
                TraceEntry::new(
                    "stock_screener",
                    json!({}),
                    json!({"requested_tool_name": "stock_screener", "available_tool_names": ["company_news"]}),
                ),
                TraceEntry::new("industry_news", json!({"keywords": ["ai"]}), json!([{"title": "t"}])),
                TraceEntry::new("industry_news", json!({"keywords": ["chips"]}), json!([])),
            ]),
            &available,
        );

        assert_eq!(result.used, tools(&["industry_news"]));
        assert_eq!(result.call_counts["industry_news"], 2);
        assert_eq!(result.call_counts["company_news"], 0);
        assert_eq!(result.errors.execution.len(), 1);
        assert_eq!(result.errors.execution[0].error, json!("rate limited"));
        assert_eq!(result.errors.parser.len(), 1);
        assert_eq!(result.errors.invalid.len(), 1);
        assert_eq!(result.errors.invalid[0].requested, "stock_screener");
        assert_partition(&result);
    }

    #[test]
    fn success_outside_available_set_is_invalid() {
        let available = tools(&["get_stock_aggregates"]);
        let result = evaluate(
            &trace(vec![TraceEntry::new("get_cash_flow", json!({}), json!({"ok": true}))]),
            &available,
        );

        assert!(result.used.is_empty());
        assert_eq!(result.errors.invalid.len(), 1);
        assert!(!result.call_counts.contains_key("get_cash_flow"));
        assert_partition(&result);
    }

    #[test]
    fn empty_trace_leaves_everything_unused() {
        let available = tools(&["a", "b", "c"]);
        let result = evaluate(&trace(vec![]), &available);
        assert_eq!(result.unused, available);
        assert_eq!(result.errors.total(), 0);
        assert_partition(&result);

        let result = evaluate(&trace(vec![]), &BTreeSet::new());
        assert!(result.all_tools_used());
    }

    #[test]
    fn data_fields_named_like_errors_are_not_failures() {
        assert_eq!(
            classify_observation("get_company_financials", &json!({"revenue": 1, "error_margin": 0.02})),
            ToolStatus::Success
        );
        assert_eq!(
            classify_observation("x", &json!({"errors_seen": 0, "price": 3})),
            ToolStatus::Success
        );
        assert_eq!(classify_observation("x", &json!({"error": null, "price": 3})), ToolStatus::Success);
        assert_eq!(classify_observation("x", &json!({"error": ""})), ToolStatus::Success);

        let available = tools(&["get_company_financials"]);
        let result = evaluate(
            &trace(vec![TraceEntry::new(
                "get_company_financials",
                json!({"symbol": "AAPL"}),
                json!({"revenue": 383_285, "error_margin": 0.02}),
            )]),
            &available,
        );
        assert!(result.all_tools_used());
        assert!(result.errors.execution.is_empty());
    }
}
