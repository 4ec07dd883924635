//! Classifier-backed router
//!
//! Asks the structured classifier for the next action. Agent names are
//! matched leniently ("FinancialMetricsAgent", "SQLAgent") and the task may
//! arrive nested under `task` or flat at the top level.

use super::{Router, RoutingContext};
use crate::classifier::{routing_schema, ClassifyError, StructuredClassifier};
use crate::error::OrchestrationError;
use crate::models::{render_transcript, AgentKind, NextAction, RoutingDecision, TaskAssignment};
use crate::prompts;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Messages are clipped in the routing prompt; the supervisor only needs gist.
const HISTORY_CHARS_PER_MESSAGE: usize = 1_200;

pub struct LlmRouter {
    classifier: Arc<dyn StructuredClassifier>,
}

impl LlmRouter {
    pub fn new(classifier: Arc<dyn StructuredClassifier>) -> Self {
        Self { classifier }
    }
}

/// Lenient mapping from model output to a next action.
pub fn parse_next_action(raw: &str) -> Option<NextAction> {
    let normalized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let normalized = normalized.trim_end_matches("agent");

    match normalized {
        "financialmetrics" | "financial" | "metrics" => Some(NextAction::FinancialMetrics),
        "newssentiment" | "news" | "sentiment" => Some(NextAction::NewsSentiment),
        "marketintelligence" | "market" => Some(NextAction::MarketIntelligence),
        "historicaldata" | "historical" | "sql" => Some(NextAction::HistoricalData),
        "synthesizer" | "synthesis" | "synthesiser" => Some(NextAction::Synthesizer),
        "finish" | "end" | "done" => Some(NextAction::Finish),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn text(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

pub fn parse_decision(value: &Value) -> std::result::Result<RoutingDecision, ClassifyError> {
    let raw = value
        .get("next_action")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let next_action = parse_next_action(raw).ok_or_else(|| ClassifyError::Malformed {
        schema: "routing_decision".to_string(),
        detail: format!("unknown next_action '{}'", raw),
    })?;

    let task = match value.get("task") {
        Some(nested) if nested.is_object() => TaskAssignment {
            description: text(nested.get("description")),
            expected_output: text(nested.get("expected_output")),
            validation_criteria: string_list(nested.get("validation_criteria")),
        },
        _ => TaskAssignment {
            description: text(value.get("task_description")),
            expected_output: text(value.get("expected_output")),
            validation_criteria: string_list(value.get("validation_criteria")),
        },
    };

    Ok(RoutingDecision { next_action, task })
}

#[async_trait]
impl Router for LlmRouter {
    async fn route(&self, ctx: &RoutingContext<'_>) -> Result<RoutingDecision> {
        let dispatched: Vec<AgentKind> = ctx.dispatched.iter().copied().collect();
        let prompt = prompts::supervisor(
            ctx.profile,
            ctx.analysis_time,
            &render_transcript(ctx.messages, HISTORY_CHARS_PER_MESSAGE),
            &dispatched,
        );
        let schema = routing_schema();

        let value = self.classifier.classify(&prompt, &schema).await?;
        schema.check(&value)?;

        parse_decision(&value).map_err(OrchestrationError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_agent_names() {
        assert_eq!(parse_next_action("FinancialMetricsAgent"), Some(NextAction::FinancialMetrics));
        assert_eq!(parse_next_action("SQLAgent"), Some(NextAction::HistoricalData));
        assert_eq!(parse_next_action("news_sentiment"), Some(NextAction::NewsSentiment));
        assert_eq!(parse_next_action("FINISH"), Some(NextAction::Finish));
        assert_eq!(parse_next_action("Astrologer"), None);
    }

    #[test]
    fn nested_and_flat_tasks() {
        let nested = parse_decision(&json!({
            "next_action": "MarketIntelligence",
            "task": {"description": "insider check", "expected_output": "summary", "validation_criteria": ["cites trades"]}
        }))
        .unwrap();
        assert_eq!(nested.task.validation_criteria, vec!["cites trades"]);

        let flat = parse_decision(&json!({
            "next_action": "FinancialMetricsAgent",
            "task_description": "P/E for AAPL",
            "expected_output": "ratio",
            "validation_criteria": "numeric"
        }))
        .unwrap();
        assert_eq!(flat.next_action, NextAction::FinancialMetrics);
        assert_eq!(flat.task.description, "P/E for AAPL");
        assert_eq!(flat.task.validation_criteria, vec!["numeric"]);
    }

    #[test]
    fn unknown_action_is_malformed() {
        let err = parse_decision(&json!({"next_action": "Oracle"})).unwrap_err();
        assert!(matches!(err, ClassifyError::Malformed { .. }));
    }
}
