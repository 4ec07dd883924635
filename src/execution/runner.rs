//! Tool-calling runner over a structured classifier
//!
//! Each iteration asks the model for one step: a batch of tool calls or the
//! final answer. Every call of a batch runs within the same iteration. Once
//! the iterations are used up the model gets one closing call that may only
//! answer. Tool failures, unknown tools and unparseable steps are all recorded
//! in the trace; nothing is returned as an error.

use super::{AgentRequest, AgentRun, AgentRunner, RUNNER_TOOL};
use crate::classifier::{agent_step_schema, ClassifyError, OutputSchema, StructuredClassifier};
use crate::models::{render_transcript, TraceEntry, PARSER_ERROR_TOOL};
use crate::prompts;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const STOPPED_ANSWER: &str = "Agent stopped due to iteration limit or time limit.";

/// Observations are clipped before they go back into the prompt.
const MAX_OBSERVATION_CHARS: usize = 4_000;

pub struct ToolCallingRunner {
    classifier: Arc<dyn StructuredClassifier>,
}

impl ToolCallingRunner {
    pub fn new(classifier: Arc<dyn StructuredClassifier>) -> Self {
        Self { classifier }
    }

    /// One model call bounded by the remaining budget. `Err` carries the
    /// runner entry that ends the loop.
    async fn ask(
        &self,
        prompt: &str,
        schema: &OutputSchema,
        deadline: Instant,
        iteration: u32,
        request: &AgentRequest<'_>,
    ) -> Result<Step, TraceEntry> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.classifier.classify(prompt, schema)).await {
            Err(_) => Err(TraceEntry::new(
                RUNNER_TOOL,
                json!({ "iteration": iteration }),
                json!({ "error": "time budget exhausted while waiting for the model" }),
            )),
            Ok(Err(ClassifyError::Malformed { detail, .. })) => Ok(Step::Unparseable(detail)),
            Ok(Err(e)) => {
                warn!(agent = %request.agent, error = %e, "Agent model call failed");
                Err(TraceEntry::new(
                    RUNNER_TOOL,
                    json!({ "iteration": iteration }),
                    json!({ "error": e.to_string() }),
                ))
            }
            Ok(Ok(value)) => Ok(parse_step(&value)),
        }
    }
}

struct ToolCall {
    tool: String,
    input: Value,
}

enum Step {
    Final(String),
    Calls(Vec<ToolCall>),
    Unparseable(String),
}

fn parse_call(value: &Value) -> Option<ToolCall> {
    let tool = value.get("tool").and_then(Value::as_str).map(str::trim)?;
    if tool.is_empty() {
        return None;
    }
    Some(ToolCall {
        tool: tool.to_string(),
        input: value.get("input").cloned().unwrap_or_else(|| json!({})),
    })
}

fn parse_step(value: &Value) -> Step {
    let action = value.get("action").and_then(Value::as_str).unwrap_or_default();

    match action {
        "final" => match value.get("answer").and_then(Value::as_str) {
            Some(answer) if !answer.trim().is_empty() => Step::Final(answer.to_string()),
            _ => Step::Unparseable("final step without an answer".to_string()),
        },
        "tools" | "tool" => {
            // A lone {"tool", "input"} step is accepted as a batch of one.
            let calls: Vec<ToolCall> = match value.get("tool_calls").and_then(Value::as_array) {
                Some(items) => items.iter().filter_map(parse_call).collect(),
                None => parse_call(value).into_iter().collect(),
            };
            if calls.is_empty() {
                Step::Unparseable("tool step without a tool name".to_string())
            } else {
                Step::Calls(calls)
            }
        }
        other => Step::Unparseable(format!("unknown action '{}'", other)),
    }
}

fn clip(value: &Value) -> String {
    let text = value.to_string();
    if text.len() <= MAX_OBSERVATION_CHARS {
        return text;
    }
    let mut end = MAX_OBSERVATION_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

async fn call_tool(tools: &ToolRegistry, call: &ToolCall, available: &[String], deadline: Instant) -> Value {
    match tools.get(&call.tool) {
        None => json!({
            "requested_tool_name": call.tool,
            "available_tool_names": available,
        }),
        Some(handle) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle.execute(&call.input)).await {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => json!({ "error": e.to_string() }),
                Err(_) => json!({ "error": "tool call exceeded the time budget" }),
            }
        }
    }
}

fn record_unparseable(detail: String, scratchpad: &mut String, entries: &mut Vec<TraceEntry>) {
    scratchpad.push_str(&format!(
        "Invalid step ({}). Respond with the JSON step format.\n",
        detail
    ));
    entries.push(TraceEntry::new(
        PARSER_ERROR_TOOL,
        json!(detail),
        json!("Invalid Format: respond with tool calls or a final answer"),
    ));
}

#[async_trait]
impl AgentRunner for ToolCallingRunner {
    async fn run(&self, request: AgentRequest<'_>) -> AgentRun {
        let deadline = Instant::now() + request.time_budget;
        let schema = agent_step_schema();
        let tool_list = request.tools.describe();
        let available: Vec<String> = request.tools.names().into_iter().collect();
        let system = format!(
            "{}\n\nCONVERSATION SO FAR:\n{}",
            request.system_prompt,
            render_transcript(request.messages, 1_500)
        );

        let mut entries: Vec<TraceEntry> = Vec::new();
        let mut scratchpad = String::new();

        for iteration in 0..request.max_iterations {
            if deadline.saturating_duration_since(Instant::now()).is_zero() {
                return stopped(entries);
            }

            let prompt = prompts::agent_step(
                &system,
                &scratchpad,
                &tool_list,
                request.max_iterations - iteration,
            );

            let step = match self.ask(&prompt, &schema, deadline, iteration, &request).await {
                Ok(step) => step,
                Err(entry) => {
                    entries.push(entry);
                    return stopped(entries);
                }
            };

            match step {
                Step::Final(answer) => {
                    debug!(agent = %request.agent, iteration, "Agent produced final answer");
                    return AgentRun {
                        final_text: answer,
                        entries,
                    };
                }
                Step::Unparseable(detail) => record_unparseable(detail, &mut scratchpad, &mut entries),
                Step::Calls(calls) => {
                    debug!(agent = %request.agent, iteration, calls = calls.len(), "Tool batch requested");
                    for call in calls {
                        let output = call_tool(request.tools, &call, &available, deadline).await;
                        scratchpad.push_str(&format!(
                            "Action: {}\nInput: {}\nObservation: {}\n",
                            call.tool,
                            call.input,
                            clip(&output)
                        ));
                        entries.push(TraceEntry::new(call.tool, call.input, output));
                    }
                }
            }
        }

        if deadline.saturating_duration_since(Instant::now()).is_zero() {
            return stopped(entries);
        }

        let prompt = prompts::agent_final(&system, &scratchpad);
        match self
            .ask(&prompt, &schema, deadline, request.max_iterations, &request)
            .await
        {
            Ok(Step::Final(answer)) => {
                debug!(agent = %request.agent, "Agent answered after its last tool iteration");
                AgentRun {
                    final_text: answer,
                    entries,
                }
            }
            Ok(Step::Calls(_)) => {
                debug!(agent = %request.agent, "Tool calls after the iteration limit ignored");
                stopped(entries)
            }
            Ok(Step::Unparseable(detail)) => {
                record_unparseable(detail, &mut scratchpad, &mut entries);
                stopped(entries)
            }
            Err(entry) => {
                entries.push(entry);
                stopped(entries)
            }
        }
    }
}

fn stopped(entries: Vec<TraceEntry>) -> AgentRun {
    AgentRun {
        final_text: STOPPED_ANSWER.to_string(),
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedClassifier, StaticTool};
    use crate::models::{AgentKind, ExecutionTrace, ToolStatus};
    use crate::team;
    use crate::verification::evaluate;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticTool::new("get_stock_price", json!({"price": 187.2}))));
        registry.register(Arc::new(StaticTool::failing("get_cash_flow", "upstream 500")));
        registry
    }

    fn request<'a>(tools: &'a ToolRegistry, max_iterations: u32) -> AgentRequest<'a> {
        AgentRequest {
            agent: AgentKind::FinancialMetrics,
            messages: &[],
            tools,
            system_prompt: "system".into(),
            max_iterations,
            time_budget: Duration::from_secs(5),
        }
    }

    fn calls(names: &[&str]) -> Value {
        let items: Vec<Value> = names
            .iter()
            .map(|name| json!({"tool": name, "input": {"symbol": "AAPL"}}))
            .collect();
        json!({"action": "tools", "tool_calls": items})
    }

    #[tokio::test]
    async fn records_every_outcome_kind() {
        let classifier = ScriptedClassifier::new()
            .respond("agent_step", calls(&["get_stock_price", "get_cash_flow"]))
            .respond("agent_step", json!({"action": "tool", "tool": "get_weather"}))
            .respond("agent_step", json!({"action": "dance"}))
            .respond("agent_step", json!({"action": "final", "answer": "AAPL trades at 187.2"}));
        let runner = ToolCallingRunner::new(Arc::new(classifier));
        let tools = registry();

        let run = runner.run(request(&tools, 5)).await;

        assert_eq!(run.final_text, "AAPL trades at 187.2");
        let statuses: Vec<ToolStatus> = run.entries.iter().map(|e| e.status()).collect();
        assert_eq!(
            statuses,
            vec![
                ToolStatus::Success,
                ToolStatus::ExecutionError,
                ToolStatus::InvalidTool,
                ToolStatus::ParserError,
            ]
        );
        assert_eq!(run.entries[2].output["requested_tool_name"], "get_weather");
    }

    #[tokio::test]
    async fn whole_tool_set_is_covered_within_two_iterations() {
        let names: Vec<&str> = team::FINANCIAL_METRICS.tools.iter().map(|(name, _)| *name).collect();
        let mut tools = ToolRegistry::new();
        for name in &names {
            tools.register(Arc::new(StaticTool::new(*name, json!({"value": 1}))));
        }
        let classifier = ScriptedClassifier::new()
            .respond("agent_step", calls(&names))
            .respond("agent_step", json!({"action": "final", "answer": "P/E is 29"}));
        let runner = ToolCallingRunner::new(Arc::new(classifier));

        let run = runner.run(request(&tools, 2)).await;

        assert_eq!(run.final_text, "P/E is 29");
        assert_eq!(run.entries.len(), names.len());
        let trace = ExecutionTrace {
            entries: run.entries,
            final_answer: run.final_text,
        };
        assert!(evaluate(&trace, &tools.names()).all_tools_used());
    }

    #[tokio::test]
    async fn closing_call_returns_the_answer_after_the_last_iteration() {
        let classifier = ScriptedClassifier::new()
            .respond("agent_step", json!({"action": "tool", "tool": "get_stock_price"}))
            .respond("agent_step", json!({"action": "tool", "tool": "get_cash_flow"}))
            .respond("agent_step", json!({"action": "final", "answer": "P/E is 29"}));
        let runner = ToolCallingRunner::new(Arc::new(classifier));
        let tools = registry();

        let run = runner.run(request(&tools, 2)).await;

        assert_eq!(run.final_text, "P/E is 29");
        assert_eq!(run.entries.len(), 2);
    }

    #[tokio::test]
    async fn tool_calls_after_the_limit_are_not_run() {
        let classifier = ScriptedClassifier::new()
            .respond("agent_step", json!({"action": "tool", "tool": "get_stock_price"}))
            .respond("agent_step", json!({"action": "tool", "tool": "get_stock_price"}))
            .respond("agent_step", json!({"action": "tool", "tool": "get_stock_price"}));
        let runner = ToolCallingRunner::new(Arc::new(classifier));
        let tools = registry();

        let run = runner.run(request(&tools, 2)).await;

        assert_eq!(run.final_text, STOPPED_ANSWER);
        assert_eq!(run.entries.len(), 2);
    }

    #[tokio::test]
    async fn backend_failure_is_the_last_entry() {
        let classifier = ScriptedClassifier::new()
            .respond("agent_step", json!({"action": "tool", "tool": "get_stock_price"}))
            .fail("agent_step", ClassifyError::Unavailable("quota".into()));
        let runner = ToolCallingRunner::new(Arc::new(classifier));
        let tools = registry();

        let run = runner.run(request(&tools, 2)).await;

        assert_eq!(run.final_text, STOPPED_ANSWER);
        let last = run.entries.last().unwrap();
        assert_eq!(last.tool_name, RUNNER_TOOL);
        assert_eq!(last.status(), ToolStatus::ExecutionError);
    }
}
