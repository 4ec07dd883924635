//! Agent execution cell
//!
//! Runs one analysis agent through a bounded tool-calling loop and records
//! what it did. The cell never fails: every problem ends up as a trace entry
//! so the retry gate always has data to evaluate.

use crate::models::{AgentKind, ExecutionTrace, Message, TraceEntry};
use crate::observer::RunObserver;
use crate::prompts;
use crate::state::ConversationState;
use crate::tools::ToolRegistry;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub mod runner;
pub use runner::ToolCallingRunner;

/// Tool name recorded when the runner itself failed or ran out of time.
pub const RUNNER_TOOL: &str = "agent_runner";

pub struct AgentRequest<'a> {
    pub agent: AgentKind,
    pub messages: &'a [Message],
    pub tools: &'a ToolRegistry,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub time_budget: Duration,
}

/// What a runner hands back: final text plus the ordered tool entries.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub final_text: String,
    pub entries: Vec<TraceEntry>,
}

/// Tool-calling agent runner. Must never fail; internal failures are encoded
/// as the last trace entry.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest<'_>) -> AgentRun;
}

pub struct ExecutionCell {
    agent: AgentKind,
    tools: Arc<ToolRegistry>,
    runner: Arc<dyn AgentRunner>,
    max_iterations: u32,
    time_budget: Duration,
}

impl ExecutionCell {
    pub fn new(
        agent: AgentKind,
        tools: Arc<ToolRegistry>,
        runner: Arc<dyn AgentRunner>,
        max_iterations: u32,
        time_budget: Duration,
    ) -> Self {
        Self {
            agent,
            tools,
            runner,
            max_iterations,
            time_budget,
        }
    }

    pub fn agent(&self) -> AgentKind {
        self.agent
    }

    /// Invoke the agent once. Appends the agent's message to the conversation
    /// and stores the trace as the agent's latest.
    pub async fn invoke(
        &self,
        state: &mut ConversationState,
        observer: &dyn RunObserver,
    ) -> ExecutionTrace {
        let start = Instant::now();
        let task = state.task();
        let system_prompt = prompts::analysis_agent(
            self.agent,
            &state.profile,
            &state.analysis_time,
            &state.question,
            &task,
        );

        state.agent_state_mut(self.agent).available_tools = self.tools.names();

        let request = AgentRequest {
            agent: self.agent,
            messages: &state.messages,
            tools: &self.tools,
            system_prompt,
            max_iterations: self.max_iterations,
            time_budget: self.time_budget,
        };

        // The runner enforces the budget itself; this bound covers runners that don't.
        let run = match tokio::time::timeout(self.time_budget, self.runner.run(request)).await {
            Ok(run) => run,
            Err(_) => {
                warn!(
                    agent = %self.agent,
                    budget_secs = self.time_budget.as_secs(),
                    "Agent exceeded its time budget"
                );
                observer.on_error(state.run_id, self.agent.name(), "time budget exceeded");
                AgentRun {
                    final_text: format!(
                        "{} stopped: time budget of {}s exceeded.",
                        self.agent,
                        self.time_budget.as_secs()
                    ),
                    entries: vec![TraceEntry::new(
                        RUNNER_TOOL,
                        json!({}),
                        json!({ "error": "time budget exceeded" }),
                    )],
                }
            }
        };

        let trace = ExecutionTrace {
            entries: run.entries,
            final_answer: run.final_text,
        };

        debug!(
            agent = %self.agent,
            entries = trace.entries.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Agent invocation completed"
        );

        state.push_message(Message::agent(self.agent, trace.final_answer.clone()));
        state.agent_state_mut(self.agent).last_trace = Some(trace.clone());
        observer.on_agent_end(state.run_id, self.agent, &trace.final_answer);

        trace
    }
}
