//! Retry gate
//!
//! `Run → EvalTools → EvalAdherence → {Run, Done}` for one analysis agent.
//! Tool coverage is checked before adherence. Every path out of an
//! evaluation state is bounded by `limit`, and `Run` is never entered once the
//! agent has already run `limit` times, so a dispatch costs at most `limit`
//! cell invocations.

use crate::execution::ExecutionCell;
use crate::models::AgentKind;
use crate::observer::RunObserver;
use crate::state::ConversationState;
use crate::verification::{self, TopicAdherenceEvaluator};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    Run,
    EvalTools,
    EvalAdherence,
    Done,
}

/// Summary of one gate pass.
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub agent: AgentKind,
    pub runs: usize,
    pub tool_evaluations: usize,
    pub adherence_evaluations: usize,
    pub all_tools_used: bool,
    pub adherence_passed: bool,
    pub final_answer: String,
}

pub struct RetryGate {
    cell: ExecutionCell,
    adherence: Arc<TopicAdherenceEvaluator>,
    limit: usize,
}

impl RetryGate {
    pub fn new(cell: ExecutionCell, adherence: Arc<TopicAdherenceEvaluator>, limit: usize) -> Self {
        Self {
            cell,
            adherence,
            limit: limit.max(1),
        }
    }

    pub fn agent(&self) -> AgentKind {
        self.cell.agent()
    }

    pub async fn run(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> GateOutcome {
        let agent = self.cell.agent();
        let run_id = state.run_id;
        let mut current = GateState::Run;

        while current != GateState::Done {
            debug!(%run_id, %agent, state = ?current, "Retry gate");

            current = match current {
                GateState::Run => {
                    // Counted before invoking so a failed invocation still uses up an attempt.
                    let attempt = {
                        let internal = state.agent_state_mut(agent);
                        internal.runs += 1;
                        internal.runs
                    };
                    observer.on_agent_start(run_id, agent, attempt);
                    self.cell.invoke(state, observer).await;
                    GateState::EvalTools
                }

                GateState::EvalTools => {
                    let internal = state.agent_state_mut(agent);
                    let trace = internal.last_trace.clone().unwrap_or_default();
                    let result = verification::evaluate(&trace, &internal.available_tools);
                    let all_used = result.all_tools_used();

                    observer.on_tool_eval(run_id, agent, &result);
                    internal.tool_eval_history.push(result);

                    if all_used
                        || internal.tool_evaluations() >= self.limit
                        || internal.runs >= self.limit
                    {
                        GateState::EvalAdherence
                    } else {
                        GateState::Run
                    }
                }

                GateState::EvalAdherence => {
                    let answer = state
                        .agent_state(agent)
                        .and_then(|s| s.last_trace.as_ref())
                        .map(|t| t.final_answer.clone())
                        .unwrap_or_default();
                    let result = self.adherence.evaluate(agent, &state.question, &answer).await;
                    let passed = result.passed;

                    observer.on_adherence_eval(run_id, agent, &result);
                    let internal = state.agent_state_mut(agent);
                    internal.adherence_eval_history.push(result);

                    if passed
                        || internal.adherence_evaluations() >= self.limit
                        || internal.runs >= self.limit
                    {
                        GateState::Done
                    } else {
                        GateState::Run
                    }
                }

                GateState::Done => GateState::Done,
            };
        }

        let internal = state.agent_state_mut(agent);
        let outcome = GateOutcome {
            agent,
            runs: internal.runs,
            tool_evaluations: internal.tool_evaluations(),
            adherence_evaluations: internal.adherence_evaluations(),
            all_tools_used: internal
                .last_tool_eval()
                .map(|r| r.all_tools_used())
                .unwrap_or(false),
            adherence_passed: internal
                .last_adherence_eval()
                .map(|r| r.passed)
                .unwrap_or(false),
            final_answer: internal
                .last_trace
                .as_ref()
                .map(|t| t.final_answer.clone())
                .unwrap_or_default(),
        };

        info!(
            %run_id,
            %agent,
            runs = outcome.runs,
            all_tools_used = outcome.all_tools_used,
            adherence_passed = outcome.adherence_passed,
            "Retry gate finished"
        );

        outcome
    }
}
