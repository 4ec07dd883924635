//! Per-run state
//!
//! One `ConversationState` is created per run and owned by the orchestrator.
//! Components borrow it mutably, touch their own section and hand it back.
//! Nothing here outlives the run.

use crate::models::{
    AdherenceEvalResult, AgentKind, ExecutionTrace, FailedFormat, FailedQuery,
    InvestmentProfile, Message, NextAction, Producer, RelevantTables, TaskAssignment,
    ToolEvalResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Internal state of one gated analysis agent. Append-only during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInternalState {
    pub available_tools: BTreeSet<String>,
    pub last_trace: Option<ExecutionTrace>,
    pub tool_eval_history: Vec<ToolEvalResult>,
    pub adherence_eval_history: Vec<AdherenceEvalResult>,
    /// Incremented before every cell invocation.
    pub runs: usize,
}

impl AgentInternalState {
    pub fn tool_evaluations(&self) -> usize {
        self.tool_eval_history.len()
    }

    pub fn adherence_evaluations(&self) -> usize {
        self.adherence_eval_history.len()
    }

    pub fn last_tool_eval(&self) -> Option<&ToolEvalResult> {
        self.tool_eval_history.last()
    }

    pub fn last_adherence_eval(&self) -> Option<&AdherenceEvalResult> {
        self.adherence_eval_history.last()
    }
}

/// Internal state of the historical-data sub-workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalState {
    pub tools: Vec<String>,
    pub date_available: bool,
    pub relevant_tables: RelevantTables,
    pub schema: Option<String>,
    pub current_query: Option<String>,
    pub executed_queries: usize,
    pub wrong_generated_queries: Vec<FailedQuery>,
    pub wrong_formatted_results: Vec<FailedFormat>,
    pub answer: Option<String>,
}

/// The single mutable record threaded through a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub run_id: Uuid,
    pub messages: Vec<Message>,
    pub question: String,
    pub analysis_time: DateTime<Utc>,
    pub profile: InvestmentProfile,
    pub current_task: Option<TaskAssignment>,
    pub next_step: Option<NextAction>,
    /// Agents already dispatched in this run. An agent is never dispatched twice.
    pub dispatched: BTreeSet<AgentKind>,
    pub agents: BTreeMap<AgentKind, AgentInternalState>,
    pub historical: HistoricalState,
    pub steps: usize,
}

impl ConversationState {
    pub fn new(
        question: impl Into<String>,
        profile: InvestmentProfile,
        analysis_time: DateTime<Utc>,
    ) -> Self {
        let agents = AgentKind::ANALYSIS
            .iter()
            .map(|kind| (*kind, AgentInternalState::default()))
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            messages: Vec::new(),
            question: question.into(),
            analysis_time,
            profile,
            current_task: None,
            next_step: None,
            dispatched: BTreeSet::new(),
            agents,
            historical: HistoricalState::default(),
            steps: 0,
        }
    }

    pub fn agent_state(&self, kind: AgentKind) -> Option<&AgentInternalState> {
        self.agents.get(&kind)
    }

    pub fn agent_state_mut(&mut self, kind: AgentKind) -> &mut AgentInternalState {
        self.agents.entry(kind).or_default()
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn task(&self) -> TaskAssignment {
        self.current_task.clone().unwrap_or_default()
    }

    /// Latest output produced by an agent, if any.
    pub fn agent_output(&self, kind: AgentKind) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.produced_by(kind))
            .map(|m| m.content.as_str())
    }

    pub fn has_agent_output(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m.producer, Some(Producer::Agent(_))))
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.producer == Some(Producer::Synthesizer))
            .map(|m| m.content.as_str())
    }

    /// Marks an agent as dispatched. Returns false if it already was.
    pub fn mark_dispatched(&mut self, kind: AgentKind) -> bool {
        self.dispatched.insert(kind)
    }

    pub fn is_dispatched(&self, kind: AgentKind) -> bool {
        self.dispatched.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_has_empty_internal_records() {
        let state = ConversationState::new("Should I buy AAPL?", InvestmentProfile::default(), Utc::now());

        assert!(state.messages.is_empty());
        assert!(state.dispatched.is_empty());
        assert_eq!(state.agents.len(), 3);
        for kind in AgentKind::ANALYSIS {
            let agent = state.agent_state(kind).unwrap();
            assert_eq!(agent.runs, 0);
            assert!(agent.tool_eval_history.is_empty());
            assert!(agent.adherence_eval_history.is_empty());
        }
        assert!(state.agent_state(AgentKind::HistoricalData).is_none());
        assert!(state.historical.wrong_generated_queries.is_empty());
    }

    #[test]
    fn agent_output_uses_typed_producer() {
        let mut state = ConversationState::new("q", InvestmentProfile::default(), Utc::now());
        state.push_message(Message::user("q"));
        state.push_message(Message::agent(AgentKind::NewsSentiment, "first"));
        state.push_message(Message::agent(AgentKind::NewsSentiment, "second"));

        assert_eq!(state.agent_output(AgentKind::NewsSentiment), Some("second"));
        assert_eq!(state.agent_output(AgentKind::FinancialMetrics), None);
        assert!(state.has_agent_output());
    }

    #[test]
    fn dispatch_is_recorded_once() {
        let mut state = ConversationState::new("q", InvestmentProfile::default(), Utc::now());
        assert!(state.mark_dispatched(AgentKind::FinancialMetrics));
        assert!(!state.mark_dispatched(AgentKind::FinancialMetrics));
        assert!(state.is_dispatched(AgentKind::FinancialMetrics));
    }
}
