//! Run observation capability
//!
//! Passed explicitly to every component call. Never stored in run state.

use crate::models::{AdherenceEvalResult, AgentKind, RoutingDecision, ToolEvalResult};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub trait RunObserver: Send + Sync {
    fn on_step(&self, _run_id: Uuid, _step: usize, _node: &str) {}
    fn on_route(&self, _run_id: Uuid, _decision: &RoutingDecision) {}
    fn on_agent_start(&self, _run_id: Uuid, _agent: AgentKind, _attempt: usize) {}
    fn on_agent_end(&self, _run_id: Uuid, _agent: AgentKind, _answer: &str) {}
    fn on_tool_eval(&self, _run_id: Uuid, _agent: AgentKind, _result: &ToolEvalResult) {}
    fn on_adherence_eval(&self, _run_id: Uuid, _agent: AgentKind, _result: &AdherenceEvalResult) {}
    fn on_stage(&self, _run_id: Uuid, _stage: &str) {}
    fn on_error(&self, _run_id: Uuid, _node: &str, _error: &str) {}
    fn on_final(&self, _run_id: Uuid, _answer: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Emits every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_step(&self, run_id: Uuid, step: usize, node: &str) {
        debug!(%run_id, step, node, "Transition");
    }

    fn on_route(&self, run_id: Uuid, decision: &RoutingDecision) {
        info!(
            %run_id,
            next_action = %decision.next_action,
            task = %decision.task.description,
            "Supervisor routed"
        );
    }

    fn on_agent_start(&self, run_id: Uuid, agent: AgentKind, attempt: usize) {
        info!(%run_id, %agent, attempt, "Agent started");
    }

    fn on_agent_end(&self, run_id: Uuid, agent: AgentKind, answer: &str) {
        debug!(%run_id, %agent, answer_len = answer.len(), "Agent finished");
    }

    fn on_tool_eval(&self, run_id: Uuid, agent: AgentKind, result: &ToolEvalResult) {
        info!(
            %run_id,
            %agent,
            all_tools_used = result.all_tools_used(),
            used = result.used.len(),
            unused = ?result.unused,
            errors = result.errors.total(),
            "Tool coverage evaluated"
        );
    }

    fn on_adherence_eval(&self, run_id: Uuid, agent: AgentKind, result: &AdherenceEvalResult) {
        info!(%run_id, %agent, passed = result.passed, reason = %result.reason, "Topic adherence evaluated");
    }

    fn on_stage(&self, run_id: Uuid, stage: &str) {
        debug!(%run_id, stage, "Historical stage");
    }

    fn on_error(&self, run_id: Uuid, node: &str, error: &str) {
        warn!(%run_id, node, error, "Recovered error");
    }

    fn on_final(&self, run_id: Uuid, answer: &str) {
        info!(%run_id, answer_len = answer.len(), "Run complete");
    }
}

/// Collects events as strings. Used by tests and the CLI summary.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn push(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl RunObserver for RecordingObserver {
    fn on_step(&self, _run_id: Uuid, step: usize, node: &str) {
        self.push(format!("step:{}:{}", step, node));
    }

    fn on_route(&self, _run_id: Uuid, decision: &RoutingDecision) {
        self.push(format!("route:{}", decision.next_action));
    }

    fn on_agent_start(&self, _run_id: Uuid, agent: AgentKind, attempt: usize) {
        self.push(format!("agent_start:{}:{}", agent, attempt));
    }

    fn on_tool_eval(&self, _run_id: Uuid, agent: AgentKind, result: &ToolEvalResult) {
        self.push(format!("tool_eval:{}:{}", agent, result.all_tools_used()));
    }

    fn on_adherence_eval(&self, _run_id: Uuid, agent: AgentKind, result: &AdherenceEvalResult) {
        self.push(format!("adherence:{}:{}", agent, result.passed));
    }

    fn on_stage(&self, _run_id: Uuid, stage: &str) {
        self.push(format!("stage:{}", stage));
    }

    fn on_error(&self, _run_id: Uuid, node: &str, error: &str) {
        self.push(format!("error:{}:{}", node, error));
    }

    fn on_final(&self, _run_id: Uuid, _answer: &str) {
        self.push("final".to_string());
    }
}
