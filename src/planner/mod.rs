//! Supervisor router
//!
//! A `Router` proposes the next action; the `Supervisor` enforces the routing
//! invariants on top of whatever the router proposed:
//! - an agent is dispatched at most once per run
//! - FINISH after agents produced output becomes Synthesizer
//! - Synthesizer with nothing to synthesize becomes FINISH
//!
//! Router failures (timeout, malformed output) fall back to keyword routing.

use crate::models::{AgentKind, InvestmentProfile, Message, NextAction, RoutingDecision};
use crate::observer::RunObserver;
use crate::state::ConversationState;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod intent;
pub mod llm;

pub use intent::{KeywordRouter, QueryIntent};
pub use llm::LlmRouter;

/// Read-only view of the run handed to a router.
pub struct RoutingContext<'a> {
    pub question: &'a str,
    pub messages: &'a [Message],
    pub profile: &'a InvestmentProfile,
    pub analysis_time: &'a DateTime<Utc>,
    pub dispatched: &'a BTreeSet<AgentKind>,
}

impl<'a> RoutingContext<'a> {
    pub fn from_state(state: &'a ConversationState) -> Self {
        Self {
            question: &state.question,
            messages: &state.messages,
            profile: &state.profile,
            analysis_time: &state.analysis_time,
            dispatched: &state.dispatched,
        }
    }
}

/// Trait for routing decisions (LLM controlled)
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, ctx: &RoutingContext<'_>) -> Result<RoutingDecision>;
}

pub struct Supervisor {
    router: Arc<dyn Router>,
    fallback: KeywordRouter,
    timeout: Duration,
}

impl Supervisor {
    pub fn new(router: Arc<dyn Router>, timeout: Duration) -> Self {
        Self {
            router,
            fallback: KeywordRouter,
            timeout,
        }
    }

    /// Produce exactly one routing decision and record it in the state.
    pub async fn decide(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> RoutingDecision {
        let run_id = state.run_id;

        if state.messages.is_empty() {
            let question = state.question.clone();
            state.push_message(Message::user(question));
        }

        let proposed = {
            let ctx = RoutingContext::from_state(state);
            match tokio::time::timeout(self.timeout, self.router.route(&ctx)).await {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => {
                    warn!(%run_id, error = %e, "Router failed, using keyword routing");
                    observer.on_error(run_id, "supervisor", &e.to_string());
                    self.fallback.decide(&ctx)
                }
                Err(_) => {
                    warn!(%run_id, timeout_secs = self.timeout.as_secs(), "Router timed out, using keyword routing");
                    observer.on_error(run_id, "supervisor", "router timed out");
                    self.fallback.decide(&ctx)
                }
            }
        };

        let decision = self.enforce(state, proposed);

        if let Some(agent) = decision.next_action.agent() {
            state.mark_dispatched(agent);
        }
        state.current_task = Some(decision.task.clone());
        state.next_step = Some(decision.next_action);

        info!(%run_id, next = %decision.next_action, "Supervisor routed");
        observer.on_route(run_id, &decision);

        decision
    }

    fn enforce(&self, state: &ConversationState, proposed: RoutingDecision) -> RoutingDecision {
        let has_output = state.has_agent_output();

        match proposed.next_action {
            NextAction::Finish if has_output => RoutingDecision {
                next_action: NextAction::Synthesizer,
                task: proposed.task,
            },
            NextAction::Synthesizer if !has_output => RoutingDecision {
                next_action: NextAction::Finish,
                task: proposed.task,
            },
            action => match action.agent() {
                Some(agent) if state.is_dispatched(agent) => {
                    let redirected = self.fallback.decide(&RoutingContext::from_state(state));
                    warn!(
                        run_id = %state.run_id,
                        %agent,
                        redirected = %redirected.next_action,
                        "Agent already dispatched, redirecting"
                    );
                    self.enforce(state, redirected)
                }
                _ => proposed,
            },
        }
    }
}
