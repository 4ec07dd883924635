//! Main orchestrator
//!
//! SUPERVISOR → AGENT → SUPERVISOR → … → SYNTHESIZER → END
//!
//! Analysis agents run inside their retry gate, the historical agent runs its
//! own workflow, and every node execution counts against the step ceiling.
//! Exceeding the ceiling is the only error a run returns.

use crate::audit::{compute_context_hash, RunLog};
use crate::classifier::StructuredClassifier;
use crate::config::{OrchestratorConfig, Settings};
use crate::error::OrchestrationError;
use crate::execution::{AgentRunner, ExecutionCell, ToolCallingRunner};
use crate::gate::{GateOutcome, RetryGate};
use crate::gemini::GeminiClient;
use crate::historical::{HistoricalWorkflow, QueryExecutor, SchemaResolver, SqliteHistoricalStore};
use crate::mock;
use crate::models::{AgentKind, InvestmentProfile, Message, NextAction};
use crate::observer::RunObserver;
use crate::planner::{KeywordRouter, LlmRouter, Router, Supervisor};
use crate::state::ConversationState;
use crate::synthesis::Synthesizer;
use crate::team;
use crate::tools::{create_http_registry, ToolRegistry};
use crate::verification::TopicAdherenceEvaluator;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

const TOOL_HTTP_TIMEOUT_SECS: u64 = 30;

/// External collaborators the orchestrator is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn StructuredClassifier>,
    pub runner: Arc<dyn AgentRunner>,
    /// Every tool of the team; each analyst gets its own subset.
    pub tools: Arc<ToolRegistry>,
    pub executor: Arc<dyn QueryExecutor>,
    pub schema: Arc<dyn SchemaResolver>,
    pub router: Arc<dyn Router>,
}

impl Collaborators {
    /// Deterministic collaborators; no network, no database.
    pub fn offline() -> Self {
        let db = Arc::new(mock::ScriptedDatabase::demo());
        Self {
            classifier: Arc::new(mock::DemoClassifier),
            runner: Arc::new(mock::SweepRunner),
            tools: Arc::new(mock::demo_registry()),
            executor: db.clone(),
            schema: db,
            router: Arc::new(KeywordRouter),
        }
    }

    /// Gemini-backed collaborators when a key is configured, offline ones otherwise.
    /// Missing tool service or database fall back to their offline stand-ins.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut collaborators = Self::offline();

        match &settings.gemini_api_key {
            Some(key) => {
                let classifier: Arc<dyn StructuredClassifier> =
                    Arc::new(GeminiClient::new(key.clone(), settings.gemini_model.clone())?);
                collaborators.runner = Arc::new(ToolCallingRunner::new(classifier.clone()));
                collaborators.router = Arc::new(LlmRouter::new(classifier.clone()));
                collaborators.classifier = classifier;
                info!(model = %settings.gemini_model, "Classifier backend: gemini");
            }
            None => warn!("GEMINI_API_KEY not set, running with offline collaborators"),
        }

        match &settings.financial_api_base_url {
            Some(url) => {
                collaborators.tools = Arc::new(create_http_registry(
                    url,
                    Duration::from_secs(TOOL_HTTP_TIMEOUT_SECS),
                )?);
                info!(url = %url, "Tool backend: financial API");
            }
            None => warn!("FINANCIAL_API_BASE_URL not set, tools return demo payloads"),
        }

        match &settings.historical_db_url {
            Some(url) => {
                let store = Arc::new(SqliteHistoricalStore::connect(url)?);
                collaborators.executor = store.clone();
                collaborators.schema = store;
            }
            None => warn!("HISTORICAL_DB_URL not set, historical data is a demo table"),
        }

        Ok(collaborators)
    }
}

/// What the historical workflow did in a run.
#[derive(Debug, Clone, Serialize)]
pub struct HistoricalSummary {
    pub date_available: bool,
    pub tables: Vec<String>,
    pub executed_queries: usize,
    pub query_errors: usize,
    pub format_errors: usize,
    pub last_query: Option<String>,
}

/// Result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub question: String,
    pub profile: InvestmentProfile,
    pub analysis_time: DateTime<Utc>,
    pub answer: String,
    pub steps: usize,
    pub dispatched: Vec<AgentKind>,
    pub agents: Vec<GateOutcome>,
    pub historical: Option<HistoricalSummary>,
    pub reasoning_trace: Vec<String>,
    pub context_hash: String,
    pub elapsed_ms: u64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Supervisor,
    Agent(AgentKind),
    Synthesizer,
    DirectReply,
}

impl Node {
    fn name(&self) -> &'static str {
        match self {
            Node::Supervisor => "supervisor",
            Node::Agent(kind) => kind.name(),
            Node::Synthesizer => "synthesizer",
            Node::DirectReply => "direct_reply",
        }
    }
}

/// Main orchestrator that coordinates the entire workflow
pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: Supervisor,
    gates: BTreeMap<AgentKind, RetryGate>,
    historical: HistoricalWorkflow,
    synthesizer: Synthesizer,
    run_log: RunLog,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let adherence = Arc::new(TopicAdherenceEvaluator::new(
            collaborators.classifier.clone(),
            config.classifier_timeout,
        ));

        let gates = team::ANALYSTS
            .iter()
            .map(|member| {
                let tools = collaborators
                    .tools
                    .subset(member.tools.iter().map(|(name, _)| *name));
                let cell = ExecutionCell::new(
                    member.kind,
                    Arc::new(tools),
                    collaborators.runner.clone(),
                    config.agent_max_iterations,
                    config.agent_time_budget,
                );
                (
                    member.kind,
                    RetryGate::new(cell, adherence.clone(), config.retry_limit),
                )
            })
            .collect();

        Ok(Self {
            supervisor: Supervisor::new(collaborators.router, config.classifier_timeout),
            gates,
            historical: HistoricalWorkflow::new(
                collaborators.classifier.clone(),
                collaborators.executor,
                collaborators.schema,
                &config,
            ),
            synthesizer: Synthesizer::new(collaborators.classifier, config.classifier_timeout),
            run_log: RunLog::with_capacity(config.run_log_capacity),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Run one question to completion.
    pub async fn run(
        &self,
        question: &str,
        profile: InvestmentProfile,
        observer: &dyn RunObserver,
    ) -> Result<RunReport> {
        if question.trim().is_empty() {
            return Err(OrchestrationError::RoutingError(
                "question must not be empty".to_string(),
            ));
        }

        let state = ConversationState::new(question.trim(), profile, Utc::now());
        self.run_state(state, observer).await
    }

    /// Run from a prepared state.
    pub async fn run_state(
        &self,
        mut state: ConversationState,
        observer: &dyn RunObserver,
    ) -> Result<RunReport> {
        let start_time = Instant::now();
        let run_id = state.run_id;
        let mut reasoning_trace = vec!["INPUT: Question received".to_string()];
        let mut outcomes: Vec<GateOutcome> = Vec::new();
        let mut node = Node::Supervisor;

        info!(
            %run_id,
            question = %state.question,
            risk = %state.profile.risk_tolerance,
            "Orchestrator: starting run"
        );

        let answer = loop {
            state.steps += 1;
            if state.steps > self.config.max_steps {
                warn!(%run_id, limit = self.config.max_steps, "Step ceiling exceeded");
                observer.on_error(run_id, node.name(), "step ceiling exceeded");
                return Err(OrchestrationError::StepLimitExceeded {
                    limit: self.config.max_steps,
                    reached: state.steps,
                    partial: Box::new(state),
                });
            }
            observer.on_step(run_id, state.steps, node.name());

            node = match node {
                Node::Supervisor => {
                    let decision = self.supervisor.decide(&mut state, observer).await;
                    reasoning_trace.push(format!("ROUTE: {}", decision.next_action));

                    match decision.next_action {
                        NextAction::Synthesizer => Node::Synthesizer,
                        NextAction::Finish => Node::DirectReply,
                        other => match other.agent() {
                            Some(agent) => Node::Agent(agent),
                            None => Node::DirectReply,
                        },
                    }
                }

                Node::Agent(AgentKind::HistoricalData) => {
                    self.historical.run(&mut state, observer).await;
                    reasoning_trace.push(format!(
                        "HISTORICAL: {} queries executed, {} query errors, {} format errors",
                        state.historical.executed_queries,
                        state.historical.wrong_generated_queries.len(),
                        state.historical.wrong_formatted_results.len()
                    ));
                    Node::Supervisor
                }

                Node::Agent(agent) => {
                    match self.gates.get(&agent) {
                        Some(gate) => {
                            let outcome = gate.run(&mut state, observer).await;
                            reasoning_trace.push(format!(
                                "AGENT: {} - {} run(s), all tools used: {}, on topic: {}",
                                agent, outcome.runs, outcome.all_tools_used, outcome.adherence_passed
                            ));
                            outcomes.push(outcome);
                        }
                        None => {
                            warn!(%run_id, %agent, "No retry gate configured for agent");
                            observer.on_error(run_id, agent.name(), "agent not configured");
                            state.push_message(Message::agent(
                                agent,
                                format!("{} is not available in this deployment.", agent),
                            ));
                        }
                    }
                    Node::Supervisor
                }

                Node::Synthesizer => {
                    reasoning_trace.push("SYNTHESIZE: Combining agent outputs".to_string());
                    break self.synthesizer.synthesize(&mut state, observer).await;
                }

                Node::DirectReply => {
                    reasoning_trace.push("REPLY: Non-analytical message".to_string());
                    break self.synthesizer.direct_reply(&mut state, observer).await;
                }
            };
        };

        reasoning_trace.push("COMPLETE".to_string());

        let historical = state
            .is_dispatched(AgentKind::HistoricalData)
            .then(|| HistoricalSummary {
                date_available: state.historical.date_available,
                tables: state.historical.relevant_tables.tables.clone(),
                executed_queries: state.historical.executed_queries,
                query_errors: state.historical.wrong_generated_queries.len(),
                format_errors: state.historical.wrong_formatted_results.len(),
                last_query: state.historical.current_query.clone(),
            });

        let report = RunReport {
            run_id,
            context_hash: compute_context_hash(&state.question, &state.profile, &state.analysis_time),
            question: state.question,
            profile: state.profile,
            analysis_time: state.analysis_time,
            answer,
            steps: state.steps,
            dispatched: state.dispatched.iter().copied().collect(),
            agents: outcomes,
            historical,
            reasoning_trace,
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            messages: state.messages,
        };

        info!(
            %run_id,
            steps = report.steps,
            agents = report.dispatched.len(),
            elapsed_ms = report.elapsed_ms,
            "Orchestrator: run complete"
        );

        self.run_log.record(report.clone()).await;
        Ok(report)
    }
}

#[cfg(test)]
impl RunReport {
    pub(crate) fn for_test(question: &str) -> Self {
        let profile = InvestmentProfile::default();
        let analysis_time = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            question: question.to_string(),
            context_hash: compute_context_hash(question, &profile, &analysis_time),
            profile,
            analysis_time,
            answer: String::new(),
            steps: 0,
            dispatched: Vec::new(),
            agents: Vec::new(),
            historical: None,
            reasoning_trace: Vec::new(),
            elapsed_ms: 0,
            messages: Vec::new(),
        }
    }
}
