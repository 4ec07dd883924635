//! Historical-data sub-workflow
//!
//! classify → gate → fetch schema → generate query → validate → execute → format
//!
//! The gate is a hard stop: a date past the data cutoff or an empty table set
//! ends the workflow without running a query. Query failures loop back to
//! generation and format failures loop back to schema fetching; each loop is
//! bounded by the length of its own error list.

use crate::classifier::{
    answer_schema, loose_bool, query_schema, table_selection_schema, ClassifyError,
    OutputSchema, StructuredClassifier,
};
use crate::config::OrchestratorConfig;
use crate::models::{AgentKind, FailedFormat, FailedQuery, Message, RelevantTables, TabularResult};
use crate::observer::RunObserver;
use crate::prompts;
use crate::state::ConversationState;
use crate::team;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod query;
pub mod sqlite;

pub use query::{clean_query, ensure_read_only, reconcile, where_literals, Revalidation};
pub use sqlite::SqliteHistoricalStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("query failed: {0}")]
    Execution(String),

    #[error("query timed out after {0}s")]
    Timeout(u64),
}

/// Read-only query executor.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str) -> Result<TabularResult, QueryError>;
}

#[async_trait]
pub trait SchemaResolver: Send + Sync {
    async fn tables(&self) -> Result<Vec<String>, QueryError>;
    async fn schema(&self, tables: &[String]) -> Result<String, QueryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Classify,
    Gate,
    FetchSchema,
    GenerateQuery,
    Validate,
    Execute,
    Format,
    Done,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Gate => "gate",
            Stage::FetchSchema => "fetch_schema",
            Stage::GenerateQuery => "generate_query",
            Stage::Validate => "validate_query",
            Stage::Execute => "execute_query",
            Stage::Format => "format_results",
            Stage::Done => "done",
        }
    }
}

/// Fixed answer when the requested date is past the cutoff.
pub fn date_unavailable_answer(cutoff: NaiveDate) -> String {
    format!("Historical data is only available up to {}.", cutoff)
}

pub struct HistoricalWorkflow {
    classifier: Arc<dyn StructuredClassifier>,
    executor: Arc<dyn QueryExecutor>,
    schema: Arc<dyn SchemaResolver>,
    cutoff: NaiveDate,
    classifier_timeout: Duration,
    query_timeout: Duration,
    max_query_errors: usize,
    max_format_errors: usize,
}

async fn bounded<T, E, F>(limit: Duration, timeout_err: E, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(timeout_err),
    }
}

impl HistoricalWorkflow {
    pub fn new(
        classifier: Arc<dyn StructuredClassifier>,
        executor: Arc<dyn QueryExecutor>,
        schema: Arc<dyn SchemaResolver>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            classifier,
            executor,
            schema,
            cutoff: config.data_cutoff,
            classifier_timeout: config.classifier_timeout,
            query_timeout: config.query_timeout,
            max_query_errors: config.max_query_errors,
            max_format_errors: config.max_format_errors,
        }
    }

    async fn ask(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, ClassifyError> {
        let value = bounded(
            self.classifier_timeout,
            ClassifyError::Timeout(self.classifier_timeout.as_secs()),
            self.classifier.classify(prompt, schema),
        )
        .await?;
        schema.check(&value)?;
        Ok(value)
    }

    /// Run the workflow to completion. Returns the answer, which is also
    /// appended to the conversation as the historical agent's message.
    pub async fn run(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> String {
        let run_id = state.run_id;
        let cutoff = self.cutoff;
        state.historical.tools = team::HISTORICAL_DATA
            .stages
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut stage = Stage::Classify;
        let mut result: Option<TabularResult> = None;
        let mut answer = String::new();

        while stage != Stage::Done {
            observer.on_stage(run_id, stage.name());
            debug!(%run_id, stage = stage.name(), "Historical stage");

            stage = match stage {
                Stage::Classify => {
                    self.classify(state).await;
                    Stage::Gate
                }

                Stage::Gate => {
                    let hist = &state.historical;
                    if !hist.date_available {
                        info!(%run_id, "Requested date outside historical coverage");
                        answer = date_unavailable_answer(cutoff);
                        Stage::Done
                    } else if hist.relevant_tables.tables.is_empty() {
                        info!(%run_id, "No relevant historical tables");
                        answer = format!(
                            "No historical table can answer this question. {}",
                            hist.relevant_tables.explanation
                        )
                        .trim()
                        .to_string();
                        Stage::Done
                    } else {
                        Stage::FetchSchema
                    }
                }

                Stage::FetchSchema => {
                    let tables = state.historical.relevant_tables.tables.clone();
                    match bounded(
                        self.query_timeout,
                        QueryError::Timeout(self.query_timeout.as_secs()),
                        self.schema.schema(&tables),
                    )
                    .await
                    {
                        Ok(schema) => {
                            state.historical.schema = Some(schema);
                            Stage::GenerateQuery
                        }
                        Err(e) => {
                            warn!(%run_id, error = %e, "Schema fetch failed");
                            observer.on_error(run_id, Stage::FetchSchema.name(), &e.to_string());
                            answer = format!(
                                "Could not load the schema for {}: {}",
                                tables.join(", "),
                                e
                            );
                            Stage::Done
                        }
                    }
                }

                Stage::GenerateQuery => self.generate(state, observer).await,

                Stage::Validate => {
                    self.validate(state).await;
                    Stage::Execute
                }

                Stage::Execute => {
                    let query = state.historical.current_query.clone().unwrap_or_default();
                    state.historical.executed_queries += 1;

                    let outcome = match ensure_read_only(&query) {
                        Ok(()) => {
                            bounded(
                                self.query_timeout,
                                QueryError::Timeout(self.query_timeout.as_secs()),
                                self.executor.execute(&query),
                            )
                            .await
                        }
                        Err(e) => Err(e),
                    };

                    match outcome {
                        Ok(rows) => {
                            debug!(%run_id, rows = rows.rows.len(), "Historical query executed");
                            result = Some(rows);
                            Stage::Format
                        }
                        Err(e) => {
                            observer.on_error(run_id, Stage::Execute.name(), &e.to_string());
                            self.record_query_error(state, query, e.to_string())
                        }
                    }
                }

                Stage::Format => match result.take() {
                    None => {
                        let hist = &state.historical;
                        answer = match hist.wrong_generated_queries.last() {
                            Some(last) => format!(
                                "Historical query failed after {} attempts. Last error: {}",
                                hist.wrong_generated_queries.len(),
                                last.error
                            ),
                            None => "Historical query produced no result.".to_string(),
                        };
                        Stage::Done
                    }
                    Some(rows) => {
                        let query = state.historical.current_query.clone().unwrap_or_default();
                        let rendered = rows.render();
                        let prompt = prompts::historical_format(&state.question, &query, &rendered);

                        let formatted = self.ask(&prompt, &answer_schema()).await.and_then(|v| {
                            v.get("answer")
                                .and_then(Value::as_str)
                                .map(str::trim)
                                .filter(|a| !a.is_empty() && !a.starts_with("Error:"))
                                .map(str::to_string)
                                .ok_or_else(|| ClassifyError::Malformed {
                                    schema: "answer".to_string(),
                                    detail: "empty or error answer".to_string(),
                                })
                        });

                        match formatted {
                            Ok(text) => {
                                answer = text;
                                Stage::Done
                            }
                            Err(e) => {
                                observer.on_error(run_id, Stage::Format.name(), &e.to_string());
                                let failures = &mut state.historical.wrong_formatted_results;
                                failures.push(FailedFormat {
                                    content: rendered.clone(),
                                    error: e.to_string(),
                                });

                                if failures.len() < self.max_format_errors {
                                    Stage::FetchSchema
                                } else {
                                    answer = format!("SQL Query:\n{}\n\nResults:\n{}", query, rendered);
                                    Stage::Done
                                }
                            }
                        }
                    }
                },

                Stage::Done => Stage::Done,
            };
        }

        info!(
            %run_id,
            executed_queries = state.historical.executed_queries,
            query_errors = state.historical.wrong_generated_queries.len(),
            format_errors = state.historical.wrong_formatted_results.len(),
            "Historical workflow finished"
        );

        state.historical.answer = Some(answer.clone());
        state.push_message(Message::agent(AgentKind::HistoricalData, answer.clone()));
        observer.on_agent_end(run_id, AgentKind::HistoricalData, &answer);
        answer
    }

    async fn classify(&self, state: &mut ConversationState) {
        let known = match self.schema.tables().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "Could not list historical tables");
                Vec::new()
            }
        };

        let prompt = prompts::historical_classify(&state.question, &state.task(), &known, self.cutoff);

        let value = match self.ask(&prompt, &table_selection_schema()).await {
            Ok(value) => value,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "Table classification failed");
                state.historical.date_available = true;
                state.historical.relevant_tables = RelevantTables {
                    tables: Vec::new(),
                    explanation: format!("Table classification failed: {}", e),
                };
                return;
            }
        };

        let mut date_available = loose_bool(value.get("date_available")).unwrap_or(false);
        if let Some(requested) = value
            .get("requested_date")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
        {
            if requested > self.cutoff {
                date_available = false;
            }
        }

        let proposed: Vec<String> = value
            .get("tables")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let mut tables: Vec<String> = Vec::new();
        for name in &proposed {
            if let Some(actual) = known.iter().find(|k| k.eq_ignore_ascii_case(name)) {
                if !tables.contains(actual) {
                    tables.push(actual.clone());
                }
            }
        }

        if tables.len() < proposed.len() {
            debug!(run_id = %state.run_id, ?proposed, ?tables, "Dropped unknown tables");
        }

        state.historical.date_available = date_available;
        state.historical.relevant_tables = RelevantTables {
            tables,
            explanation: value
                .get("explanation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
    }

    async fn generate(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> Stage {
        let schema = state.historical.schema.clone().unwrap_or_default();
        let prompt = prompts::historical_query(
            &state.question,
            &schema,
            self.cutoff,
            &state.historical.wrong_generated_queries,
        );

        let raw = match self.ask(&prompt, &query_schema()).await {
            Ok(value) => value
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                observer.on_error(state.run_id, Stage::GenerateQuery.name(), &e.to_string());
                return self.record_query_error(state, String::new(), e.to_string());
            }
        };

        let query = clean_query(&raw);

        // The generator reports unanswerable questions as "ERROR: ..."
        if query.to_ascii_uppercase().starts_with("ERROR") {
            return self.record_query_error(state, query.clone(), query);
        }

        if let Err(e) = ensure_read_only(&query) {
            warn!(run_id = %state.run_id, query = %query, "Generated query rejected");
            observer.on_error(state.run_id, Stage::GenerateQuery.name(), &e.to_string());
            return self.record_query_error(state, query, e.to_string());
        }

        state.historical.current_query = Some(query);
        Stage::Validate
    }

    async fn validate(&self, state: &mut ConversationState) {
        let original = state.historical.current_query.clone().unwrap_or_default();
        let schema = state.historical.schema.clone().unwrap_or_default();
        let prompt = prompts::historical_validate(&original, &schema);

        let revalidated = match self.ask(&prompt, &query_schema()).await {
            Ok(value) => value
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                debug!(run_id = %state.run_id, error = %e, "Revalidation unavailable, keeping query");
                return;
            }
        };

        match reconcile(&original, &revalidated) {
            Revalidation::Accepted(query) => state.historical.current_query = Some(query),
            Revalidation::Restored { reason, .. } => {
                warn!(run_id = %state.run_id, reason = %reason, "Keeping original query");
            }
        }
    }

    fn record_query_error(&self, state: &mut ConversationState, query: String, error: String) -> Stage {
        let failures = &mut state.historical.wrong_generated_queries;
        failures.push(FailedQuery { query, error });

        if failures.len() < self.max_query_errors {
            Stage::GenerateQuery
        } else {
            Stage::Format
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedClassifier, ScriptedDatabase};
    use crate::models::InvestmentProfile;
    use crate::observer::RecordingObserver;
    use chrono::Utc;
    use serde_json::json;

    fn workflow(classifier: ScriptedClassifier, db: Arc<ScriptedDatabase>) -> HistoricalWorkflow {
        HistoricalWorkflow::new(
            Arc::new(classifier),
            db.clone(),
            db,
            &OrchestratorConfig::default(),
        )
    }

    fn state(question: &str) -> ConversationState {
        ConversationState::new(question, InvestmentProfile::default(), Utc::now())
    }

    fn tables(date_available: &str, tables: &[&str]) -> Value {
        json!({"date_available": date_available, "tables": tables, "explanation": "prices hold closes"})
    }

    fn prices() -> TabularResult {
        TabularResult {
            columns: vec!["date".into(), "close".into()],
            rows: vec![vec![json!("2021-06-30"), json!(136.96)]],
        }
    }

    #[tokio::test]
    async fn date_after_cutoff_short_circuits() {
        let classifier = ScriptedClassifier::new().respond(
            "table_selection",
            json!({"date_available": "true", "requested_date": "2023-03-01", "tables": ["prices"]}),
        );
        let db = Arc::new(ScriptedDatabase::new(&["prices"]));
        let mut state = state("AAPL close on 2023-03-01?");

        let answer = workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert_eq!(answer, "Historical data is only available up to 2022-09-30.");
        assert!(!state.historical.date_available);
        assert_eq!(state.historical.executed_queries, 0);
        assert!(db.executed().is_empty());
        assert!(state.historical.wrong_generated_queries.is_empty());
        assert!(state.historical.wrong_formatted_results.is_empty());
        assert_eq!(state.agent_output(AgentKind::HistoricalData), Some(answer.as_str()));
    }

    #[tokio::test]
    async fn classifier_reporting_no_coverage_short_circuits() {
        let classifier = ScriptedClassifier::new().respond("table_selection", tables("false", &["prices"]));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]));
        let mut state = state("What did TSLA close at last Friday?");
        let observer = RecordingObserver::new();

        let answer = workflow(classifier, db.clone()).run(&mut state, &observer).await;

        assert_eq!(answer, "Historical data is only available up to 2022-09-30.");
        assert!(!state.historical.date_available);
        assert_eq!(state.historical.executed_queries, 0);
        assert!(db.executed().is_empty());
        assert_eq!(db.schema_requests(), 0);
        assert!(state.historical.wrong_generated_queries.is_empty());
        assert!(state.historical.wrong_formatted_results.is_empty());
        assert_eq!(observer.count_prefix("stage:generate_query"), 0);
    }

    #[tokio::test]
    async fn unknown_tables_close_the_gate() {
        let classifier = ScriptedClassifier::new().respond("table_selection", tables("true", &["options_chain"]));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]));
        let mut state = state("AAPL options?");

        let answer = workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert!(answer.starts_with("No historical table"));
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn malformed_classification_closes_the_gate() {
        let classifier = ScriptedClassifier::new().respond("table_selection", json!({"tables": "prices"}));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]));
        let mut state = state("q");

        workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert!(state.historical.relevant_tables.tables.is_empty());
        assert_eq!(state.historical.executed_queries, 0);
    }

    #[tokio::test]
    async fn happy_path_runs_every_stage() {
        let classifier = ScriptedClassifier::new()
            .respond("table_selection", tables("true", &["PRICES"]))
            .respond("sql_query", json!({"query": "```sql\nSELECT date, close FROM prices WHERE ticker = 'MSFT'\n```"}))
            .respond("sql_query", json!({"query": "SELECT date, close FROM prices WHERE ticker = 'MSFT' ORDER BY date"}))
            .respond("answer", json!({"answer": "MSFT closed at 136.96 on 2021-06-30."}));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]).push_result(Ok(prices())));
        let mut state = state("MSFT close mid 2021?");
        let observer = RecordingObserver::new();

        let answer = workflow(classifier, db.clone()).run(&mut state, &observer).await;

        assert_eq!(answer, "MSFT closed at 136.96 on 2021-06-30.");
        assert_eq!(state.historical.relevant_tables.tables, vec!["prices"]);
        assert_eq!(
            db.executed(),
            vec!["SELECT date, close FROM prices WHERE ticker = 'MSFT' ORDER BY date"]
        );
        assert_eq!(state.historical.tools.len(), 6);
        assert_eq!(observer.count_prefix("stage:"), 7);
    }

    #[tokio::test]
    async fn altered_ticker_in_validation_keeps_original() {
        let classifier = ScriptedClassifier::new()
            .respond("table_selection", tables("true", &["prices"]))
            .respond("sql_query", json!({"query": "SELECT close FROM prices WHERE ticker = 'MSFT'"}))
            .respond("sql_query", json!({"query": "SELECT close FROM prices WHERE ticker = 'AAPL'"}))
            .respond("answer", json!({"answer": "ok"}));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]).push_result(Ok(prices())));
        let mut state = state("Microsoft close?");

        workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert_eq!(db.executed(), vec!["SELECT close FROM prices WHERE ticker = 'MSFT'"]);
    }

    #[tokio::test]
    async fn three_execution_failures_surface_the_last_error() {
        let mut classifier = ScriptedClassifier::new().respond("table_selection", tables("true", &["prices"]));
        for _ in 0..3 {
            classifier = classifier
                .respond("sql_query", json!({"query": "SELECT closing FROM prices WHERE ticker = 'MSFT'"}))
                .respond("sql_query", json!({"query": "SELECT closing FROM prices WHERE ticker = 'MSFT'"}));
        }
        let mut db = ScriptedDatabase::new(&["prices"]);
        for i in 1..=3 {
            db = db.push_result(Err(QueryError::Execution(format!("no such column: closing ({})", i))));
        }
        let db = Arc::new(db);
        let mut state = state("MSFT close?");

        let answer = workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert_eq!(state.historical.wrong_generated_queries.len(), 3);
        assert_eq!(db.executed().len(), 3);
        assert!(answer.contains("no such column: closing (3)"));
        assert!(state.historical.wrong_formatted_results.is_empty());
    }

    #[tokio::test]
    async fn generation_failures_are_bounded_without_execution() {
        let classifier = ScriptedClassifier::new()
            .respond("table_selection", tables("true", &["prices"]))
            .respond("sql_query", json!({"query": "DELETE FROM prices"}))
            .respond("sql_query", json!({"query": "ERROR: No relevant data available for this query"}))
            .fail("sql_query", ClassifyError::Backend("500".into()));
        let db = Arc::new(ScriptedDatabase::new(&["prices"]));
        let mut state = state("wipe it");

        let answer = workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert_eq!(state.historical.wrong_generated_queries.len(), 3);
        assert_eq!(state.historical.executed_queries, 0);
        assert!(db.executed().is_empty());
        assert!(answer.contains("500"));
    }

    #[tokio::test]
    async fn format_failures_refetch_schema_then_fall_back() {
        let mut classifier = ScriptedClassifier::new().respond("table_selection", tables("true", &["prices"]));
        let mut db = ScriptedDatabase::new(&["prices"]);
        for _ in 0..3 {
            classifier = classifier
                .respond("sql_query", json!({"query": "SELECT close FROM prices WHERE ticker = 'MSFT'"}))
                .respond("sql_query", json!({"query": "SELECT close FROM prices WHERE ticker = 'MSFT'"}))
                .respond("answer", json!({"answer": ""}));
            db = db.push_result(Ok(prices()));
        }
        let db = Arc::new(db);
        let mut state = state("MSFT close?");

        let answer = workflow(classifier, db.clone()).run(&mut state, &RecordingObserver::new()).await;

        assert_eq!(state.historical.wrong_formatted_results.len(), 3);
        assert_eq!(db.schema_requests(), 3);
        assert!(answer.starts_with("SQL Query:"));
        assert!(answer.contains("136.96"));
    }
}
