//! Mock collaborators
//!
//! Keep the system functional without an LLM, a tool service or a database.
//! The scripted variants replay queued answers for tests; the demo variants
//! back the offline CLI mode.

use crate::classifier::{ClassifyError, OutputSchema, StructuredClassifier};
use crate::error::OrchestrationError;
use crate::execution::{AgentRequest, AgentRun, AgentRunner};
use crate::historical::{QueryError, QueryExecutor, SchemaResolver};
use crate::models::{AgentKind, TabularResult, TraceEntry};
use crate::team;
use crate::tools::{Tool, ToolRegistry};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

//
// ================= Classifier =================
//

type Reply = std::result::Result<Value, ClassifyError>;

/// Replays queued replies per output schema, in order.
/// An exhausted queue falls back to the schema default, if one was set.
#[derive(Default)]
pub struct ScriptedClassifier {
    queues: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: HashMap<String, Value>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, schema: &str, value: Value) -> Self {
        self.enqueue(schema, Ok(value))
    }

    pub fn fail(self, schema: &str, error: ClassifyError) -> Self {
        self.enqueue(schema, Err(error))
    }

    pub fn with_default(mut self, schema: &str, value: Value) -> Self {
        self.defaults.insert(schema.to_string(), value);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls made against a schema.
    pub fn calls(&self, schema: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.iter().filter(|c| *c == schema).count())
            .unwrap_or(0)
    }

    fn enqueue(self, schema: &str, reply: Reply) -> Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(schema.to_string()).or_default().push_back(reply);
        }
        self
    }
}

#[async_trait]
impl StructuredClassifier for ScriptedClassifier {
    async fn classify(&self, _prompt: &str, schema: &OutputSchema) -> Reply {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(schema.name.to_string());
        }

        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(schema.name).and_then(VecDeque::pop_front));

        match queued {
            Some(reply) => reply,
            None => self
                .defaults
                .get(schema.name)
                .cloned()
                .ok_or_else(|| ClassifyError::Unavailable(format!("no scripted reply for {}", schema.name))),
        }
    }
}

/// Deterministic offline classifier for the demo mode.
pub struct DemoClassifier;

const DEMO_QUERY: &str =
    "SELECT ticker, date, close FROM prices WHERE ticker = 'AAPL' ORDER BY date DESC LIMIT 5";

fn excerpt(prompt: &str, marker: &str) -> String {
    let body = prompt
        .rfind(marker)
        .map(|idx| &prompt[idx + marker.len()..])
        .unwrap_or(prompt);
    let body = body.split("Respond with JSON").next().unwrap_or(body);
    ["\n\nHighlight", "\n\nInclude"]
        .iter()
        .fold(body, |acc, cut| acc.split(cut).next().unwrap_or(acc))
        .trim()
        .to_string()
}

#[async_trait]
impl StructuredClassifier for DemoClassifier {
    async fn classify(&self, prompt: &str, schema: &OutputSchema) -> Reply {
        let value = match schema.name {
            "topic_adherence" => json!({"passed": "true", "reason": "offline demo"}),
            "table_selection" => json!({
                "date_available": "true",
                "tables": ["prices"],
                "explanation": "daily closes live in prices",
            }),
            "sql_query" => json!({ "query": DEMO_QUERY }),
            "answer" if prompt.contains("ANALYSES:") => json!({
                "answer": format!("Offline demo recommendation.\n\n{}", excerpt(prompt, "ANALYSES:"))
            }),
            "answer" if prompt.contains("Results:") => json!({
                "answer": format!("Recent closes from the historical store:\n\n{}", excerpt(prompt, "Results:"))
            }),
            "answer" => json!({
                "answer": "Hello! Ask me about a stock or your portfolio and I will run an analysis."
            }),
            "agent_step" => json!({"action": "final", "answer": "Offline demo: no model available."}),
            other => {
                return Err(ClassifyError::Unavailable(format!(
                    "offline demo has no reply for {}",
                    other
                )))
            }
        };
        Ok(value)
    }
}

//
// ================= Agent Runners =================
//

/// Replays queued runs per agent. An empty queue yields an empty run.
#[derive(Default)]
pub struct ScriptedRunner {
    runs: Mutex<HashMap<AgentKind, VecDeque<AgentRun>>>,
    calls: Mutex<HashMap<AgentKind, usize>>,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(self, agent: AgentKind, run: AgentRun) -> Self {
        if let Ok(mut runs) = self.runs.lock() {
            runs.entry(agent).or_default().push_back(run);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self, agent: AgentKind) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, request: AgentRequest<'_>) -> AgentRun {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.agent).or_default() += 1;
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.runs
            .lock()
            .ok()
            .and_then(|mut runs| runs.get_mut(&request.agent).and_then(VecDeque::pop_front))
            .unwrap_or_default()
    }
}

/// Calls every available tool once, then reports what came back.
pub struct SweepRunner;

fn guess_symbol(question: &str) -> String {
    question
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|w| (2..=5).contains(&w.len()) && w.chars().all(|c| c.is_ascii_uppercase()))
        .unwrap_or("AAPL")
        .to_string()
}

#[async_trait]
impl AgentRunner for SweepRunner {
    async fn run(&self, request: AgentRequest<'_>) -> AgentRun {
        let question = request
            .messages
            .iter()
            .find(|m| m.role == crate::models::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let input = json!({ "symbol": guess_symbol(question) });

        let mut entries = Vec::new();
        let mut lines = Vec::new();

        for name in request.tools.names() {
            let output = match request.tools.get(&name) {
                Some(tool) => match tool.execute(&input).await {
                    Ok(value) => value,
                    Err(e) => json!({ "error": e.to_string() }),
                },
                None => continue,
            };
            lines.push(format!("- {}: {}", name, output));
            entries.push(TraceEntry::new(name, input.clone(), output));
        }

        AgentRun {
            final_text: format!("{} findings:\n{}", request.agent, lines.join("\n")),
            entries,
        }
    }
}

//
// ================= Tools =================
//

/// Tool returning a fixed value, or a fixed error.
pub struct StaticTool {
    name: String,
    value: Value,
    error: Option<String>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            error: None,
        }
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "static test tool"
    }

    async fn execute(&self, _input: &Value) -> Result<Value> {
        match &self.error {
            Some(message) => Err(OrchestrationError::ToolError(message.clone())),
            None => Ok(self.value.clone()),
        }
    }
}

/// Every roster tool backed by a canned payload.
pub fn demo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for member in team::ANALYSTS {
        for (name, _) in member.tools {
            registry.register(Arc::new(StaticTool::new(
                *name,
                json!({ "source": "offline demo", "tool": name }),
            )));
        }
    }
    registry
}

//
// ================= Historical Database =================
//

/// In-memory stand-in for the historical store.
pub struct ScriptedDatabase {
    tables: Vec<String>,
    results: Mutex<VecDeque<std::result::Result<TabularResult, QueryError>>>,
    fallback: Option<TabularResult>,
    executed: Mutex<Vec<String>>,
    schema_requests: AtomicUsize,
}

impl ScriptedDatabase {
    pub fn new(tables: &[&str]) -> Self {
        Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            results: Mutex::new(VecDeque::new()),
            fallback: None,
            executed: Mutex::new(Vec::new()),
            schema_requests: AtomicUsize::new(0),
        }
    }

    /// A `prices` table answering every query with the same rows.
    pub fn demo() -> Self {
        let mut db = Self::new(&["prices"]);
        db.fallback = Some(TabularResult {
            columns: vec!["ticker".into(), "date".into(), "close".into()],
            rows: vec![
                vec![json!("AAPL"), json!("2022-09-30"), json!(138.2)],
                vec![json!("AAPL"), json!("2022-09-29"), json!(142.48)],
                vec![json!("AAPL"), json!("2022-09-28"), json!(149.84)],
            ],
        });
        db
    }

    pub fn push_result(self, result: std::result::Result<TabularResult, QueryError>) -> Self {
        if let Ok(mut results) = self.results.lock() {
            results.push_back(result);
        }
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn schema_requests(&self) -> usize {
        self.schema_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for ScriptedDatabase {
    async fn execute(&self, query: &str) -> std::result::Result<TabularResult, QueryError> {
        crate::historical::ensure_read_only(query)?;

        if let Ok(mut executed) = self.executed.lock() {
            executed.push(query.to_string());
        }

        let queued = self.results.lock().ok().and_then(|mut r| r.pop_front());
        match queued {
            Some(result) => result,
            None => Ok(self.fallback.clone().unwrap_or_default()),
        }
    }
}

#[async_trait]
impl SchemaResolver for ScriptedDatabase {
    async fn tables(&self) -> std::result::Result<Vec<String>, QueryError> {
        Ok(self.tables.clone())
    }

    async fn schema(&self, tables: &[String]) -> std::result::Result<String, QueryError> {
        self.schema_requests.fetch_add(1, Ordering::SeqCst);

        tables
            .iter()
            .map(|table| {
                if self.tables.contains(table) {
                    Ok(format!(
                        "CREATE TABLE {} (ticker TEXT, date TEXT, close REAL)",
                        table
                    ))
                } else {
                    Err(QueryError::Execution(format!("no such table: {}", table)))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(|ddl| ddl.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::answer_schema;

    #[tokio::test]
    async fn scripted_classifier_replays_then_falls_back() {
        let classifier = ScriptedClassifier::new()
            .respond("answer", json!({"answer": "one"}))
            .with_default("answer", json!({"answer": "default"}));

        let first = classifier.classify("p", &answer_schema()).await.unwrap();
        let second = classifier.classify("p", &answer_schema()).await.unwrap();

        assert_eq!(first["answer"], "one");
        assert_eq!(second["answer"], "default");
        assert_eq!(classifier.calls("answer"), 2);
    }

    #[tokio::test]
    async fn exhausted_classifier_is_unavailable() {
        let err = ScriptedClassifier::new()
            .classify("p", &answer_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Unavailable(_)));
    }

    #[tokio::test]
    async fn sweep_runner_touches_every_tool() {
        let registry = demo_registry().subset(team::MARKET_INTELLIGENCE.tools.iter().map(|(n, _)| *n));
        let messages = vec![crate::models::Message::user("Is MSFT a buy?")];

        let run = SweepRunner
            .run(AgentRequest {
                agent: AgentKind::MarketIntelligence,
                messages: &messages,
                tools: &registry,
                system_prompt: String::new(),
                max_iterations: 2,
                time_budget: Duration::from_secs(1),
            })
            .await;

        assert_eq!(run.entries.len(), 2);
        assert_eq!(run.entries[0].input["symbol"], "MSFT");
    }

    #[test]
    fn symbol_guess_skips_lowercase_words() {
        assert_eq!(guess_symbol("should I buy NVDA now"), "NVDA");
        assert_eq!(guess_symbol("what about apple"), "AAPL");
    }
}
