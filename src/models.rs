//! Core data models for the advisory orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

//
// ================= Investment Profile =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    ShortTerm,
    #[default]
    MediumTerm,
    LongTerm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStyle {
    Value,
    Growth,
    #[default]
    Blend,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct InvestmentProfile {
    #[serde(default)]
    pub risk_tolerance: RiskTolerance,
    #[serde(default)]
    pub time_horizon: TimeHorizon,
    #[serde(default)]
    pub investment_style: InvestmentStyle,
}

impl InvestmentProfile {
    /// Profile block embedded in every prompt
    pub fn prompt_context(&self) -> String {
        format!(
            "Investment Profile:\n- Risk Tolerance: {}\n- Time Horizon: {}\n- Investment Style: {}",
            self.risk_tolerance, self.time_horizon, self.investment_style
        )
    }
}

//
// ================= Agents & Routing =================
//

/// The four specialised agents the supervisor can dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentKind {
    FinancialMetrics,
    NewsSentiment,
    MarketIntelligence,
    HistoricalData,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [
        AgentKind::FinancialMetrics,
        AgentKind::NewsSentiment,
        AgentKind::MarketIntelligence,
        AgentKind::HistoricalData,
    ];

    /// Agents that run through the generic retry gate.
    pub const ANALYSIS: [AgentKind; 3] = [
        AgentKind::FinancialMetrics,
        AgentKind::NewsSentiment,
        AgentKind::MarketIntelligence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::FinancialMetrics => "FinancialMetrics",
            AgentKind::NewsSentiment => "NewsSentiment",
            AgentKind::MarketIntelligence => "MarketIntelligence",
            AgentKind::HistoricalData => "HistoricalData",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    pub fn uses_retry_gate(&self) -> bool {
        !matches!(self, AgentKind::HistoricalData)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NextAction {
    FinancialMetrics,
    NewsSentiment,
    MarketIntelligence,
    HistoricalData,
    Synthesizer,
    #[serde(rename = "FINISH")]
    Finish,
}

impl NextAction {
    pub const OPTIONS: [&'static str; 6] = [
        "FinancialMetrics",
        "NewsSentiment",
        "MarketIntelligence",
        "HistoricalData",
        "Synthesizer",
        "FINISH",
    ];

    pub fn agent(&self) -> Option<AgentKind> {
        match self {
            NextAction::FinancialMetrics => Some(AgentKind::FinancialMetrics),
            NextAction::NewsSentiment => Some(AgentKind::NewsSentiment),
            NextAction::MarketIntelligence => Some(AgentKind::MarketIntelligence),
            NextAction::HistoricalData => Some(AgentKind::HistoricalData),
            NextAction::Synthesizer | NextAction::Finish => None,
        }
    }
}

impl From<AgentKind> for NextAction {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::FinancialMetrics => NextAction::FinancialMetrics,
            AgentKind::NewsSentiment => NextAction::NewsSentiment,
            AgentKind::MarketIntelligence => NextAction::MarketIntelligence,
            AgentKind::HistoricalData => NextAction::HistoricalData,
        }
    }
}

impl fmt::Display for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextAction::Synthesizer => f.write_str("Synthesizer"),
            NextAction::Finish => f.write_str("FINISH"),
            other => match other.agent() {
                Some(kind) => f.write_str(kind.name()),
                None => Ok(()),
            },
        }
    }
}

/// Instruction handed by the supervisor to the next component.
/// Replaced wholesale on every routing decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskAssignment {
    pub description: String,
    pub expected_output: String,
    #[serde(default)]
    pub validation_criteria: Vec<String>,
}

impl TaskAssignment {
    pub fn prompt_block(&self) -> String {
        let criteria = if self.validation_criteria.is_empty() {
            "- (none)".to_string()
        } else {
            self.validation_criteria
                .iter()
                .map(|c| format!("- {}", c))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "ASSIGNED TASK:\n{}\n\nEXPECTED OUTPUT:\n{}\n\nVALIDATION CRITERIA:\n{}",
            self.description, self.expected_output, criteria
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingDecision {
    pub next_action: NextAction,
    pub task: TaskAssignment,
}

//
// ================= Messages =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Component that produced a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "agent", rename_all = "snake_case")]
pub enum Producer {
    User,
    Supervisor,
    Agent(AgentKind),
    Synthesizer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub producer: Option<Producer>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            producer: Some(Producer::User),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn agent(kind: AgentKind, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            producer: Some(Producer::Agent(kind)),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn synthesis(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            producer: Some(Producer::Synthesizer),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn supervisor(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            producer: Some(Producer::Supervisor),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn produced_by(&self, kind: AgentKind) -> bool {
        self.producer == Some(Producer::Agent(kind))
    }

    pub fn speaker(&self) -> String {
        match self.producer {
            Some(Producer::Agent(kind)) => kind.name().to_string(),
            Some(Producer::Supervisor) => "Supervisor".to_string(),
            Some(Producer::Synthesizer) => "Synthesizer".to_string(),
            Some(Producer::User) | None => match self.role {
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
                Role::System => "system".to_string(),
            },
        }
    }
}

/// `speaker: content` lines, each message clipped to `max_chars`.
pub fn render_transcript(messages: &[Message], max_chars: usize) -> String {
    messages
        .iter()
        .map(|m| {
            let content: String = m.content.chars().take(max_chars).collect();
            let clipped = if m.content.chars().count() > max_chars { "…" } else { "" };
            format!("{}: {}{}", m.speaker(), content, clipped)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

//
// ================= Execution Trace =================
//

/// Tool name the runner records when the model output could not be parsed.
pub const PARSER_ERROR_TOOL: &str = "_Exception";

/// Key marking an observation for a tool that was requested but not available.
pub const INVALID_TOOL_MARKER: &str = "requested_tool_name";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    ParserError,
    InvalidTool,
    ExecutionError,
}

/// One tool invocation as recorded by the runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub tool_name: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
}

impl TraceEntry {
    pub fn new(
        tool_name: impl Into<String>,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            output,
        }
    }

    pub fn status(&self) -> ToolStatus {
        crate::verification::classify_observation(&self.tool_name, &self.output)
    }
}

/// Immutable record of a single agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionTrace {
    pub entries: Vec<TraceEntry>,
    pub final_answer: String,
}

//
// ================= Evaluations =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvalidToolAttempt {
    pub requested: String,
    pub available: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub tool: String,
    pub input: serde_json::Value,
    pub error: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolErrors {
    pub invalid: Vec<InvalidToolAttempt>,
    pub execution: Vec<ToolFailure>,
    pub parser: Vec<ToolFailure>,
}

impl ToolErrors {
    pub fn total(&self) -> usize {
        self.invalid.len() + self.execution.len() + self.parser.len()
    }
}

/// Tool-coverage verdict for one trace.
/// Invariant: `used ∪ unused == available`, `used ∩ unused == ∅`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEvalResult {
    pub available: BTreeSet<String>,
    pub used: BTreeSet<String>,
    pub unused: BTreeSet<String>,
    pub call_counts: BTreeMap<String, usize>,
    pub errors: ToolErrors,
    pub evaluated_at: DateTime<Utc>,
}

impl ToolEvalResult {
    pub fn all_tools_used(&self) -> bool {
        self.unused.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdherenceEvalResult {
    pub passed: bool,
    pub reason: String,
}

//
// ================= Historical Data =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RelevantTables {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedQuery {
    pub query: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedFormat {
    pub content: String,
    pub error: String,
}

/// Rows returned by the read-only executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl TabularResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Markdown table rendering
    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return "(no rows)".to_string();
        }

        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!(
            "|{}|\n",
            self.columns
                .iter()
                .map(|_| "---")
                .collect::<Vec<_>>()
                .join("|")
        ));

        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .map(|value| match value {
                    serde_json::Value::Null => "—".to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }

        out
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskTolerance::Conservative => "Conservative",
            RiskTolerance::Moderate => "Moderate",
            RiskTolerance::Aggressive => "Aggressive",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TimeHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeHorizon::ShortTerm => "Short-Term",
            TimeHorizon::MediumTerm => "Medium-Term",
            TimeHorizon::LongTerm => "Long-Term",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for InvestmentStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvestmentStyle::Value => "Value",
            InvestmentStyle::Growth => "Growth",
            InvestmentStyle::Blend => "Blend",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_action_serializes_finish_in_caps() {
        let json = serde_json::to_string(&NextAction::Finish).unwrap();
        assert_eq!(json, "\"FINISH\"");

        let parsed: NextAction = serde_json::from_str("\"HistoricalData\"").unwrap();
        assert_eq!(parsed.agent(), Some(AgentKind::HistoricalData));
    }

    #[test]
    fn agent_names_round_trip_through_lookup() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(AgentKind::from_name("SQLAgent"), None);
    }

    #[test]
    fn tabular_result_renders_markdown() {
        let table = TabularResult {
            columns: vec!["ticker".into(), "close".into()],
            rows: vec![vec![serde_json::json!("AAPL"), serde_json::json!(142.5)]],
        };

        let rendered = table.render();
        assert!(rendered.starts_with("| ticker | close |"));
        assert!(rendered.contains("| AAPL | 142.5 |"));
        assert_eq!(TabularResult::default().render(), "(no rows)");
    }

    #[test]
    fn default_profile_is_moderate_blend() {
        let profile = InvestmentProfile::default();
        let ctx = profile.prompt_context();
        assert!(ctx.contains("Moderate"));
        assert!(ctx.contains("Medium-Term"));
        assert!(ctx.contains("Blend"));
    }
}
