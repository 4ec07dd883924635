//! Prompt builders
//!
//! Plain string assembly. Wording quality is not load-bearing; structure is:
//! every prompt carries the profile block and the output contract the
//! matching `OutputSchema` checks.

use crate::models::{AgentKind, InvestmentProfile, TaskAssignment};
use crate::team;
use chrono::{DateTime, NaiveDate, Utc};

fn date_context(analysis_time: &DateTime<Utc>) -> String {
    format!(
        "Analysis Date: {}",
        analysis_time.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

const PROFILE_GUIDELINES: &str = "Investment Profile Guidelines:
1. Risk Tolerance: Conservative favours stability and fundamentals, Moderate balances growth and stability, Aggressive favours growth and market dynamics.
2. Time Horizon: Short-Term looks at immediate catalysts, Medium-Term at trajectory, Long-Term at sustainable fundamentals.
3. Investment Style: Value looks at intrinsic value, Growth at growth potential, Blend at both.";

/// Supervisor routing prompt
pub fn supervisor(
    profile: &InvestmentProfile,
    analysis_time: &DateTime<Utc>,
    history: &str,
    dispatched: &[AgentKind],
) -> String {
    let done = if dispatched.is_empty() {
        "none".to_string()
    } else {
        dispatched
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        r#"You are a Financial Advisory Supervisor coordinating a team of specialised agents.

{date}

INVESTMENT PROFILE:
{profile}

{guidelines}

TEAM:
{roster}

RULES:
1. Greetings, clarifications and other non-analytical messages: choose FINISH.
2. Buy/sell/hold or multi-perspective decisions: FinancialMetrics, then MarketIntelligence, then NewsSentiment, then HistoricalData only if historical context is requested. One agent per turn.
3. Anything else: choose the single most relevant agent.
4. Once every required agent has answered: choose Synthesizer.
5. Never choose an agent that already ran. Already ran: {done}.
6. HistoricalData only covers data up to 2022.

CONVERSATION:
{history}

Respond with JSON only:
{{"next_action": one of {options:?}, "task": {{"description": "...", "expected_output": "...", "validation_criteria": ["..."]}}}}"#,
        date = date_context(analysis_time),
        profile = profile.prompt_context(),
        guidelines = PROFILE_GUIDELINES,
        roster = team::roster_block(),
        done = done,
        history = history,
        options = crate::models::NextAction::OPTIONS,
    )
}

/// System prompt for a gated analysis agent
pub fn analysis_agent(
    kind: AgentKind,
    profile: &InvestmentProfile,
    analysis_time: &DateTime<Utc>,
    question: &str,
    task: &TaskAssignment,
) -> String {
    let member = team::member(kind);
    let tools = member
        .tools
        .iter()
        .enumerate()
        .map(|(i, (name, description))| format!("{}. {}: {}", i + 1, name, description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are the {kind} analyst. {role}\n\n{task}\n\n{date}\n\nINVESTMENT PROFILE:\n{profile}\n\n\
         THE USER HAS ASKED:\n{question}\n\n\
         Available Tools:\n{tools}\n\n\
         RULES:\n\
         1. Call EVERY available tool at least once before answering.\n\
         2. Present numerical data as markdown tables.\n\
         3. Flag missing data instead of guessing.\n\
         4. Tailor the analysis to the investment profile.",
        kind = kind,
        role = member.role,
        task = task.prompt_block(),
        date = date_context(analysis_time),
        profile = profile.prompt_context(),
        question = question,
        tools = tools,
    )
}

/// Per-iteration instruction for the tool-calling runner
pub fn agent_step(system_prompt: &str, transcript: &str, tools: &str, remaining: u32) -> String {
    format!(
        "{system}\n\nTOOLS YOU MAY CALL:\n{tools}\n\nWORK SO FAR:\n{transcript}\n\n\
         Iterations remaining: {remaining}. Call every tool you need in the same step.\n\
         Respond with JSON only. To call tools: {{\"action\": \"tools\", \"tool_calls\": [{{\"tool\": \"<name>\", \"input\": {{...}}}}]}}. \
         To finish: {{\"action\": \"final\", \"answer\": \"<markdown answer>\"}}.",
        system = system_prompt,
        tools = tools,
        transcript = if transcript.is_empty() { "(nothing yet)" } else { transcript },
        remaining = remaining,
    )
}

/// Closing prompt once the tool iterations are used up.
pub fn agent_final(system_prompt: &str, transcript: &str) -> String {
    format!(
        "{system}\n\nWORK SO FAR:\n{transcript}\n\n\
         No tool calls are left. Answer now from the observations above.\n\
         Respond with JSON only: {{\"action\": \"final\", \"answer\": \"<markdown answer>\"}}.",
        system = system_prompt,
        transcript = if transcript.is_empty() { "(nothing yet)" } else { transcript },
    )
}

fn agent_focus(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::FinancialMetrics => "financial statements, valuation ratios, company fundamentals and industry benchmarks",
        AgentKind::NewsSentiment => "news coverage, sentiment, market perception and key narratives",
        AgentKind::MarketIntelligence => "technical analysis, insider trading activity, volume, volatility and momentum",
        AgentKind::HistoricalData => "historical price and fundamentals data",
    }
}

/// Topic-adherence evaluation prompt
pub fn topic_adherence(kind: AgentKind, question: &str, answer: &str) -> String {
    format!(
        r#"You evaluate responses from the {kind} agent, which covers {focus}.

The user asked:
{question}

The agent responded with:
{answer}

Decide whether the answer directly addresses the question using data from its domain.
Respond with JSON only: {{"passed": "true" or "false", "reason": "<brief explanation>"}}"#,
        kind = kind,
        focus = agent_focus(kind),
        question = question,
        answer = answer,
    )
}

/// Historical stage 1: table relevance and date coverage
pub fn historical_classify(
    question: &str,
    task: &TaskAssignment,
    tables: &[String],
    cutoff: NaiveDate,
) -> String {
    format!(
        r#"You are a financial data SQL expert. Decide which tables can answer the question and whether the requested date is covered.

Available tables: {tables}
The database contains data up to {cutoff}.

{task}

Question: {question}

Map company names to tickers (Apple -> AAPL, Microsoft -> MSFT).
Respond with JSON only:
{{"tables": [<relevant table names, empty if none>], "explanation": "<why>", "date_available": "true" or "false", "requested_date": "<YYYY-MM-DD or empty>"}}"#,
        tables = tables.join(", "),
        cutoff = cutoff,
        task = task.prompt_block(),
        question = question,
    )
}

/// Historical stage 4: query generation
pub fn historical_query(
    question: &str,
    schema: &str,
    cutoff: NaiveDate,
    previous_errors: &[crate::models::FailedQuery],
) -> String {
    let errors = if previous_errors.is_empty() {
        String::new()
    } else {
        let listed = previous_errors
            .iter()
            .map(|e| format!("- {}\n  error: {}", e.query, e.error))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\nThese queries already failed, do not repeat them:\n{}\n", listed)
    };

    format!(
        r#"You are a SQL expert. Schema:
{schema}

Write one syntactically correct SQLite SELECT query answering the question.
- Query only relevant columns.
- Data ends at {cutoff}.
- Filter on the ticker of the company mentioned with a WHERE clause.
- Never write INSERT, UPDATE, DELETE, DROP or any other modifying statement.
{errors}
Question: {question}

Respond with JSON only: {{"query": "<sql>"}}"#,
        schema = schema,
        cutoff = cutoff,
        errors = errors,
        question = question,
    )
}

/// Historical stage 5: revalidation
pub fn historical_validate(query: &str, schema: &str) -> String {
    format!(
        r#"Validate this SQLite query against the schema and return the corrected query.

Query:
{query}

Schema:
{schema}

Check joins, column names, WHERE clauses and data types.
DO NOT modify any ticker symbol or other literal in WHERE clauses.
Respond with JSON only: {{"query": "<sql>"}}"#,
        query = query,
        schema = schema,
    )
}

/// Historical stage 7: result formatting
pub fn historical_format(question: &str, query: &str, rendered: &str) -> String {
    format!(
        r#"Format these SQL results into a clear answer for: {question}

SQL Query:
{query}

Results:
{rendered}

Include the query and a readable summary of the results.
Respond with JSON only: {{"answer": "<markdown>"}}"#,
        question = question,
        query = query,
        rendered = rendered,
    )
}

/// Final synthesis across agent outputs
pub fn synthesis(
    profile: &InvestmentProfile,
    analysis_time: &DateTime<Utc>,
    question: &str,
    sections: &[(AgentKind, String)],
) -> String {
    let body = sections
        .iter()
        .map(|(kind, output)| format!("### {}\n{}", kind, output))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are a senior financial advisor. Combine the analyses below into one recommendation for the user.\n\n\
         {date}\n\nINVESTMENT PROFILE:\n{profile}\n\nQUESTION:\n{question}\n\nANALYSES:\n{body}\n\n\
         Highlight conflicting signals, state confidence, and tailor the recommendation to the profile.\n\
         Respond with JSON only: {{\"answer\": \"<markdown>\"}}",
        date = date_context(analysis_time),
        profile = profile.prompt_context(),
        question = question,
        body = body,
    )
}

/// Reply for non-analytical messages
pub fn direct_reply(profile: &InvestmentProfile, question: &str) -> String {
    format!(
        "You are a friendly financial advisory assistant. The user's message does not need market analysis.\n\n\
         INVESTMENT PROFILE:\n{profile}\n\nMESSAGE:\n{question}\n\n\
         Reply briefly and offer to analyse a stock or portfolio.\n\
         Respond with JSON only: {{\"answer\": \"<reply>\"}}",
        profile = profile.prompt_context(),
        question = question,
    )
}
