//! Team roster
//!
//! Static description of the four agents: role text for prompts and the tool
//! set each analysis agent is given.

use crate::models::AgentKind;
use std::collections::BTreeSet;

pub struct TeamMember {
    pub kind: AgentKind,
    pub role: &'static str,
    /// `(name, description)` pairs. Empty for the historical workflow.
    pub tools: &'static [(&'static str, &'static str)],
    /// Stage names for workflow-backed members.
    pub stages: &'static [&'static str],
}

impl TeamMember {
    pub fn tool_names(&self) -> BTreeSet<String> {
        self.tools.iter().map(|(name, _)| name.to_string()).collect()
    }
}

pub const FINANCIAL_METRICS: TeamMember = TeamMember {
    kind: AgentKind::FinancialMetrics,
    role: "Core financial data specialist focusing on company metrics, financial statements and fundamental analysis.",
    tools: &[
        ("get_stock_price", "Current price, day range and volume for a ticker"),
        ("get_company_financials", "Key ratios: P/E, margins, debt/equity, dividend yield"),
        ("get_income_statement", "Quarterly and annual income statement"),
        ("get_balance_sheet", "Quarterly and annual balance sheet"),
        ("get_cash_flow", "Quarterly and annual cash-flow statement"),
    ],
    stages: &[],
};

pub const NEWS_SENTIMENT: TeamMember = TeamMember {
    kind: AgentKind::NewsSentiment,
    role: "Specializes in news analysis and sentiment tracking across company-specific news and industry trends.",
    tools: &[
        ("company_news", "Recent headlines for a company"),
        ("industry_news", "Recent headlines for a set of industry keywords"),
        ("get_news_sentiment", "Aggregated news sentiment score for a ticker"),
        ("polygon_ticker_news_tool", "Ticker news with publisher insights"),
    ],
    stages: &[],
};

pub const MARKET_INTELLIGENCE: TeamMember = TeamMember {
    kind: AgentKind::MarketIntelligence,
    role: "Focuses on market data analysis and insider trading patterns to provide trading insights.",
    tools: &[
        ("get_insider_transactions", "Recent insider buys and sells for a ticker"),
        ("get_stock_aggregates", "OHLCV bars for a ticker over a date range"),
    ],
    stages: &[],
};

pub const HISTORICAL_DATA: TeamMember = TeamMember {
    kind: AgentKind::HistoricalData,
    role: "Historical financial data analyst working over a read-only database. Data is not real time and ends in 2022.",
    tools: &[],
    stages: &[
        "classify",
        "fetch_schema",
        "generate_query",
        "validate_query",
        "execute_query",
        "format_results",
    ],
};

/// The three gated analysis agents.
pub const ANALYSTS: [&TeamMember; 3] = [&FINANCIAL_METRICS, &NEWS_SENTIMENT, &MARKET_INTELLIGENCE];

pub const ROSTER: [&TeamMember; 4] = [
    &FINANCIAL_METRICS,
    &NEWS_SENTIMENT,
    &MARKET_INTELLIGENCE,
    &HISTORICAL_DATA,
];

pub fn member(kind: AgentKind) -> &'static TeamMember {
    match kind {
        AgentKind::FinancialMetrics => &FINANCIAL_METRICS,
        AgentKind::NewsSentiment => &NEWS_SENTIMENT,
        AgentKind::MarketIntelligence => &MARKET_INTELLIGENCE,
        AgentKind::HistoricalData => &HISTORICAL_DATA,
    }
}

/// Numbered roster block for the supervisor prompt.
pub fn roster_block() -> String {
    ROSTER
        .iter()
        .enumerate()
        .map(|(i, member)| {
            let capabilities: Vec<&str> = if member.tools.is_empty() {
                member.stages.to_vec()
            } else {
                member.tools.iter().map(|(name, _)| *name).collect()
            };
            format!(
                "**{} {}**\nRole: {}\nCapabilities: {}\n",
                i + 1,
                member.kind,
                member.role,
                capabilities.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
