//! Keyword routing
//!
//! Classifies a question as:
//! - NonAnalytical: greetings and small talk, answered directly
//! - FullDecision: buy/sell/hold or multi-perspective, runs the whole team
//! - Focused: one agent is enough
//!
//! Also serves as the supervisor's fallback when the classifier-backed
//! router fails, and as the router of the offline mode.

use super::{Router, RoutingContext};
use crate::models::{AgentKind, NextAction, RoutingDecision, TaskAssignment};
use crate::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    NonAnalytical,
    FullDecision { historical: bool },
    Focused(AgentKind),
}

/// Static keyword lists, zero allocation
const SMALL_TALK_KEYWORDS: &[&str] = &[
    "hello", "hi", "hey", "thanks", "thank you", "good morning", "good evening",
    "who are you", "what can you do", "help", "bye",
];

const DECISION_KEYWORDS: &[&str] = &[
    // Actions
    "buy", "sell", "hold", "invest", "should i", "recommend", "worth",
    // Broad analysis
    "outlook", "analysis", "analyze", "analyse", "overall", "comprehensive", "portfolio",
];

const FINANCIAL_KEYWORDS: &[&str] = &[
    "p/e", "pe ratio", "earnings", "revenue", "margin", "balance sheet", "cash flow",
    "income", "financials", "valuation", "dividend", "debt", "price", "eps", "profit",
];

const NEWS_KEYWORDS: &[&str] = &[
    "news", "sentiment", "headline", "press", "media", "announcement", "rumor", "rumour",
];

const MARKET_KEYWORDS: &[&str] = &[
    "insider", "volume", "aggregate", "trading activity", "ohlc", "market data", "momentum",
    "candles", "bars",
];

const HISTORICAL_KEYWORDS: &[&str] = &[
    "historical", "history", "past performance", "back in", "used to", "years ago", "since",
];

fn score(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| contains_word(text, kw)).count()
}

/// Whole-word (or whole-phrase) match so "hi" does not fire inside "this".
fn contains_word(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + keyword.len()..].chars().next();
        !before.map(|c| c.is_alphanumeric()).unwrap_or(false)
            && !after.map(|c| c.is_alphanumeric()).unwrap_or(false)
    })
}

/// Years a question refers to, e.g. "in 2019".
fn mentions_year(text: &str) -> bool {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|w| w.len() == 4)
        .filter_map(|w| w.parse::<u16>().ok())
        .any(|year| (1980..=2100).contains(&year))
}

/// Uppercase 2-5 letter words, the way tickers appear in questions.
fn mentions_ticker(original: &str) -> bool {
    original
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| (2..=5).contains(&w.len()) && w.chars().all(|c| c.is_ascii_uppercase()))
}

pub fn classify(question: &str) -> QueryIntent {
    let text = question.to_lowercase();

    let historical = score(&text, HISTORICAL_KEYWORDS) > 0 || mentions_year(&text);
    let decision = score(&text, DECISION_KEYWORDS);
    let scores = [
        (AgentKind::FinancialMetrics, score(&text, FINANCIAL_KEYWORDS)),
        (AgentKind::NewsSentiment, score(&text, NEWS_KEYWORDS)),
        (AgentKind::MarketIntelligence, score(&text, MARKET_KEYWORDS)),
    ];
    let domain_total: usize = scores.iter().map(|(_, s)| s).sum();
    let domains_hit = scores.iter().filter(|(_, s)| *s > 0).count();

    let analytical = decision > 0 || domain_total > 0 || historical || mentions_ticker(question);

    if !analytical || (score(&text, SMALL_TALK_KEYWORDS) > 0 && decision == 0 && domain_total == 0) {
        return QueryIntent::NonAnalytical;
    }

    if decision > 0 || domains_hit >= 2 {
        return QueryIntent::FullDecision { historical };
    }

    if historical && domain_total == 0 {
        return QueryIntent::Focused(AgentKind::HistoricalData);
    }

    // First maximum wins, so ties keep roster order.
    let mut best: Option<(AgentKind, usize)> = None;
    for (kind, s) in scores {
        if s > best.map(|(_, b)| b).unwrap_or(0) {
            best = Some((kind, s));
        }
    }

    match best {
        Some(_) if historical => QueryIntent::FullDecision { historical: true },
        Some((kind, _)) => QueryIntent::Focused(kind),
        None => QueryIntent::FullDecision { historical },
    }
}

impl QueryIntent {
    /// Agents this intent needs, in dispatch order.
    pub fn plan(&self) -> Vec<AgentKind> {
        match self {
            QueryIntent::NonAnalytical => Vec::new(),
            QueryIntent::FullDecision { historical } => {
                let mut plan = vec![
                    AgentKind::FinancialMetrics,
                    AgentKind::MarketIntelligence,
                    AgentKind::NewsSentiment,
                ];
                if *historical {
                    plan.push(AgentKind::HistoricalData);
                }
                plan
            }
            QueryIntent::Focused(kind) => vec![*kind],
        }
    }
}

pub fn task_for(agent: AgentKind, question: &str) -> TaskAssignment {
    let (focus, output) = match agent {
        AgentKind::FinancialMetrics => (
            "price, valuation ratios and financial statements",
            "Key metrics with values and a short interpretation",
        ),
        AgentKind::NewsSentiment => (
            "recent company and industry news and overall sentiment",
            "Main headlines with a sentiment verdict",
        ),
        AgentKind::MarketIntelligence => (
            "insider transactions and recent trading activity",
            "Insider activity summary and price/volume trend",
        ),
        AgentKind::HistoricalData => (
            "historical records in the database",
            "The relevant historical figures and the query used",
        ),
    };

    TaskAssignment {
        description: format!("Answer \"{}\" focusing on {}.", question.trim(), focus),
        expected_output: output.to_string(),
        validation_criteria: vec![
            "Stays on the user's question".to_string(),
            "Cites the data it relies on".to_string(),
        ],
    }
}

/// Deterministic router following the keyword intent.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordRouter;

impl KeywordRouter {
    pub fn decide(&self, ctx: &RoutingContext<'_>) -> RoutingDecision {
        let intent = classify(ctx.question);
        let next = intent.plan().into_iter().find(|agent| !ctx.dispatched.contains(agent));

        match next {
            Some(agent) => RoutingDecision {
                next_action: NextAction::from(agent),
                task: task_for(agent, ctx.question),
            },
            None if ctx.dispatched.is_empty() => RoutingDecision {
                next_action: NextAction::Finish,
                task: TaskAssignment {
                    description: "Reply to the user directly.".to_string(),
                    expected_output: "A short conversational reply".to_string(),
                    validation_criteria: Vec::new(),
                },
            },
            None => RoutingDecision {
                next_action: NextAction::Synthesizer,
                task: TaskAssignment {
                    description: "Combine the agents' findings into one recommendation.".to_string(),
                    expected_output: "A recommendation tailored to the investment profile".to_string(),
                    validation_criteria: Vec::new(),
                },
            },
        }
    }
}

#[async_trait]
impl Router for KeywordRouter {
    async fn route(&self, ctx: &RoutingContext<'_>) -> Result<RoutingDecision> {
        Ok(self.decide(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_talk_is_non_analytical() {
        for q in ["hello", "Hi there!", "thanks a lot", "what can you do?"] {
            assert_eq!(classify(q), QueryIntent::NonAnalytical, "{q}");
        }
    }

    #[test]
    fn decisions_run_the_whole_team() {
        assert_eq!(
            classify("Should I buy AAPL?"),
            QueryIntent::FullDecision { historical: false }
        );
        assert_eq!(
            classify("Is MSFT worth holding given how it did in 2021?"),
            QueryIntent::FullDecision { historical: true }
        );
    }

    #[test]
    fn focused_questions_pick_one_agent() {
        assert_eq!(
            classify("What is AAPL's P/E ratio?"),
            QueryIntent::Focused(AgentKind::FinancialMetrics)
        );
        assert_eq!(
            classify("Latest news on Tesla"),
            QueryIntent::Focused(AgentKind::NewsSentiment)
        );
        assert_eq!(
            classify("Any insider selling at NVDA?"),
            QueryIntent::Focused(AgentKind::MarketIntelligence)
        );
        assert_eq!(
            classify("What was the closing value of MSFT on 2021-06-30?"),
            QueryIntent::Focused(AgentKind::HistoricalData)
        );
    }

    #[test]
    fn whole_word_matching() {
        assert!(!contains_word("this is it", "hi"));
        assert!(contains_word("hi, there", "hi"));
        assert!(contains_word("what is the p/e ratio", "p/e"));
    }

    #[test]
    fn full_plan_order() {
        assert_eq!(
            QueryIntent::FullDecision { historical: true }.plan(),
            vec![
                AgentKind::FinancialMetrics,
                AgentKind::MarketIntelligence,
                AgentKind::NewsSentiment,
                AgentKind::HistoricalData,
            ]
        );
    }
}
