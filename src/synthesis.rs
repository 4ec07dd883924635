//! Terminal stages: synthesis and direct reply

use crate::classifier::{answer_schema, ClassifyError, StructuredClassifier};
use crate::models::{AgentKind, Message};
use crate::observer::RunObserver;
use crate::prompts;
use crate::state::ConversationState;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Synthesizer {
    classifier: Arc<dyn StructuredClassifier>,
    timeout: Duration,
}

impl Synthesizer {
    pub fn new(classifier: Arc<dyn StructuredClassifier>, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    async fn answer(&self, prompt: &str) -> Result<String, ClassifyError> {
        let schema = answer_schema();
        let value = tokio::time::timeout(self.timeout, self.classifier.classify(prompt, &schema))
            .await
            .map_err(|_| ClassifyError::Timeout(self.timeout.as_secs()))??;
        schema.check(&value)?;

        value
            .get("answer")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ClassifyError::Malformed {
                schema: schema.name.to_string(),
                detail: "empty answer".to_string(),
            })
    }

    /// Combine every agent's latest output into the final answer.
    pub async fn synthesize(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> String {
        let sections: Vec<(AgentKind, String)> = AgentKind::ALL
            .iter()
            .filter_map(|kind| state.agent_output(*kind).map(|out| (*kind, out.to_string())))
            .collect();

        let prompt = prompts::synthesis(&state.profile, &state.analysis_time, &state.question, &sections);

        let answer = match self.answer(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "Synthesis failed, using sectioned report");
                observer.on_error(state.run_id, "synthesizer", &e.to_string());
                fallback_report(&state.question, &sections)
            }
        };

        info!(run_id = %state.run_id, sections = sections.len(), "Synthesis completed");
        state.push_message(Message::synthesis(answer.clone()));
        observer.on_final(state.run_id, &answer);
        answer
    }

    /// Reply to a non-analytical message without running any agent.
    pub async fn direct_reply(&self, state: &mut ConversationState, observer: &dyn RunObserver) -> String {
        let prompt = prompts::direct_reply(&state.profile, &state.question);

        let answer = match self.answer(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "Direct reply failed, using canned reply");
                observer.on_error(state.run_id, "direct_reply", &e.to_string());
                "Hello! I can analyse stocks for you: ask about a company's financials, news, insider activity or history.".to_string()
            }
        };

        state.push_message(Message::supervisor(answer.clone()));
        observer.on_final(state.run_id, &answer);
        answer
    }
}

/// Deterministic report used when the synthesis call fails.
pub fn fallback_report(question: &str, sections: &[(AgentKind, String)]) -> String {
    let mut report = format!("## Analysis: {}\n", question.trim());

    if sections.is_empty() {
        report.push_str("\nNo agent produced output for this question.\n");
        return report;
    }

    for (kind, output) in sections {
        report.push_str(&format!("\n### {}\n{}\n", kind, output.trim()));
    }
    report
}
