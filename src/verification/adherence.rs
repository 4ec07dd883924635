//! Topic-adherence evaluator
//!
//! One classifier call per evaluation. Any failure (timeout, malformed
//! output, backend error) becomes a failing verdict so the retry gate always
//! has something to act on.

use crate::classifier::{adherence_schema, loose_bool, ClassifyError, StructuredClassifier};
use crate::models::{AdherenceEvalResult, AgentKind};
use crate::prompts;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct TopicAdherenceEvaluator {
    classifier: Arc<dyn StructuredClassifier>,
    timeout: Duration,
}

impl TopicAdherenceEvaluator {
    pub fn new(classifier: Arc<dyn StructuredClassifier>, timeout: Duration) -> Self {
        Self {
            classifier,
            timeout,
        }
    }

    pub async fn evaluate(&self, agent: AgentKind, question: &str, answer: &str) -> AdherenceEvalResult {
        let prompt = prompts::topic_adherence(agent, question, answer);
        let schema = adherence_schema();

        let outcome = match tokio::time::timeout(self.timeout, self.classifier.classify(&prompt, &schema)).await {
            Ok(result) => result,
            Err(_) => Err(ClassifyError::Timeout(self.timeout.as_secs())),
        };

        let value = match outcome.and_then(|v| schema.check(&v).map(|_| v)) {
            Ok(value) => value,
            Err(e) => {
                warn!(%agent, error = %e, "Topic adherence evaluation failed");
                return failing(format!("evaluation failed: {}", e));
            }
        };

        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        match loose_bool(value.get("passed")) {
            Some(passed) => AdherenceEvalResult { passed, reason },
            None => {
                warn!(%agent, passed = %value["passed"], "Unrecognised adherence verdict");
                failing(format!("unrecognised verdict: {}", value["passed"]))
            }
        }
    }
}

fn failing(reason: String) -> AdherenceEvalResult {
    AdherenceEvalResult {
        passed: false,
        reason,
    }
}
