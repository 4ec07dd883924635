//! Structured classifier contract
//!
//! A prompt goes in, a value conforming to a fixed output schema comes out.
//! Used by the supervisor, the topic-adherence evaluator, every historical
//! stage and the tool-calling runner. Malformed output is a typed failure.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("malformed classifier output for '{schema}': {detail}")]
    Malformed { schema: String, detail: String },

    #[error("classifier timed out after {0}s")]
    Timeout(u64),

    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier backend failure: {0}")]
    Backend(String),
}

/// Named JSON schema the classifier output must conform to.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
}

impl OutputSchema {
    pub fn new(name: &'static str, schema: Value) -> Self {
        Self { name, schema }
    }

    /// Top-level keys the output object must carry.
    pub fn required_keys(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Checks the shallow shape: an object carrying every required key.
    pub fn check(&self, value: &Value) -> Result<(), ClassifyError> {
        let object = value.as_object().ok_or_else(|| ClassifyError::Malformed {
            schema: self.name.to_string(),
            detail: "expected a JSON object".to_string(),
        })?;

        let missing: Vec<&str> = self
            .required_keys()
            .into_iter()
            .filter(|key| !object.contains_key(*key))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClassifyError::Malformed {
                schema: self.name.to_string(),
                detail: format!("missing keys: {}", missing.join(", ")),
            })
        }
    }
}

#[async_trait]
pub trait StructuredClassifier: Send + Sync {
    async fn classify(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, ClassifyError>;
}

/// Classify and deserialize into a concrete type.
pub async fn classify_as<T: DeserializeOwned>(
    classifier: &dyn StructuredClassifier,
    prompt: &str,
    schema: &OutputSchema,
) -> Result<T, ClassifyError> {
    let value = classifier.classify(prompt, schema).await?;
    schema.check(&value)?;

    serde_json::from_value(value).map_err(|e| ClassifyError::Malformed {
        schema: schema.name.to_string(),
        detail: e.to_string(),
    })
}

/// Extract a JSON object from raw model text. Tolerates ```json fences and
/// leading prose.
pub fn parse_json_block(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

//
// ================= Output Schemas =================
//

pub fn routing_schema() -> OutputSchema {
    OutputSchema::new(
        "routing_decision",
        json!({
            "type": "object",
            "properties": {
                "next_action": {
                    "type": "string",
                    "enum": crate::models::NextAction::OPTIONS,
                },
                "task": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "expected_output": { "type": "string" },
                        "validation_criteria": { "type": "array", "items": { "type": "string" } }
                    },
                    "required": ["description", "expected_output"]
                },
                "task_description": { "type": "string" },
                "expected_output": { "type": "string" },
                "validation_criteria": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["next_action"]
        }),
    )
}

pub fn adherence_schema() -> OutputSchema {
    OutputSchema::new(
        "topic_adherence",
        json!({
            "type": "object",
            "properties": {
                "passed": { "type": "string", "enum": ["true", "false"] },
                "reason": { "type": "string" }
            },
            "required": ["passed", "reason"]
        }),
    )
}

pub fn agent_step_schema() -> OutputSchema {
    OutputSchema::new(
        "agent_step",
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["tools", "final"] },
                "tool_calls": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "tool": { "type": "string" },
                            "input": { "type": "object" }
                        },
                        "required": ["tool"]
                    }
                },
                "answer": { "type": "string" }
            },
            "required": ["action"]
        }),
    )
}

pub fn table_selection_schema() -> OutputSchema {
    OutputSchema::new(
        "table_selection",
        json!({
            "type": "object",
            "properties": {
                "date_available": { "type": "string", "enum": ["true", "false"] },
                "requested_date": { "type": "string" },
                "tables": { "type": "array", "items": { "type": "string" } },
                "explanation": { "type": "string" }
            },
            "required": ["date_available", "tables"]
        }),
    )
}

pub fn query_schema() -> OutputSchema {
    OutputSchema::new(
        "sql_query",
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }),
    )
}

pub fn answer_schema() -> OutputSchema {
    OutputSchema::new(
        "answer",
        json!({
            "type": "object",
            "properties": { "answer": { "type": "string" } },
            "required": ["answer"]
        }),
    )
}

/// Reads a bool that may arrive as `true` or `"true"`.
pub fn loose_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Fixed(Value);

    #[async_trait]
    impl StructuredClassifier for Fixed {
        async fn classify(&self, _prompt: &str, _schema: &OutputSchema) -> Result<Value, ClassifyError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Answer {
        answer: String,
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Sure:\n```json\n{\"query\": \"SELECT 1\"}\n```";
        let value = parse_json_block(raw).unwrap();
        assert_eq!(value["query"], "SELECT 1");

        let prose = "The result is {\"answer\": \"ok\"} as requested";
        assert_eq!(parse_json_block(prose).unwrap()["answer"], "ok");
        assert!(parse_json_block("no json here").is_none());
    }

    #[test]
    fn schema_check_reports_missing_keys() {
        let schema = adherence_schema();
        let err = schema.check(&json!({"passed": "true"})).unwrap_err();
        assert!(matches!(err, ClassifyError::Malformed { .. }));
        assert!(err.to_string().contains("reason"));

        assert!(schema.check(&json!({"passed": "true", "reason": "on topic"})).is_ok());
        assert!(schema.check(&json!("true")).is_err());
    }

    #[tokio::test]
    async fn classify_as_deserializes_conforming_output() {
        let classifier = Fixed(json!({"answer": "hold"}));
        let answer: Answer = classify_as(&classifier, "p", &answer_schema()).await.unwrap();
        assert_eq!(answer.answer, "hold");

        let classifier = Fixed(json!({"wrong": 1}));
        let result: Result<Answer, _> = classify_as(&classifier, "p", &answer_schema()).await;
        assert!(result.is_err());
    }

    #[test]
    fn loose_bool_accepts_strings() {
        assert_eq!(loose_bool(Some(&json!("true"))), Some(true));
        assert_eq!(loose_bool(Some(&json!(false))), Some(false));
        assert_eq!(loose_bool(Some(&json!("maybe"))), None);
        assert_eq!(loose_bool(None), None);
    }
}
