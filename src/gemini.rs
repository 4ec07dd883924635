//! Gemini API client
//!
//! Structured classifier backend. Requests JSON output and tolerates fenced
//! or prose-wrapped JSON in the reply.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::classifier::{parse_json_block, ClassifyError, OutputSchema, StructuredClassifier};
use crate::error::OrchestrationError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const SYSTEM_PROMPT: &str = "You are part of a financial advisory system. \
Follow the instructions of each request exactly and answer with a single JSON object matching the requested format.";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> crate::Result<Self> {
        if api_key.trim().is_empty() {
            return Err(OrchestrationError::ConfigError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    fn url(&self) -> String {
        format!("{}/{}:generateContent?key={}", BASE_URL, self.model, self.api_key)
    }

    /// Raw text of the first candidate.
    async fn generate(&self, prompt: &str) -> Result<String, ClassifyError> {
        let request = build_request(prompt);

        let response = self
            .client
            .post(self.url())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                ClassifyError::Unavailable(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            let detail = format!("Gemini API returned {}: {}", status, error_text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                ClassifyError::Unavailable(detail)
            } else {
                ClassifyError::Backend(detail)
            });
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            ClassifyError::Backend(format!("Gemini parse error: {}", e))
        })?;

        first_text(gemini_response)
    }
}

fn build_request(prompt: &str) -> GeminiRequest {
    GeminiRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: prompt.to_string(),
            }],
        }],
        generation_config: GenerationConfig {
            temperature: 0.0,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 2048,
            response_mime_type: "application/json".to_string(),
        },
        system_instruction: SystemInstruction {
            parts: vec![Part {
                text: SYSTEM_PROMPT.to_string(),
            }],
        },
    }
}

fn first_text(response: GeminiResponse) -> Result<String, ClassifyError> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ClassifyError::Backend("No response from Gemini API".to_string()))?;

    debug!(finish_reason = ?candidate.finish_reason, "Gemini candidate received");

    candidate
        .content
        .and_then(|c| c.parts.into_iter().next())
        .map(|p| p.text)
        .ok_or_else(|| ClassifyError::Backend("Empty response from Gemini".to_string()))
}

#[async_trait]
impl StructuredClassifier for GeminiClient {
    async fn classify(&self, prompt: &str, schema: &OutputSchema) -> Result<Value, ClassifyError> {
        let text = self.generate(prompt).await?;

        let value = parse_json_block(&text).ok_or_else(|| ClassifyError::Malformed {
            schema: schema.name.to_string(),
            detail: format!("no JSON object in reply: {}", text.chars().take(200).collect::<String>()),
        })?;

        schema.check(&value)?;
        Ok(value)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    response_mime_type: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}
