//! Tool trait and registry
//!
//! Agents see tools only through this trait. Data providers live behind the
//! financial API service; `HttpTool` is the bridge to it.

use crate::error::OrchestrationError;
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, input: &Value) -> Result<Value>;
}

/// Tool registry for looking up and executing tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names.
    pub fn names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `name: description` lines for prompts, sorted by name.
    pub fn describe(&self) -> String {
        let mut lines: Vec<String> = self
            .tools
            .values()
            .map(|tool| format!("- {}: {}", tool.name(), tool.description()))
            .collect();
        lines.sort();
        lines.join("\n")
    }

    /// Registry restricted to the given names. Unknown names are skipped.
    pub fn subset<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.get(name) {
                registry.register(tool);
            }
        }
        registry
    }
}

/// Pooled client for the financial API service.
#[derive(Clone)]
pub struct FinancialApiClient {
    client: Client,
    base_url: String,
}

impl FinancialApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                OrchestrationError::ToolError(format!(
                    "Financial API request failed for {}: {}",
                    path, e
                ))
            })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| OrchestrationError::ToolError(format!("Invalid JSON response: {}", e)))?;

        if !status.is_success() {
            return Err(OrchestrationError::ToolError(format!(
                "Financial API returned {} for {}: {}",
                status, path, body
            )));
        }

        Ok(body)
    }
}

/// A named tool executed remotely at `/api/v1/tools/{name}`.
pub struct HttpTool {
    name: String,
    description: String,
    api: FinancialApiClient,
}

impl HttpTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, api: FinancialApiClient) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            api,
        }
    }
}

#[async_trait::async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        if !input.is_object() {
            return Err(OrchestrationError::InvalidToolInput(
                "tool input must be a JSON object".to_string(),
            ));
        }

        let response = self
            .api
            .post_json(&format!("/api/v1/tools/{}", self.name), &json!({ "input": input }))
            .await?;

        // The service wraps payloads as {"data": ...}; unwrap when present.
        Ok(response.get("data").cloned().unwrap_or(response))
    }
}

/// Registry with every roster tool bridged to the financial API.
pub fn create_http_registry(base_url: &str, timeout: Duration) -> Result<ToolRegistry> {
    let api = FinancialApiClient::new(base_url, timeout)?;
    let mut registry = ToolRegistry::new();

    for member in crate::team::ANALYSTS {
        for (name, description) in member.tools {
            registry.register(Arc::new(HttpTool::new(*name, *description, api.clone())));
        }
    }

    Ok(registry)
}
