//! Runtime configuration
//!
//! `OrchestratorConfig` holds the limits of the core. `Settings` adds the
//! collaborator endpoints and is read from the environment (`.env` honoured).

use crate::error::OrchestrationError;
use crate::Result;
use chrono::NaiveDate;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_STEPS: usize = 30;
const DEFAULT_AGENT_MAX_ITERATIONS: u32 = 2;
const DEFAULT_AGENT_TIME_BUDGET_SECS: u64 = 120;
const DEFAULT_RETRY_LIMIT: usize = 2;
const DEFAULT_CLASSIFIER_TIMEOUT_SECS: u64 = 60;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_QUERY_ERRORS: usize = 3;
const DEFAULT_MAX_FORMAT_ERRORS: usize = 3;
const DEFAULT_RUN_LOG_CAPACITY: usize = crate::audit::DEFAULT_RUN_LOG_CAPACITY;

/// Last date covered by the historical database.
pub fn default_data_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 9, 30).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global transition ceiling for one run.
    pub max_steps: usize,
    /// Tool-calling iterations per agent invocation.
    pub agent_max_iterations: u32,
    pub agent_time_budget: Duration,
    /// Cell invocations (and evaluations of each kind) per gated agent.
    pub retry_limit: usize,
    pub classifier_timeout: Duration,
    pub query_timeout: Duration,
    pub data_cutoff: NaiveDate,
    pub max_query_errors: usize,
    pub max_format_errors: usize,
    /// Completed runs kept in memory for the API.
    pub run_log_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            agent_max_iterations: DEFAULT_AGENT_MAX_ITERATIONS,
            agent_time_budget: Duration::from_secs(DEFAULT_AGENT_TIME_BUDGET_SECS),
            retry_limit: DEFAULT_RETRY_LIMIT,
            classifier_timeout: Duration::from_secs(DEFAULT_CLASSIFIER_TIMEOUT_SECS),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            data_cutoff: default_data_cutoff(),
            max_query_errors: DEFAULT_MAX_QUERY_ERRORS,
            max_format_errors: DEFAULT_MAX_FORMAT_ERRORS,
            run_log_capacity: DEFAULT_RUN_LOG_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_steps", self.max_steps == 0),
            ("agent_max_iterations", self.agent_max_iterations == 0),
            ("retry_limit", self.retry_limit == 0),
            ("max_query_errors", self.max_query_errors == 0),
            ("max_format_errors", self.max_format_errors == 0),
            ("run_log_capacity", self.run_log_capacity == 0),
        ];

        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(OrchestrationError::ConfigError(format!(
                "{} must be greater than zero",
                name
            )));
        }

        Ok(())
    }

    /// Defaults overridden by `ADVISOR_*` variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_steps: env_parse("ADVISOR_MAX_STEPS")?.unwrap_or(defaults.max_steps),
            agent_max_iterations: env_parse("ADVISOR_AGENT_MAX_ITERATIONS")?
                .unwrap_or(defaults.agent_max_iterations),
            agent_time_budget: env_parse("ADVISOR_AGENT_TIME_BUDGET_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.agent_time_budget),
            retry_limit: env_parse("ADVISOR_RETRY_LIMIT")?.unwrap_or(defaults.retry_limit),
            classifier_timeout: env_parse("ADVISOR_CLASSIFIER_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.classifier_timeout),
            query_timeout: env_parse("ADVISOR_QUERY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.query_timeout),
            data_cutoff: env_parse("ADVISOR_DATA_CUTOFF")?.unwrap_or(defaults.data_cutoff),
            max_query_errors: env_parse("ADVISOR_MAX_QUERY_ERRORS")?
                .unwrap_or(defaults.max_query_errors),
            max_format_errors: env_parse("ADVISOR_MAX_FORMAT_ERRORS")?
                .unwrap_or(defaults.max_format_errors),
            run_log_capacity: env_parse("ADVISOR_RUN_LOG_CAPACITY")?
                .unwrap_or(defaults.run_log_capacity),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Collaborator endpoints plus core limits.
#[derive(Debug, Clone)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub historical_db_url: Option<String>,
    pub financial_api_base_url: Option<String>,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .ok()
            .map(|raw| {
                raw.parse::<u16>().map_err(|e| {
                    OrchestrationError::ConfigError(format!("invalid PORT '{}': {}", raw, e))
                })
            })
            .transpose()?
            .unwrap_or(8080);

        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            gemini_api_key: non_empty_var("GEMINI_API_KEY"),
            gemini_model: non_empty_var("GEMINI_MODEL")
                .unwrap_or_else(|| crate::gemini::DEFAULT_MODEL.to_string()),
            historical_db_url: non_empty_var("HISTORICAL_DB_URL"),
            financial_api_base_url: non_empty_var("FINANCIAL_API_BASE_URL")
                .or_else(|| non_empty_var("TOOLS_API_BASE_URL")),
            port,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(key) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            OrchestrationError::ConfigError(format!("invalid {} '{}': {}", key, raw, e))
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults_match_documented_limits() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_steps, 30);
        assert_eq!(config.agent_max_iterations, 2);
        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.max_query_errors, 3);
        assert_eq!(config.max_format_errors, 3);
        assert_eq!(config.run_log_capacity, 256);
        assert_eq!(config.data_cutoff.to_string(), "2022-09-30");
        assert_ok!(config.validate());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = OrchestratorConfig {
            retry_limit: 0,
            ..OrchestratorConfig::default()
        };

        let err = assert_err!(config.validate());
        assert!(err.to_string().contains("retry_limit"));
    }

    #[test]
    fn env_values_are_parsed_or_rejected() {
        env::set_var("ADVISOR_TEST_PARSE_OK", " 12 ");
        env::set_var("ADVISOR_TEST_PARSE_BAD", "twelve");

        assert_eq!(assert_ok!(env_parse::<usize>("ADVISOR_TEST_PARSE_OK")), Some(12));
        assert_eq!(assert_ok!(env_parse::<usize>("ADVISOR_TEST_PARSE_UNSET")), None);
        let err = assert_err!(env_parse::<usize>("ADVISOR_TEST_PARSE_BAD"));
        assert!(err.to_string().contains("ADVISOR_TEST_PARSE_BAD"));
    }
}
