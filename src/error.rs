//! Error types for the advisory orchestrator

use crate::state::ConversationState;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Fatal
    // =============================

    /// The only error that escapes a run. Carries whatever state was built.
    #[error("Step ceiling exceeded: reached {reached} transitions (limit {limit})")]
    StepLimitExceeded {
        limit: usize,
        reached: usize,
        partial: Box<ConversationState>,
    },

    // =============================
    // Component Errors
    // =============================

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Classification error: {0}")]
    Classification(#[from] crate::classifier::ClassifyError),

    #[error("Query error: {0}")]
    Query(#[from] crate::historical::QueryError),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl OrchestrationError {
    /// Partial conversation state for fatal run errors.
    pub fn partial_state(&self) -> Option<&ConversationState> {
        match self {
            OrchestrationError::StepLimitExceeded { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, OrchestrationError::StepLimitExceeded { .. })
    }
}
