//! Financial Advisory Orchestrator
//!
//! A multi-agent analysis core that:
//! - Routes each question through a supervisor to specialised analysts
//! - Re-runs an analyst until its tools were covered and it stayed on topic
//! - Answers historical questions through a guarded, read-only SQL workflow
//! - Stops every run at a hard step ceiling
//!
//! RUN LOOP:
//! SUPERVISOR → AGENT (RUN → EVAL TOOLS → EVAL ADHERENCE) → SUPERVISOR → … → SYNTHESIZE

pub mod agent;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod gate;
pub mod gemini;
pub mod historical;
pub mod mock;
pub mod models;
pub mod observer;
pub mod planner;
pub mod prompts;
pub mod state;
pub mod synthesis;
pub mod team;
pub mod tools;
pub mod verification;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use agent::{Collaborators, Orchestrator, RunReport};
pub use classifier::{ClassifyError, OutputSchema, StructuredClassifier};
pub use config::{OrchestratorConfig, Settings};
pub use models::{AgentKind, InvestmentProfile, Message, NextAction, Producer};
pub use observer::{RunObserver, TracingObserver};
pub use state::ConversationState;
