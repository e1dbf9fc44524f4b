//! Top-level error type for agent construction and orchestration.
//!
//! Errors that happen *inside* a reasoning step never surface here: they are
//! folded into the step as failed observations (the reasoner may recover).
//! `AgentError` covers the paths where no loop exists yet — configuration,
//! LLM client construction, manager startup — or where the caller cancelled.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("llm: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("manager: {0}")]
    Manager(#[from] crate::manager::ManagerError),

    #[error("cancelled")]
    Cancelled,
}
