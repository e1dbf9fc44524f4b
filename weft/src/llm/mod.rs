//! LLM client abstraction for the reasoning loop.
//!
//! The loop needs one capability: given a message history, produce assistant
//! text. [`MockLlm`] scripts responses for tests; [`ChatOpenAI`] talks to any
//! OpenAI-compatible endpoint.
//!
//! Streaming is optional: `complete_stream` accepts a chunk sender and by
//! default falls back to `complete`, emitting the full text as one chunk.

mod mock;
mod openai;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mock::MockLlm;
pub use openai::ChatOpenAI;

/// One chat message. Plain text roles; tool activity never flows through the
/// LLM channel (action selection is the reasoner's job).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System(content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User(content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant(content.into())
    }

    pub fn content(&self) -> &str {
        match self {
            Self::System(c) | Self::User(c) | Self::Assistant(c) => c,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("api key not found in environment variable: {0}")]
    MissingApiKey(String),
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("llm returned no content")]
    EmptyResponse,
}

/// LLM client: given messages, return assistant text.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// Streaming variant: when `chunk_tx` is `Some`, send text fragments as
    /// they arrive and still return the complete text.
    async fn complete_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<String, LlmError> {
        let content = self.complete(messages).await?;
        if let Some(tx) = chunk_tx {
            if !content.is_empty() {
                let _ = tx.send(content.clone()).await;
            }
        }
        Ok(content)
    }
}
