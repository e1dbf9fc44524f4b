//! Scripted LLM for tests: pops queued responses and records every prompt.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{LlmClient, LlmError, Message};

/// Returns queued responses in order; repeats the last one when the queue
/// runs dry. Prompts are recorded for assertion.
pub struct MockLlm {
    responses: Mutex<Vec<String>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always answers the same text.
    pub fn always(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Every message list this mock has been invoked with.
    pub fn recorded_calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let mut responses = self
            .responses
            .lock()
            .map_err(|_| LlmError::Request("mock poisoned".into()))?;
        if responses.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        if responses.len() == 1 {
            return Ok(responses[0].clone());
        }
        Ok(responses.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pops_in_order_then_repeats_last() {
        let llm = MockLlm::new(vec!["one".into(), "two".into()]);
        assert_eq!(llm.complete(&[Message::user("a")]).await.unwrap(), "one");
        assert_eq!(llm.complete(&[Message::user("b")]).await.unwrap(), "two");
        assert_eq!(llm.complete(&[Message::user("c")]).await.unwrap(), "two");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_queue_errors() {
        let llm = MockLlm::new(vec![]);
        assert!(matches!(
            llm.complete(&[Message::user("a")]).await,
            Err(LlmError::EmptyResponse)
        ));
    }
}
