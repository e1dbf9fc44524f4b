//! OpenAI-compatible Chat Completions client implementing [`LlmClient`].
//!
//! Works against any endpoint speaking the Chat Completions API (OpenAI,
//! OpenRouter, local proxies) via a custom base URL. The reasoner only needs
//! text in and text out; tool selection happens outside the LLM channel, so
//! no function-calling plumbing lives here.

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::config::LlmSettings;

use super::{LlmClient, LlmError, Message};

#[derive(Debug)]
pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ChatOpenAI {
    /// Build a client with default config (API key from `OPENAI_API_KEY`).
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Build a client with custom config (API key, base URL).
    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Build from [`LlmSettings`], reading the API key from the environment
    /// variable the settings name. Missing key is fatal at startup.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = std::env::var(&settings.api_key_env)
            .map_err(|_| LlmError::MissingApiKey(settings.api_key_env.clone()))?;
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(ref base) = settings.base_url {
            config = config.with_api_base(base.clone());
        }
        Ok(Self::with_config(config, settings.model.clone())
            .with_temperature(settings.temperature)
            .with_max_tokens(settings.max_tokens))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn messages_to_request(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::System(s) => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(s.as_str()),
                ),
                Message::User(s) => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(s.as_str()),
                ),
                Message::Assistant(s) => {
                    ChatCompletionRequestMessage::Assistant((s.as_str()).into())
                }
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<async_openai::types::chat::CreateChatCompletionRequest, LlmError> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(Self::messages_to_request(messages));
        if stream {
            args.stream(true);
        }
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        if let Some(n) = self.max_tokens {
            args.max_completion_tokens(n);
        }
        args.build()
            .map_err(|e| LlmError::Request(format!("request build failed: {}", e)))
    }
}

#[async_trait]
impl LlmClient for ChatOpenAI {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = self.build_request(messages, false)?;
        debug!(model = %self.model, message_count = messages.len(), "chat completion");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)?;
        match choice.message.content {
            Some(content) if !content.is_empty() => Ok(content),
            _ => Err(LlmError::EmptyResponse),
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<String, LlmError> {
        let Some(chunk_tx) = chunk_tx else {
            return self.complete(messages).await;
        };

        let request = self.build_request(messages, true)?;
        debug!(model = %self.model, message_count = messages.len(), "chat completion (stream)");
        let mut stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let mut full_content = String::new();
        while let Some(result) = stream.next().await {
            let response = result.map_err(|e| LlmError::Request(e.to_string()))?;
            for choice in response.choices {
                if let Some(ref content) = choice.delta.content {
                    if !content.is_empty() {
                        full_content.push_str(content);
                        let _ = chunk_tx.send(content.clone()).await;
                    }
                }
            }
        }
        if full_content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(full_content)
    }
}
