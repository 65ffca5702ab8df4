//! Generic OpenAI-compatible provider.
//!
//! For self-hosted or third-party servers speaking the chat completions
//! protocol (Ollama, vLLM, LM Studio, OpenRouter, Groq, ...).  The
//! endpoint is mandatory and the key optional:
//!
//! ```yaml
//! models:
//!   - id: local
//!     provider: ollama
//!     model: llama3
//!     endpoint: http://localhost:11434/v1/chat/completions
//! ```

use std::any::Any;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::openai::{chat_body, completion_text, http_client, parse_completion, post_chat};
use super::{ChatMessage, ModelProvider, ProviderResponse, TokenUsage};

const LABEL: &str = "OpenAI-compat API";

pub struct OpenAICompatProvider {
    api_key: String,
    endpoint: String,
    model: String,
    client: Client,
}

impl OpenAICompatProvider {
    /// `api_key` may be empty for local servers that don't require auth.
    pub fn new(endpoint: String, api_key: String, model: String) -> anyhow::Result<Self> {
        Ok(Self {
            api_key,
            endpoint,
            model,
            client: http_client()?,
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    async fn send_chat(&self, messages: &[ChatMessage]) -> Result<String, anyhow::Error> {
        let body = chat_body(&self.model, messages, &[]);
        let json = post_chat(&self.client, &self.endpoint, &self.api_key, LABEL, &body).await?;
        Ok(completion_text(&json))
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        let body = chat_body(&self.model, messages, functions);
        let json = post_chat(&self.client, &self.endpoint, &self.api_key, LABEL, &body).await?;
        Ok(parse_completion(&json))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
