//! OpenAI chat-completions provider.
//!
//! The request/response helpers here are shared with
//! [`super::openai_compat`].

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{ChatMessage, ModelProvider, ProviderResponse, TokenUsage};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

const LABEL: &str = "OpenAI API";

pub(crate) fn http_client() -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(90))
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

/// Request body.  Function definitions are wrapped into the `tools` format.
pub(crate) fn chat_body(model: &str, messages: &[ChatMessage], functions: &[Value]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": super::serialize_messages(messages),
    });
    if !functions.is_empty() {
        body["tools"] = functions
            .iter()
            .map(|f| json!({ "type": "function", "function": f }))
            .collect();
        body["tool_choice"] = json!("auto");
    }
    body
}

pub(crate) fn parse_completion(json: &Value) -> (ProviderResponse, Option<TokenUsage>) {
    let usage = super::parse_token_usage(json);
    match super::parse_tool_calls(json) {
        Some(calls) => (calls, usage),
        None => (ProviderResponse::Final(completion_text(json)), usage),
    }
}

pub(crate) fn completion_text(json: &Value) -> String {
    json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// POST a chat body and return the decoded JSON.
///
/// Non-2xx responses fail with `"<label> returned <status>: <body>"`; the
/// provider manager reads the status from that text to decide on retries.
pub(crate) async fn post_chat(
    client: &Client,
    endpoint: &str,
    api_key: &str,
    label: &str,
    body: &Value,
) -> anyhow::Result<Value> {
    let mut req = client.post(endpoint).json(body);
    if !api_key.is_empty() {
        req = req.bearer_auth(api_key);
    }
    let resp = req.send().await?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("{label} returned {status}: {text}");
    }
    Ok(resp.json().await?)
}

/// Provider for the hosted OpenAI API (or an endpoint override).
pub struct OpenAIProvider {
    api_key: String,
    endpoint: String,
    client: Client,
    model: String,
}

impl OpenAIProvider {
    pub fn with_config(api_key: String, endpoint: String, model: String) -> anyhow::Result<Self> {
        Ok(Self {
            api_key,
            endpoint,
            client: http_client()?,
            model,
        })
    }

    async fn complete(&self, messages: &[ChatMessage], functions: &[Value]) -> anyhow::Result<Value> {
        let body = chat_body(&self.model, messages, functions);
        post_chat(&self.client, &self.endpoint, &self.api_key, LABEL, &body).await
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn send_chat(&self, messages: &[ChatMessage]) -> Result<String, anyhow::Error> {
        let json = self.complete(messages, &[]).await?;
        Ok(completion_text(&json))
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        let json = self.complete(messages, functions).await?;
        Ok(parse_completion(&json))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
