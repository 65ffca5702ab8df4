//! Model providers.
//!
//! Both agent loops talk to a [`ModelProvider`].  The runtime hands them a
//! [`ProviderManager`], which tries each configured model in turn with
//! retries; the concrete backends speak the OpenAI chat-completions
//! protocol ([`OpenAIProvider`], [`OpenAICompatProvider`]).

pub mod openai;
pub mod openai_compat;

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

pub use openai::OpenAIProvider;
pub use openai_compat::OpenAICompatProvider;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The outcome of one tool call, fed back to the model.
#[derive(Debug, Clone)]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// One entry of a conversation.
///
/// Assistant turns that invoked tools carry `tool_calls`; the answer to a
/// whole tool round is a single message carrying `tool_results`.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    pub tool_calls: Option<Vec<FunctionCallItem>>,
    pub tool_results: Option<Vec<ToolResultPart>>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: &[FunctionCallItem]) -> Self {
        Self {
            tool_calls: Some(calls.to_vec()),
            ..Self::new("assistant", content)
        }
    }

    pub fn tool_results(results: Vec<ToolResultPart>) -> Self {
        Self {
            tool_results: Some(results),
            ..Self::new("tool", "")
        }
    }
}

/// Wire form of a conversation.  A tool-results message expands into one
/// `role: "tool"` entry per call.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        if let Some(results) = &m.tool_results {
            out.extend(results.iter().map(|r| {
                json!({ "role": "tool", "tool_call_id": r.tool_call_id, "content": r.content })
            }));
            continue;
        }
        match &m.tool_calls {
            Some(calls) => {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                // content must be null, not "", next to tool_calls
                let content = if m.content.is_empty() {
                    Value::Null
                } else {
                    json!(m.content)
                };
                out.push(json!({ "role": m.role, "content": content, "tool_calls": calls }));
            }
            None => out.push(json!({ "role": m.role, "content": m.content })),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Plain completion: the assistant's text reply.
    async fn send_chat(&self, messages: &[ChatMessage]) -> Result<String, anyhow::Error>;

    /// Completion with tool definitions (`{name, description, parameters}`).
    ///
    /// Providers without function calling fall back to [`send_chat`](Self::send_chat)
    /// and always answer with [`ProviderResponse::Final`].
    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        _functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        let reply = self.send_chat(messages).await?;
        Ok((ProviderResponse::Final(reply), None))
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub fn parse_token_usage(json: &Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    let field = |name: &str| usage[name].as_u64().unwrap_or(0);
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    })
}

/// Tool calls requested by a chat completion, if any.  Understands both
/// `tool_calls` and the older single `function_call` field.
pub fn parse_tool_calls(json: &Value) -> Option<ProviderResponse> {
    let message = json.get("choices")?.get(0)?.get("message")?;

    let str_field = |v: &Value, key: &str, default: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };

    if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
        let mut items: Vec<FunctionCallItem> = tool_calls
            .iter()
            .filter_map(|tc| {
                let func = tc.get("function")?;
                Some(FunctionCallItem {
                    id: str_field(tc, "id", ""),
                    name: func.get("name")?.as_str()?.to_string(),
                    arguments: str_field(func, "arguments", "{}"),
                })
            })
            .collect();
        if items.len() == 1 {
            let FunctionCallItem { id, name, arguments } = items.remove(0);
            return Some(ProviderResponse::FunctionCall { id, name, arguments });
        }
        if !items.is_empty() {
            return Some(ProviderResponse::MultiFunctionCall(items));
        }
    }

    let fc = message.get("function_call")?;
    Some(ProviderResponse::FunctionCall {
        id: String::new(),
        name: str_field(fc, "name", ""),
        arguments: str_field(fc, "arguments", "{}"),
    })
}

// ---------------------------------------------------------------------------
// ProviderResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FunctionCallItem {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded arguments.
    pub arguments: String,
}

#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Final(String),
    FunctionCall {
        id: String,
        name: String,
        arguments: String,
    },
    MultiFunctionCall(Vec<FunctionCallItem>),
}

impl ProviderResponse {
    /// Normalise into a list of calls; empty for a final reply.
    ///
    /// Calls without an id get a synthetic `call_<n>` so results can
    /// still be matched back.
    pub fn into_calls(self) -> Vec<FunctionCallItem> {
        let mut calls = match self {
            ProviderResponse::Final(_) => Vec::new(),
            ProviderResponse::FunctionCall { id, name, arguments } => {
                vec![FunctionCallItem { id, name, arguments }]
            }
            ProviderResponse::MultiFunctionCall(items) => items,
        };
        for (i, call) in calls.iter_mut().enumerate() {
            if call.id.is_empty() {
                call.id = format!("call_{i}");
            }
        }
        calls
    }
}

// ---------------------------------------------------------------------------
// ProviderManager
// ---------------------------------------------------------------------------

/// Manages an ordered list of providers with per-provider retry and
/// automatic fallback to the next provider on exhaustion.
///
/// Implements [`ModelProvider`] itself so it can be used transparently
/// anywhere a single provider is expected.
pub struct ProviderManager {
    providers: Vec<Box<dyn ModelProvider>>,
    max_retries: usize,
    /// Whether the providers support OpenAI-style function calling.
    pub supports_functions: bool,
}

impl ProviderManager {
    /// Create a new manager.
    ///
    /// * `providers` – ordered list (first = preferred).
    /// * `max_retries` – attempts per provider (clamped to ≥ 1).
    pub fn new(providers: Vec<Box<dyn ModelProvider>>, max_retries: usize) -> Self {
        Self::new_with_functions(providers, max_retries, true)
    }

    /// Create a new manager with an explicit function-calling flag.
    pub fn new_with_functions(
        providers: Vec<Box<dyn ModelProvider>>,
        max_retries: usize,
        supports_functions: bool,
    ) -> Self {
        Self {
            providers,
            max_retries: max_retries.max(1),
            supports_functions,
        }
    }

    /// Number of configured providers.
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Send chat messages with automatic retries and provider fallback.
    ///
    /// For each provider in order, retries up to `max_attempts` times
    /// with exponential backoff (100 ms × 2^attempt).  Falls through to
    /// the next provider when all attempts are exhausted.
    ///
    /// Permanent errors (400, 401, 403, 404, 422) skip remaining retries
    /// for that provider and immediately fall through to the next one.
    pub async fn send_chat_with_retry(
        &self,
        messages: &[ChatMessage],
        max_attempts: usize,
    ) -> Result<String, anyhow::Error> {
        self.with_retry(max_attempts, |p| Box::pin(p.send_chat(messages)))
            .await
    }

    /// Function-calling request with the same retry/fallback policy.
    pub async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        if !self.supports_functions || functions.is_empty() {
            let reply = self.send_chat(messages).await?;
            return Ok((ProviderResponse::Final(reply), None));
        }
        self.with_retry(self.max_retries, |p| {
            Box::pin(p.send_chat_with_functions(messages, functions))
        })
        .await
    }

    async fn with_retry<'a, T>(
        &'a self,
        max_attempts: usize,
        call: impl Fn(
            &'a dyn ModelProvider,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
    ) -> anyhow::Result<T> {
        let attempts = max_attempts.max(1);
        let mut last_err = anyhow::anyhow!("no providers configured");

        for (idx, provider) in self.providers.iter().enumerate() {
            for attempt in 0..attempts {
                match call(provider.as_ref()).await {
                    Ok(reply) => return Ok(reply),
                    Err(e) => {
                        let is_permanent = is_permanent_error(&e);
                        warn!(
                            provider_idx = idx,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            permanent = is_permanent,
                            error = %e,
                            "provider call failed"
                        );
                        last_err = e;

                        if is_permanent {
                            break;
                        }

                        if attempt + 1 < attempts {
                            let delay = Duration::from_millis(100 * 2u64.pow(attempt as u32));
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            warn!(provider_idx = idx, "all retries exhausted, trying next provider");
        }

        Err(last_err.context("all providers exhausted"))
    }
}

/// Check if an error represents a permanent HTTP failure that should not
/// be retried (auth errors, bad request, not found).
///
/// Parses status codes from error messages like "OpenAI API returned 401 …".
fn is_permanent_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    ["400", "401", "403", "404", "422"]
        .iter()
        .any(|code| msg.contains(&format!("returned {code}")))
}

#[async_trait]
impl ModelProvider for ProviderManager {
    async fn send_chat(&self, messages: &[ChatMessage]) -> Result<String, anyhow::Error> {
        self.send_chat_with_retry(messages, self.max_retries).await
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        ProviderManager::send_chat_with_functions(self, messages, functions).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// Development fallback used when no model is configured: echoes the last
/// user message and never requests tools.
pub struct StubProvider;

#[async_trait]
impl ModelProvider for StubProvider {
    async fn send_chat(&self, messages: &[ChatMessage]) -> Result<String, anyhow::Error> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(format!("[stub] echo: {last_user}"))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Provider factory
// ---------------------------------------------------------------------------

/// Build a concrete provider from one `models` entry.
pub fn build_provider(mc: &crate::config::ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    let model_name = mc.model.as_deref().unwrap_or(&mc.id).to_string();
    let provider_id = mc.provider.as_str();
    if matches!(
        provider_id,
        "openai-compat" | "openai_compat" | "compat" | "openrouter" | "ollama" | "groq"
            | "together" | "fireworks" | "mistral" | "lmstudio" | "vllm" | "deepseek" | "xai"
    ) {
        // Must come before the plain "openai" match.
        let endpoint = mc
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("model '{}': {provider_id} requires an endpoint", mc.id))?;
        let key = resolve_config_key(mc.api_key.as_deref(), provider_id);
        Ok(Box::new(OpenAICompatProvider::new(endpoint, key, model_name)?))
    } else if provider_id == "openai" {
        let key = resolve_config_key(mc.api_key.as_deref(), provider_id);
        if key.is_empty() {
            anyhow::bail!("model '{}': no API key (set api_key or OPENAI_API_KEY)", mc.id);
        }
        let endpoint = mc
            .endpoint
            .clone()
            .unwrap_or_else(|| openai::DEFAULT_ENDPOINT.to_string());
        Ok(Box::new(OpenAIProvider::with_config(key, endpoint, model_name)?))
    } else if provider_id == "stub" {
        Ok(Box::new(StubProvider))
    } else {
        anyhow::bail!("model '{}': unknown provider '{provider_id}'", mc.id)
    }
}

/// Build the [`ProviderManager`] for the runtime: the primary model
/// followed by every other configured model as fallback.  With no usable
/// model the manager wraps a [`StubProvider`].
pub fn build_provider_manager_from_config(cfg: &crate::config::Config) -> ProviderManager {
    let primary = cfg.primary_model();
    let primary_id = primary.map(|p| p.id.as_str());
    let ordered = primary
        .into_iter()
        .chain(cfg.models.iter().filter(|m| Some(m.id.as_str()) != primary_id));

    let mut providers: Vec<Box<dyn ModelProvider>> = Vec::new();
    for mc in ordered {
        match build_provider(mc) {
            Ok(p) => providers.push(p),
            Err(e) => warn!(model = %mc.id, error = %e, "skipping model"),
        }
    }

    if providers.is_empty() {
        warn!("no usable model configured, using stub provider");
        return ProviderManager::new_with_functions(vec![Box::new(StubProvider)], 1, false);
    }
    ProviderManager::new(providers, 3)
}

/// Resolve an API key: config value → env var → empty string.
///
/// If the config value starts with `$`, it's treated as an env-var reference.
fn resolve_config_key(config_key: Option<&str>, provider_id: &str) -> String {
    if let Some(k) = config_key {
        if let Some(var) = k.strip_prefix('$') {
            return std::env::var(var).unwrap_or_default();
        }
        if !k.is_empty() {
            return k.to_string();
        }
    }
    let env_name = format!("{}_API_KEY", provider_id.to_uppercase().replace('-', "_"));
    std::env::var(env_name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn model(provider: &str, endpoint: Option<&str>) -> ModelConfig {
        ModelConfig {
            id: "m".into(),
            provider: provider.into(),
            model: Some("test-model".into()),
            api_key: Some("sk-test".into()),
            endpoint: endpoint.map(String::from),
        }
    }

    #[test]
    fn resolve_config_key_plain_value() {
        assert_eq!(resolve_config_key(Some("my-secret"), "test"), "my-secret");
    }

    #[test]
    fn resolve_config_key_env_var_syntax() {
        std::env::set_var("TOOLSMITH_TEST_RESOLVE_KEY", "from_env");
        assert_eq!(
            resolve_config_key(Some("$TOOLSMITH_TEST_RESOLVE_KEY"), "test"),
            "from_env"
        );
        std::env::remove_var("TOOLSMITH_TEST_RESOLVE_KEY");
    }

    #[test]
    fn resolve_config_key_missing_returns_empty() {
        assert_eq!(resolve_config_key(None, "nonexistent_provider_xyz"), "");
    }

    #[test]
    fn compat_provider_requires_endpoint() {
        assert!(build_provider(&model("ollama", None)).is_err());
        let p = build_provider(&model("ollama", Some("http://localhost:11434/v1/chat/completions")))
            .unwrap();
        assert!(p.as_any().downcast_ref::<OpenAICompatProvider>().is_some());
    }

    #[test]
    fn unusable_models_fall_back_to_stub() {
        let cfg = crate::config::Config {
            models: vec![model("mystery", None)],
            ..Default::default()
        };
        let pm = build_provider_manager_from_config(&cfg);
        assert_eq!(pm.provider_count(), 1);
        assert!(!pm.supports_functions);
    }

    #[test]
    fn combined_tool_results_serialize_as_consecutive_messages() {
        let calls = vec![
            FunctionCallItem { id: "a".into(), name: "x".into(), arguments: "{}".into() },
            FunctionCallItem { id: "b".into(), name: "y".into(), arguments: "{}".into() },
        ];
        let msgs = vec![
            ChatMessage::assistant_tool_calls("", &calls),
            ChatMessage::tool_results(vec![
                ToolResultPart { tool_call_id: "a".into(), content: "1".into(), is_error: false },
                ToolResultPart { tool_call_id: "b".into(), content: "2".into(), is_error: true },
            ]),
        ];
        let out = serialize_messages(&msgs);
        assert_eq!(out.len(), 3);
        assert!(out[0]["content"].is_null());
        assert_eq!(out[0]["tool_calls"][1]["function"]["name"], "y");
        assert_eq!(out[2]["role"], "tool");
        assert_eq!(out[2]["tool_call_id"], "b");
    }

    #[test]
    fn into_calls_fills_missing_ids() {
        let calls = ProviderResponse::FunctionCall {
            id: String::new(),
            name: "f".into(),
            arguments: "{}".into(),
        }
        .into_calls();
        assert_eq!(calls[0].id, "call_0");
        assert!(ProviderResponse::Final("x".into()).into_calls().is_empty());
    }
}
