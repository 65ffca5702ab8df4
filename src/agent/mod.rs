//! Interactive agent: the agentic loop and the session wrapper around it.
//!
//! [`run_agentic_loop`] drives model rounds over a [`ToolTable`] until the
//! model answers without tools, asks the user a question, or the round
//! budget runs out.  [`Agent`] rebuilds the tool table from the catalog on
//! every turn and hands build requests to a [`BuildDispatcher`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::builder::{BuildDispatcher, BuildJob};
use crate::capabilities::Catalog;
use crate::config::AgentConfig;
use crate::models::{ChatMessage, FunctionCallItem, ModelProvider, ProviderResponse, ToolResultPart};
use crate::tools::{self, ToolContext, ToolTable, ASK_USER, REQUEST_CAPABILITY};

pub const LOOP_FALLBACK: &str = "I got a bit caught in a loop there. Let me try a different approach.";
pub const MODEL_FALLBACK: &str = "I'm having a moment. Let me gather my thoughts.";
pub const AWAITING_USER: &str = "[Waiting for user response]";

const DEFAULT_QUESTION: &str = "Could you tell me more?";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, capable assistant. Keep replies short and \
conversational. You can use tools. When the user asks for something you have no tool for, call \
lookup_capability to check the catalog; if nothing fits, call request_capability with a snake_case \
name and a detailed description so a new capability gets built, then tell the user it is on its \
way. Tools prefixed with cap_ are capabilities built earlier; call them directly. Use ask_user \
when a request is ambiguous. Use store_memory for facts the user wants remembered and \
recall_memory to look them up.";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress signal emitted around every tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    ToolStart {
        name: String,
        input: Value,
    },
    ToolResult {
        name: String,
        result: String,
        is_error: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ToolEvent);
}

/// Publishes tool events on the gateway broadcast channel.
pub struct GatewayEvents;

impl EventSink for GatewayEvents {
    fn emit(&self, event: ToolEvent) {
        match serde_json::to_value(&event) {
            Ok(v) => crate::gateway::publish_event_json(&v),
            Err(e) => warn!(error = %e, "failed to serialize tool event"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop outcome
// ---------------------------------------------------------------------------

/// Record of a single tool invocation within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<String>,
    /// A capability build the caller must launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildJob>,
}

// ---------------------------------------------------------------------------
// Agentic loop
// ---------------------------------------------------------------------------

/// Run up to `max_rounds` model invocations.  Never fails: transport errors
/// and budget exhaustion produce canned replies.
pub async fn run_agentic_loop(
    provider: &dyn ModelProvider,
    system_prompt: &str,
    history: &[ChatMessage],
    table: &ToolTable,
    ctx: &ToolContext,
    events: Arc<dyn EventSink>,
    max_rounds: usize,
) -> LoopOutcome {
    let functions = table.function_defs();
    let table = Arc::new(table.clone());

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::new("system", system_prompt));
    messages.extend_from_slice(history);

    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
    let mut build: Option<BuildJob> = None;

    for round in 0..max_rounds {
        let response = match provider.send_chat_with_functions(&messages, &functions).await {
            Ok((response, _usage)) => response,
            Err(e) => {
                warn!(round, error = %e, "model call failed, using fallback reply");
                return LoopOutcome {
                    text: MODEL_FALLBACK.to_string(),
                    tool_calls,
                    pending_question: None,
                    build,
                };
            }
        };

        let calls = match response {
            ProviderResponse::Final(text) => {
                debug!(round, "model answered without tools");
                return LoopOutcome {
                    text,
                    tool_calls,
                    pending_question: None,
                    build,
                };
            }
            other => other.into_calls(),
        };
        if calls.is_empty() {
            return LoopOutcome {
                text: String::new(),
                tool_calls,
                pending_question: None,
                build,
            };
        }

        messages.push(ChatMessage::assistant_tool_calls("", &calls));

        let records = run_round(&calls, &table, ctx, &events).await;

        let mut pending_question = None;
        let mut results = Vec::with_capacity(records.len());
        for (call, record) in calls.iter().zip(records) {
            if call.name == ASK_USER {
                pending_question = Some(
                    record
                        .input
                        .get("question")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_QUESTION)
                        .to_string(),
                );
            } else if call.name == REQUEST_CAPABILITY && !record.is_error {
                if let Some(job) = build_request(&record) {
                    info!(build_id = %job.build_id, "capability build requested");
                    build = Some(job);
                }
            }
            results.push(ToolResultPart {
                tool_call_id: call.id.clone(),
                content: record.result.clone(),
                is_error: record.is_error,
            });
            tool_calls.push(record);
        }
        messages.push(ChatMessage::tool_results(results));

        if let Some(question) = pending_question {
            return LoopOutcome {
                text: question.clone(),
                tool_calls,
                pending_question: Some(question),
                build,
            };
        }
    }

    warn!(max_rounds, "tool round budget exhausted");
    LoopOutcome {
        text: LOOP_FALLBACK.to_string(),
        tool_calls,
        pending_question: None,
        build,
    }
}

/// Execute one round of tool calls concurrently; records come back in
/// request order.
async fn run_round(
    calls: &[FunctionCallItem],
    table: &Arc<ToolTable>,
    ctx: &ToolContext,
    events: &Arc<dyn EventSink>,
) -> Vec<ToolCallRecord> {
    let mut handles = Vec::with_capacity(calls.len());
    for call in calls {
        let name = call.name.clone();
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        let table = table.clone();
        let ctx = ctx.clone();
        let events = events.clone();

        handles.push(tokio::spawn(async move {
            events.emit(ToolEvent::ToolStart {
                name: name.clone(),
                input: input.clone(),
            });

            let timer = Instant::now();
            let (result, is_error) = if name == ASK_USER {
                (AWAITING_USER.to_string(), false)
            } else {
                match tools::dispatch(&table, &name, input.clone(), &ctx).await {
                    Ok(text) => (text, false),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "tool execution failed, feeding error back");
                        (format!("{e:#}"), true)
                    }
                }
            };
            let duration_ms = timer.elapsed().as_millis() as u64;

            events.emit(ToolEvent::ToolResult {
                name: name.clone(),
                result: result.clone(),
                is_error,
            });

            ToolCallRecord {
                name,
                input,
                result,
                is_error,
                duration_ms,
            }
        }));
    }

    let mut records = Vec::with_capacity(handles.len());
    for (call, handle) in calls.iter().zip(handles) {
        let record = match handle.await {
            Ok(record) => record,
            Err(e) => ToolCallRecord {
                name: call.name.clone(),
                input: serde_json::from_str(&call.arguments).unwrap_or(json!({})),
                result: format!("tool task failed: {e}"),
                is_error: true,
                duration_ms: 0,
            },
        };
        records.push(record);
    }
    records
}

/// A `request_capability` result of `{status: "building"}` becomes a build job.
fn build_request(record: &ToolCallRecord) -> Option<BuildJob> {
    let parsed: Value = serde_json::from_str(&record.result).ok()?;
    if parsed.get("status").and_then(Value::as_str) != Some("building") {
        return None;
    }
    let capability_id = parsed.get("capability_id").and_then(Value::as_str)?;
    let name = parsed
        .get("capability_name")
        .or_else(|| record.input.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let description = record
        .input
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(BuildJob::for_capability(capability_id, name, description))
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Shared, stateless turn runner.
pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    catalog: Arc<Catalog>,
    tools: ToolContext,
    builds: Arc<dyn BuildDispatcher>,
    events: Arc<dyn EventSink>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: ToolContext,
        builds: Arc<dyn BuildDispatcher>,
        events: Arc<dyn EventSink>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            catalog: tools.catalog.clone(),
            tools,
            builds,
            events,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Answer the last message of `history`.  The tool table is assembled
    /// from a fresh catalog snapshot; a requested build is submitted before
    /// returning.
    pub async fn respond(&self, history: &[ChatMessage]) -> anyhow::Result<LoopOutcome> {
        let snapshot = self.catalog.list(None)?;
        let table = tools::assemble(&snapshot);

        let start = history.len().saturating_sub(self.config.history_limit.max(1));
        let outcome = run_agentic_loop(
            self.provider.as_ref(),
            self.config
                .system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT),
            &history[start..],
            &table,
            &self.tools,
            self.events.clone(),
            self.config.max_rounds,
        )
        .await;

        if let Some(job) = outcome.build.clone() {
            if let Err(e) = self.builds.submit(job).await {
                warn!(error = %e, "failed to submit build");
            }
        }
        Ok(outcome)
    }
}

/// A conversation with bounded history.
pub struct Session {
    agent: Arc<Agent>,
    history: Vec<ChatMessage>,
}

impl Session {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Run one user turn and record both sides of the exchange.
    pub async fn send(&mut self, text: &str) -> anyhow::Result<LoopOutcome> {
        self.history.push(ChatMessage::new("user", text));
        let outcome = self.agent.respond(&self.history).await?;
        self.history.push(ChatMessage::new("assistant", outcome.text.clone()));

        let limit = self.agent.config().history_limit.max(1);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(input: Value, result: Value) -> ToolCallRecord {
        ToolCallRecord {
            name: REQUEST_CAPABILITY.into(),
            input,
            result: result.to_string(),
            is_error: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn building_result_becomes_job() {
        let job = build_request(&record(
            json!({"name": "weather_lookup", "description": "weather"}),
            json!({"status": "building", "capability_id": "c1", "capability_name": "weather_lookup"}),
        ))
        .unwrap();
        assert_eq!(job.build_id, "c1");
        assert_eq!(job.capability_id.as_deref(), Some("c1"));
        assert_eq!(job.name.as_deref(), Some("weather_lookup"));
        assert_eq!(job.description, "weather");
    }

    #[test]
    fn existing_capability_is_not_built() {
        let r = record(
            json!({"name": "x", "description": "y"}),
            json!({"status": "already_exists", "capability_id": "c1"}),
        );
        assert!(build_request(&r).is_none());
    }

    #[test]
    fn tool_event_serializes_with_type_tag() {
        let v = serde_json::to_value(ToolEvent::ToolResult {
            name: "t".into(),
            result: "r".into(),
            is_error: true,
        })
        .unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["is_error"], true);
    }
}
