//! Capability builder.
//!
//! A build is an agentic loop restricted to sandbox tools.  It owns one
//! sandbox for its whole lifetime, talks to the user only through the
//! [`Relay`], and ends when the model calls `register_capability`, stops
//! without registering, or runs out of rounds.

pub mod prompt;
pub mod queue;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::capabilities::{Catalog, CapabilityStatus};
use crate::config::BuilderConfig;
use crate::models::{ChatMessage, ModelProvider, ProviderResponse, ToolResultPart};
use crate::relay::Relay;
use crate::sandbox::{destroy_quietly, Sandbox, SandboxProvider};
use crate::tools::ToolDef;

pub use queue::{BuildDispatcher, BuildWorkerPool, InlineBuildDispatcher};
use tools::BuildContext;

pub const NOT_REGISTERED: &str = "Builder finished without registering a capability.";
pub const ROUNDS_EXCEEDED: &str = "Builder exceeded maximum iterations.";

/// A request to build one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub build_id: String,
    /// Catalog entry created by `request_capability`, when there is one.
    pub capability_id: Option<String>,
    pub name: Option<String>,
    pub description: String,
}

impl BuildJob {
    /// A free-standing build with a fresh id.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            build_id: uuid::Uuid::new_v4().to_string(),
            capability_id: None,
            name: None,
            description: description.into(),
        }
    }

    /// A build for a requested capability; the build id is the capability id.
    pub fn for_capability(
        capability_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let capability_id = capability_id.into();
        Self {
            build_id: capability_id.clone(),
            capability_id: Some(capability_id),
            name: Some(name.into()),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildOutcome {
    pub build_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Builder {
    provider: Arc<dyn ModelProvider>,
    catalog: Arc<Catalog>,
    relay: Arc<Relay>,
    sandboxes: Arc<dyn SandboxProvider>,
    config: BuilderConfig,
}

impl Builder {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        catalog: Arc<Catalog>,
        relay: Arc<Relay>,
        sandboxes: Arc<dyn SandboxProvider>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            provider,
            catalog,
            relay,
            sandboxes,
            config,
        }
    }

    /// Run a build to completion.  Never fails: every non-success path
    /// pushes exactly one `error` message after the sandbox is gone.
    pub async fn run(&self, job: BuildJob) -> BuildOutcome {
        info!(build_id = %job.build_id, "build started");

        match self.build(&job).await {
            Ok(capability_id) => {
                info!(build_id = %job.build_id, capability_id = %capability_id, "build succeeded");
                crate::gateway::publish_event_json(&serde_json::json!({
                    "type": "build_complete",
                    "build_id": job.build_id,
                    "capability_id": capability_id,
                }));
                BuildOutcome {
                    build_id: job.build_id,
                    success: true,
                    capability_id: Some(capability_id),
                    error: None,
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(build_id = %job.build_id, error = %error, "build failed");
                self.fail(&job, &error);
                BuildOutcome {
                    build_id: job.build_id,
                    success: false,
                    capability_id: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn build(&self, job: &BuildJob) -> anyhow::Result<String> {
        let lifetime = Duration::from_secs(self.config.sandbox_lifetime_secs);
        let sandbox = self
            .sandboxes
            .create(lifetime)
            .await
            .context("failed to create build sandbox")?;

        let result = self.drive(job, sandbox.as_ref()).await;
        destroy_quietly(sandbox.as_ref()).await;
        result
    }

    async fn drive(&self, job: &BuildJob, sandbox: &dyn Sandbox) -> anyhow::Result<String> {
        self.relay.push_progress(
            &job.build_id,
            "Starting build",
            Some("Sandbox created, builder agent starting..."),
        )?;

        let mut ctx = BuildContext {
            build_id: &job.build_id,
            target_capability: job.capability_id.as_deref(),
            sandbox,
            catalog: &self.catalog,
            relay: &self.relay,
            config: &self.config,
            registered: None,
        };

        let functions: Vec<Value> = tools::definitions()
            .iter()
            .map(ToolDef::to_function_def)
            .collect();
        let mut messages = vec![
            ChatMessage::new("system", prompt::BUILDER_SYSTEM_PROMPT),
            ChatMessage::new("user", prompt::initial_request(job)),
        ];

        for round in 0..self.config.max_rounds {
            let (response, _usage) = self
                .provider
                .send_chat_with_functions(&messages, &functions)
                .await
                .context("builder model call failed")?;

            let calls = match response {
                ProviderResponse::Final(text) => {
                    messages.push(ChatMessage::new("assistant", text));
                    Vec::new()
                }
                other => other.into_calls(),
            };
            if calls.is_empty() {
                return ctx
                    .registered
                    .take()
                    .ok_or_else(|| anyhow::anyhow!(NOT_REGISTERED));
            }

            messages.push(ChatMessage::assistant_tool_calls("", &calls));

            // Sequential: every call in a round shares the sandbox.
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let input: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));
                let (content, is_error) = match tools::handle(&call.name, input, &mut ctx).await {
                    Ok(text) => (text, false),
                    Err(e) => (format!("Tool error: {e:#}"), true),
                };
                results.push(ToolResultPart {
                    tool_call_id: call.id.clone(),
                    content,
                    is_error,
                });
            }
            messages.push(ChatMessage::tool_results(results));

            if let Some(id) = ctx.registered.take() {
                return Ok(id);
            }
            tracing::debug!(build_id = %job.build_id, round = round + 1, "builder round finished");
        }

        anyhow::bail!(ROUNDS_EXCEEDED)
    }

    /// Terminal failure: one `error` message, then `building` → `failed`.
    fn fail(&self, job: &BuildJob, error: &str) {
        if let Err(e) = self.relay.push_error(&job.build_id, error) {
            warn!(build_id = %job.build_id, error = %e, "failed to push build error");
        }
        crate::gateway::publish_event_json(&serde_json::json!({
            "type": "build_failed",
            "build_id": job.build_id,
            "error": error,
        }));

        let Some(capability_id) = job.capability_id.as_deref() else {
            return;
        };
        match self.catalog.get(capability_id) {
            Ok(Some(cap)) if cap.status == CapabilityStatus::Building => {
                if let Err(e) = self.catalog.set_status(capability_id, CapabilityStatus::Failed) {
                    warn!(capability_id, error = %e, "failed to mark capability failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(capability_id, error = %e, "failed to load capability"),
        }
    }
}
