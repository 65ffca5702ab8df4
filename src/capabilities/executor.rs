//! Runs an active capability inside a short-lived sandbox.
//!
//! The persisted `main.py` is driven by a small Python wrapper that decides
//! once whether `run` takes `(args)` or `(args, context)`, calls it, and
//! prints a `__RESULT__` marker followed by one JSON line
//! `{"response": str, "storage"?: object}`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{Catalog, CapabilityStatus, SecretStore, StorageStore};
use crate::config::ExecutorConfig;
use crate::sandbox::{self, Sandbox, SandboxProvider};

pub const RESULT_MARKER: &str = "__RESULT__";

const WRAPPER: &str = r#"import inspect, json

from main import run

with open("__args.json") as f:
    args = json.load(f)
with open("__context.json") as f:
    context = json.load(f)

try:
    params = list(inspect.signature(run).parameters.values())
    positional = [p for p in params if p.kind in (p.POSITIONAL_ONLY, p.POSITIONAL_OR_KEYWORD)]
    takes_context = len(positional) >= 2 or any(p.kind == p.VAR_POSITIONAL for p in params)
except (TypeError, ValueError):
    takes_context = True

result = run(args, context) if takes_context else run(args)

if isinstance(result, dict) and "response" in result:
    response = result["response"]
    out = {"response": response if isinstance(response, str) else json.dumps(response, default=str)}
    if isinstance(result.get("storage"), dict):
        out["storage"] = result["storage"]
elif isinstance(result, str):
    out = {"response": result}
else:
    out = {"response": json.dumps(result, default=str)}

print("__RESULT__")
print(json.dumps(out, default=str))
"#;

/// Outcome of one capability invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutput {
    fn failure(error: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            stdout,
            stderr,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WrapperResult {
    response: String,
    #[serde(default)]
    storage: Option<Map<String, Value>>,
}

/// Split wrapper stdout into the user's own output and the parsed result.
fn parse_wrapper_output(stdout: &[String]) -> (String, Option<anyhow::Result<WrapperResult>>) {
    match stdout.iter().rposition(|l| l.trim() == RESULT_MARKER) {
        Some(idx) => {
            let user_out = stdout[..idx].join("\n");
            let parsed = stdout
                .get(idx + 1)
                .ok_or_else(|| anyhow::anyhow!("missing result line after {RESULT_MARKER}"))
                .and_then(|line| {
                    serde_json::from_str::<WrapperResult>(line).context("malformed capability result")
                });
            (user_out, Some(parsed))
        }
        None => (stdout.join("\n"), None),
    }
}

pub struct Executor {
    catalog: Arc<Catalog>,
    secrets: Arc<SecretStore>,
    storage: Arc<StorageStore>,
    sandboxes: Arc<dyn SandboxProvider>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        catalog: Arc<Catalog>,
        secrets: Arc<SecretStore>,
        storage: Arc<StorageStore>,
        sandboxes: Arc<dyn SandboxProvider>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            catalog,
            secrets,
            storage,
            sandboxes,
            config,
        }
    }

    /// Execute capability `capability_id` with `args`.
    ///
    /// Errors are returned for precondition failures (unknown or inactive
    /// capability, sandbox provisioning).  Failures inside the sandbox come
    /// back as an unsuccessful [`ExecutionOutput`].
    pub async fn execute(&self, capability_id: &str, args: &Value) -> anyhow::Result<ExecutionOutput> {
        let cap = self
            .catalog
            .get(capability_id)?
            .ok_or_else(|| anyhow::anyhow!("Capability {capability_id} not found"))?;
        if cap.status != CapabilityStatus::Active {
            anyhow::bail!(
                "Capability \"{}\" is not active (status: {})",
                cap.name,
                cap.status
            );
        }
        let files = self.catalog.load_files(&cap.id)?;

        let started = Instant::now();
        let sbx = self
            .sandboxes
            .create(Duration::from_secs(self.config.sandbox_lifetime_secs))
            .await
            .context("provision execution sandbox")?;

        let outcome = self.run_in(sbx.as_ref(), &cap.id, &files, args).await;
        sandbox::destroy_quietly(sbx.as_ref()).await;

        match &outcome {
            Ok(out) => info!(
                capability = %cap.name,
                success = out.success,
                duration_ms = started.elapsed().as_millis() as u64,
                "capability executed"
            ),
            Err(e) => warn!(capability = %cap.name, error = %e, "capability execution errored"),
        }
        outcome
    }

    async fn run_in(
        &self,
        sbx: &dyn Sandbox,
        capability_id: &str,
        files: &super::CapabilityFiles,
        args: &Value,
    ) -> anyhow::Result<ExecutionOutput> {
        sbx.write_file("main.py", &files.main_py).await?;

        if !files.requirements_txt.trim().is_empty() {
            let install = sandbox::install_requirements(
                sbx,
                &files.requirements_txt,
                Duration::from_secs(self.config.install_timeout_secs),
            )
            .await?;
            if install.exit_code != 0 {
                return Ok(ExecutionOutput::failure(
                    format!("Failed to install requirements: {}", install.stderr),
                    install.stdout,
                    install.stderr,
                ));
            }
        }

        let context = json!({
            "secrets": self.secrets.get_all(capability_id)?,
            "storage": self.storage.get(capability_id)?,
        });
        sbx.write_file("__args.json", &serde_json::to_string(args)?).await?;
        sbx.write_file("__context.json", &serde_json::to_string(&context)?)
            .await?;

        let out = sbx
            .run_code(WRAPPER, Duration::from_secs(self.config.run_timeout_secs))
            .await?;
        let (stdout, parsed) = parse_wrapper_output(&out.stdout);
        let mut stderr = out.stderr.join("\n");

        if let Some(err) = out.error {
            if !err.traceback.is_empty() {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&err.traceback);
            }
            return Ok(ExecutionOutput::failure(
                format!("{}: {}", err.name, err.value),
                stdout,
                stderr,
            ));
        }

        let result = match parsed {
            Some(Ok(r)) => r,
            Some(Err(e)) => return Ok(ExecutionOutput::failure(e.to_string(), stdout, stderr)),
            None => {
                return Ok(ExecutionOutput::failure(
                    "Capability produced no result",
                    stdout,
                    stderr,
                ))
            }
        };

        if let Some(updates) = result.storage.as_ref() {
            self.storage.merge(capability_id, updates)?;
        }

        Ok(ExecutionOutput {
            success: true,
            result: Some(result.response),
            error: None,
            stdout,
            stderr,
        })
    }
}
