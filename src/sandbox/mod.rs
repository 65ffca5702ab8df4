//! Isolated execution sandbox.
//!
//! The runtime only talks to sandboxes through [`SandboxProvider`] and
//! [`Sandbox`]; [`local::LocalSandboxProvider`] backs them with a private
//! directory and child processes.  A sandbox is exclusively owned by the
//! build or execution that created it and must be destroyed by that owner.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::LocalSandboxProvider;

/// Conventional home directory inside a sandbox; paths under it are
/// resolved relative to the sandbox root.
pub const SANDBOX_HOME: &str = "/home/user";

/// Structured Python exception raised by sandboxed code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeError {
    pub name: String,
    pub value: String,
    pub traceback: String,
}

/// Result of running a snippet of Python.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeOutput {
    /// `repr` of a trailing expression, if any.
    pub text: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<CodeError>,
}

/// Result of a shell command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()>;

    async fn run_code(&self, code: &str, timeout: Duration) -> anyhow::Result<CodeOutput>;

    async fn run_command(&self, command: &str, timeout: Duration) -> anyhow::Result<CommandOutput>;

    /// Tear the sandbox down.  Calling it twice is harmless.
    async fn destroy(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox that expires after `lifetime`.
    async fn create(&self, lifetime: Duration) -> anyhow::Result<Box<dyn Sandbox>>;
}

/// Write `requirements.txt` and install it with pip.
pub async fn install_requirements(
    sandbox: &dyn Sandbox,
    requirements: &str,
    timeout: Duration,
) -> anyhow::Result<CommandOutput> {
    sandbox.write_file("requirements.txt", requirements).await?;
    sandbox
        .run_command("pip install -r requirements.txt", timeout)
        .await
}

/// Destroy a sandbox, logging instead of failing when teardown errors.
pub async fn destroy_quietly(sandbox: &dyn Sandbox) {
    if let Err(e) = sandbox.destroy().await {
        tracing::warn!(sandbox_id = sandbox.id(), error = %e, "sandbox teardown failed");
    }
}
