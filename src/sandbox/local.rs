//! Process-backed sandbox.
//!
//! Every sandbox gets a private directory under the provider root.  Shell
//! commands run via `sh -c` with a cleared environment, the directory as
//! `HOME` and working dir, and are killed on timeout.  Python snippets go
//! through a small harness that records the trailing expression and any
//! exception as JSON next to the cell.  `pip` installs into a per-sandbox
//! package directory through `PIP_TARGET`.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{CodeError, CodeOutput, CommandOutput, Sandbox, SandboxProvider, SANDBOX_HOME};
use crate::utils::truncate_utf8_owned;

const MAX_OUTPUT: usize = 256 * 1024;

const HARNESS: &str = r#"import ast, json, os, sys, traceback

def _main(cell_path, result_path):
    sys.path.insert(0, os.getcwd())
    result = {"text": "", "error": None}
    with open(cell_path) as f:
        source = f.read()
    scope = {"__name__": "__main__"}
    try:
        tree = ast.parse(source, filename="<cell>", mode="exec")
        tail = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            tail = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<cell>", "exec"), scope)
        if tail is not None:
            value = eval(compile(tail, "<cell>", "eval"), scope)
            if value is not None:
                result["text"] = repr(value)
    except BaseException as exc:
        result["error"] = {
            "name": type(exc).__name__,
            "value": str(exc),
            "traceback": traceback.format_exc(),
        }
    finally:
        sys.stdout.flush()
        sys.stderr.flush()
        with open(result_path, "w") as f:
            json.dump(result, f)

_main(sys.argv[1], sys.argv[2])
"#;

/// Creates [`LocalSandbox`]es under `root`.
pub struct LocalSandboxProvider {
    root: PathBuf,
    python: String,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>, python: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            python: python.into(),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, lifetime: Duration) -> anyhow::Result<Box<dyn Sandbox>> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        for sub in [".cells", ".bin", ".packages"] {
            tokio::fs::create_dir_all(dir.join(sub))
                .await
                .with_context(|| format!("create sandbox dir {}", dir.display()))?;
        }

        tokio::fs::write(dir.join(".cells/harness.py"), HARNESS).await?;
        let shims = [
            ("python", format!("#!/bin/sh\nexec {} \"$@\"\n", self.python)),
            ("pip", format!("#!/bin/sh\nexec {} -m pip \"$@\"\n", self.python)),
        ];
        for (name, body) in shims {
            let path = dir.join(".bin").join(name);
            tokio::fs::write(&path, body).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
            }
        }

        info!(sandbox_id = %id, lifetime_secs = lifetime.as_secs(), "sandbox created");
        Ok(Box::new(LocalSandbox {
            id,
            dir,
            python: self.python.clone(),
            deadline: Instant::now() + lifetime,
            destroyed: AtomicBool::new(false),
            cells: AtomicU64::new(0),
        }))
    }
}

pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
    python: String,
    deadline: Instant,
    destroyed: AtomicBool,
    cells: AtomicU64,
}

impl LocalSandbox {
    /// Map a sandbox path (absolute under `/home/user`, or relative) into the
    /// sandbox directory.  `..` is rejected.
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let rel = path
            .strip_prefix(SANDBOX_HOME)
            .unwrap_or(path)
            .trim_start_matches('/');
        let mut out = self.dir.clone();
        for comp in Path::new(rel).components() {
            match comp {
                Component::Normal(part) => out.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    anyhow::bail!("path escapes the sandbox: {path}")
                }
            }
        }
        if out == self.dir {
            anyhow::bail!("path must name a file: {path:?}");
        }
        Ok(out)
    }

    /// Remaining lifetime, capped by `requested`.
    fn budget(&self, requested: Duration) -> anyhow::Result<Duration> {
        if self.destroyed.load(Ordering::SeqCst) {
            anyhow::bail!("sandbox {} has been destroyed", self.id);
        }
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("sandbox {} lifetime expired", self.id);
        }
        Ok(requested.min(remaining))
    }

    fn command(&self, program: &str) -> tokio::process::Command {
        let bin = self.dir.join(".bin");
        let packages = self.dir.join(".packages");
        let mut cmd = tokio::process::Command::new(program);
        cmd.current_dir(&self.dir)
            .env_clear()
            .env(
                "PATH",
                format!("{}:/usr/local/bin:/usr/bin:/bin", bin.display()),
            )
            .env("HOME", &self.dir)
            .env("PIP_TARGET", &packages)
            .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
            .env(
                "PYTHONPATH",
                format!("{}:{}", packages.display(), self.dir.display()),
            )
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn lines(s: &str) -> Vec<String> {
    s.lines().map(str::to_string).collect()
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.budget(Duration::MAX)?;
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("sandbox write {path}"))?;
        debug!(sandbox_id = %self.id, path, bytes = content.len(), "sandbox file written");
        Ok(())
    }

    async fn run_code(&self, code: &str, timeout: Duration) -> anyhow::Result<CodeOutput> {
        let timeout = self.budget(timeout)?;
        let n = self.cells.fetch_add(1, Ordering::SeqCst);
        let cell = format!(".cells/cell_{n}.py");
        let result_file = format!(".cells/cell_{n}.json");
        tokio::fs::write(self.dir.join(&cell), code).await?;

        let child = self
            .command(&self.python)
            .arg(".cells/harness.py")
            .arg(&cell)
            .arg(&result_file)
            .spawn()
            .map_err(|e| anyhow::anyhow!("sandbox: failed to start {}: {e}", self.python))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("sandbox: {e}"))?,
            Err(_elapsed) => {
                return Ok(CodeOutput {
                    error: Some(CodeError {
                        name: "TimeoutError".into(),
                        value: format!("execution exceeded {}s", timeout.as_secs()),
                        traceback: String::new(),
                    }),
                    ..Default::default()
                });
            }
        };

        let stdout = truncate_utf8_owned(String::from_utf8_lossy(&output.stdout).into_owned(), MAX_OUTPUT);
        let stderr = truncate_utf8_owned(String::from_utf8_lossy(&output.stderr).into_owned(), MAX_OUTPUT);

        #[derive(serde::Deserialize)]
        struct HarnessResult {
            text: String,
            error: Option<CodeError>,
        }

        let harness: Option<HarnessResult> = tokio::fs::read_to_string(self.dir.join(&result_file))
            .await
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let (text, error) = match harness {
            Some(h) => (h.text, h.error),
            // The harness itself died (e.g. killed, interpreter missing modules).
            None => (
                String::new(),
                Some(CodeError {
                    name: "ProcessError".into(),
                    value: format!("interpreter exited with {}", output.status.code().unwrap_or(-1)),
                    traceback: stderr.clone(),
                }),
            ),
        };

        Ok(CodeOutput {
            text,
            stdout: lines(&stdout),
            stderr: lines(&stderr),
            error,
        })
    }

    async fn run_command(&self, command: &str, timeout: Duration) -> anyhow::Result<CommandOutput> {
        let timeout = self.budget(timeout)?;
        let child = self
            .command("sh")
            .arg("-c")
            .arg(command)
            .spawn()
            .map_err(|e| anyhow::anyhow!("sandbox: spawn failed: {e}"))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| anyhow::anyhow!("sandbox: {e}"))?,
            Err(_elapsed) => {
                return Ok(CommandOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("timed out after {}s (child killed)", timeout.as_secs()),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_utf8_owned(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
                MAX_OUTPUT,
            ),
            stderr: truncate_utf8_owned(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                MAX_OUTPUT,
            ),
        })
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", self.dir.display())),
        }
        info!(sandbox_id = %self.id, "sandbox destroyed");
        Ok(())
    }
}
