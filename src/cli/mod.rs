//! Subcommand handlers.
//!
//! Keeps `main.rs` slim: clap parsing stays there, the logic lives here.

use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::LoopOutcome;
use crate::builder::BuildJob;
use crate::capabilities::{Capability, CapabilityStatus};
use crate::config::Config;
use crate::relay::{Direction, RelayMessage};
use crate::runtime::{DispatchMode, Runtime};

async fn open_runtime(config_path: &Path, mode: DispatchMode) -> anyhow::Result<Arc<Runtime>> {
    let cfg = Config::load(config_path).await?;
    Runtime::open(cfg, mode)
}

// ── Server ──────────────────────────────────────────────────────────────────

/// Run the gateway and the build workers until Ctrl-C.
pub async fn start(config_path: &Path) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let runtime = open_runtime(config_path, DispatchMode::Workers(cancel.clone())).await?;

    let addr: std::net::SocketAddr = runtime
        .config
        .gateway
        .addr
        .parse()
        .with_context(|| format!("invalid gateway address: {}", runtime.config.gateway.addr))?;
    let api_token = crate::gateway::api_token_from_env();
    let gateway =
        crate::gateway::start_gateway(runtime.clone(), addr, api_token.clone(), cancel.clone())
            .await
            .with_context(|| format!("failed to bind gateway on {addr}"))?;

    println!();
    println!("  toolsmith v{}", env!("CARGO_PKG_VERSION"));
    println!("  Gateway:  http://{}", gateway.addr);
    println!("  Data:     {}", runtime.data_dir.display());
    println!("  Workers:  {}", runtime.config.builder.workers);
    if let Some(token) = api_token {
        println!("  Events:   ws://{}/ws?token={token}", gateway.addr);
    }
    println!();

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down");

    crate::gateway::publish_event_json(&serde_json::json!({
        "type": "shutdown",
        "message": "toolsmith shutting down",
    }));
    cancel.cancel();
    runtime.shutdown().await;
    let _ = gateway.handle.await;

    info!("shutdown complete");
    Ok(())
}

/// Ask a running server for its status.
pub async fn check_status(config_path: &Path) -> anyhow::Result<()> {
    let cfg = Config::load(config_path).await?;
    let url = format!("http://{}/api/status", cfg.gateway.addr);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(3))
        .build()?;
    let mut req = client.get(&url);
    if let Some(token) = crate::gateway::api_token_from_env() {
        req = req.bearer_auth(token);
    }

    match req.send().await {
        Ok(resp) if resp.status().is_success() => {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            println!("toolsmith is running at http://{}", cfg.gateway.addr);
            if let Some(counts) = body.get("capabilities").and_then(|c| c.as_object()) {
                for (status, n) in counts {
                    println!("  {status:<9} {n}");
                }
            }
        }
        Ok(resp) => println!("toolsmith responded with status: {}", resp.status()),
        Err(_) => {
            println!("toolsmith is not running (no response at {url})");
            println!("start it with: toolsmith start");
        }
    }
    Ok(())
}

// ── Chat & build ────────────────────────────────────────────────────────────

/// One turn with `--message`, otherwise a line-by-line session on stdin.
/// Builds run inline, so a requested capability is ready by the next prompt.
pub async fn chat(config_path: &Path, message: Option<&str>) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let mut session = runtime.session();

    if let Some(message) = message {
        let outcome = session.send(message).await?;
        print_outcome(&runtime, &outcome);
        return Ok(());
    }

    let stdin = std::io::stdin();
    let interactive = stdin.is_terminal();
    loop {
        if interactive {
            print!("> ");
            std::io::stdout().flush()?;
        }
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        let outcome = session.send(line).await?;
        print_outcome(&runtime, &outcome);
    }
    Ok(())
}

fn print_outcome(runtime: &Runtime, outcome: &LoopOutcome) {
    for call in &outcome.tool_calls {
        let marker = if call.is_error { "!" } else { "·" };
        println!(
            "  {marker} {} ({} ms) {}",
            call.name,
            call.duration_ms,
            crate::utils::truncate_str(&call.result, 120)
        );
    }
    println!("{}", outcome.text);

    if let Some(job) = &outcome.build {
        let result = runtime
            .inline_builds()
            .and_then(|d| d.outcomes().into_iter().rev().find(|o| o.build_id == job.build_id));
        match result {
            Some(o) if o.success => println!("  [build {}] capability ready", job.build_id),
            Some(o) => println!(
                "  [build {}] failed: {}",
                job.build_id,
                o.error.unwrap_or_default()
            ),
            None => println!("  [build {}] queued", job.build_id),
        }
    }
}

/// Run a build in the foreground and print what it sent to the user.
pub async fn build(
    config_path: &Path,
    description: &str,
    build_id: Option<&str>,
) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;

    let job = match build_id {
        Some(id) => match runtime.catalog.get(id)? {
            Some(cap) => BuildJob::for_capability(cap.id, cap.name, description),
            None => BuildJob {
                build_id: id.to_string(),
                ..BuildJob::new(description)
            },
        },
        None => BuildJob::new(description),
    };
    println!("build {}", job.build_id);

    let build_id = job.build_id.clone();
    let outcome = runtime.builder.run(job).await;
    for msg in runtime.relay.poll(&build_id, Direction::ToUser)? {
        print_message(&msg);
    }
    if outcome.success {
        println!("capability {} registered", outcome.capability_id.unwrap_or_default());
        Ok(())
    } else {
        anyhow::bail!("build failed: {}", outcome.error.unwrap_or_default())
    }
}

// ── Capabilities ────────────────────────────────────────────────────────────

pub async fn list_capabilities(config_path: &Path, status: Option<&str>) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let status = status.map(str::parse::<CapabilityStatus>).transpose()?;
    let caps = runtime.catalog.list(status)?;
    if caps.is_empty() {
        println!("no capabilities");
        return Ok(());
    }
    for cap in caps {
        println!(
            "{:<36}  {:<24}  {:<8}  v{}",
            cap.id, cap.name, cap.status, cap.version
        );
    }
    Ok(())
}

/// Resolve an id or a name.
fn find_capability(runtime: &Runtime, id_or_name: &str) -> anyhow::Result<Capability> {
    if let Some(cap) = runtime.catalog.get(id_or_name)? {
        return Ok(cap);
    }
    runtime
        .catalog
        .get_by_name(id_or_name)?
        .ok_or_else(|| anyhow::anyhow!("no capability with id or name {id_or_name:?}"))
}

pub async fn show_capability(config_path: &Path, id_or_name: &str) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let cap = find_capability(&runtime, id_or_name)?;
    println!("{}", serde_json::to_string_pretty(&cap)?);

    if let Some(manifest) = runtime.catalog.load_manifest(&cap)? {
        if !manifest.required_secrets.is_empty() {
            println!("required secrets:");
            for s in &manifest.required_secrets {
                println!("  {}  {}", s.name, s.description);
            }
        }
    }
    let keys = runtime.secrets.keys(&cap.id)?;
    if !keys.is_empty() {
        println!("stored secrets: {}", keys.join(", "));
    }
    let storage = runtime.storage.get(&cap.id)?;
    if !storage.is_empty() {
        println!("storage: {}", serde_json::Value::Object(storage));
    }
    Ok(())
}

pub async fn set_capability_status(
    config_path: &Path,
    id_or_name: &str,
    status: CapabilityStatus,
) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let cap = find_capability(&runtime, id_or_name)?;
    let updated = runtime.catalog.set_status(&cap.id, status)?;
    println!("{} is now {}", updated.name, updated.status);
    Ok(())
}

pub async fn delete_capability(config_path: &Path, id_or_name: &str) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let cap = find_capability(&runtime, id_or_name)?;
    if runtime.catalog.delete(&cap.id)? {
        println!("deleted {} ({})", cap.name, cap.id);
    }
    Ok(())
}

// ── Secrets & relay ─────────────────────────────────────────────────────────

/// Store a secret for a capability; the value is prompted without echo.
pub async fn set_secret(config_path: &Path, capability: &str, key: &str) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let cap = find_capability(&runtime, capability)?;
    let value: String = dialoguer::Password::new()
        .with_prompt(format!("Value for {key}"))
        .interact()
        .context("failed to read secret value")?;
    if value.is_empty() {
        anyhow::bail!("empty secret value");
    }
    runtime.secrets.set(&cap.id, key, &value)?;
    println!("secret '{key}' saved for {}", cap.name);
    Ok(())
}

pub async fn relay_messages(
    config_path: &Path,
    build_id: &str,
    direction: Direction,
    consume: bool,
) -> anyhow::Result<()> {
    let runtime = open_runtime(config_path, DispatchMode::Inline).await?;
    let messages = if consume {
        runtime.relay.poll(build_id, direction)?
    } else {
        runtime.relay.peek(build_id, direction)?
    };
    if messages.is_empty() {
        println!("no messages");
    }
    for msg in &messages {
        print_message(msg);
    }
    Ok(())
}

fn print_message(msg: &RelayMessage) {
    println!(
        "{}  {:<15} {}",
        chrono::DateTime::from_timestamp_millis(msg.created_at)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_default(),
        msg.kind.as_str(),
        msg.payload
    );
}
