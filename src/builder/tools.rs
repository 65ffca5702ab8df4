//! Tools available to the capability builder and their handlers.
//!
//! Every handler returns the text fed back to the builder model.  An `Err`
//! is turned into an error-flagged `Tool error: ...` result by the loop.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::capabilities::{Catalog, Registration, RequiredSecret};
use crate::config::BuilderConfig;
use crate::relay::{Direction, MessageKind, Relay};
use crate::sandbox::Sandbox;
use crate::tools::builtins::{required_str, string_list};
use crate::tools::ToolDef;

pub const RUN_CODE_TIMEOUT: Duration = Duration::from_secs(30);
pub const RUN_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

pub const ANSWER_TIMEOUT_SENTINEL: &str = "No answer received from user (timed out).";

/// State shared by the handlers for one build.
pub struct BuildContext<'a> {
    pub build_id: &'a str,
    /// Catalog entry the build was started for, if known up front.
    pub target_capability: Option<&'a str>,
    pub sandbox: &'a dyn Sandbox,
    pub catalog: &'a Catalog,
    pub relay: &'a Relay,
    pub config: &'a BuilderConfig,
    /// Set once `register_capability` succeeds.
    pub registered: Option<String>,
}

impl BuildContext<'_> {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }
}

// ── Definitions ─────────────────────────────────────────────

pub fn definitions() -> Vec<ToolDef> {
    vec![
        ToolDef::new(
            "write_file",
            "Write a file to the sandbox filesystem. Use this to create main.py, requirements.txt, or any helper files.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path in the sandbox (e.g., /home/user/main.py)" },
                    "content": { "type": "string", "description": "File content" }
                },
                "required": ["path", "content"]
            }),
        ),
        ToolDef::new(
            "run_code",
            "Execute Python code in the sandbox interpreter. Use this to test your code.",
            json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python code to execute" }
                },
                "required": ["code"]
            }),
        ),
        ToolDef::new(
            "run_command",
            "Execute a shell command in the sandbox. Use this for pip install, ls, etc.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to run" }
                },
                "required": ["command"]
            }),
        ),
        ToolDef::new(
            "ask_user",
            "Ask the user a clarifying question. The question will be relayed through the main agent. Use sparingly.",
            json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "The question to ask the user" }
                },
                "required": ["question"]
            }),
        ),
        ToolDef::new(
            "request_secret",
            "Request a secret or API key from the user through a secure input instead of asking in chat. \
             Use this for API keys, tokens, passwords, or any sensitive credentials.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Secret name in UPPER_SNAKE_CASE (e.g., \"OPENWEATHER_API_KEY\")" },
                    "description": { "type": "string", "description": "What this secret is for, so the user knows what to paste" }
                },
                "required": ["name", "description"]
            }),
        ),
        ToolDef::new(
            "report_progress",
            "Report build progress to the user. Call this at key milestones.",
            json!({
                "type": "object",
                "properties": {
                    "step": { "type": "string", "description": "Current step name (e.g., \"Writing code\", \"Testing\")" },
                    "detail": { "type": "string", "description": "Optional detail about what is happening" }
                },
                "required": ["step"]
            }),
        ),
        ToolDef::new(
            "register_capability",
            "Finalize and register the capability. Call this only after testing succeeds. Provide the final versions of all files.",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Capability name (snake_case, e.g., \"weather_lookup\")" },
                    "description": { "type": "string", "description": "What this capability does (1-2 sentences)" },
                    "main_py": { "type": "string", "description": "Final main.py content" },
                    "requirements_txt": { "type": "string", "description": "Final requirements.txt content (empty string if none)" },
                    "input_schema": { "type": "object", "description": "JSON schema for the input args" },
                    "tags": { "type": "array", "items": { "type": "string" }, "description": "Tags for discoverability" },
                    "required_secrets": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "description": { "type": "string" }
                            },
                            "required": ["name", "description"]
                        },
                        "description": "List of secrets this capability requires"
                    }
                },
                "required": ["name", "description", "main_py", "requirements_txt", "input_schema"]
            }),
        ),
    ]
}

// ── Dispatch ────────────────────────────────────────────────

pub async fn handle(name: &str, input: Value, ctx: &mut BuildContext<'_>) -> anyhow::Result<String> {
    debug!(build_id = ctx.build_id, tool = name, "builder tool call");
    match name {
        "write_file" => write_file(ctx, &input).await,
        "run_code" => run_code(ctx, &input).await,
        "run_command" => run_command(ctx, &input).await,
        "ask_user" => ask_user(ctx, &input).await,
        "request_secret" => request_secret(ctx, &input).await,
        "report_progress" => report_progress(ctx, &input),
        "register_capability" => register_capability(ctx, &input),
        other => Ok(format!("Unknown tool: {other}")),
    }
}

async fn write_file(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let path = required_str(input, "write_file", "path")?;
    let content = required_str(input, "write_file", "content")?;
    ctx.sandbox.write_file(path, content).await?;
    Ok(format!("File written to {path}"))
}

async fn run_code(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let code = required_str(input, "run_code", "code")?;
    let out = ctx.sandbox.run_code(code, RUN_CODE_TIMEOUT).await?;
    if let Some(err) = out.error {
        return Ok(format!("Error: {}: {}\n{}", err.name, err.value, err.traceback));
    }
    let stdout = out.stdout.join("\n");
    let stderr = out.stderr.join("\n");
    let mut text = format!("Output: {}\nStdout: {stdout}", out.text);
    if !stderr.is_empty() {
        text.push_str(&format!("\nStderr: {stderr}"));
    }
    Ok(text)
}

async fn run_command(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let command = required_str(input, "run_command", "command")?;
    let out = ctx.sandbox.run_command(command, RUN_COMMAND_TIMEOUT).await?;
    Ok(format!(
        "Exit code: {}\nStdout: {}\nStderr: {}",
        out.exit_code, out.stdout, out.stderr
    ))
}

async fn ask_user(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let question = required_str(input, "ask_user", "question")?;
    ctx.relay.push(
        ctx.build_id,
        Direction::ToUser,
        MessageKind::Question,
        json!({ "question": question }),
    )?;

    let reply = ctx
        .relay
        .wait_for(
            ctx.build_id,
            Direction::ToBuilder,
            &[MessageKind::Answer],
            Duration::from_secs(ctx.config.ask_user_timeout_secs),
            ctx.poll_interval(),
        )
        .await?;
    Ok(reply
        .and_then(|m| answer_text(&m.payload))
        .unwrap_or_else(|| ANSWER_TIMEOUT_SENTINEL.to_string()))
}

/// The secret value never passes through here; the interactive side stores
/// it and only confirms.
async fn request_secret(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let name = required_str(input, "request_secret", "name")?;
    let description = required_str(input, "request_secret", "description")?;

    let mut payload = json!({ "name": name, "description": description });
    if let Some(id) = ctx.target_capability {
        payload["capability_id"] = json!(id);
    }
    ctx.relay
        .push(ctx.build_id, Direction::ToUser, MessageKind::SecretRequest, payload)?;

    let reply = ctx
        .relay
        .wait_for(
            ctx.build_id,
            Direction::ToBuilder,
            &[MessageKind::Answer, MessageKind::SecretResponse],
            Duration::from_secs(ctx.config.secret_timeout_secs),
            ctx.poll_interval(),
        )
        .await?;
    match reply {
        Some(_) => Ok(format!(
            "Secret \"{name}\" has been saved by the user. Access it in your code via context['secrets']['{name}']."
        )),
        None => Ok(format!(
            "User did not provide the secret \"{name}\" within the timeout."
        )),
    }
}

fn report_progress(ctx: &BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let step = required_str(input, "report_progress", "step")?;
    let detail = input.get("detail").and_then(Value::as_str);
    ctx.relay.push_progress(ctx.build_id, step, detail)?;
    Ok("Progress reported.".into())
}

fn register_capability(ctx: &mut BuildContext<'_>, input: &Value) -> anyhow::Result<String> {
    let name = required_str(input, "register_capability", "name")?;
    let description = required_str(input, "register_capability", "description")?;
    let main_py = required_str(input, "register_capability", "main_py")?;
    let requirements_txt = input
        .get("requirements_txt")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let input_schema = input
        .get("input_schema")
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
    let tags = input
        .get("tags")
        .filter(|v| v.is_array())
        .map(|_| string_list(input, "tags"));
    let required_secrets: Vec<RequiredSecret> = input
        .get("required_secrets")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    let cap = ctx.catalog.register(
        name,
        Registration {
            description: description.to_string(),
            main_py: main_py.to_string(),
            requirements_txt: requirements_txt.to_string(),
            input_schema,
            tags,
            required_secrets,
        },
    )?;

    ctx.relay.push(
        ctx.build_id,
        Direction::ToUser,
        MessageKind::Complete,
        json!({
            "capability_id": cap.id,
            "capability_name": cap.name,
            "summary": description,
        }),
    )?;
    info!(build_id = ctx.build_id, capability_id = %cap.id, "build registered capability");
    ctx.registered = Some(cap.id.clone());

    Ok(format!(
        "Capability \"{name}\" registered successfully with id {}.",
        cap.id
    ))
}

fn answer_text(payload: &Value) -> Option<String> {
    payload
        .get("answer")
        .and_then(Value::as_str)
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_cover_all_handlers() {
        let names: Vec<_> = definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            [
                "write_file",
                "run_code",
                "run_command",
                "ask_user",
                "request_secret",
                "report_progress",
                "register_capability"
            ]
        );
    }

    #[test]
    fn answer_text_reads_answer_field() {
        assert_eq!(answer_text(&json!({"answer": "yes"})).as_deref(), Some("yes"));
        assert_eq!(answer_text(&json!({"other": 1})), None);
    }
}
