//! Shared fakes for integration tests: a scripted model, an in-memory
//! sandbox, and a runtime wired to both.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use toolsmith::capabilities::Registration;
use toolsmith::config::Config;
use toolsmith::models::{ChatMessage, FunctionCallItem, ModelProvider, ProviderResponse, TokenUsage};
use toolsmith::runtime::{DispatchMode, Runtime};
use toolsmith::sandbox::{CodeOutput, CommandOutput, Sandbox, SandboxProvider};
use toolsmith::store::Database;

// ---------------------------------------------------------------------------
// Scripted model
// ---------------------------------------------------------------------------

/// A provider that replays a fixed list of responses.  Once the script is
/// exhausted it keeps returning `repeat` (or errors when there is none).
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderResponse>>,
    repeat: Option<ProviderResponse>,
    pub calls: AtomicUsize,
    /// Every message list the provider was called with.
    pub seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<ProviderResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: ProviderResponse) -> Self {
        Self {
            repeat: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Content of every tool result the model has been shown so far.
    pub fn tool_results(&self) -> Vec<String> {
        let seen = self.seen.lock().unwrap();
        let Some(last) = seen.last() else {
            return Vec::new();
        };
        last.iter()
            .filter_map(|m| m.tool_results.as_ref())
            .flatten()
            .map(|r| r.content.clone())
            .collect()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send_chat(&self, _messages: &[ChatMessage]) -> Result<String, anyhow::Error> {
        anyhow::bail!("scripted provider only answers function-calling requests")
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        _functions: &[Value],
    ) -> Result<(ProviderResponse, Option<TokenUsage>), anyhow::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next.or_else(|| self.repeat.clone()) {
            Some(r) => Ok((r, None)),
            None => anyhow::bail!("script exhausted"),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub fn call(name: &str, args: Value) -> ProviderResponse {
    ProviderResponse::FunctionCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

pub fn calls(items: &[(&str, Value)]) -> ProviderResponse {
    ProviderResponse::MultiFunctionCall(
        items
            .iter()
            .enumerate()
            .map(|(i, (name, args))| FunctionCallItem {
                id: format!("call_{i}"),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
    )
}

pub fn reply(text: &str) -> ProviderResponse {
    ProviderResponse::Final(text.to_string())
}

// ---------------------------------------------------------------------------
// Fake sandbox
// ---------------------------------------------------------------------------

/// Counters and canned outputs shared by every sandbox a provider creates.
#[derive(Default)]
pub struct SandboxLog {
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub files: Mutex<HashMap<String, String>>,
    pub commands: Mutex<Vec<String>>,
    pub code_runs: AtomicUsize,
}

pub struct FakeSandboxProvider {
    pub log: Arc<SandboxLog>,
    code_output: CodeOutput,
    command_exit: i32,
}

impl FakeSandboxProvider {
    pub fn new() -> Self {
        Self::with_output(CodeOutput::default())
    }

    pub fn with_output(code_output: CodeOutput) -> Self {
        Self {
            log: Arc::new(SandboxLog::default()),
            code_output,
            command_exit: 0,
        }
    }

    pub fn failing_commands(mut self, exit_code: i32) -> Self {
        self.command_exit = exit_code;
        self
    }

    /// Sandbox output that looks like a capability returning `result`.
    pub fn returning(result: Value) -> Self {
        Self::with_output(CodeOutput {
            stdout: vec![
                "working...".to_string(),
                "__RESULT__".to_string(),
                result.to_string(),
            ],
            ..CodeOutput::default()
        })
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn create(&self, _lifetime: Duration) -> anyhow::Result<Box<dyn Sandbox>> {
        let n = self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSandbox {
            id: format!("fake-{n}"),
            log: self.log.clone(),
            code_output: self.code_output.clone(),
            command_exit: self.command_exit,
        }))
    }
}

struct FakeSandbox {
    id: String,
    log: Arc<SandboxLog>,
    code_output: CodeOutput,
    command_exit: i32,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.log
            .files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn run_code(&self, _code: &str, _timeout: Duration) -> anyhow::Result<CodeOutput> {
        self.log.code_runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.code_output.clone())
    }

    async fn run_command(&self, command: &str, _timeout: Duration) -> anyhow::Result<CommandOutput> {
        self.log.commands.lock().unwrap().push(command.to_string());
        Ok(CommandOutput {
            exit_code: self.command_exit,
            stdout: String::new(),
            stderr: if self.command_exit == 0 {
                String::new()
            } else {
                "boom".to_string()
            },
        })
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.log.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Config with short builder timeouts so relay waits finish quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.builder.max_rounds = 5;
    config.builder.poll_interval_ms = 10;
    config.builder.ask_user_timeout_secs = 2;
    config.builder.secret_timeout_secs = 2;
    config.agent.max_rounds = 4;
    config
}

pub fn runtime(
    dir: &tempfile::TempDir,
    config: Config,
    provider: Arc<dyn ModelProvider>,
    sandboxes: Arc<dyn SandboxProvider>,
) -> Arc<Runtime> {
    let db = Arc::new(Database::open(dir.path()).unwrap());
    Runtime::with_parts(
        config,
        dir.path(),
        db,
        [7u8; 32],
        provider,
        sandboxes,
        DispatchMode::Inline,
    )
    .unwrap()
}

/// A minimal `register_capability` call.
pub fn register_args(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name}, verified"),
        "main_py": "def run(args, context):\n    return {'response': 'ok'}\n",
        "requirements_txt": "",
        "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]},
        "required_secrets": [{"name": "API_KEY", "description": "weather service key"}],
    })
}

/// Registration payload with a trivial `run(args, context)`.
pub fn registration(description: &str) -> Registration {
    Registration {
        description: description.into(),
        main_py: "def run(args, context):\n    return 'ok'\n".into(),
        requirements_txt: String::new(),
        input_schema: json!({"type": "object", "properties": {}}),
        tags: None,
        required_secrets: Vec::new(),
    }
}
