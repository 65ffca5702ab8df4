use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `config.yaml`.
///
/// Every section has defaults, so an empty file (or no file at all) is a
/// valid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Model provider definitions.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Id of the model entry used for both the agent and the builder.
    /// Defaults to the first entry of `models`.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Override for the data directory (`<home>/data` by default).
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// A configured LLM provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Unique identifier for this provider entry (e.g. "openai-default").
    pub id: String,
    /// Provider kind: "openai", "openai-compat", "ollama", etc.
    pub provider: String,
    /// Model name to request (e.g. "gpt-4o").
    #[serde(default)]
    pub model: Option<String>,
    /// API key (plain text or env-var reference like `$OPENAI_API_KEY`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Chat completions endpoint; required for OpenAI-compatible servers.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Interactive agent loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
    pub max_rounds: usize,
    /// Messages of history kept per session.
    pub history_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_rounds: 10,
            history_limit: 20,
        }
    }
}

/// Capability builder settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub max_rounds: usize,
    pub sandbox_lifetime_secs: u64,
    pub ask_user_timeout_secs: u64,
    pub secret_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Background build workers started by `toolsmith start`.
    pub workers: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_rounds: 25,
            sandbox_lifetime_secs: 600,
            ask_user_timeout_secs: 60,
            secret_timeout_secs: 120,
            poll_interval_ms: 2000,
            workers: 2,
        }
    }
}

/// Capability execution limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub sandbox_lifetime_secs: u64,
    pub install_timeout_secs: u64,
    pub run_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sandbox_lifetime_secs: 180,
            install_timeout_secs: 120,
            run_timeout_secs: 60,
        }
    }
}

/// Local sandbox settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Python interpreter used inside sandboxes.
    pub python: String,
    /// Directory that holds sandbox roots (`<data_dir>/sandboxes` by default).
    pub root: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3131".into(),
        }
    }
}

impl Config {
    /// Read and parse a YAML configuration file.  A missing file yields
    /// the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };
        let config = Self::parse(&contents)?;
        tracing::debug!(
            path = %path.display(),
            models = config.models.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn parse(contents: &str) -> anyhow::Result<Config> {
        // An empty document deserializes to unit, not a map.
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(contents).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Default config path: `<home>/config.yaml`.
    pub fn default_path() -> PathBuf {
        crate::toolsmith_home().join("config.yaml")
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        let mut model_ids = HashSet::new();
        for m in &self.models {
            if !model_ids.insert(m.id.as_str()) {
                anyhow::bail!("config: duplicate model ID: {}", m.id);
            }
        }

        if let Some(ref default) = self.default_model {
            if !model_ids.contains(default.as_str()) {
                anyhow::bail!("config: default_model references unknown model '{default}'");
            }
        }

        let budgets = [
            ("agent.max_rounds", self.agent.max_rounds as u64),
            ("agent.history_limit", self.agent.history_limit as u64),
            ("builder.max_rounds", self.builder.max_rounds as u64),
            ("builder.sandbox_lifetime_secs", self.builder.sandbox_lifetime_secs),
            ("builder.poll_interval_ms", self.builder.poll_interval_ms),
            ("builder.workers", self.builder.workers as u64),
            ("executor.sandbox_lifetime_secs", self.executor.sandbox_lifetime_secs),
            ("executor.run_timeout_secs", self.executor.run_timeout_secs),
        ];
        for (name, value) in budgets {
            if value == 0 {
                anyhow::bail!("config: {name} must be greater than zero");
            }
        }

        Ok(())
    }

    /// The model entry selected by `default_model`, or the first one.
    pub fn primary_model(&self) -> Option<&ModelConfig> {
        match self.default_model {
            Some(ref id) => self.models.iter().find(|m| &m.id == id),
            None => self.models.first(),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.data_dir {
            Some(ref dir) => PathBuf::from(dir),
            None => crate::utils::default_data_dir(),
        }
    }

    pub fn sandbox_root(&self) -> PathBuf {
        match self.sandbox.root {
            Some(ref root) => PathBuf::from(root),
            None => self.data_dir().join("sandboxes"),
        }
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.agent.max_rounds, 10);
        assert_eq!(cfg.builder.max_rounds, 25);
        assert_eq!(cfg.executor.sandbox_lifetime_secs, 180);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = Config::parse("builder:\n  workers: 4\n").unwrap();
        assert_eq!(cfg.builder.workers, 4);
        assert_eq!(cfg.builder.ask_user_timeout_secs, 60);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = Config::parse("agent:\n  max_rounds: 0\n").unwrap_err();
        assert!(err.to_string().contains("agent.max_rounds"));
    }

    #[test]
    fn primary_model_defaults_to_first() {
        let cfg = Config::parse(
            "models:\n  - id: a\n    provider: openai\n  - id: b\n    provider: ollama\n",
        )
        .unwrap();
        assert_eq!(cfg.primary_model().unwrap().id, "a");
    }
}
