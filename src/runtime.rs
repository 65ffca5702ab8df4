//! Wiring of the long-lived components.
//!
//! [`Runtime`] owns one shared database handle and every store built on
//! it, the model provider, the sandbox provider, the builder and the build
//! dispatcher.  The gateway and the CLI both start from here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, GatewayEvents, Session};
use crate::builder::{BuildDispatcher, BuildWorkerPool, Builder, InlineBuildDispatcher};
use crate::capabilities::{crypto, Catalog, Executor, SecretStore, StorageStore};
use crate::config::Config;
use crate::memory::MemoryStore;
use crate::models::{build_provider_manager_from_config, ModelProvider};
use crate::relay::Relay;
use crate::sandbox::{LocalSandboxProvider, SandboxProvider};
use crate::store::Database;
use crate::tools::ToolContext;

/// How submitted builds are run.
#[derive(Clone)]
pub enum DispatchMode {
    /// Background worker pool, stopped by the token.
    Workers(CancellationToken),
    /// Run each build to completion inside `submit`.
    Inline,
}

pub struct Runtime {
    pub config: Config,
    pub data_dir: PathBuf,
    pub db: Arc<Database>,
    pub catalog: Arc<Catalog>,
    pub secrets: Arc<SecretStore>,
    pub storage: Arc<StorageStore>,
    pub relay: Arc<Relay>,
    pub memory: Arc<MemoryStore>,
    pub executor: Arc<Executor>,
    pub builder: Arc<Builder>,
    pub agent: Arc<Agent>,
    pub builds: Arc<dyn BuildDispatcher>,
    workers: Option<Arc<BuildWorkerPool>>,
    inline: Option<Arc<InlineBuildDispatcher>>,
}

impl Runtime {
    /// Open the on-disk stores under the configured data directory and
    /// build providers from the configuration.
    pub fn open(config: Config, mode: DispatchMode) -> anyhow::Result<Arc<Runtime>> {
        let data_dir = config.data_dir();
        let db = Arc::new(Database::open(&data_dir)?);
        let key = crypto::load_or_create_key(&data_dir.join(".secrets"))?;
        let provider: Arc<dyn ModelProvider> = Arc::new(build_provider_manager_from_config(&config));
        let sandboxes: Arc<dyn SandboxProvider> = Arc::new(LocalSandboxProvider::new(
            config.sandbox_root(),
            config.sandbox.python.clone(),
        ));
        info!(data_dir = %data_dir.display(), "runtime opened");
        Self::with_parts(config, &data_dir, db, key, provider, sandboxes, mode)
    }

    /// Assemble a runtime from explicit parts.
    pub fn with_parts(
        config: Config,
        data_dir: &Path,
        db: Arc<Database>,
        key: [u8; 32],
        provider: Arc<dyn ModelProvider>,
        sandboxes: Arc<dyn SandboxProvider>,
        mode: DispatchMode,
    ) -> anyhow::Result<Arc<Runtime>> {
        let catalog = Arc::new(Catalog::new(db.clone(), data_dir.join("capabilities")));
        let secrets = Arc::new(SecretStore::new(db.clone(), key));
        let storage = Arc::new(StorageStore::new(db.clone()));
        let relay = Arc::new(Relay::new(db.clone()));
        let memory = Arc::new(MemoryStore::new(db.clone())?);

        let executor = Arc::new(Executor::new(
            catalog.clone(),
            secrets.clone(),
            storage.clone(),
            sandboxes.clone(),
            config.executor.clone(),
        ));
        let builder = Arc::new(Builder::new(
            provider.clone(),
            catalog.clone(),
            relay.clone(),
            sandboxes,
            config.builder.clone(),
        ));

        let (builds, workers, inline) = match mode {
            DispatchMode::Workers(cancel) => {
                let pool = Arc::new(BuildWorkerPool::start(
                    builder.clone(),
                    config.builder.workers,
                    cancel,
                ));
                (pool.clone() as Arc<dyn BuildDispatcher>, Some(pool), None)
            }
            DispatchMode::Inline => {
                let inline = Arc::new(InlineBuildDispatcher::new(builder.clone()));
                (inline.clone() as Arc<dyn BuildDispatcher>, None, Some(inline))
            }
        };

        let agent = Arc::new(Agent::new(
            provider,
            ToolContext {
                catalog: catalog.clone(),
                executor: executor.clone(),
                memory: memory.clone(),
            },
            builds.clone(),
            Arc::new(GatewayEvents),
            config.agent.clone(),
        ));

        Ok(Arc::new(Runtime {
            config,
            data_dir: data_dir.to_path_buf(),
            db,
            catalog,
            secrets,
            storage,
            relay,
            memory,
            executor,
            builder,
            agent,
            builds,
            workers,
            inline,
        }))
    }

    /// A fresh conversation.
    pub fn session(&self) -> Session {
        Session::new(self.agent.clone())
    }

    /// Inline dispatcher, when the runtime was opened with
    /// [`DispatchMode::Inline`].
    pub fn inline_builds(&self) -> Option<&InlineBuildDispatcher> {
        self.inline.as_deref()
    }

    /// Stop the build workers, if any.
    pub async fn shutdown(&self) {
        if let Some(pool) = &self.workers {
            pool.shutdown().await;
        }
    }
}
