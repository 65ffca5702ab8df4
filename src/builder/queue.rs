//! Build job handoff.
//!
//! Builds never run on the request that triggered them.  Callers submit a
//! [`BuildJob`] to a [`BuildDispatcher`]; the server uses a
//! [`BuildWorkerPool`] (queue drained by background workers) and tests or
//! the CLI use [`InlineBuildDispatcher`] to run the build in place.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{BuildJob, BuildOutcome, Builder};

#[async_trait]
pub trait BuildDispatcher: Send + Sync {
    async fn submit(&self, job: BuildJob) -> anyhow::Result<()>;
}

// ── Worker pool ─────────────────────────────────────────────

pub struct BuildWorkerPool {
    tx: mpsc::UnboundedSender<BuildJob>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildWorkerPool {
    /// Spawn `workers` tasks (at least one) draining a shared queue until
    /// `cancel` fires.  A build already running is allowed to finish.
    pub fn start(builder: Arc<Builder>, workers: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<BuildJob>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let builder = builder.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => None,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        let Some(job) = next else { break };
                        debug!(worker, build_id = %job.build_id, "worker picked up build");
                        builder.run(job).await;
                    }
                    debug!(worker, "build worker stopped");
                })
            })
            .collect();

        info!(workers = workers.max(1), "build worker pool started");
        Self {
            tx,
            cancel,
            workers: Mutex::new(handles),
        }
    }

    /// Stop taking jobs and wait for the workers to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl BuildDispatcher for BuildWorkerPool {
    async fn submit(&self, job: BuildJob) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("build worker pool is shut down");
        }
        let build_id = job.build_id.clone();
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("build queue closed"))?;
        info!(build_id = %build_id, "build queued");
        Ok(())
    }
}

// ── Inline dispatcher ───────────────────────────────────────

/// Runs the build to completion inside `submit`.
pub struct InlineBuildDispatcher {
    builder: Arc<Builder>,
    outcomes: Mutex<Vec<BuildOutcome>>,
}

impl InlineBuildDispatcher {
    pub fn new(builder: Arc<Builder>) -> Self {
        Self {
            builder,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes of every build run so far, oldest first.
    pub fn outcomes(&self) -> Vec<BuildOutcome> {
        self.outcomes
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BuildDispatcher for InlineBuildDispatcher {
    async fn submit(&self, job: BuildJob) -> anyhow::Result<()> {
        let outcome = self.builder.run(job).await;
        self.outcomes
            .lock()
            .map_err(|_| anyhow::anyhow!("outcome lock poisoned"))?
            .push(outcome);
        Ok(())
    }
}
