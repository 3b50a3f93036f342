//! Background `terraform apply` loop.
//!
//! Mutations only write files and call [`ApplyCoordinator::trigger`]. A single
//! loop task applies on behalf of all of them: triggers that arrive while it is
//! running collapse into one pending wake-up, and the first apply is preceded by
//! a settle window so a burst of writes is applied once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::executor::TerraformExecutor;
use crate::error::Result;
use crate::lock::FileLock;

/// Decides whether this replica may run `terraform apply`.
#[async_trait]
pub trait Leadership: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Single-replica deployments always lead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Standalone;

#[async_trait]
impl Leadership for Standalone {
    async fn is_leader(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub poll_interval: Duration,
    pub settle_window: Duration,
    pub refresh: bool,
}

struct Inner {
    executor: Arc<dyn TerraformExecutor>,
    leadership: Arc<dyn Leadership>,
    lock: FileLock,
    settings: ApplySettings,
    running: AtomicBool,
    stopped: AtomicBool,
    interrupt_tx: mpsc::Sender<()>,
    interrupt_rx: Mutex<mpsc::Receiver<()>>,
}

#[derive(Clone)]
pub struct ApplyCoordinator {
    inner: Arc<Inner>,
}

impl ApplyCoordinator {
    pub fn new(
        executor: Arc<dyn TerraformExecutor>,
        leadership: Arc<dyn Leadership>,
        lock: FileLock,
        settings: ApplySettings,
    ) -> Self {
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                executor,
                leadership,
                lock,
                settings,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                interrupt_tx,
                interrupt_rx: Mutex::new(interrupt_rx),
            }),
        }
    }

    /// Starts the loop if idle, otherwise wakes it early. Never blocks.
    pub fn trigger(&self) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("starting apply loop");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.run());
        } else {
            // A full slot already guarantees another pass.
            let _ = self.inner.interrupt_tx.try_send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Lets the loop exit after its current pass. An in-flight apply is not killed.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _ = self.inner.interrupt_tx.try_send(());
    }

    /// Runs one apply in the foreground, waiting for the file lock.
    pub async fn apply_now(&self) -> Result<()> {
        let _guard = self.inner.lock.acquire().await?;
        self.inner
            .executor
            .apply(self.inner.settings.refresh)
            .await?
            .into_result("apply")?;
        Ok(())
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut interrupt = self.interrupt_rx.lock().await;
        let mut first_pass = true;

        loop {
            if self.stopped.load(Ordering::Acquire) {
                tracing::info!("apply loop stopped");
                break;
            }
            if !self.leadership.is_leader().await {
                tracing::info!("not the leader, apply loop exiting");
                break;
            }

            // Every attempt waits the settle window until the first apply.
            if first_pass {
                tokio::time::sleep(self.settings.settle_window).await;
            }

            match self.lock.try_acquire() {
                Ok(Some(_guard)) => {
                    first_pass = false;
                    // Writers trigger after releasing the lock, so anything
                    // queued so far is already on disk.
                    while interrupt.try_recv().is_ok() {}
                    self.apply().await;
                }
                Ok(None) => tracing::info!("file lock busy, skipping this apply pass"),
                Err(e) => tracing::warn!(error = %e, "cannot take file lock for apply"),
            }

            tokio::select! {
                _ = interrupt.recv() => tracing::debug!("apply loop interrupted"),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.running.store(false, Ordering::Release);
    }

    async fn apply(&self) {
        tracing::info!(refresh = self.settings.refresh, "running terraform apply");
        match self.executor.apply(self.settings.refresh).await {
            Ok(output) if output.success => tracing::info!("terraform apply complete"),
            Ok(output) => tracing::warn!(
                stderr = %output.stderr.trim(),
                "terraform apply failed, retrying next cycle"
            ),
            Err(e) => tracing::warn!(error = %e, "terraform apply failed, retrying next cycle"),
        }
    }
}
