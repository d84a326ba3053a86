//! Starting worker instances and confirming they are running.

use std::time::Duration;

use async_trait::async_trait;
use darkroom_core::{InstanceId, Operation, WorkerRegistration};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Worker, WorkerContext, WorkerExit};

/// Why a worker could not be started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("no transform registered for operation {0}")]
    UnsupportedOperation(Operation),
    #[error("mailbox {0} is already owned by a live worker")]
    NameCollision(String),
    #[error("worker exited before binding its mailbox")]
    Exited,
    #[error("worker did not start within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("factory is shutting down")]
    ShuttingDown,
}

/// Starts one more worker instance for an operation and resolves only once
/// it is executing.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// # Errors
    ///
    /// Returns `SpawnError` if the instance was refused or never started.
    async fn spawn(&self, op: &Operation) -> Result<WorkerRegistration, SpawnError>;
}

/// Runs workers as tasks on the current tokio runtime.
#[derive(Debug)]
pub struct LocalSpawner {
    ctx: WorkerContext,
    spawn_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<WorkerExit>>>,
}

impl LocalSpawner {
    #[must_use]
    pub fn new(ctx: WorkerContext, spawn_timeout: Duration) -> Self {
        Self {
            ctx,
            spawn_timeout,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts a worker with a caller-chosen identity.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` if no transform serves the operation,
    /// `NameCollision` if the identity is already running, `Timeout` if the
    /// worker did not bind in time.
    pub async fn spawn_instance(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerRegistration, SpawnError> {
        if self.ctx.shutdown.is_triggered() {
            return Err(SpawnError::ShuttingDown);
        }
        if !self.ctx.transforms.supports(&registration.operation) {
            return Err(SpawnError::UnsupportedOperation(registration.operation));
        }

        let (started_tx, started_rx) = oneshot::channel();
        let worker = Worker::new(registration.clone(), self.ctx.clone());
        let handle = tokio::spawn(worker.run(self.ctx.shutdown.signal(), Some(started_tx)));
        {
            let mut workers = self.workers.lock();
            workers.retain(|h| !h.is_finished());
            workers.push(handle);
        }

        match tokio::time::timeout(self.spawn_timeout, started_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(mailbox = %registration.mailbox, "worker started");
                Ok(registration)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SpawnError::Exited),
            Err(_) => Err(SpawnError::Timeout {
                timeout_ms: u64::try_from(self.spawn_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Worker tasks that have not finished yet.
    #[must_use]
    pub fn running(&self) -> usize {
        self.workers.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Waits for every spawned worker to exit. Call after shutdown is
    /// triggered.
    pub async fn join_all(&self) -> Vec<WorkerExit> {
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        let mut exits = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(exit) => exits.push(exit),
                Err(e) => warn!(error = %e, "worker task ended abnormally"),
            }
        }
        exits
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self, op: &Operation) -> Result<WorkerRegistration, SpawnError> {
        self.spawn_instance(WorkerRegistration::new(op.clone(), InstanceId::generate()))
            .await
    }
}
