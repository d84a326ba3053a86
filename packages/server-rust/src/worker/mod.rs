//! Per-operation worker instances.
//!
//! A worker owns one private mailbox named `worker-<op>-<instance>`, takes
//! tasks from it one at a time, runs the operation's transform and reports
//! every outcome, success or failure, to the shared outcome mailbox.

pub mod guard;
pub mod spawner;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use darkroom_core::messages::{codec, mailbox_names};
use darkroom_core::{Task, TaskOutcome, TransformSet, WorkerRegistration};
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};

pub use guard::LifecycleGuard;
pub use spawner::{LocalSpawner, SpawnError, WorkerSpawner};

use crate::mailbox::{discard_malformed, Delivery, MailboxError, MailboxTransport};
use crate::registry::WorkerRegistry;
use crate::shutdown::{ShutdownController, ShutdownSignal};
use crate::telemetry::metric_names;

/// Shared collaborators every worker is built from.
#[derive(Clone)]
pub struct WorkerContext {
    pub transport: Arc<dyn MailboxTransport>,
    pub registry: Arc<dyn WorkerRegistry>,
    pub transforms: Arc<TransformSet>,
    pub shutdown: Arc<ShutdownController>,
    pub mailbox_capacity: usize,
    /// Bound on posting one outcome or lifecycle event.
    pub report_timeout: Duration,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("namespace", &self.transport.namespace())
            .field("transforms", &self.transforms)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("report_timeout", &self.report_timeout)
            .finish_non_exhaustive()
    }
}

/// Why a worker's run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was signalled.
    Shutdown,
    /// Another live instance already owns this mailbox name.
    NameCollision,
    /// The mailbox was closed underneath the worker.
    MailboxClosed,
}

/// Fires once the mailbox is bound (or binding failed).
pub type StartedTx = oneshot::Sender<Result<(), SpawnError>>;

#[derive(Debug)]
pub struct Worker {
    registration: WorkerRegistration,
    ctx: WorkerContext,
}

impl Worker {
    #[must_use]
    pub fn new(registration: WorkerRegistration, ctx: WorkerContext) -> Self {
        Self { registration, ctx }
    }

    #[must_use]
    pub fn registration(&self) -> &WorkerRegistration {
        &self.registration
    }

    /// Announces, binds the mailbox, and processes tasks until shutdown.
    ///
    /// `started`, if given, resolves once the mailbox is bound. Announce and
    /// withdraw are paired on every path out of this function, including the
    /// future being dropped.
    pub async fn run(self, shutdown: ShutdownSignal, started: Option<StartedTx>) -> WorkerExit {
        let span = info_span!(
            "worker",
            op = %self.registration.operation,
            instance = %self.registration.instance
        );
        self.run_inner(shutdown, started).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: ShutdownSignal, started: Option<StartedTx>) -> WorkerExit {
        let mut guard = LifecycleGuard::announce(
            self.registration.clone(),
            Arc::clone(&self.ctx.transport),
            Arc::clone(&self.ctx.registry),
            self.ctx.report_timeout,
        )
        .await;

        let mut mailbox = match self
            .ctx
            .transport
            .create(&self.registration.mailbox, self.ctx.mailbox_capacity)
        {
            Ok(mailbox) => mailbox,
            Err(MailboxError::NameCollision { name }) => {
                warn!(mailbox = %name, "mailbox already owned, exiting");
                guard.release().await;
                notify(started, Err(SpawnError::NameCollision(name)));
                return WorkerExit::NameCollision;
            }
            Err(e) => {
                warn!(error = %e, "mailbox bind failed, exiting");
                guard.release().await;
                notify(started, Err(SpawnError::Exited));
                return WorkerExit::MailboxClosed;
            }
        };
        guard.register().await;
        notify(started, Ok(()));
        info!(mailbox = %mailbox.name(), "worker ready");

        let exit = loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => break WorkerExit::Shutdown,
                delivery = mailbox.receive() => match delivery {
                    Some(d) => self.handle(d).await,
                    None => break WorkerExit::MailboxClosed,
                },
            }
        };

        // Unbind before withdrawing so no new task lands after worker_stop.
        drop(mailbox);
        guard.release().await;
        info!(?exit, "worker stopped");
        exit
    }

    async fn handle(&self, delivery: Delivery) {
        let task: Task = match codec::decode(delivery.payload()) {
            Ok(task) => task,
            Err(e) => {
                discard_malformed(delivery, &self.registration.mailbox, &e);
                return;
            }
        };
        if task.op != self.registration.operation {
            debug!(task_op = %task.op, image = %task.image_id, "misrouted task ignored");
            delivery.ack();
            return;
        }

        let outcome = match self.ctx.transforms.apply(&task).await {
            Ok(result_ref) => TaskOutcome::succeeded(&task, result_ref),
            Err(e) => {
                warn!(image = %task.image_id, error = %e, "transform failed");
                TaskOutcome::failed(&task, e.to_string())
            }
        };
        let payload = match codec::encode(&outcome) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(image = %task.image_id, error = %e, "outcome not encodable");
                delivery.ack();
                return;
            }
        };

        // The report runs on its own task so cancelling this worker can't
        // lose an outcome that has already been computed.
        let report = tokio::spawn(report_outcome(
            Arc::clone(&self.ctx.transport),
            payload.clone(),
            outcome,
            self.ctx.report_timeout,
            self.ctx.shutdown.report_guard(),
        ));
        delivery.respond(payload);
        if let Err(e) = report.await {
            warn!(mailbox = %self.registration.mailbox, error = %e, "outcome report task ended abnormally");
        }
    }
}

async fn report_outcome(
    transport: Arc<dyn MailboxTransport>,
    payload: Bytes,
    outcome: TaskOutcome,
    timeout: Duration,
    _guard: crate::shutdown::ReportGuard,
) {
    match transport.send(mailbox_names::OUTCOMES, payload, timeout).await {
        Ok(()) => debug!(image = %outcome.image_id, success = outcome.success, "outcome reported"),
        Err(e) => {
            metrics::counter!(metric_names::REPORT_FAILURES, "op" => outcome.op.to_string())
                .increment(1);
            warn!(image = %outcome.image_id, error = %e, "outcome report failed");
        }
    }
}

fn notify(started: Option<StartedTx>, result: Result<(), SpawnError>) {
    if let Some(tx) = started {
        let _ = tx.send(result);
    }
}
