//! Composition root: binds every well-known mailbox in a namespace, starts
//! the long-running loops and hands back a [`FactoryHandle`].
//!
//! Shutdown runs in two phases. The main controller stops intake, the
//! supervisor and every worker; workers post their `worker_stop` events and
//! in-flight outcome reports while the aggregator is still listening on its
//! own controller. Only once reports have drained is the aggregator stopped,
//! which yields the final snapshot.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use darkroom_core::messages::{codec, mailbox_names, CodecError};
use darkroom_core::{Intake, Operation, Snapshot, TransformSet};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregate::{Aggregator, SnapshotPublisher, Subscription};
use crate::config::DarkroomConfig;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::mailbox::{MailboxError, MailboxTransport};
use crate::registry::WorkerRegistry;
use crate::shutdown::{RunState, ShutdownController};
use crate::supervisor::{self, ScaleReport, Supervisor};
use crate::worker::{LocalSpawner, WorkerContext, WorkerSpawner};

/// Why an upload was not handed to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
}

pub struct Factory;

impl Factory {
    /// Starts a factory in `transport`'s namespace.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, if another factory already
    /// owns one of the well-known mailboxes, or if an auto-started worker
    /// does not come up.
    pub async fn start(
        config: DarkroomConfig,
        transport: Arc<dyn MailboxTransport>,
        registry: Arc<dyn WorkerRegistry>,
        transforms: TransformSet,
    ) -> anyhow::Result<FactoryHandle> {
        config.validate().context("invalid factory configuration")?;
        let controller = Arc::new(ShutdownController::new());
        let aggregator_controller = ShutdownController::new();

        // The aggregator binds first so no lifecycle event is lost.
        let publisher = Arc::new(SnapshotPublisher::new(config.subscriber_buffer));
        let aggregator = Aggregator::bind(
            transport.as_ref(),
            Arc::clone(&publisher),
            &config.capacities,
        )
        .context("binding aggregator mailboxes")?;

        let dispatcher = Dispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            DispatchSettings {
                operations: config.operations.clone(),
                timeout: config.dispatch_timeout,
                policy: config.delivery_policy,
                intake_capacity: config.capacities.intake,
                max_in_flight: config.max_concurrent_uploads,
                event_timeout: config.report_timeout,
            },
        );
        let intake = dispatcher.bind().context("binding intake mailbox")?;
        let supervisor_mailbox =
            Supervisor::bind(transport.as_ref(), config.capacities.supervisor)
                .context("binding supervisor mailbox")?;

        let spawner = Arc::new(LocalSpawner::new(
            WorkerContext {
                transport: Arc::clone(&transport),
                registry,
                transforms: Arc::new(transforms),
                shutdown: Arc::clone(&controller),
                mailbox_capacity: config.capacities.worker,
                report_timeout: config.report_timeout,
            },
            config.spawn_timeout,
        ));

        let aggregator_task = tokio::spawn(aggregator.run(aggregator_controller.signal()));
        let dispatcher_task = tokio::spawn(dispatcher.run(intake, controller.signal()));
        let supervisor_task = tokio::spawn(
            Supervisor::new(Arc::clone(&spawner) as Arc<dyn WorkerSpawner>)
                .run(supervisor_mailbox, controller.signal()),
        );

        let handle = FactoryHandle {
            config,
            transport,
            publisher,
            spawner,
            controller,
            aggregator_controller,
            aggregator_task,
            dispatcher_task,
            supervisor_task,
        };

        if let Err(e) = handle.start_configured_workers().await {
            if let Err(stop) = handle.shutdown().await {
                warn!(error = %stop, "shutdown after failed start also failed");
            }
            return Err(e);
        }

        handle.controller.set_ready();
        info!(
            namespace = %handle.transport.namespace(),
            ops = ?handle.config.operations,
            "factory ready"
        );
        Ok(handle)
    }
}

/// A running factory.
pub struct FactoryHandle {
    config: DarkroomConfig,
    transport: Arc<dyn MailboxTransport>,
    publisher: Arc<SnapshotPublisher>,
    spawner: Arc<LocalSpawner>,
    controller: Arc<ShutdownController>,
    aggregator_controller: ShutdownController,
    aggregator_task: JoinHandle<Snapshot>,
    dispatcher_task: JoinHandle<()>,
    supervisor_task: JoinHandle<()>,
}

impl FactoryHandle {
    async fn start_configured_workers(&self) -> anyhow::Result<()> {
        let per_op = self.config.workers_per_operation;
        for op in &self.config.operations {
            for _ in 0..per_op {
                self.spawner
                    .spawn(op)
                    .await
                    .with_context(|| format!("starting {op} worker"))?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &DarkroomConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.controller.state()
    }

    /// Hands an upload to the dispatcher. Resolves once intake acked it;
    /// dispatch continues in the background.
    ///
    /// # Errors
    ///
    /// Returns `SubmitError::Mailbox` if the intake mailbox is unbound, full
    /// or silent past the dispatch timeout.
    pub async fn submit(&self, intake: &Intake) -> Result<(), SubmitError> {
        let payload = Bytes::from(codec::encode(intake)?);
        self.transport
            .request(mailbox_names::INTAKE, payload, self.config.dispatch_timeout)
            .await?;
        Ok(())
    }

    /// A new observer; the current snapshot is delivered first.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    #[must_use]
    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        self.publisher.latest()
    }

    /// Requests `n` more `op` workers through the supervisor mailbox.
    pub async fn scale(&self, op: &Operation, n: usize) -> ScaleReport {
        supervisor::scale(self.transport.as_ref(), op, n, self.config.spawn_timeout).await
    }

    /// The in-process spawner behind the supervisor.
    #[must_use]
    pub fn spawner(&self) -> &Arc<LocalSpawner> {
        &self.spawner
    }

    /// Stops intake and workers, waits for in-flight outcome reports, then
    /// stops the aggregator and returns its final snapshot.
    ///
    /// # Errors
    ///
    /// Fails only if the aggregator task panicked.
    pub async fn shutdown(self) -> anyhow::Result<Snapshot> {
        info!("factory shutting down");
        self.controller.trigger();

        // The supervisor must be gone before the worker list is taken.
        for (name, task) in [
            ("dispatcher", self.dispatcher_task),
            ("supervisor", self.supervisor_task),
        ] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "task ended abnormally");
            }
        }
        let exits = self.spawner.join_all().await;

        if !self.controller.wait_for_drain(self.config.drain_timeout).await {
            warn!(
                in_flight = self.controller.reports_in_flight(),
                "drain timed out, outcome reports may be lost"
            );
        }

        self.aggregator_controller.trigger();
        let snapshot = self
            .aggregator_task
            .await
            .context("aggregator task failed")?;
        info!(workers = exits.len(), "factory stopped");
        Ok(snapshot)
    }
}

impl std::fmt::Debug for FactoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryHandle")
            .field("namespace", &self.transport.namespace())
            .field("state", &self.controller.state())
            .finish_non_exhaustive()
    }
}
