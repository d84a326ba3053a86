//! Job dispatch: fans each accepted upload out into one task per configured
//! operation.
//!
//! Intake is acked before any dispatch work starts, so the uploader never
//! waits on workers. Each operation is then discovered and delivered
//! independently under its own deadline; an operation with no registered
//! worker is skipped for that image, without retry.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use darkroom_core::messages::{codec, mailbox_names};
use darkroom_core::{Intake, Operation, SystemEvent, Task};
use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DeliveryPolicy;
use crate::mailbox::{discard_malformed, Mailbox, MailboxError, MailboxTransport};
use crate::registry::WorkerRegistry;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::metric_names;

/// What happened to one operation of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpDispatch {
    /// No worker registered; nothing sent.
    Skipped,
    /// Task enqueued on these worker mailboxes.
    Delivered(Vec<String>),
    /// Workers were listed but no delivery succeeded before the deadline.
    Failed(MailboxError),
}

/// Per-operation results for one upload, in configured order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub ops: Vec<(Operation, OpDispatch)>,
}

impl DispatchReport {
    #[must_use]
    pub fn get(&self, op: &str) -> Option<&OpDispatch> {
        self.ops
            .iter()
            .find(|(o, _)| o.as_str() == op)
            .map(|(_, d)| d)
    }
}

/// Settings the dispatcher needs from the factory configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub operations: Vec<Operation>,
    pub timeout: Duration,
    pub policy: DeliveryPolicy,
    pub intake_capacity: usize,
    /// Uploads dispatched concurrently.
    pub max_in_flight: usize,
    /// Bound on posting the upload-accepted event.
    pub event_timeout: Duration,
}

pub struct Dispatcher {
    transport: Arc<dyn MailboxTransport>,
    registry: Arc<dyn WorkerRegistry>,
    settings: DispatchSettings,
    cursor: AtomicUsize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        transport: Arc<dyn MailboxTransport>,
        registry: Arc<dyn WorkerRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            transport,
            registry,
            settings,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Binds the intake mailbox.
    ///
    /// # Errors
    ///
    /// Returns `MailboxError::NameCollision` if another dispatcher already
    /// serves this namespace.
    pub fn bind(&self) -> Result<Mailbox, MailboxError> {
        self.transport
            .create(mailbox_names::INTAKE, self.settings.intake_capacity)
    }

    /// Serves `intake` until shutdown or until the mailbox closes.
    ///
    /// Each upload is acked and then dispatched on its own task, so intake
    /// keeps flowing while earlier uploads wait on slow or stale workers. At
    /// most `max_in_flight` uploads are dispatched at once; past that, intake
    /// queues up in the mailbox. In-flight dispatches finish before this
    /// returns.
    pub async fn run(self, mut intake: Mailbox, mut shutdown: ShutdownSignal) {
        info!(ops = ?self.settings.operations, policy = ?self.settings.policy, "dispatcher running");
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let this = Arc::new(self);
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                delivery = intake.receive() => match delivery {
                    Some(d) => d,
                    None => break,
                },
            };

            let upload: Intake = match codec::decode(delivery.payload()) {
                Ok(upload) => upload,
                Err(e) => {
                    discard_malformed(delivery, mailbox_names::INTAKE, &e);
                    continue;
                }
            };
            delivery.ack();

            let dispatcher = Arc::clone(&this);
            in_flight.spawn(async move {
                dispatcher.accept(&upload).await;
                drop(permit);
            });
            while let Some(done) = in_flight.try_join_next() {
                log_join(done);
            }
        }

        drop(intake);
        while let Some(done) = in_flight.join_next().await {
            log_join(done);
        }
        info!("dispatcher stopped");
    }

    /// Records the upload and dispatches every configured operation.
    pub async fn accept(&self, upload: &Intake) -> DispatchReport {
        let span = info_span!("dispatch", image = %upload.image_id);
        async {
            self.post_accepted(upload).await;
            let report = self.dispatch(upload).await;
            debug!(?report, "dispatch complete");
            report
        }
        .instrument(span)
        .await
    }

    async fn post_accepted(&self, upload: &Intake) {
        let event = SystemEvent::UploadAccepted {
            image_id: upload.image_id.clone(),
        };
        let sent = match codec::encode(&event) {
            Ok(bytes) => {
                self.transport
                    .send(
                        mailbox_names::LIFECYCLE,
                        Bytes::from(bytes),
                        self.settings.event_timeout,
                    )
                    .await
            }
            Err(e) => {
                warn!(error = %e, "upload event not encodable");
                return;
            }
        };
        if let Err(e) = sent {
            warn!(error = %e, "upload event not delivered");
        }
    }

    /// Dispatches one task per configured operation, concurrently. Each
    /// operation is bounded by the configured timeout on its own.
    pub async fn dispatch(&self, upload: &Intake) -> DispatchReport {
        let results = join_all(
            self.settings
                .operations
                .iter()
                .map(|op| self.dispatch_op(upload, op)),
        )
        .await;
        DispatchReport {
            ops: self.settings.operations.iter().cloned().zip(results).collect(),
        }
    }

    async fn dispatch_op(&self, upload: &Intake, op: &Operation) -> OpDispatch {
        let deadline = Instant::now() + self.settings.timeout;

        let members = tokio::time::timeout_at(deadline, self.registry.list(op))
            .await
            .unwrap_or_else(|_| {
                warn!(%op, "worker listing timed out");
                BTreeSet::new()
            });
        if members.is_empty() {
            metrics::counter!(metric_names::TASKS_SKIPPED, "op" => op.to_string()).increment(1);
            debug!(%op, "no workers registered, skipping");
            return OpDispatch::Skipped;
        }

        let task = Task::for_intake(upload, op.clone());
        let payload = match codec::encode(&task) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(%op, error = %e, "task not encodable");
                return OpDispatch::Skipped;
            }
        };

        let members: Vec<String> = members.into_iter().collect();
        let result = match self.settings.policy {
            DeliveryPolicy::One => self.deliver_one(&members, payload, deadline).await,
            DeliveryPolicy::All => self.deliver_all(&members, payload, deadline).await,
        };

        match result {
            Ok(targets) => {
                metrics::counter!(metric_names::TASKS_DISPATCHED, "op" => op.to_string())
                    .increment(targets.len() as u64);
                debug!(%op, ?targets, "task delivered");
                OpDispatch::Delivered(targets)
            }
            Err(e) => {
                metrics::counter!(metric_names::DELIVERY_FAILURES, "op" => op.to_string())
                    .increment(1);
                warn!(%op, error = %e, "task delivery failed");
                OpDispatch::Failed(e)
            }
        }
    }

    /// One recipient. A non-blocking pass over the members in rotated order
    /// takes the first with free capacity; if none has any, wait on the first
    /// bound member (or the first member at all) until the deadline.
    async fn deliver_one(
        &self,
        members: &[String],
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Vec<String>, MailboxError> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
        let rotated: Vec<&String> = members[start..].iter().chain(&members[..start]).collect();

        for member in &rotated {
            match self.transport.try_send(member, payload.clone()) {
                Ok(()) => return Ok(vec![(*member).clone()]),
                Err(e) => debug!(mailbox = %member, error = %e, "member not accepting"),
            }
        }

        let fallback = rotated
            .iter()
            .find(|m| self.transport.is_bound(m))
            .unwrap_or(&rotated[0]);
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.transport.send(fallback, payload, remaining).await?;
        Ok(vec![(*fallback).clone()])
    }

    /// Every member gets a copy. Succeeds if at least one copy was enqueued.
    async fn deliver_all(
        &self,
        members: &[String],
        payload: Bytes,
        deadline: Instant,
    ) -> Result<Vec<String>, MailboxError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let results = join_all(
            members
                .iter()
                .map(|m| self.transport.send(m, payload.clone(), remaining)),
        )
        .await;

        let mut delivered = Vec::new();
        let mut last_error = None;
        for (member, result) in members.iter().zip(results) {
            match result {
                Ok(()) => delivered.push(member.clone()),
                Err(e) => {
                    debug!(mailbox = %member, error = %e, "copy not delivered");
                    last_error = Some(e);
                }
            }
        }
        match (delivered.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(delivered),
        }
    }
}

fn log_join(done: Result<(), JoinError>) {
    if let Err(e) = done {
        warn!(error = %e, "dispatch task ended abnormally");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("namespace", &self.transport.namespace())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
