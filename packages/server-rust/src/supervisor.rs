//! Administrative scaling: "start N more workers for operation X".
//!
//! The supervisor owns the `supervisor` mailbox and answers each
//! [`SpawnRequest`] with a [`SpawnAck`] only after the new instance is
//! running. [`scale`] is the client side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use darkroom_core::messages::{codec, mailbox_names};
use darkroom_core::{Operation, SpawnAck, SpawnRequest};
use tracing::{info, warn};

use crate::mailbox::{
    discard_malformed, Delivery, Mailbox, MailboxError, MailboxTransport, Reply,
};
use crate::shutdown::ShutdownSignal;
use crate::worker::WorkerSpawner;

/// Serves spawn requests through a [`WorkerSpawner`].
pub struct Supervisor {
    spawner: Arc<dyn WorkerSpawner>,
}

impl Supervisor {
    #[must_use]
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self { spawner }
    }

    /// Binds the supervisor mailbox.
    ///
    /// # Errors
    ///
    /// Returns `MailboxError::NameCollision` if another supervisor serves
    /// this namespace.
    pub fn bind(transport: &dyn MailboxTransport, capacity: usize) -> Result<Mailbox, MailboxError> {
        transport.create(mailbox_names::SUPERVISOR, capacity)
    }

    /// Handles requests one at a time until shutdown.
    pub async fn run(self, mut mailbox: Mailbox, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                delivery = mailbox.receive() => match delivery {
                    Some(d) => self.handle(d).await,
                    None => break,
                },
            }
        }
        info!("supervisor stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let request: SpawnRequest = match codec::decode(delivery.payload()) {
            Ok(request) => request,
            Err(e) => {
                discard_malformed(delivery, mailbox_names::SUPERVISOR, &e);
                return;
            }
        };

        let ack = match self.spawner.spawn(&request.op).await {
            Ok(reg) => SpawnAck::Started {
                name: reg.instance.to_string(),
                mailbox: reg.mailbox,
            },
            Err(e) => {
                warn!(op = %request.op, error = %e, "spawn refused");
                SpawnAck::Refused {
                    reason: e.to_string(),
                }
            }
        };
        match codec::encode(&ack) {
            Ok(bytes) => delivery.respond(Bytes::from(bytes)),
            Err(e) => {
                warn!(error = %e, "spawn ack not encodable");
                delivery.ack();
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

/// Outcome of a [`scale`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub requested: usize,
    /// Mailboxes of instances confirmed running.
    pub started: Vec<String>,
    /// One reason per refused or failed request.
    pub refused: Vec<String>,
}

/// Asks the supervisor for `n` more `op` workers, one confirmed instance at
/// a time. Each request waits up to `timeout`.
pub async fn scale(
    transport: &dyn MailboxTransport,
    op: &Operation,
    n: usize,
    timeout: Duration,
) -> ScaleReport {
    let mut report = ScaleReport {
        requested: n,
        ..ScaleReport::default()
    };
    let payload = match codec::encode(&SpawnRequest { op: op.clone() }) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            report.refused.push(e.to_string());
            return report;
        }
    };

    for _ in 0..n {
        let reply = transport
            .request(mailbox_names::SUPERVISOR, payload.clone(), timeout)
            .await;
        match reply {
            Ok(Reply::Response(body)) => match codec::decode::<SpawnAck>(&body) {
                Ok(SpawnAck::Started { mailbox, .. }) => report.started.push(mailbox),
                Ok(SpawnAck::Refused { reason }) => report.refused.push(reason),
                Err(e) => report.refused.push(e.to_string()),
            },
            Ok(Reply::Ack) => report.refused.push("request discarded".to_string()),
            Err(e) => report.refused.push(e.to_string()),
        }
    }
    info!(%op, requested = n, started = report.started.len(), "scale finished");
    report
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use darkroom_core::{InstanceId, WorkerRegistration};
    use parking_lot::Mutex;

    use super::*;
    use crate::mailbox::LocalTransport;
    use crate::shutdown::ShutdownController;
    use crate::worker::SpawnError;

    /// Accepts every operation except `sepia` and records what it started.
    #[derive(Default)]
    struct RecordingSpawner {
        started: Mutex<Vec<Operation>>,
    }

    #[async_trait]
    impl WorkerSpawner for RecordingSpawner {
        async fn spawn(&self, op: &Operation) -> Result<WorkerRegistration, SpawnError> {
            if op.as_str() == "sepia" {
                return Err(SpawnError::UnsupportedOperation(op.clone()));
            }
            let mut started = self.started.lock();
            let instance = InstanceId::new(format!("i{}", started.len()));
            started.push(op.clone());
            Ok(WorkerRegistration::new(op.clone(), instance))
        }
    }

    fn running_supervisor() -> (Arc<LocalTransport>, Arc<RecordingSpawner>, ShutdownController) {
        let transport = Arc::new(LocalTransport::new("sup-test"));
        let spawner = Arc::new(RecordingSpawner::default());
        let mailbox = Supervisor::bind(transport.as_ref(), 4).unwrap();
        let shutdown = ShutdownController::new();
        tokio::spawn(Supervisor::new(spawner.clone()).run(mailbox, shutdown.signal()));
        (transport, spawner, shutdown)
    }

    #[tokio::test]
    async fn scale_starts_requested_count() {
        let (transport, spawner, _shutdown) = running_supervisor();
        let report = scale(
            transport.as_ref(),
            &Operation::new("blur"),
            3,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(report.requested, 3);
        assert_eq!(
            report.started,
            vec!["worker-blur-i0", "worker-blur-i1", "worker-blur-i2"]
        );
        assert!(report.refused.is_empty());
        assert_eq!(spawner.started.lock().len(), 3);
    }

    #[tokio::test]
    async fn refused_spawn_is_reported() {
        let (transport, _spawner, _shutdown) = running_supervisor();
        let report = scale(
            transport.as_ref(),
            &Operation::new("sepia"),
            2,
            Duration::from_secs(1),
        )
        .await;

        assert!(report.started.is_empty());
        assert_eq!(report.refused.len(), 2);
        assert!(report.refused[0].contains("sepia"));
    }

    #[tokio::test]
    async fn malformed_request_is_acked() {
        let (transport, spawner, _shutdown) = running_supervisor();
        let reply = transport
            .request(
                mailbox_names::SUPERVISOR,
                Bytes::from_static(b"\xc1"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ack);
        assert!(spawner.started.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scale_without_supervisor_fails_each_request() {
        let transport = LocalTransport::new("sup-test");
        let report = scale(&transport, &Operation::new("blur"), 2, Duration::from_secs(1)).await;
        assert!(report.started.is_empty());
        assert_eq!(report.refused.len(), 2);
    }

    #[tokio::test]
    async fn zero_requested_sends_nothing() {
        let (transport, spawner, _shutdown) = running_supervisor();
        let report = scale(
            transport.as_ref(),
            &Operation::new("blur"),
            0,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(report, ScaleReport::default());
        assert!(spawner.started.lock().is_empty());
        // The supervisor is idle and still serving.
        let next = scale(transport.as_ref(), &Operation::new("blur"), 1, Duration::from_secs(1)).await;
        assert_eq!(next.started, vec!["worker-blur-i0"]);
    }
}
