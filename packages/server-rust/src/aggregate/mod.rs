//! Status aggregation: folds every worker's outcomes and lifecycle events
//! into one snapshot and publishes it to observers.
//!
//! The aggregator owns the shared outcome and lifecycle mailboxes. It is the
//! single writer of [`AggregateState`]; everything else reads snapshots.

pub mod publisher;
pub mod state;

use std::sync::Arc;

use darkroom_core::messages::{codec, mailbox_names};
use darkroom_core::{Snapshot, SystemEvent, TaskOutcome};
use tracing::{debug, info};

pub use publisher::{PublishReport, SnapshotPublisher, Subscription};
pub use state::{AggregateState, OutcomeEffect};

use crate::config::MailboxCapacities;
use crate::mailbox::{discard_malformed, Delivery, Mailbox, MailboxError, MailboxTransport};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::metric_names;

/// Consumes outcomes and lifecycle events; publishes snapshots.
#[derive(Debug)]
pub struct Aggregator {
    state: AggregateState,
    publisher: Arc<SnapshotPublisher>,
    outcomes: Mailbox,
    lifecycle: Mailbox,
}

impl Aggregator {
    /// Binds the outcome and lifecycle mailboxes.
    ///
    /// # Errors
    ///
    /// Returns `MailboxError::NameCollision` if another aggregator already
    /// owns either mailbox in this namespace.
    pub fn bind(
        transport: &dyn MailboxTransport,
        publisher: Arc<SnapshotPublisher>,
        capacities: &MailboxCapacities,
    ) -> Result<Self, MailboxError> {
        let outcomes = transport.create(mailbox_names::OUTCOMES, capacities.outcomes)?;
        let lifecycle = transport.create(mailbox_names::LIFECYCLE, capacities.lifecycle)?;
        Ok(Self {
            state: AggregateState::new(),
            publisher,
            outcomes,
            lifecycle,
        })
    }

    /// Runs until shutdown, then folds in whatever is still queued and
    /// returns the final snapshot.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Snapshot {
        info!("aggregator running");
        loop {
            let changed = tokio::select! {
                () = shutdown.triggered() => break,
                delivery = self.outcomes.receive() => match delivery {
                    Some(d) => self.handle_outcome(d),
                    None => break,
                },
                delivery = self.lifecycle.receive() => match delivery {
                    Some(d) => self.handle_event(d),
                    None => break,
                },
            };
            if changed {
                self.publish();
            }
        }

        self.outcomes.close();
        self.lifecycle.close();
        while let Some(d) = self.lifecycle.receive().await {
            self.handle_event(d);
        }
        while let Some(d) = self.outcomes.receive().await {
            self.handle_outcome(d);
        }
        self.publish();

        let snapshot = self.state.snapshot();
        info!(
            uploads = snapshot.metrics.total_uploads,
            variants = snapshot.metrics.total_variants,
            failed = snapshot.metrics.failed_variants,
            "aggregator stopped"
        );
        snapshot
    }

    fn handle_outcome(&mut self, delivery: Delivery) -> bool {
        let outcome = match codec::decode::<TaskOutcome>(delivery.payload()) {
            Ok(outcome) => outcome,
            Err(e) => {
                discard_malformed(delivery, mailbox_names::OUTCOMES, &e);
                return false;
            }
        };
        delivery.ack();

        let effect = self.state.apply_outcome(&outcome);
        let result = if outcome.success { "success" } else { "failed" };
        match effect {
            OutcomeEffect::Recorded => {
                metrics::counter!(
                    metric_names::OUTCOMES_RECORDED,
                    "op" => outcome.op.to_string(),
                    "result" => result
                )
                .increment(1);
            }
            OutcomeEffect::Duplicate => {
                debug!(image = %outcome.image_id, op = %outcome.op, "duplicate outcome, not counted");
            }
        }
        // A duplicate success may still have moved the variant location.
        effect == OutcomeEffect::Recorded || outcome.success
    }

    fn handle_event(&mut self, delivery: Delivery) -> bool {
        let event = match codec::decode::<SystemEvent>(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                discard_malformed(delivery, mailbox_names::LIFECYCLE, &e);
                return false;
            }
        };
        delivery.ack();

        let changed = self.state.apply_event(&event);
        if let SystemEvent::WorkerStart { op, .. } | SystemEvent::WorkerStop { op, .. } = &event {
            #[allow(clippy::cast_precision_loss)]
            let active = self.state.active(op.as_str()) as f64;
            metrics::gauge!(metric_names::WORKERS_ACTIVE, "op" => op.to_string()).set(active);
        }
        debug!(event = event.kind(), changed, "lifecycle event applied");
        changed
    }

    fn publish(&self) {
        let report = self.publisher.publish(self.state.snapshot());
        if report.pruned > 0 {
            debug!(pruned = report.pruned, "closed subscribers removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use darkroom_core::{ImageId, InstanceId, Operation, Task, WorkerRegistration};

    use super::*;
    use crate::mailbox::{LocalTransport, Reply};
    use crate::shutdown::ShutdownController;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn encoded<T: serde::Serialize>(msg: &T) -> Bytes {
        Bytes::from(codec::encode(msg).unwrap())
    }

    fn setup() -> (Arc<LocalTransport>, Arc<SnapshotPublisher>, ShutdownController) {
        (
            Arc::new(LocalTransport::new("agg-test")),
            Arc::new(SnapshotPublisher::new(16)),
            ShutdownController::new(),
        )
    }

    #[test]
    fn second_aggregator_in_namespace_collides() {
        let (transport, publisher, _) = setup();
        let caps = MailboxCapacities::default();
        let _first = Aggregator::bind(transport.as_ref(), Arc::clone(&publisher), &caps).unwrap();
        let err = Aggregator::bind(transport.as_ref(), publisher, &caps).unwrap_err();
        assert!(matches!(err, MailboxError::NameCollision { .. }));
    }

    #[tokio::test]
    async fn outcomes_and_events_reach_subscribers() {
        let (transport, publisher, shutdown) = setup();
        let aggregator =
            Aggregator::bind(transport.as_ref(), Arc::clone(&publisher), &MailboxCapacities::default())
                .unwrap();
        let mut sub = publisher.subscribe();
        let handle = tokio::spawn(aggregator.run(shutdown.signal()));

        let reg = WorkerRegistration::new(Operation::new("blur"), InstanceId::new("w1"));
        transport
            .send(mailbox_names::LIFECYCLE, encoded(&SystemEvent::worker_start(&reg)), TIMEOUT)
            .await
            .unwrap();
        let task = Task {
            image_id: ImageId::new("img1"),
            op: Operation::new("blur"),
            source_ref: "d/img1/original.jpg".to_string(),
        };
        transport
            .send(
                mailbox_names::OUTCOMES,
                encoded(&TaskOutcome::succeeded(&task, "d/img1/blur.jpg")),
                TIMEOUT,
            )
            .await
            .unwrap();

        let mut seen = sub.next().await.unwrap();
        while seen.success_count("blur") == 0 || seen.active_count("blur") == 0 {
            seen = sub.next().await.unwrap();
        }
        assert_eq!(seen.active_count("blur"), 1);
        assert_eq!(seen.location("img1", "blur"), Some("/images/img1/blur.jpg"));

        shutdown.trigger();
        let last = handle.await.unwrap();
        assert_eq!(last.metrics.worker_started, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_and_ignored() {
        let (transport, publisher, shutdown) = setup();
        let aggregator =
            Aggregator::bind(transport.as_ref(), Arc::clone(&publisher), &MailboxCapacities::default())
                .unwrap();
        let handle = tokio::spawn(aggregator.run(shutdown.signal()));

        let reply = transport
            .request(mailbox_names::OUTCOMES, Bytes::from_static(b"\xc1garbage"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ack);

        shutdown.trigger();
        assert_eq!(handle.await.unwrap(), Snapshot::default());
    }

    #[tokio::test]
    async fn queued_messages_are_folded_in_on_shutdown() {
        let (transport, publisher, shutdown) = setup();
        let aggregator =
            Aggregator::bind(transport.as_ref(), publisher, &MailboxCapacities::default()).unwrap();

        for id in ["a", "b", "c"] {
            let event = SystemEvent::UploadAccepted {
                image_id: ImageId::new(id),
            };
            transport
                .send(mailbox_names::LIFECYCLE, encoded(&event), TIMEOUT)
                .await
                .unwrap();
        }
        shutdown.trigger();

        let last = aggregator.run(shutdown.signal()).await;
        assert_eq!(last.metrics.total_uploads, 3);
    }
}
