//! Aggregate state folded from outcomes and lifecycle events.
//!
//! Pure and single-owner: the aggregator loop is the only writer, and
//! observers only ever see [`Snapshot`] copies.

use std::collections::{BTreeMap, HashSet};

use darkroom_core::snapshot::public_location;
use darkroom_core::{Metrics, PerOpMetrics, Snapshot, SystemEvent, TaskOutcome, VariantMap};

/// What applying one outcome did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    /// First outcome for its (image, operation): counters moved.
    Recorded,
    /// A later outcome for an (image, operation) already counted.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct AggregateState {
    variants: VariantMap,
    total_uploads: u64,
    total_variants: u64,
    failed_variants: u64,
    worker_started: u64,
    success: BTreeMap<String, u64>,
    failed: BTreeMap<String, u64>,
    /// Live workers per op. Decrements clamp at zero, so a stop that
    /// overtakes its start can never drive a count negative.
    active: BTreeMap<String, u64>,
    /// (image, op) pairs whose first outcome has been counted.
    recorded: HashSet<(String, String)>,
}

impl AggregateState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one task outcome in.
    ///
    /// Success writes the variant location (a later success overwrites it).
    /// Failure never touches the variant map. Counters move only for the
    /// first outcome per (image, operation), so duplicates never double
    /// count.
    pub fn apply_outcome(&mut self, outcome: &TaskOutcome) -> OutcomeEffect {
        let image = outcome.image_id.to_string();
        let op = outcome.op.to_string();

        if outcome.success {
            self.variants
                .entry(image.clone())
                .or_default()
                .insert(op.clone(), public_location(&image, &outcome.result_ref));
        }

        if !self.recorded.insert((image, op.clone())) {
            return OutcomeEffect::Duplicate;
        }

        if outcome.success {
            self.total_variants += 1;
            *self.success.entry(op).or_default() += 1;
        } else {
            self.failed_variants += 1;
            *self.failed.entry(op).or_default() += 1;
        }
        OutcomeEffect::Recorded
    }

    /// Folds one lifecycle event in. Returns whether anything changed.
    pub fn apply_event(&mut self, event: &SystemEvent) -> bool {
        match event {
            SystemEvent::UploadAccepted { .. } => {
                self.total_uploads += 1;
                true
            }
            SystemEvent::WorkerStart { op, .. } => {
                self.worker_started += 1;
                *self.active.entry(op.to_string()).or_default() += 1;
                true
            }
            SystemEvent::WorkerStop { op, .. } => {
                let active = self.active.entry(op.to_string()).or_default();
                if *active == 0 {
                    return false;
                }
                *active -= 1;
                true
            }
        }
    }

    /// Live workers for `op`.
    #[must_use]
    pub fn active(&self, op: &str) -> u64 {
        self.active.get(op).copied().unwrap_or(0)
    }

    /// Live workers across every operation.
    #[must_use]
    pub fn worker_active(&self) -> u64 {
        self.active.values().sum()
    }

    /// Immutable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            variants: self.variants.clone(),
            metrics: Metrics {
                total_uploads: self.total_uploads,
                total_variants: self.total_variants,
                failed_variants: self.failed_variants,
                worker_active: self.worker_active(),
                worker_started: self.worker_started,
                per_op: PerOpMetrics {
                    active: self.active.clone(),
                    success: self.success.clone(),
                    failed: self.failed.clone(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use darkroom_core::{ImageId, InstanceId, Operation, Task, WorkerRegistration};
    use proptest::prelude::*;

    use super::*;

    fn task(image: &str, op: &str) -> Task {
        Task {
            image_id: ImageId::new(image),
            op: Operation::new(op),
            source_ref: format!("./data/{image}/original.jpg"),
        }
    }

    fn reg(op: &str, instance: &str) -> WorkerRegistration {
        WorkerRegistration::new(Operation::new(op), InstanceId::new(instance))
    }

    #[test]
    fn success_records_public_location() {
        let mut state = AggregateState::new();
        let t = task("img1", "thumbnail");
        let effect = state.apply_outcome(&TaskOutcome::succeeded(&t, "./data/img1/thumbnail.jpg"));

        assert_eq!(effect, OutcomeEffect::Recorded);
        let snap = state.snapshot();
        assert_eq!(snap.location("img1", "thumbnail"), Some("/images/img1/thumbnail.jpg"));
        assert_eq!(snap.success_count("thumbnail"), 1);
        assert_eq!(snap.metrics.total_variants, 1);
    }

    #[test]
    fn failure_counts_without_variant_entry() {
        let mut state = AggregateState::new();
        state.apply_outcome(&TaskOutcome::failed(&task("img1", "blur"), "decode error"));

        let snap = state.snapshot();
        assert!(snap.location("img1", "blur").is_none());
        assert!(snap.variants.is_empty());
        assert_eq!(snap.failed_count("blur"), 1);
        assert_eq!(snap.metrics.failed_variants, 1);
    }

    #[test]
    fn duplicate_outcome_is_counted_once() {
        let mut state = AggregateState::new();
        let t = task("img1", "grayscale");
        state.apply_outcome(&TaskOutcome::succeeded(&t, "a/grayscale.jpg"));
        let effect = state.apply_outcome(&TaskOutcome::succeeded(&t, "b/grayscale.jpg"));

        assert_eq!(effect, OutcomeEffect::Duplicate);
        let snap = state.snapshot();
        assert_eq!(snap.success_count("grayscale"), 1);
        assert_eq!(snap.metrics.total_variants, 1);
    }

    #[test]
    fn late_success_overwrites_location_but_not_counters() {
        let mut state = AggregateState::new();
        let t = task("img1", "rotate90");
        state.apply_outcome(&TaskOutcome::failed(&t, "timeout"));
        state.apply_outcome(&TaskOutcome::succeeded(&t, "x/rotate90.jpg"));

        let snap = state.snapshot();
        assert_eq!(snap.location("img1", "rotate90"), Some("/images/img1/rotate90.jpg"));
        assert_eq!(snap.failed_count("rotate90"), 1);
        assert_eq!(snap.success_count("rotate90"), 0);
    }

    #[test]
    fn uploads_count_accepted_intake() {
        let mut state = AggregateState::new();
        for id in ["a", "b"] {
            state.apply_event(&SystemEvent::UploadAccepted {
                image_id: ImageId::new(id),
            });
        }
        assert_eq!(state.snapshot().metrics.total_uploads, 2);
    }

    #[test]
    fn start_and_stop_track_active_per_operation() {
        let mut state = AggregateState::new();
        state.apply_event(&SystemEvent::worker_start(&reg("blur", "a")));
        state.apply_event(&SystemEvent::worker_start(&reg("blur", "b")));
        state.apply_event(&SystemEvent::worker_start(&reg("thumbnail", "c")));
        state.apply_event(&SystemEvent::worker_stop(&reg("blur", "a")));

        let snap = state.snapshot();
        assert_eq!(snap.active_count("blur"), 1);
        assert_eq!(snap.active_count("thumbnail"), 1);
        assert_eq!(snap.metrics.worker_active, 2);
        assert_eq!(snap.metrics.worker_started, 3);
    }

    #[test]
    fn stop_before_start_clamps_at_zero() {
        let mut state = AggregateState::new();
        let r = reg("grayscale", "g1");
        assert!(!state.apply_event(&SystemEvent::worker_stop(&r)));
        assert_eq!(state.active("grayscale"), 0);

        state.apply_event(&SystemEvent::worker_start(&r));
        assert_eq!(state.active("grayscale"), 1);
        assert_eq!(state.snapshot().metrics.worker_started, 1);
    }

    #[test]
    fn colliding_newcomer_nets_out() {
        let mut state = AggregateState::new();
        let r = reg("blur", "same");
        state.apply_event(&SystemEvent::worker_start(&r));
        // A second instance with the same name announces, collides, withdraws.
        state.apply_event(&SystemEvent::worker_start(&r));
        state.apply_event(&SystemEvent::worker_stop(&r));

        assert_eq!(state.active("blur"), 1);
        assert_eq!(state.snapshot().metrics.worker_started, 2);
    }

    #[test]
    fn stopped_operation_still_reports_zero() {
        let mut state = AggregateState::new();
        let r = reg("blur", "x");
        state.apply_event(&SystemEvent::worker_start(&r));
        state.apply_event(&SystemEvent::worker_stop(&r));
        assert_eq!(state.snapshot().metrics.per_op.active.get("blur"), Some(&0));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Start(usize, usize),
        Stop(usize, usize),
        Outcome(usize, usize, bool),
    }

    const OPS: [&str; 3] = ["thumbnail", "blur", "rotate90"];

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..3usize, 0..4usize).prop_map(|(o, w)| Step::Start(o, w)),
            (0..3usize, 0..4usize).prop_map(|(o, w)| Step::Stop(o, w)),
            (0..3usize, 0..5usize, any::<bool>()).prop_map(|(o, i, ok)| Step::Outcome(o, i, ok)),
        ]
    }

    proptest! {
        #[test]
        fn counters_stay_consistent_and_monotonic_under_any_event_order(steps in prop::collection::vec(step(), 0..60)) {
            let mut state = AggregateState::new();
            let mut recorded = [0u64; 3];
            for s in &steps {
                match *s {
                    Step::Start(o, w) => {
                        state.apply_event(&SystemEvent::worker_start(&reg(OPS[o], &w.to_string())));
                    }
                    Step::Stop(o, w) => {
                        state.apply_event(&SystemEvent::worker_stop(&reg(OPS[o], &w.to_string())));
                    }
                    Step::Outcome(o, i, ok) => {
                        let t = task(&format!("img{i}"), OPS[o]);
                        let outcome = if ok {
                            TaskOutcome::succeeded(&t, format!("d/{}.jpg", OPS[o]))
                        } else {
                            TaskOutcome::failed(&t, "boom")
                        };
                        state.apply_outcome(&outcome);
                    }
                }

                let snap = state.snapshot();
                for (i, op) in OPS.iter().enumerate() {
                    let now = snap.success_count(op) + snap.failed_count(op);
                    prop_assert!(now >= recorded[i], "{op} went from {} to {now}", recorded[i]);
                    recorded[i] = now;
                }
            }

            let snap = state.snapshot();
            let m = &snap.metrics;
            let per_op_active: u64 = m.per_op.active.values().sum();
            prop_assert_eq!(per_op_active, m.worker_active);
            prop_assert!(m.worker_active <= m.worker_started);

            let success: u64 = m.per_op.success.values().sum();
            let failed: u64 = m.per_op.failed.values().sum();
            prop_assert_eq!(success, m.total_variants);
            prop_assert_eq!(failed, m.failed_variants);

            // At most one counted outcome per (image, op).
            for op in OPS {
                prop_assert!(snap.success_count(op) + snap.failed_count(op) <= 5);
            }
            // Every variant entry comes from a success.
            let entries: usize = snap.variants.values().map(BTreeMap::len).sum();
            prop_assert!(entries as u64 <= m.total_variants + m.failed_variants);
        }
    }
}
