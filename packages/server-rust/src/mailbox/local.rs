//! In-process mailbox transport.
//!
//! Every bound name maps to the sending half of a bounded mpsc channel. The
//! receiving half lives in the owner's [`Mailbox`]; when that is dropped the
//! slot is released, and a slot whose receiver is gone counts as unbound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::debug;

use super::{Delivery, Mailbox, MailboxError, MailboxTransport, Reply};

/// How often an unbound target is re-resolved while a send waits for it.
const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Slot {
    binding: u64,
    tx: mpsc::Sender<Delivery>,
}

/// Mailbox transport for components that share one process.
#[derive(Debug)]
pub struct LocalTransport {
    namespace: String,
    slots: Arc<DashMap<String, Slot>>,
    next_binding: AtomicU64,
    resolve_interval: Duration,
}

impl LocalTransport {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            slots: Arc::new(DashMap::new()),
            next_binding: AtomicU64::new(1),
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
        }
    }

    /// Overrides how often a pending send re-checks an unbound name.
    #[must_use]
    pub fn with_resolve_interval(mut self, interval: Duration) -> Self {
        self.resolve_interval = interval;
        self
    }

    /// Number of names currently bound to a live receiver.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.tx.is_closed()).count()
    }

    fn lookup(&self, name: &str) -> Option<mpsc::Sender<Delivery>> {
        self.slots
            .get(name)
            .filter(|slot| !slot.tx.is_closed())
            .map(|slot| slot.tx.clone())
    }

    /// Waits until `name` is bound or `deadline` passes.
    async fn resolve(
        &self,
        name: &str,
        deadline: Instant,
    ) -> Result<mpsc::Sender<Delivery>, MailboxError> {
        loop {
            if let Some(tx) = self.lookup(name) {
                return Ok(tx);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MailboxError::Unreachable {
                    name: name.to_string(),
                });
            }
            tokio::time::sleep(self.resolve_interval.min(deadline - now)).await;
        }
    }

    async fn deliver(
        &self,
        target: &str,
        delivery: Delivery,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), MailboxError> {
        let tx = self.resolve(target, deadline).await?;
        match tokio::time::timeout_at(deadline, tx.send(delivery)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MailboxError::Closed {
                name: target.to_string(),
            }),
            Err(_) => Err(timeout_error(target, timeout)),
        }
    }
}

fn timeout_error(name: &str, timeout: Duration) -> MailboxError {
    MailboxError::Timeout {
        name: name.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

#[async_trait]
impl MailboxTransport for LocalTransport {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create(&self, name: &str, capacity: usize) -> Result<Mailbox, MailboxError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let binding = self.next_binding.fetch_add(1, Ordering::Relaxed);

        match self.slots.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().tx.is_closed() {
                    return Err(MailboxError::NameCollision {
                        name: name.to_string(),
                    });
                }
                // Previous owner is gone but its release hasn't run yet.
                occupied.insert(Slot { binding, tx });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { binding, tx });
            }
        }
        debug!(namespace = %self.namespace, mailbox = name, capacity, "mailbox bound");

        let slots = Arc::clone(&self.slots);
        let owned = name.to_string();
        Ok(Mailbox::new(name, rx, move || {
            // Only unbind our own binding; a successor may already own the name.
            slots.remove_if(&owned, |_, slot| slot.binding == binding);
        }))
    }

    fn is_bound(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn try_send(&self, target: &str, payload: Bytes) -> Result<(), MailboxError> {
        let tx = self.lookup(target).ok_or_else(|| MailboxError::Unreachable {
            name: target.to_string(),
        })?;
        tx.try_send(Delivery::oneway(payload)).map_err(|e| match e {
            TrySendError::Full(_) => MailboxError::Full {
                name: target.to_string(),
            },
            TrySendError::Closed(_) => MailboxError::Closed {
                name: target.to_string(),
            },
        })
    }

    async fn send(
        &self,
        target: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(), MailboxError> {
        let deadline = Instant::now() + timeout;
        self.deliver(target, Delivery::oneway(payload), deadline, timeout)
            .await
    }

    async fn request(
        &self,
        target: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Reply, MailboxError> {
        let deadline = Instant::now() + timeout;
        let (delivery, reply_rx) = Delivery::with_reply(payload);
        self.deliver(target, delivery, deadline, timeout).await?;

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(MailboxError::NoReply {
                name: target.to_string(),
            }),
            Err(_) => Err(timeout_error(target, timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    const SHORT: Duration = Duration::from_millis(500);

    fn transport() -> LocalTransport {
        LocalTransport::new("test-ns")
    }

    #[test]
    fn second_live_owner_collides() {
        let t = transport();
        let _first = t.create("worker-blur-a", 4).unwrap();
        let err = t.create("worker-blur-a", 4).unwrap_err();
        assert_eq!(
            err,
            MailboxError::NameCollision {
                name: "worker-blur-a".to_string()
            }
        );
    }

    #[test]
    fn name_is_reusable_after_owner_drops() {
        let t = transport();
        let first = t.create("uploads", 4).unwrap();
        assert!(t.is_bound("uploads"));
        drop(first);
        assert!(!t.is_bound("uploads"));
        assert!(t.create("uploads", 4).is_ok());
    }

    #[test]
    fn closing_releases_name_for_successor() {
        let t = transport();
        let mut first = t.create("m", 1).unwrap();
        first.close();
        let _second = t.create("m", 1).unwrap();
        // The closed owner already released; dropping it must not unbind.
        drop(first);
        assert!(t.is_bound("m"));
        assert_eq!(t.bound_count(), 1);
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let t = transport();
        let mut mb = t.create("q", 8).unwrap();
        for i in 0u8..3 {
            t.send("q", Bytes::from(vec![i]), SHORT).await.unwrap();
        }
        for i in 0u8..3 {
            assert_eq!(mb.receive().await.unwrap().payload(), &[i]);
        }
    }

    #[tokio::test]
    async fn request_returns_receiver_response() {
        let t = Arc::new(transport());
        let mut mb = t.create("echo", 1).unwrap();
        let responder = tokio::spawn(async move {
            let d = mb.receive().await.unwrap();
            let body = Bytes::copy_from_slice(d.payload());
            d.respond(body);
        });

        let reply = t
            .request("echo", Bytes::from_static(b"hi"), SHORT)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Response(Bytes::from_static(b"hi")));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_request_reports_no_reply() {
        let t = Arc::new(transport());
        let mut mb = t.create("sink", 1).unwrap();
        let receiver = tokio::spawn(async move {
            drop(mb.receive().await);
        });

        let err = t.request("sink", Bytes::new(), SHORT).await.unwrap_err();
        assert!(matches!(err, MailboxError::NoReply { .. }));
        receiver.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_unbound_name_times_out_as_unreachable() {
        let t = transport();
        let started = Instant::now();
        let err = t
            .send("worker-blur-gone", Bytes::new(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::Unreachable { .. }));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn send_waits_for_late_binding() {
        let t = Arc::new(transport());
        let binder = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut mb = t.create("late", 1).unwrap();
                mb.receive().await.unwrap().payload().to_vec()
            })
        };

        t.send("late", Bytes::from_static(b"ok"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(binder.await.unwrap(), b"ok");
    }

    #[tokio::test(start_paused = true)]
    async fn late_binding_is_seen_on_next_resolve_tick() {
        let t = Arc::new(transport().with_resolve_interval(Duration::from_millis(250)));
        let binder = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut mb = t.create("late", 1).unwrap();
                mb.receive().await.unwrap();
                Instant::now()
            })
        };

        let started = Instant::now();
        t.send("late", Bytes::from_static(b"ok"), Duration::from_secs(1))
            .await
            .unwrap();
        let received_at = binder.await.unwrap();
        assert!(received_at - started >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn full_mailbox_applies_backpressure_until_timeout() {
        let t = transport();
        let _mb = t.create("tiny", 1).unwrap();
        t.send("tiny", Bytes::new(), SHORT).await.unwrap();

        let err = t.send("tiny", Bytes::new(), SHORT).await.unwrap_err();
        assert!(matches!(err, MailboxError::Timeout { timeout_ms: 500, .. }));
        assert!(matches!(
            t.try_send("tiny", Bytes::new()),
            Err(MailboxError::Full { .. })
        ));
    }

    #[tokio::test]
    async fn closed_mailbox_drains_then_ends() {
        let t = transport();
        let mut mb = t.create("c", 4).unwrap();
        t.send("c", Bytes::from_static(b"last"), SHORT).await.unwrap();
        mb.close();

        assert!(matches!(
            t.try_send("c", Bytes::new()),
            Err(MailboxError::Unreachable { .. })
        ));
        assert_eq!(mb.receive().await.unwrap().payload(), b"last");
        assert!(mb.receive().await.is_none());
    }

    #[tokio::test]
    async fn stream_yields_deliveries() {
        let t = transport();
        let mb = t.create("s", 4).unwrap();
        t.send("s", Bytes::from_static(b"a"), SHORT).await.unwrap();
        t.send("s", Bytes::from_static(b"b"), SHORT).await.unwrap();

        let got: Vec<Vec<u8>> = mb
            .into_stream()
            .take(2)
            .map(|d| d.payload().to_vec())
            .collect()
            .await;
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
