//! Named, bounded mailboxes with acknowledgment and request/response
//! correlation.
//!
//! [`MailboxTransport`] is the seam every component talks through: the
//! dispatcher, workers, supervisor and aggregator never share memory, they
//! only `create` mailboxes, `send`/`request` payloads to names, and `ack` or
//! `respond` to what they receive. [`LocalTransport`] is the in-process
//! implementation; a networked transport only has to feed the same
//! [`Mailbox`] receiver type.
//!
//! Delivery is at-most-once: nothing is persisted and an un-acked message is
//! never redelivered.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};

pub use local::LocalTransport;

use crate::telemetry::metric_names;

/// Errors surfaced by mailbox operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    /// A live owner already holds this exact name.
    #[error("mailbox {name} is already owned by a live receiver")]
    NameCollision { name: String },
    /// No receiver bound the name before the deadline.
    #[error("mailbox {name} is not bound")]
    Unreachable { name: String },
    /// The mailbox stayed full, or no reply arrived, until the deadline.
    #[error("mailbox {name} timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },
    /// Non-blocking send found the mailbox at capacity.
    #[error("mailbox {name} is full")]
    Full { name: String },
    /// The receiver closed while the message was in transit.
    #[error("mailbox {name} closed")]
    Closed { name: String },
    /// The receiver dropped a request without acking or responding.
    #[error("request to {name} was dropped without a reply")]
    NoReply { name: String },
}

/// Reply correlated to a [`MailboxTransport::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Receipt confirmed, no body.
    Ack,
    /// Receipt confirmed with a response payload.
    Response(Bytes),
}

/// One received message plus its (optional) reply channel.
///
/// Consuming the delivery with [`ack`](Delivery::ack) or
/// [`respond`](Delivery::respond) answers a pending request. Dropping it
/// without either leaves the requester with [`MailboxError::NoReply`].
#[derive(Debug)]
pub struct Delivery {
    payload: Bytes,
    reply: Option<oneshot::Sender<Reply>>,
}

impl Delivery {
    /// A fire-and-forget delivery (nobody awaits the ack).
    #[must_use]
    pub fn oneway(payload: Bytes) -> Self {
        Self {
            payload,
            reply: None,
        }
    }

    /// A delivery whose sender awaits a reply on the returned receiver.
    #[must_use]
    pub fn with_reply(payload: Bytes) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                reply: Some(tx),
            },
            rx,
        )
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether a sender is waiting on this delivery.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Confirms receipt to the sender.
    pub fn ack(self) {
        self.reply_with(Reply::Ack);
    }

    /// Answers the sender with a payload.
    pub fn respond(self, payload: Bytes) {
        self.reply_with(Reply::Response(payload));
    }

    fn reply_with(mut self, reply: Reply) {
        if let Some(tx) = self.reply.take() {
            // The requester may have timed out and gone away.
            let _ = tx.send(reply);
        }
    }
}

/// Acks and drops a payload that failed to decode.
pub(crate) fn discard_malformed(
    delivery: Delivery,
    mailbox: &str,
    error: &darkroom_core::messages::CodecError,
) {
    delivery.ack();
    metrics::counter!(metric_names::MALFORMED_MESSAGES, "mailbox" => mailbox.to_string())
        .increment(1);
    tracing::debug!(mailbox, error = %error, "malformed message discarded");
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Receiving end of a named mailbox.
///
/// The name stays bound for as long as the `Mailbox` lives; dropping or
/// closing it releases the name so a new owner may bind it.
pub struct Mailbox {
    name: String,
    rx: mpsc::Receiver<Delivery>,
    release: Option<Release>,
}

impl Mailbox {
    /// Wraps a receiver. `release` runs once, when the mailbox is closed or
    /// dropped, and must unbind `name` from the transport.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        rx: mpsc::Receiver<Delivery>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            rx,
            release: Some(Box::new(release)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. Returns `None` once the mailbox is closed
    /// and drained.
    ///
    /// Cancel-safe: a dropped `receive()` future loses no message.
    pub async fn receive(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Stops accepting new messages and releases the name. Messages already
    /// queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Turns the mailbox into a lazy stream of deliveries, starting from
    /// whatever arrives next.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        stream::unfold(self, |mut mailbox| async move {
            mailbox.receive().await.map(|delivery| (delivery, mailbox))
        })
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("bound", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Pluggable mailbox substrate scoped to one namespace.
#[async_trait]
pub trait MailboxTransport: Send + Sync + 'static {
    /// The operational namespace this transport serves.
    fn namespace(&self) -> &str;

    /// Binds `name` with a bounded queue of `capacity` messages.
    ///
    /// # Errors
    ///
    /// Returns `MailboxError::NameCollision` if a live owner already holds
    /// `name`.
    fn create(&self, name: &str, capacity: usize) -> Result<Mailbox, MailboxError>;

    /// Whether a live owner currently holds `name`.
    fn is_bound(&self, name: &str) -> bool;

    /// Enqueues `payload` without waiting for capacity or for the name to
    /// become bound.
    ///
    /// # Errors
    ///
    /// `Unreachable` if unbound, `Full` if at capacity, `Closed` if the
    /// receiver is gone.
    fn try_send(&self, target: &str, payload: Bytes) -> Result<(), MailboxError>;

    /// Enqueues `payload`, waiting up to `timeout` for `target` to be bound
    /// and to have capacity. Does not wait for an ack.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the name never became bound, `Timeout` if the
    /// mailbox stayed full, `Closed` if the receiver went away.
    async fn send(&self, target: &str, payload: Bytes, timeout: Duration)
        -> Result<(), MailboxError>;

    /// Enqueues `payload` and waits for the receiver's ack or response, all
    /// within `timeout`.
    ///
    /// # Errors
    ///
    /// Any `send` error, plus `Timeout` if no reply arrived in time and
    /// `NoReply` if the receiver dropped the message unanswered.
    async fn request(
        &self,
        target: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Reply, MailboxError>;
}
