//! Pairs a worker's announce with its withdraw, exactly once, on every exit
//! path: `worker_start` with `worker_stop`, and a registry key (once written)
//! with its removal.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use darkroom_core::messages::{codec, mailbox_names};
use darkroom_core::{SystemEvent, WorkerRegistration};
use tracing::{debug, warn};

use crate::mailbox::MailboxTransport;
use crate::registry::WorkerRegistry;

struct Announcer {
    registration: WorkerRegistration,
    registered: bool,
    transport: Arc<dyn MailboxTransport>,
    registry: Arc<dyn WorkerRegistry>,
    timeout: Duration,
}

impl Announcer {
    async fn post(&self, event: &SystemEvent) {
        let payload = match codec::encode(event) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(event = event.kind(), error = %e, "lifecycle event not encodable");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send(mailbox_names::LIFECYCLE, payload, self.timeout)
            .await
        {
            warn!(event = event.kind(), mailbox = %self.registration.mailbox, error = %e, "lifecycle event not delivered");
        }
    }

    async fn withdraw(self) {
        self.post(&SystemEvent::worker_stop(&self.registration)).await;
        let reg = &self.registration;
        // Never touch a key this instance didn't write: after a name
        // collision it belongs to the live owner.
        if self.registered {
            if let Err(e) = self.registry.deregister(&reg.operation, &reg.instance).await {
                warn!(mailbox = %reg.mailbox, error = %e, "deregistration failed, stale key left behind");
            }
        }
        debug!(mailbox = %reg.mailbox, registered = self.registered, "worker withdrawn");
    }
}

/// Armed once the worker has announced itself. Withdrawal runs once: either
/// through [`release`](LifecycleGuard::release) or, if the worker future is
/// dropped first, on a task spawned from `Drop`.
///
/// The registry key is written separately by
/// [`register`](LifecycleGuard::register), after the worker owns its
/// mailbox.
pub struct LifecycleGuard {
    announcer: Option<Announcer>,
}

impl LifecycleGuard {
    /// Posts `worker_start`.
    pub async fn announce(
        registration: WorkerRegistration,
        transport: Arc<dyn MailboxTransport>,
        registry: Arc<dyn WorkerRegistry>,
        timeout: Duration,
    ) -> Self {
        let announcer = Announcer {
            registration,
            registered: false,
            transport,
            registry,
            timeout,
        };
        announcer
            .post(&SystemEvent::worker_start(&announcer.registration))
            .await;
        Self {
            announcer: Some(announcer),
        }
    }

    /// Writes the registry key so the dispatcher can discover this worker.
    ///
    /// Failures are logged, not fatal: the worker still runs but stays
    /// undiscoverable until it is restarted.
    pub async fn register(&mut self) {
        let Some(announcer) = self.announcer.as_mut() else {
            return;
        };
        match announcer.registry.register(&announcer.registration).await {
            Ok(()) => announcer.registered = true,
            Err(e) => {
                warn!(mailbox = %announcer.registration.mailbox, error = %e, "registration failed");
            }
        }
    }

    /// Posts `worker_stop` and removes the registry key if one was written.
    pub async fn release(mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.withdraw().await;
        }
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        let Some(announcer) = self.announcer.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(announcer.withdraw());
            }
            Err(_) => warn!(
                mailbox = %announcer.registration.mailbox,
                "no runtime to withdraw worker, stale key left behind"
            ),
        }
    }
}

impl std::fmt::Debug for LifecycleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleGuard")
            .field(
                "mailbox",
                &self.announcer.as_ref().map(|a| a.registration.mailbox.as_str()),
            )
            .finish()
    }
}
