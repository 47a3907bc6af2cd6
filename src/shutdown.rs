use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::delivery::{route, Delivered};
use crate::messages::Message;
use crate::registry::Registry;

/// Read side of the process-wide shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered (or the trigger is gone).
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions the shutdown notice was queued for.
    pub notified: usize,
    /// Identities still bound when the grace period ran out.
    pub forced: Vec<String>,
}

pub struct ShutdownCoordinator {
    registry: Registry,
    trigger: watch::Sender<bool>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Registry, grace: Duration) -> Self {
        let (trigger, _) = watch::channel(false);
        Self {
            registry,
            trigger,
            grace,
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.trigger.subscribe(),
        }
    }

    /// Queues `SERVER_SHUTDOWN:<reason>` for every live session and raises the
    /// flag in the same critical section, so no session can unbind in between.
    pub async fn begin(&self, reason: &str) -> usize {
        let notified = self
            .registry
            .atomically(|state| {
                let outcome = route(state, Message::server_shutdown(reason), None);
                self.trigger.send_replace(true);
                match outcome {
                    Delivered::Broadcast { delivered, .. } => delivered,
                    _ => 0,
                }
            })
            .await;
        info!("Shutdown started ({reason}), notified {notified} session(s)");
        notified
    }

    /// Waits up to the grace period for `sessions` to finish, then aborts the
    /// rest and clears whatever is still bound.
    pub async fn drain(&self, sessions: &mut JoinSet<()>) -> Vec<String> {
        let finished = tokio::time::timeout(self.grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "{} session(s) still open after {:?}, closing them",
                sessions.len(),
                self.grace
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        let forced = self.registry.evict_all().await;
        if !forced.is_empty() {
            warn!("Force-closed sessions for: {}", forced.join(", "));
        }
        forced
    }

    pub async fn shutdown(&self, reason: &str, sessions: &mut JoinSet<()>) -> ShutdownReport {
        let notified = self.begin(reason).await;
        let forced = self.drain(sessions).await;
        info!("Server shutdown complete");
        ShutdownReport { notified, forced }
    }
}
