use log::{debug, warn};
use thiserror::Error;

use crate::messages::{Message, MessageKind};
use crate::registry::{Registry, RegistryState, SessionId};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
}

/// Where a message ended up.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivered {
    Broadcast { delivered: usize, failed: usize },
    /// Written to the target's live session.
    Direct,
    /// Appended to the target's mailbox.
    Queued,
    /// A notice for someone who is not connected.
    Dropped,
}

/// Resolves targets against the registry and hands lines to session outboxes.
#[derive(Clone)]
pub struct DeliveryEngine {
    registry: Registry,
}

impl DeliveryEngine {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn deliver(&self, message: Message) -> Delivered {
        self.registry
            .atomically(|state| route(state, message, None))
            .await
    }

    /// Like [`DeliveryEngine::deliver`], but a broadcast skips `except`.
    pub async fn deliver_except(&self, message: Message, except: &str) -> Delivered {
        self.registry
            .atomically(|state| route(state, message, Some(except)))
            .await
    }
}

/// Delivers `message` under an already held registry lock.
pub fn route(state: &mut RegistryState, message: Message, except: Option<&str>) -> Delivered {
    match (message.kind, message.target.clone()) {
        (MessageKind::Private, Some(target)) => deliver_private(state, message, &target),
        (_, Some(target)) => deliver_direct(state, &message, &target),
        (_, None) => broadcast(state, &message, except),
    }
}

fn broadcast(state: &RegistryState, message: &Message, except: Option<&str>) -> Delivered {
    let line = message.render();
    let mut delivered = 0;
    let mut failed = 0;

    for (handle, identity) in state.snapshot_live_sessions() {
        if except == Some(identity.as_str()) {
            continue;
        }
        match handle.send(line.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => {
                warn!("Skipping broadcast to {identity}: {e}");
                failed += 1;
            }
        }
    }

    debug!("Broadcast from {} reached {delivered} session(s)", message.sender);
    Delivered::Broadcast { delivered, failed }
}

/// Either the live socket or the mailbox gets the message, never both. A
/// message the writer accepts but cannot flush is returned to the mailbox by
/// the writer itself.
fn deliver_private(state: &mut RegistryState, message: Message, target: &str) -> Delivered {
    if let Some(handle) = state.live_session_for(target) {
        match handle.send_mail(message.clone()) {
            Ok(()) => return Delivered::Direct,
            Err(e) => warn!("Private message to {target} failed ({e}), queueing instead"),
        }
    }
    state.enqueue_mail(target, message);
    Delivered::Queued
}

fn deliver_direct(state: &RegistryState, message: &Message, target: &str) -> Delivered {
    let Some(handle) = state.live_session_for(target) else {
        debug!("Dropping notice for offline {target}");
        return Delivered::Dropped;
    };
    match handle.send(message.render()) {
        Ok(()) => Delivered::Direct,
        Err(e) => {
            warn!("Notice to {target} failed: {e}");
            Delivered::Dropped
        }
    }
}
