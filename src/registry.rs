//! Shared session state: who is connected, their status, and their pending mail.
//!
//! Every read or write goes through one mutex. Composite steps (login, teardown,
//! shutdown notice) run inside a single [`Registry::atomically`] call so no
//! other task can observe them half applied.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::delivery::DeliveryError;
use crate::messages::Message;

pub type SessionId = Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already logged in elsewhere")]
    AlreadyBound(String),
    #[error("session {0} is already bound")]
    SessionAlreadyBound(SessionId),
    #[error("session {0} closed before login finished")]
    SessionClosed(SessionId),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown status {0:?}")]
pub struct ParseStatusError(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Online,
    Away,
    Inactive,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Online => "online",
            Status::Away => "away",
            Status::Inactive => "inactive",
        })
    }
}

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(Status::Online),
            "away" => Ok(Status::Away),
            "inactive" => Ok(Status::Inactive),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum Outgoing {
    Line(String),
    /// A private message, kept whole so a writer that fails before it reaches
    /// the socket can hand it back to the mailbox.
    Mail(Message),
}

impl Outgoing {
    pub fn render(&self) -> String {
        match self {
            Outgoing::Line(line) => line.clone(),
            Outgoing::Mail(message) => message.render(),
        }
    }
}

pub type Outbox = mpsc::UnboundedReceiver<Outgoing>;

/// The registry's view of one connection: an id plus the outbox its writer drains.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        outbox: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self { id, peer, outbox }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues one line for the writer. Fails once the writer has gone away,
    /// which only happens after the socket broke or closed.
    pub fn send(&self, line: impl Into<String>) -> Result<(), DeliveryError> {
        self.push(Outgoing::Line(line.into()))
    }

    pub fn send_mail(&self, message: Message) -> Result<(), DeliveryError> {
        self.push(Outgoing::Mail(message))
    }

    fn push(&self, outgoing: Outgoing) -> Result<(), DeliveryError> {
        self.outbox
            .send(outgoing)
            .map_err(|_| DeliveryError::SessionClosed(self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// Resolves once the writer has stopped draining this session's outbox.
    pub async fn closed(&self) {
        self.outbox.closed().await;
    }
}

#[derive(Default)]
pub struct RegistryState {
    live: BTreeMap<String, SessionHandle>,
    by_session: HashMap<SessionId, String>,
    statuses: HashMap<String, Status>,
    mailboxes: HashMap<String, Vec<Message>>,
}

impl RegistryState {
    /// Only one live session per identity; a second login is refused.
    pub fn bind(&mut self, handle: SessionHandle, identity: &str) -> Result<(), RegistryError> {
        if self.live.contains_key(identity) {
            return Err(RegistryError::AlreadyBound(identity.to_string()));
        }
        if self.by_session.contains_key(&handle.id) {
            return Err(RegistryError::SessionAlreadyBound(handle.id));
        }
        self.by_session.insert(handle.id, identity.to_string());
        self.live.insert(identity.to_string(), handle);
        Ok(())
    }

    /// Returns the identity that was bound, if any.
    pub fn unbind(&mut self, session: SessionId) -> Option<String> {
        let identity = self.by_session.remove(&session)?;
        self.live.remove(&identity);
        Some(identity)
    }

    pub fn set_status(&mut self, identity: &str, status: Status) {
        self.statuses.insert(identity.to_string(), status);
    }

    pub fn status(&self, identity: &str) -> Option<Status> {
        self.statuses.get(identity).copied()
    }

    pub fn live_session_for(&self, identity: &str) -> Option<&SessionHandle> {
        self.live.get(identity)
    }

    pub fn identity_for(&self, session: SessionId) -> Option<&str> {
        self.by_session.get(&session).map(String::as_str)
    }

    pub fn enqueue_mail(&mut self, identity: &str, message: Message) {
        self.mailboxes
            .entry(identity.to_string())
            .or_default()
            .push(message);
    }

    /// Empties the mailbox, returning entries in enqueue order.
    pub fn drain_mail(&mut self, identity: &str) -> Vec<Message> {
        self.mailboxes.remove(identity).unwrap_or_default()
    }

    pub fn pending_mail(&self, identity: &str) -> usize {
        self.mailboxes.get(identity).map_or(0, Vec::len)
    }

    /// Live sessions ordered by identity.
    pub fn snapshot_live_sessions(&self) -> Vec<(SessionHandle, String)> {
        self.live
            .iter()
            .map(|(identity, handle)| (handle.clone(), identity.clone()))
            .collect()
    }

    pub fn live_identities(&self) -> Vec<String> {
        self.live.keys().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Drops every remaining binding and marks those identities inactive.
    pub fn evict_all(&mut self) -> Vec<String> {
        self.by_session.clear();
        let evicted: Vec<String> = std::mem::take(&mut self.live).into_keys().collect();
        for identity in &evicted {
            self.statuses.insert(identity.clone(), Status::Inactive);
        }
        evicted
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the registry locked. `f` must not block.
    pub async fn atomically<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut RegistryState) -> R,
    {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    pub async fn bind(&self, handle: SessionHandle, identity: &str) -> Result<(), RegistryError> {
        self.atomically(|state| state.bind(handle, identity)).await
    }

    pub async fn unbind(&self, session: SessionId) -> Option<String> {
        self.atomically(|state| state.unbind(session)).await
    }

    pub async fn set_status(&self, identity: &str, status: Status) {
        self.atomically(|state| state.set_status(identity, status)).await;
    }

    pub async fn status(&self, identity: &str) -> Option<Status> {
        self.atomically(|state| state.status(identity)).await
    }

    pub async fn live_session_for(&self, identity: &str) -> Option<SessionHandle> {
        self.atomically(|state| state.live_session_for(identity).cloned())
            .await
    }

    pub async fn enqueue_mail(&self, identity: &str, message: Message) {
        self.atomically(|state| state.enqueue_mail(identity, message))
            .await;
    }

    pub async fn drain_mail(&self, identity: &str) -> Vec<Message> {
        self.atomically(|state| state.drain_mail(identity)).await
    }

    pub async fn snapshot_live_sessions(&self) -> Vec<(SessionHandle, String)> {
        self.atomically(|state| state.snapshot_live_sessions()).await
    }

    pub async fn live_count(&self) -> usize {
        self.atomically(|state| state.live_count()).await
    }

    pub async fn evict_all(&self) -> Vec<String> {
        self.atomically(RegistryState::evict_all).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn handle() -> (SessionHandle, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = "127.0.0.1:9".parse().unwrap();
        (SessionHandle::new(Uuid::new_v4(), peer, tx), rx)
    }

    /// Everything queued so far, as it would appear on the wire.
    pub(crate) fn drain(rx: &mut Outbox) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|outgoing| outgoing.render())
            .collect()
    }

    #[tokio::test]
    async fn bind_and_unbind_track_live_sessions() {
        let registry = Registry::new();
        let (alice, _rx) = handle();
        let alice_id = alice.id();

        registry.bind(alice, "alice").await.unwrap();
        assert_eq!(registry.live_count().await, 1);
        assert!(registry.live_session_for("alice").await.is_some());

        assert_eq!(registry.unbind(alice_id).await.as_deref(), Some("alice"));
        assert_eq!(registry.live_count().await, 0);
        assert!(registry.live_session_for("alice").await.is_none());
    }

    #[tokio::test]
    async fn second_binding_for_identity_is_refused() {
        let registry = Registry::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();
        let first_id = first.id();

        registry.bind(first, "alice").await.unwrap();
        assert_eq!(
            registry.bind(second, "alice").await,
            Err(RegistryError::AlreadyBound("alice".to_string()))
        );
        let live = registry.live_session_for("alice").await.unwrap();
        assert_eq!(live.id(), first_id);
    }

    #[tokio::test]
    async fn unbinding_unknown_session_is_a_no_op() {
        let registry = Registry::new();
        let (alice, _rx) = handle();
        registry.bind(alice, "alice").await.unwrap();

        assert!(registry.unbind(Uuid::new_v4()).await.is_none());
        assert_eq!(registry.live_count().await, 1);
    }

    #[tokio::test]
    async fn mailbox_drains_in_order_exactly_once() {
        let registry = Registry::new();
        registry.enqueue_mail("bob", Message::private("alice", "bob", "one")).await;
        registry.enqueue_mail("bob", Message::private("carol", "bob", "two")).await;
        registry.enqueue_mail("bob", Message::private("alice", "bob", "three")).await;

        let bodies: Vec<String> = registry
            .drain_mail("bob")
            .await
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert!(registry.drain_mail("bob").await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_excludes_committed_unbinds() {
        let registry = Registry::new();
        let (alice, _rx1) = handle();
        let (bob, _rx2) = handle();
        let bob_id = bob.id();
        registry.bind(alice, "alice").await.unwrap();
        registry.bind(bob, "bob").await.unwrap();

        registry.unbind(bob_id).await;
        let snapshot = registry.snapshot_live_sessions().await;
        let names: Vec<&str> = snapshot.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, ["alice"]);
    }

    #[tokio::test]
    async fn evict_all_empties_the_registry() {
        let registry = Registry::new();
        let (alice, _rx1) = handle();
        let (bob, _rx2) = handle();
        registry.bind(alice, "alice").await.unwrap();
        registry.bind(bob, "bob").await.unwrap();
        registry.set_status("bob", Status::Away).await;

        let evicted = registry.evict_all().await;
        assert_eq!(evicted, ["alice", "bob"]);
        assert_eq!(registry.live_count().await, 0);
        assert_eq!(registry.status("bob").await, Some(Status::Inactive));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("AWAY".parse::<Status>(), Ok(Status::Away));
        assert_eq!(Status::Online.to_string(), "online");
        let err = "busy".parse::<Status>().unwrap_err();
        assert_eq!(err, ParseStatusError("busy".to_string()));
        assert_eq!(err.to_string(), "unknown status \"busy\"");
    }

    #[tokio::test]
    async fn handle_reports_closed_once_outbox_is_closed() {
        let (alice, mut rx) = handle();
        assert!(!alice.is_closed());
        rx.close();
        assert!(alice.is_closed());
        tokio::time::timeout(std::time::Duration::from_secs(1), alice.closed())
            .await
            .unwrap();
        assert_eq!(alice.send("late"), Err(DeliveryError::SessionClosed(alice.id())));
    }
}
