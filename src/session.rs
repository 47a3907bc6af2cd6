//! Per-connection state machine.
//!
//! ```text
//! Connecting -> AwaitingAuthChoice -> AwaitingUsername -> AwaitingPassword
//!                                                              |
//!                                       Authenticated <--------+
//!                                             |                |
//!                                          Closing <-----------+ (auth failure)
//! ```
//!
//! Each connection runs its reader (this state machine) and its writer in the
//! same task. Everything addressed to the session, including its own replies,
//! goes through the outbox the writer drains, so lines leave in the order
//! they were queued. A failed socket write closes the outbox, which the
//! reader treats like a disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::commands::Dispatcher;
use crate::credentials::CredentialStore;
use crate::delivery::{route, DeliveryEngine};
use crate::messages::{
    Message, AUTH_CHOICE_PROMPT, COMMAND_PREFIX, HELP_HINT, LOGIN_FAILED, LOGIN_SUCCESSFUL,
    PASSWORD_PROMPT, USERNAME_PROMPT,
};
use crate::registry::{Outbox, Outgoing, Registry, RegistryError, SessionHandle, SessionId, Status};
use crate::shutdown::ShutdownSignal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingAuthChoice,
    AwaitingUsername,
    AwaitingPassword,
    Authenticated,
    Closing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    Login,
    Register,
}

impl AuthMode {
    fn parse(choice: &str) -> Option<Self> {
        match choice.to_ascii_lowercase().as_str() {
            "l" | "login" => Some(AuthMode::Login),
            "r" | "register" => Some(AuthMode::Register),
            _ => None,
        }
    }
}

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub delivery: DeliveryEngine,
    pub dispatcher: Dispatcher,
    pub credentials: Arc<dyn CredentialStore>,
    pub shutdown: ShutdownSignal,
}

/// Serves one accepted connection until it closes.
pub async fn serve(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    let (read_half, write_half) = stream.into_split();
    let (outbox, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    let registry = ctx.delivery.registry().clone();
    let handler = SessionHandler::new(SessionHandle::new(id, peer, outbox), ctx);

    tokio::join!(
        handler.run(BufReader::new(read_half)),
        write_lines(write_half, rx, id, registry)
    );
    debug!("Connection {id} ({peer}) released");
}

/// Drains the outbox onto the socket. Ends once every sender is gone, or on
/// the first write error, which closes the outbox for everyone else too.
pub async fn write_lines<W>(mut writer: W, mut outbox: Outbox, id: SessionId, registry: Registry)
where
    W: AsyncWrite + Unpin,
{
    while let Some(outgoing) = outbox.recv().await {
        let mut line = outgoing.render();
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Write to session {id} failed: {e}");
            let returned = return_unsent_mail(&registry, &mut outbox, outgoing).await;
            if returned > 0 {
                warn!(
                    "Session {id} failed with {returned} private message(s) unsent, \
                     moved to mailbox"
                );
            }
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutting down writer for session {id}: {e}");
    }
}

/// Closes the outbox and moves every private message still in it, starting
/// with `failed`, back to its recipient's mailbox. Closing under the registry
/// lock means any later delivery sees the session as gone and queues instead.
async fn return_unsent_mail(registry: &Registry, outbox: &mut Outbox, failed: Outgoing) -> usize {
    registry
        .atomically(|state| {
            outbox.close();
            let queued = std::iter::from_fn(|| outbox.try_recv().ok());
            let unsent = std::iter::once(failed).chain(queued);
            let mut returned = 0;
            for outgoing in unsent {
                let Outgoing::Mail(message) = outgoing else {
                    continue;
                };
                if let Some(target) = message.target.clone() {
                    state.enqueue_mail(&target, message);
                    returned += 1;
                }
            }
            returned
        })
        .await
}

pub struct SessionHandler {
    handle: SessionHandle,
    state: SessionState,
    mode: Option<AuthMode>,
    username: Option<String>,
    identity: Option<String>,
    ctx: SessionContext,
}

impl SessionHandler {
    pub fn new(handle: SessionHandle, ctx: SessionContext) -> Self {
        Self {
            handle,
            state: SessionState::Connecting,
            mode: None,
            username: None,
            identity: None,
            ctx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run<R>(mut self, reader: R)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut shutdown = self.ctx.shutdown.clone();

        while self.state != SessionState::Closing {
            if self.state == SessionState::Connecting {
                self.reply(AUTH_CHOICE_PROMPT);
                self.state = SessionState::AwaitingAuthChoice;
                continue;
            }
            if shutdown.is_triggered() {
                break;
            }
            if self.handle.is_closed() {
                debug!("Writer for {} is gone", self.handle.peer());
                break;
            }

            let line = tokio::select! {
                line = lines.next_line() => line,
                () = shutdown.triggered() => break,
                () = self.handle.closed() => {
                    debug!("Writer for {} is gone", self.handle.peer());
                    break;
                }
            };

            match line {
                Ok(Some(line)) => self.handle_line(line.trim()).await,
                Ok(None) => {
                    debug!("Peer {} closed the connection", self.handle.peer());
                    break;
                }
                Err(e) => {
                    warn!("Read from {} failed: {e}", self.handle.peer());
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn handle_line(&mut self, line: &str) {
        match self.state {
            SessionState::AwaitingAuthChoice => match AuthMode::parse(line) {
                Some(mode) => {
                    self.mode = Some(mode);
                    self.reply(USERNAME_PROMPT);
                    self.state = SessionState::AwaitingUsername;
                }
                None => self.reply(AUTH_CHOICE_PROMPT),
            },
            SessionState::AwaitingUsername => {
                if line.is_empty() {
                    self.reply(USERNAME_PROMPT);
                    return;
                }
                self.username = Some(line.to_string());
                self.reply(PASSWORD_PROMPT);
                self.state = SessionState::AwaitingPassword;
            }
            SessionState::AwaitingPassword => self.authenticate(line).await,
            SessionState::Authenticated => self.handle_chat(line).await,
            SessionState::Connecting | SessionState::Closing => {}
        }
    }

    async fn authenticate(&mut self, password: &str) {
        let (Some(mode), Some(username)) = (self.mode, self.username.take()) else {
            self.state = SessionState::Closing;
            return;
        };

        let outcome = match mode {
            AuthMode::Login => self.ctx.credentials.verify(&username, password).await,
            AuthMode::Register => self.ctx.credentials.register(&username, password).await,
        };
        let accepted = outcome.unwrap_or_else(|e| {
            warn!("{mode:?} for {username} rejected: {e}");
            false
        });

        if !accepted {
            self.fail_login(&username, "bad credentials");
            return;
        }

        match self.bind(&username).await {
            Ok(mail) => {
                info!(
                    "{username} logged in from {} ({mail} queued message(s) delivered)",
                    self.handle.peer()
                );
                self.identity = Some(username.clone());
                self.state = SessionState::Authenticated;
                if let Err(e) = self.ctx.credentials.touch_last_seen(&username, Utc::now()).await {
                    warn!("Could not record last seen for {username}: {e}");
                }
            }
            Err(e) => self.fail_login(&username, &e.to_string()),
        }
    }

    fn fail_login(&mut self, username: &str, reason: &str) {
        info!("Login failed for {username} from {}: {reason}", self.handle.peer());
        self.reply(LOGIN_FAILED);
        self.state = SessionState::Closing;
    }

    /// Binds the identity, flushes its mailbox and announces the join as one
    /// registry step. Returns how many queued messages were handed over.
    async fn bind(&self, username: &str) -> Result<usize, RegistryError> {
        let handle = self.handle.clone();
        self.ctx
            .delivery
            .registry()
            .atomically(|state| -> Result<usize, RegistryError> {
                state.bind(handle.clone(), username)?;
                if handle.send(LOGIN_SUCCESSFUL).is_err() {
                    state.unbind(handle.id());
                    return Err(RegistryError::SessionClosed(handle.id()));
                }
                state.set_status(username, Status::Online);

                let mut delivered = 0;
                let mut writable = true;
                for message in state.drain_mail(username) {
                    if writable && handle.send_mail(message.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        writable = false;
                        state.enqueue_mail(username, message);
                    }
                }

                if let Err(e) = handle.send(HELP_HINT) {
                    debug!("Help hint for {username} dropped: {e}");
                }
                route(state, Message::joined(username), Some(username));
                Ok(delivered)
            })
            .await
    }

    async fn handle_chat(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let Some(identity) = self.identity.clone() else {
            return;
        };

        if line.starts_with(COMMAND_PREFIX) {
            let output = self.ctx.dispatcher.dispatch(&identity, line).await;
            for message in output.messages {
                self.ctx.delivery.deliver(message).await;
            }
            if output.disconnect {
                self.state = SessionState::Closing;
            }
        } else {
            self.ctx.delivery.deliver(Message::chat(&identity, line)).await;
        }
    }

    /// Unbinds, marks inactive and announces the disconnect in one registry
    /// step. Safe to call more than once.
    async fn close(&mut self) {
        self.state = SessionState::Closing;
        let Some(identity) = self.identity.take() else {
            return;
        };

        let id = self.handle.id();
        let remaining = self
            .ctx
            .delivery
            .registry()
            .atomically(|state| -> Option<usize> {
                state.unbind(id)?;
                state.set_status(&identity, Status::Inactive);
                route(state, Message::user_disconnect(&identity), None);
                Some(state.live_count())
            })
            .await;

        if let Some(remaining) = remaining {
            info!("{identity} has disconnected, {remaining} user(s) remaining");
        }
        if let Err(e) = self.ctx.credentials.touch_last_seen(&identity, Utc::now()).await {
            warn!("Could not record last seen for {identity}: {e}");
        }
    }

    fn reply(&self, line: &str) {
        if let Err(e) = self.handle.send(line) {
            debug!("Reply dropped: {e}");
        }
    }
}
