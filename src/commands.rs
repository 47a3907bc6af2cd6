use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use log::debug;
use thiserror::Error;

use crate::credentials::{CredentialError, CredentialStore};
use crate::messages::{Message, CLEAR_SCREEN, COMMAND_PREFIX};
use crate::registry::{Registry, Status};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unknown command: /{0}. Type /help for available commands.")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("User {0} not found")]
    UnknownUser(String),
    #[error("Unknown status {0:?}. Use online or away.")]
    InvalidStatus(String),
    #[error("Could not look up user: {0}")]
    Credentials(#[from] CredentialError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Help,
    Whisper,
    Broadcast,
    Online,
    Status,
    Whois,
    Me,
    Time,
    Clear,
    Exit,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Help,
        Command::Whisper,
        Command::Broadcast,
        Command::Online,
        Command::Status,
        Command::Whois,
        Command::Me,
        Command::Time,
        Command::Clear,
        Command::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Help => "help",
            Command::Whisper => "whisper",
            Command::Broadcast => "broadcast",
            Command::Online => "online",
            Command::Status => "status",
            Command::Whois => "whois",
            Command::Me => "me",
            Command::Time => "time",
            Command::Clear => "clear",
            Command::Exit => "exit",
        }
    }

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Command::Whisper => &["pm"],
            Command::Online => &["users"],
            Command::Exit => &["quit"],
            _ => &[],
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            Command::Help => "/help - Show this help message",
            Command::Whisper => "/whisper <username> <message> - Send a private message",
            Command::Broadcast => "/broadcast <message> - Send a message to all users",
            Command::Online => "/online - List everyone who is online",
            Command::Status => "/status [online|away] - Show or set your status",
            Command::Whois => "/whois <username> - Show a user's status or last seen time",
            Command::Me => "/me <action> - Send an action message",
            Command::Time => "/time - Show the current server time",
            Command::Clear => "/clear - Clear your screen",
            Command::Exit => "/exit - Disconnect from the server",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|command| command.name() == name || command.aliases().contains(&name.as_str()))
    }
}

/// `/name rest of line` split into the command token and its raw arguments.
#[derive(Debug, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub name: &'a str,
    pub args: &'a str,
}

pub fn parse(line: &str) -> Option<Invocation<'_>> {
    let rest = line.strip_prefix(COMMAND_PREFIX)?;
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    Some(Invocation { name, args })
}

/// Messages a command produced, plus whether the sender should be disconnected.
#[derive(Debug, Default)]
pub struct CommandOutput {
    pub messages: Vec<Message>,
    pub disconnect: bool,
}

impl CommandOutput {
    fn reply(sender: &str, body: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::notice_to(sender, body)],
            disconnect: false,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
    credentials: Arc<dyn CredentialStore>,
}

impl Dispatcher {
    pub fn new(registry: Registry, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// Runs one command line. Errors become a single reply to `sender`.
    pub async fn dispatch(&self, sender: &str, line: &str) -> CommandOutput {
        let Some(invocation) = parse(line) else {
            return CommandOutput::default();
        };

        let result = match Command::from_name(invocation.name) {
            Some(command) => self.execute(command, sender, invocation.args).await,
            None => Err(CommandError::Unknown(invocation.name.to_string())),
        };

        result.unwrap_or_else(|e| {
            debug!("Command from {sender} failed: {e}");
            CommandOutput::reply(sender, e.to_string())
        })
    }

    async fn execute(
        &self,
        command: Command,
        sender: &str,
        args: &str,
    ) -> Result<CommandOutput, CommandError> {
        match command {
            Command::Help => Ok(CommandOutput::reply(sender, help_text())),
            Command::Whisper => self.whisper(sender, args).await,
            Command::Broadcast => {
                if args.is_empty() {
                    return Err(CommandError::Usage(Command::Broadcast.usage()));
                }
                Ok(CommandOutput {
                    messages: vec![
                        Message::announcement(sender, args),
                        Message::notice_to(sender, "Broadcast message sent"),
                    ],
                    disconnect: false,
                })
            }
            Command::Online => self.online(sender).await,
            Command::Status => self.status(sender, args).await,
            Command::Whois => self.whois(sender, args).await,
            Command::Me => {
                if args.is_empty() {
                    return Err(CommandError::Usage(Command::Me.usage()));
                }
                Ok(CommandOutput {
                    messages: vec![Message::action(sender, args)],
                    disconnect: false,
                })
            }
            Command::Time => {
                let now = Local::now().format("%Y-%m-%d %H:%M:%S");
                Ok(CommandOutput::reply(sender, format!("Current server time: {now}")))
            }
            Command::Clear => Ok(CommandOutput::reply(sender, CLEAR_SCREEN)),
            Command::Exit => Ok(CommandOutput {
                messages: vec![Message::notice_to(sender, "Goodbye!")],
                disconnect: true,
            }),
        }
    }

    async fn whisper(&self, sender: &str, args: &str) -> Result<CommandOutput, CommandError> {
        let Some((target, text)) = args.split_once(char::is_whitespace) else {
            return Err(CommandError::Usage(Command::Whisper.usage()));
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(CommandError::Usage(Command::Whisper.usage()));
        }
        if self.credentials.lookup(target).await?.is_none() {
            return Err(CommandError::UnknownUser(target.to_string()));
        }

        Ok(CommandOutput {
            messages: vec![
                Message::private(sender, target, text),
                Message::notice_to(sender, format!("[Private to {target}] {text}")),
            ],
            disconnect: false,
        })
    }

    async fn online(&self, sender: &str) -> Result<CommandOutput, CommandError> {
        let listing = self
            .registry
            .atomically(|state| {
                state
                    .live_identities()
                    .into_iter()
                    .map(|name| {
                        let status = state.status(&name).unwrap_or(Status::Online);
                        format!("{name} ({status})")
                    })
                    .collect::<Vec<_>>()
            })
            .await;

        Ok(CommandOutput::reply(
            sender,
            format!("Online users ({}): {}", listing.len(), listing.join(", ")),
        ))
    }

    async fn status(&self, sender: &str, args: &str) -> Result<CommandOutput, CommandError> {
        if args.is_empty() {
            let status = self.registry.status(sender).await.unwrap_or(Status::Online);
            return Ok(CommandOutput::reply(sender, format!("Your current status: {status}")));
        }

        let status = match args.parse::<Status>() {
            Ok(status @ (Status::Online | Status::Away)) => status,
            _ => return Err(CommandError::InvalidStatus(args.to_string())),
        };
        self.registry.set_status(sender, status).await;
        Ok(CommandOutput::reply(sender, format!("Status set to {status}")))
    }

    async fn whois(&self, sender: &str, args: &str) -> Result<CommandOutput, CommandError> {
        let target = args
            .split_whitespace()
            .next()
            .ok_or(CommandError::Usage(Command::Whois.usage()))?;

        let live_status = self
            .registry
            .atomically(|state| {
                state
                    .live_session_for(target)
                    .map(|_| state.status(target).unwrap_or(Status::Online))
            })
            .await;
        if let Some(status) = live_status {
            return Ok(CommandOutput::reply(sender, format!("{target} is currently {status}")));
        }

        let record = self
            .credentials
            .lookup(target)
            .await?
            .ok_or_else(|| CommandError::UnknownUser(target.to_string()))?;
        let reply = match record.last_seen {
            Some(at) => format!(
                "{target} was last seen at {}",
                at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => format!("{target} has never been seen"),
        };
        Ok(CommandOutput::reply(sender, reply))
    }
}

fn help_text() -> String {
    let mut text = String::from("Available commands:");
    for command in Command::ALL {
        text.push_str("\n  ");
        text.push_str(command.usage());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::JsonCredentialStore;
    use crate::messages::MessageKind;
    use crate::registry::tests::handle;

    async fn dispatcher() -> (Dispatcher, Registry) {
        let store = JsonCredentialStore::in_memory();
        store.register("alice", "secret1").await.unwrap();
        store.register("bob", "secret2").await.unwrap();
        let registry = Registry::new();
        (Dispatcher::new(registry.clone(), Arc::new(store)), registry)
    }

    fn only_reply(output: &CommandOutput) -> &str {
        assert_eq!(output.messages.len(), 1);
        &output.messages[0].body
    }

    #[test]
    fn parse_splits_name_and_args() {
        assert_eq!(
            parse("/whisper bob  hello there"),
            Some(Invocation { name: "whisper", args: "bob  hello there" })
        );
        assert_eq!(parse("/help"), Some(Invocation { name: "help", args: "" }));
        assert_eq!(parse("hello"), None);
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(Command::from_name("pm"), Some(Command::Whisper));
        assert_eq!(Command::from_name("QUIT"), Some(Command::Exit));
        assert_eq!(Command::from_name("users"), Some(Command::Online));
        assert_eq!(Command::from_name("dance"), None);
    }

    #[tokio::test]
    async fn help_lists_every_command() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/help").await;
        let reply = only_reply(&output);
        for command in Command::ALL {
            assert!(reply.contains(&format!("/{}", command.name())));
        }
    }

    #[tokio::test]
    async fn unknown_command_replies_once_and_mutates_nothing() {
        let (dispatcher, registry) = dispatcher().await;
        let (alice, _rx) = handle();
        registry.bind(alice, "alice").await.unwrap();
        registry.set_status("alice", Status::Online).await;

        let output = dispatcher.dispatch("alice", "/dance wildly").await;
        assert!(!output.disconnect);
        assert_eq!(
            only_reply(&output),
            "Unknown command: /dance. Type /help for available commands."
        );
        assert_eq!(output.messages[0].target.as_deref(), Some("alice"));
        assert_eq!(registry.status("alice").await, Some(Status::Online));
        assert_eq!(registry.live_count().await, 1);
        assert!(registry.drain_mail("alice").await.is_empty());
    }

    #[tokio::test]
    async fn whisper_produces_private_message_and_echo() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/whisper bob hello").await;

        assert_eq!(output.messages.len(), 2);
        let private = &output.messages[0];
        assert_eq!(private.kind, MessageKind::Private);
        assert_eq!(private.sender, "alice");
        assert_eq!(private.target.as_deref(), Some("bob"));
        assert_eq!(private.body, "hello");
        assert_eq!(output.messages[1].render(), "[Private to bob] hello");
        assert_eq!(output.messages[1].target.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn whisper_to_unknown_user_is_an_error() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/whisper mallory hi").await;
        assert_eq!(only_reply(&output), "User mallory not found");
        assert_ne!(output.messages[0].kind, MessageKind::Private);
    }

    #[tokio::test]
    async fn whisper_without_text_shows_usage() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/whisper bob").await;
        assert!(only_reply(&output).starts_with("Usage: /whisper"));
    }

    #[tokio::test]
    async fn online_lists_live_identities_with_status() {
        let (dispatcher, registry) = dispatcher().await;
        let (alice, _rx1) = handle();
        let (bob, _rx2) = handle();
        registry.bind(alice, "alice").await.unwrap();
        registry.bind(bob, "bob").await.unwrap();
        registry.set_status("bob", Status::Away).await;

        let output = dispatcher.dispatch("alice", "/online").await;
        assert_eq!(only_reply(&output), "Online users (2): alice (online), bob (away)");
    }

    #[tokio::test]
    async fn status_can_be_shown_and_set() {
        let (dispatcher, registry) = dispatcher().await;

        let output = dispatcher.dispatch("alice", "/status away").await;
        assert_eq!(only_reply(&output), "Status set to away");
        assert_eq!(registry.status("alice").await, Some(Status::Away));

        let output = dispatcher.dispatch("alice", "/status").await;
        assert_eq!(only_reply(&output), "Your current status: away");

        let output = dispatcher.dispatch("alice", "/status inactive").await;
        assert!(only_reply(&output).starts_with("Unknown status"));
        assert_eq!(registry.status("alice").await, Some(Status::Away));
    }

    #[tokio::test]
    async fn whois_reports_never_seen_users() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/whois bob").await;
        assert_eq!(only_reply(&output), "bob has never been seen");

        let output = dispatcher.dispatch("alice", "/whois mallory").await;
        assert_eq!(only_reply(&output), "User mallory not found");
    }

    #[tokio::test]
    async fn exit_requests_disconnect() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/exit").await;
        assert!(output.disconnect);
        assert_eq!(only_reply(&output), "Goodbye!");
    }

    #[tokio::test]
    async fn broadcast_announces_to_everyone_and_acknowledges() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/broadcast lunch at noon").await;

        assert_eq!(output.messages.len(), 2);
        assert_eq!(output.messages[0].render(), "BROADCAST from alice: lunch at noon");
        assert!(output.messages[0].target.is_none());
        assert_eq!(output.messages[1].render(), "Broadcast message sent");
        assert_eq!(output.messages[1].target.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn broadcast_without_text_shows_usage() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/broadcast   ").await;
        assert_eq!(
            only_reply(&output),
            "Usage: /broadcast <message> - Send a message to all users"
        );
        assert_eq!(output.messages[0].target.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn me_broadcasts_an_action() {
        let (dispatcher, _) = dispatcher().await;
        let output = dispatcher.dispatch("alice", "/me waves").await;
        assert_eq!(output.messages[0].render(), "* alice waves");
        assert!(output.messages[0].target.is_none());
    }
}
