use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const COMMAND_PREFIX: char = '/';

pub const AUTH_CHOICE_PROMPT: &str = "Do you want to (l)ogin or (r)egister?";
pub const USERNAME_PROMPT: &str = "Enter username:";
pub const PASSWORD_PROMPT: &str = "Enter password:";
pub const LOGIN_SUCCESSFUL: &str = "Login successful";
pub const LOGIN_FAILED: &str = "Login failed";
pub const HELP_HINT: &str = "Type /help for available commands.";
pub const CLEAR_SCREEN: &str = "CLEAR_SCREEN";

/// Who a server-originated message claims to come from.
pub const SERVER_SENDER: &str = "server";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Broadcast,
    Private,
    System,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    /// `None` means every live session.
    pub target: Option<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl Message {
    pub fn chat(sender: &str, body: impl Into<String>) -> Self {
        Self::new(sender, None, body.into(), MessageKind::Broadcast)
    }

    pub fn private(sender: &str, target: &str, body: impl Into<String>) -> Self {
        Self::new(sender, Some(target.to_string()), body.into(), MessageKind::Private)
    }

    /// A server notice for every live session.
    pub fn notice(body: impl Into<String>) -> Self {
        Self::new(SERVER_SENDER, None, body.into(), MessageKind::System)
    }

    /// A server notice for a single identity, typically a command reply.
    pub fn notice_to(target: &str, body: impl Into<String>) -> Self {
        Self::new(SERVER_SENDER, Some(target.to_string()), body.into(), MessageKind::System)
    }

    /// `/me` style line, shown to everyone as `* <sender> <action>`.
    pub fn action(sender: &str, action: &str) -> Self {
        Self::new(sender, None, format!("* {sender} {action}"), MessageKind::System)
    }

    /// `/broadcast` announcement, shown to everyone as `BROADCAST from <sender>: <body>`.
    pub fn announcement(sender: &str, body: &str) -> Self {
        Self::new(sender, None, format!("BROADCAST from {sender}: {body}"), MessageKind::System)
    }

    pub fn joined(username: &str) -> Self {
        Self::notice(format!("{username} has joined the chat."))
    }

    pub fn user_disconnect(username: &str) -> Self {
        Self::notice(format!("USER_DISCONNECT:{username}"))
    }

    pub fn server_shutdown(reason: &str) -> Self {
        Self::notice(format!("SERVER_SHUTDOWN:{reason}"))
    }

    fn new(sender: &str, target: Option<String>, body: String, kind: MessageKind) -> Self {
        Message {
            sender: sender.to_string(),
            target,
            body,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The single wire line a recipient sees, without the trailing newline.
    pub fn render(&self) -> String {
        match self.kind {
            MessageKind::Broadcast => format!("{}: {}", self.sender, self.body),
            MessageKind::Private => format!("[Private from {}] {}", self.sender, self.body),
            MessageKind::System => self.body.clone(),
        }
    }
}
