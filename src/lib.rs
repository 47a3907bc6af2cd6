//! Line-oriented multi-user chat server.
//!
//! Clients connect over TCP, log in or register, then exchange
//! newline-delimited chat lines, `/` commands and private messages.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod delivery;
pub mod messages;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use credentials::{CredentialStore, JsonCredentialStore};
pub use registry::{Registry, Status};
pub use server::{Server, ServerError};
