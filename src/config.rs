use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 55556;
pub const DEFAULT_USER_DB: &str = "users.json";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Settings for one server process.
///
/// Every field can be overridden from the environment, see [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub user_db: PathBuf,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user_db: PathBuf::from(DEFAULT_USER_DB),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    /// Reads `CHAT_HOST`, `CHAT_PORT`, `CHAT_USER_DB` and
    /// `CHAT_SHUTDOWN_GRACE_SECS`, falling back to the defaults for unset vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServerConfig::default();

        if let Some(host) = lookup("CHAT_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("CHAT_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                var: "CHAT_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup("CHAT_USER_DB") {
            config.user_db = PathBuf::from(path);
        }
        if let Some(secs) = lookup("CHAT_SHUTDOWN_GRACE_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                var: "CHAT_SHUTDOWN_GRACE_SECS",
                value: secs.clone(),
            })?;
            config.shutdown_grace = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
