use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

const SALT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid username: {0}")]
    InvalidUsername(&'static str),
    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),
}

/// What the rest of the server may know about a registered identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub username: String,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Verifies and registers identities. The session engine only ever talks to
/// this trait; the storage format behind it is an implementation detail.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Result<bool, CredentialError>;

    /// Returns `Ok(false)` when the username is already taken.
    async fn register(&self, username: &str, password: &str) -> Result<bool, CredentialError>;

    async fn touch_last_seen(&self, username: &str, at: DateTime<Utc>) -> Result<(), CredentialError>;

    async fn lookup(&self, username: &str) -> Result<Option<IdentityRecord>, CredentialError>;
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct CredentialRecord {
    password: String,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

/// Username -> record map persisted as one pretty-printed JSON object.
pub struct JsonCredentialStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl JsonCredentialStore {
    /// Loads the store at `path`. A missing file starts an empty store that
    /// is created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No user database at {}, starting empty", path.display());
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} user(s) from {}", records.len(), path.display());

        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn persist(&self, records: &HashMap<String, CredentialRecord>) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(records)?;
        write_atomically(path, json.as_bytes()).await?;
        debug!("Persisted {} user(s) to {}", records.len(), path.display());
        Ok(())
    }
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn verify(&self, username: &str, password: &str) -> Result<bool, CredentialError> {
        let records = self.records.read().await;
        Ok(records
            .get(username)
            .is_some_and(|record| verify_password(&record.password, password)))
    }

    async fn register(&self, username: &str, password: &str) -> Result<bool, CredentialError> {
        validate_username(username)?;
        validate_password(password)?;

        let mut records = self.records.write().await;
        if records.contains_key(username) {
            return Ok(false);
        }
        records.insert(
            username.to_string(),
            CredentialRecord {
                password: hash_password(password),
                last_seen: None,
            },
        );
        self.persist(&records).await?;
        info!("Registered new user {username}");
        Ok(true)
    }

    async fn touch_last_seen(&self, username: &str, at: DateTime<Utc>) -> Result<(), CredentialError> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(username) {
            record.last_seen = Some(at);
            self.persist(&records).await?;
        }
        Ok(())
    }

    async fn lookup(&self, username: &str) -> Result<Option<IdentityRecord>, CredentialError> {
        let records = self.records.read().await;
        Ok(records.get(username).map(|record| IdentityRecord {
            username: username.to_string(),
            last_seen: record.last_seen,
        }))
    }
}

pub fn validate_username(username: &str) -> Result<(), CredentialError> {
    let len = username.chars().count();
    if len < 3 {
        return Err(CredentialError::InvalidUsername("must be at least 3 characters long"));
    }
    if len > 20 {
        return Err(CredentialError::InvalidUsername("cannot be longer than 20 characters"));
    }
    if !username.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(CredentialError::InvalidUsername(
            "can only contain letters, numbers, and underscores",
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), CredentialError> {
    let len = password.chars().count();
    if len < 6 {
        return Err(CredentialError::InvalidPassword("must be at least 6 characters long"));
    }
    if len > 30 {
        return Err(CredentialError::InvalidPassword("cannot be longer than 30 characters"));
    }
    if password.chars().any(char::is_whitespace) {
        return Err(CredentialError::InvalidPassword("cannot contain spaces"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(CredentialError::InvalidPassword("must contain at least one number"));
    }
    if !password.chars().any(char::is_alphabetic) {
        return Err(CredentialError::InvalidPassword("must contain at least one letter"));
    }
    Ok(())
}

fn digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

/// `base64(salt)$base64(sha256(salt || password))`
fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    format!("{}${}", BASE64.encode(salt), BASE64.encode(digest(&salt, password)))
}

fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    match (BASE64.decode(salt), BASE64.decode(hash)) {
        (Ok(salt), Ok(hash)) => digest(&salt, password) == hash,
        _ => false,
    }
}
