//! File-backed username/password store
//!
//! The whole store is loaded at startup and rewritten on every successful
//! mutation. Writes go to a sibling temp file first and are renamed into
//! place so a crash never leaves a half-written store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use beacon_core::crypto::{generate_salt, hash_password, verify_password};

/// Longest accepted username
pub const MAX_USERNAME_LEN: usize = 32;

/// Shortest accepted password
pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredUser {
    salt: String,
    digest: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    users: BTreeMap<String, StoredUser>,
}

/// Username/password store persisted as JSON
pub struct CredentialStore {
    path: PathBuf,
    users: Mutex<BTreeMap<String, StoredUser>>,
}

impl CredentialStore {
    /// Load the store, starting empty if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CredentialError> {
        let path = path.as_ref().to_path_buf();

        let users = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<StoreFile>(&bytes)?.users,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Credential file {:?} not found, starting empty", path);
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!("Loaded {} users from {:?}", users.len(), path);
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    pub fn check_available(&self, username: &str) -> bool {
        validate_username(username).is_ok() && !self.users.lock().contains_key(username)
    }

    /// Add a user. Fails with `Conflict` if the name is taken.
    pub fn register(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        validate_username(username)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::Invalid(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let mut users = self.users.lock();
        if users.contains_key(username) {
            return Err(CredentialError::Conflict);
        }

        let salt = generate_salt()?;
        let digest = hash_password(&salt, password);
        users.insert(username.to_owned(), StoredUser { salt, digest });

        if let Err(e) = self.persist(&users) {
            users.remove(username);
            return Err(e);
        }

        info!("Registered user {}", username);
        Ok(())
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        let users = self.users.lock();
        match users.get(username) {
            Some(user) if verify_password(&user.salt, password, &user.digest) => Ok(()),
            _ => Err(CredentialError::InvalidCredentials),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }

    fn persist(&self, users: &BTreeMap<String, StoredUser>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = StoreFile {
            users: users.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Wrote {} users to {:?}", users.len(), self.path);
        Ok(())
    }
}

fn validate_username(username: &str) -> Result<(), CredentialError> {
    if username.is_empty() || username.chars().count() > MAX_USERNAME_LEN {
        return Err(CredentialError::Invalid(format!(
            "username must be 1-{} characters",
            MAX_USERNAME_LEN
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(CredentialError::Invalid(
            "username may only contain letters, digits, '_', '-' and '.'".into(),
        ));
    }
    Ok(())
}

/// Credential store errors
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("username already taken")]
    Conflict,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("{0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt credential file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("entropy source unavailable: {0}")]
    Entropy(#[from] beacon_core::crypto::RngError),
}
