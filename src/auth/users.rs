use std::{collections::BTreeMap, fs, io, path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    auth::{validate_password, validate_username},
    error::AppError,
    ledger::write_json_atomic,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserStore {
    accounts: Arc<RwLock<BTreeMap<String, UserAccount>>>,
    path: Option<PathBuf>,
}

impl UserStore {
    /// A missing file is an empty store. An unreadable one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let accounts = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, UserAccount>>(&raw)
                .with_context(|| format!("user store {} is corrupt", path.display()))?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read user store {}", path.display()));
            }
        };
        info!(path = %path.display(), users = accounts.len(), "loaded user accounts");

        Ok(Self {
            accounts: Arc::new(RwLock::new(accounts)),
            path: Some(path),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            accounts: Arc::new(RwLock::new(BTreeMap::new())),
            path: None,
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<String, AppError> {
        let username = validate_username(username)?;
        validate_password(password)?;

        let password = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .context("password hashing task panicked")??;

        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&username) {
            return Err(AppError::Conflict(
                "Username already exists. Please choose another one.".to_string(),
            ));
        }

        accounts.insert(
            username.clone(),
            UserAccount {
                password_hash,
                created_at: Utc::now(),
            },
        );
        self.persist(&accounts).await?;
        info!(username = %username, "user registered");

        Ok(username)
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), AppError> {
        let password_hash = {
            let accounts = self.accounts.read().await;
            let Some(account) = accounts.get(username.trim()) else {
                return Err(AppError::NotFound(
                    "This username does not exist. Please register first.".to_string(),
                ));
            };
            account.password_hash.clone()
        };

        let password = password.to_string();
        let matches =
            tokio::task::spawn_blocking(move || verify_password(&password, &password_hash))
                .await
                .context("password verification task panicked")??;

        if matches {
            Ok(())
        } else {
            Err(AppError::Unauthorized("Incorrect password.".to_string()))
        }
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.accounts.read().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }

    pub async fn delete(&self, username: &str) -> Result<bool> {
        let mut accounts = self.accounts.write().await;
        if accounts.remove(username).is_none() {
            return Ok(false);
        }

        self.persist(&accounts).await?;
        info!(username, "user deleted");
        Ok(true)
    }

    async fn persist(&self, accounts: &BTreeMap<String, UserAccount>) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let snapshot = accounts.clone();
        tokio::task::spawn_blocking(move || {
            write_json_atomic(&path, &snapshot)
                .with_context(|| format!("failed to write user store {}", path.display()))
        })
        .await
        .context("user store write task panicked")?
    }
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|error| anyhow!("failed to hash password: {error}"))
}

fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|error| anyhow!("stored password hash is malformed: {error}"))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
