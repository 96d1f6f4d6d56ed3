pub mod token;
pub mod users;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::{
    auth::{token::TokenIssuer, users::UserStore},
    config::AuthConfig,
    error::AppError,
    time::parse_std_duration,
};

const MIN_USERNAME_CHARS: usize = 3;
const MIN_PASSWORD_CHARS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

#[derive(Clone)]
struct AdminCredentials {
    username: String,
    password: String,
}

#[derive(Clone)]
pub struct Authenticator {
    tokens: TokenIssuer,
    users: UserStore,
    admin: Option<AdminCredentials>,
}

impl Authenticator {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let ttl = parse_std_duration(&config.token_ttl)
            .with_context(|| format!("invalid auth.token_ttl: {}", config.token_ttl))?;
        let tokens = TokenIssuer::new(&config.jwt_secret, ttl)?;
        let users = UserStore::open(&config.users_path)?;

        let admin = match (&config.admin_username, &config.admin_password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => {
                warn!("admin credentials are not configured, admin routes are unreachable");
                None
            }
        };

        Ok(Self::new(tokens, users, admin))
    }

    pub fn new(tokens: TokenIssuer, users: UserStore, admin: Option<(String, String)>) -> Self {
        Self {
            tokens,
            users,
            admin: admin.map(|(username, password)| AdminCredentials { username, password }),
        }
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<AccessToken, AppError> {
        let username = username.trim();
        self.users.authenticate(username, password).await?;
        self.access_token(username, Role::User)
    }

    pub fn admin_login(&self, username: &str, password: &str) -> Result<AccessToken, AppError> {
        let Some(admin) = self.admin.as_ref() else {
            return Err(AppError::Forbidden("admin login is disabled".to_string()));
        };

        let username_matches = admin.username.as_bytes().ct_eq(username.as_bytes());
        let password_matches = admin.password.as_bytes().ct_eq(password.as_bytes());
        if !bool::from(username_matches & password_matches) {
            return Err(AppError::Unauthorized(
                "Invalid admin credentials".to_string(),
            ));
        }

        self.access_token(&admin.username, Role::Admin)
    }

    /// Resolves a regular user from the request's bearer token. The account
    /// must still exist.
    pub async fn authenticate_user(&self, headers: &HeaderMap) -> Result<Identity, AppError> {
        let identity = self.identity(headers)?;
        if identity.role != Role::User {
            return Err(AppError::Forbidden(
                "admin tokens cannot act as a user".to_string(),
            ));
        }
        if !self.users.contains(&identity.username).await {
            return Err(AppError::Unauthorized(
                "account no longer exists".to_string(),
            ));
        }

        Ok(identity)
    }

    pub fn authenticate_admin(&self, headers: &HeaderMap) -> Result<Identity, AppError> {
        let identity = self.identity(headers)?;
        if identity.role != Role::Admin {
            return Err(AppError::Forbidden("Admin access required".to_string()));
        }

        Ok(identity)
    }

    fn identity(&self, headers: &HeaderMap) -> Result<Identity, AppError> {
        let token = bearer_token(headers)?;
        let claims = self.tokens.verify(token)?;

        Ok(Identity {
            username: claims.sub,
            role: claims.role,
        })
    }

    fn access_token(&self, username: &str, role: Role) -> Result<AccessToken, AppError> {
        let access_token = self.tokens.issue(username, role)?;

        Ok(AccessToken {
            access_token,
            token_type: "bearer",
            expires_in: self.tokens.ttl_seconds(),
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("malformed authorization header".to_string()))?;

    let Some((scheme, token)) = value.trim().split_once(' ') else {
        return Err(AppError::Unauthorized("missing bearer token".to_string()));
    };
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AppError::Unauthorized("missing bearer token".to_string()));
    }

    Ok(token)
}

pub fn validate_username(raw: &str) -> Result<String, AppError> {
    let username = raw.trim();
    if username.chars().count() < MIN_USERNAME_CHARS {
        return Err(AppError::Validation(
            "Username must be at least 3 characters long.".to_string(),
        ));
    }

    Ok(username.to_string())
}

pub fn validate_password(password: &str) -> Result<(), AppError> {
    let has_letter = password.chars().any(|character| character.is_ascii_alphabetic());
    let has_digit = password.chars().any(|character| character.is_ascii_digit());
    if password.chars().count() < MIN_PASSWORD_CHARS || !has_letter || !has_digit {
        return Err(AppError::Validation(
            "Password must be at least 6 characters long and include both letters and numbers."
                .to_string(),
        ));
    }

    Ok(())
}
