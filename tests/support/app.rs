use std::{path::PathBuf, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, Result, bail};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header::AUTHORIZATION, header::CONTENT_TYPE},
};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tempfile::TempDir;
use text_assistant::{
    auth::{Authenticator, token::TokenIssuer, users::UserStore},
    config::GenerationConfig,
    generation::GenerationClient,
    interactions::InteractionLog,
    ledger::{CorruptLedgerPolicy, FileLedgerStore},
    metrics::MetricsRegistry,
    quota::QuotaLimiter,
    server::{AppState, build_router},
    time::{DayBoundary, ManualClock},
};
use tower::ServiceExt;

use super::provider::{StubProvider, StubReply};

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-pass1";

/// The full router wired to temp-dir storage, a manual clock and a stub
/// provider.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub clock: ManualClock,
    pub provider: StubProvider,
    temp: TempDir,
}

impl TestApp {
    pub async fn start(daily_limit: u32, reply: StubReply) -> Result<Self> {
        let temp = tempfile::tempdir().context("failed to create temp dir")?;
        let provider = StubProvider::start(reply).await?;
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0)
                .single()
                .context("fixed start time")?,
        );

        let quota = QuotaLimiter::new(
            Arc::new(FileLedgerStore::new(
                temp.path().join("usage_limits.json"),
                CorruptLedgerPolicy::Reset,
            )),
            daily_limit,
            DayBoundary::Zone(chrono_tz::UTC),
            Arc::new(clock.clone()),
        );
        let auth = Authenticator::new(
            TokenIssuer::new("integration-secret", StdDuration::from_secs(3600))?,
            UserStore::open(temp.path().join("users.json"))?,
            Some((ADMIN_USERNAME.to_string(), ADMIN_PASSWORD.to_string())),
        );
        let generation = GenerationClient::new(&GenerationConfig {
            url: provider.base_url().to_string(),
            api_key: Some("test-key".to_string()),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 300,
            timeout: "5s".to_string(),
        })?;

        let state = AppState {
            quota,
            auth,
            generation,
            interactions: Some(InteractionLog::new(temp.path().join("logs.jsonl"))),
            metrics: MetricsRegistry::new("test")?,
        };

        Ok(Self {
            router: build_router(state.clone()),
            state,
            clock,
            provider,
            temp,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.temp.path().join("usage_limits.json")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("router call failed")?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .context("failed to read response body")?;
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok((status, value))
    }

    pub async fn register_and_login(&self, username: &str, password: &str) -> Result<String> {
        let credentials = serde_json::json!({"username": username, "password": password});
        let (status, body) = self
            .request(Method::POST, "/api/register", None, Some(credentials.clone()))
            .await?;
        if status != StatusCode::CREATED {
            bail!("register returned {status}: {body}");
        }

        self.login("/api/login", credentials).await
    }

    pub async fn admin_token(&self) -> Result<String> {
        self.login(
            "/api/admin/login",
            serde_json::json!({"username": ADMIN_USERNAME, "password": ADMIN_PASSWORD}),
        )
        .await
    }

    pub async fn generate(&self, token: Option<&str>, user_text: &str) -> Result<(StatusCode, Value)> {
        self.request(
            Method::POST,
            "/api/generate",
            token,
            Some(serde_json::json!({
                "instruction": "Rewrite this politely",
                "user_text": user_text,
            })),
        )
        .await
    }

    async fn login(&self, uri: &str, credentials: Value) -> Result<String> {
        let (status, body) = self.request(Method::POST, uri, None, Some(credentials)).await?;
        if status != StatusCode::OK {
            bail!("{uri} returned {status}: {body}");
        }

        body["access_token"]
            .as_str()
            .map(str::to_string)
            .context("login response had no access_token")
    }
}
