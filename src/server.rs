use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{Instrument, info, warn};

use crate::{
    auth::Authenticator,
    config::Config,
    error::AppError,
    generation::GenerationClient,
    interactions::{InteractionInput, InteractionLog},
    ledger::FileLedgerStore,
    metrics::MetricsRegistry,
    quota::{QuotaLimiter, UsageSummary},
    time::SystemClock,
};

const DEFAULT_LOG_LIMIT: usize = 100;
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct RequestId(String);

#[derive(Clone)]
pub struct AppState {
    pub quota: QuotaLimiter,
    pub auth: Authenticator,
    pub generation: GenerationClient,
    pub interactions: Option<InteractionLog>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = FileLedgerStore::new(
            &config.quota.ledger_path,
            config.quota.corruption_policy()?,
        );
        let day_boundary = config.day_boundary()?;
        info!(
            daily_limit = config.quota.daily_limit,
            day_boundary = %day_boundary,
            ledger = %store.path().display(),
            "quota limiter ready"
        );
        let quota = QuotaLimiter::new(
            Arc::new(store),
            config.quota.daily_limit,
            day_boundary,
            Arc::new(SystemClock),
        );
        let interactions = config
            .interactions
            .enabled
            .then(|| InteractionLog::new(&config.interactions.path));

        Ok(Self {
            quota,
            auth: Authenticator::from_config(&config.auth)?,
            generation: GenerationClient::new(&config.generation)?,
            interactions,
            metrics: MetricsRegistry::new(&config.metrics.prefix)?,
        })
    }
}

pub async fn run(config: Config) -> Result<()> {
    init_tracing(&config.server.log_level);
    let state = AppState::from_config(&config)?;

    let app = build_router(state);

    let address: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.server.listen))?;

    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind to {address}"))?;

    info!(%address, "text-assistant server started");

    axum::serve(listener, app)
        .await
        .context("server exited unexpectedly")
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/quota", get(quota))
        .route("/api/generate", post(generate))
        .route("/api/admin/login", post(admin_login))
        .route("/api/admin/usage", get(admin_usage))
        .route("/api/admin/reset-usage", post(admin_reset_usage))
        .route("/api/admin/reset-user", post(admin_reset_user))
        .route("/api/admin/users/{username}", delete(admin_delete_user))
        .route("/api/admin/logs", get(admin_logs))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state,
            request_context_middleware,
        ))
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init();
}

async fn root() -> impl IntoResponse {
    Json(json!({"message": "Text Assistant API is running"}))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(error) => {
            let request_id = request_id
                .map(|Extension(value)| value.0)
                .unwrap_or_else(|| "unknown".to_string());
            warn!(
                request_id = %request_id,
                error = %error,
                "failed to render metrics"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to render metrics"})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let username = state
        .auth
        .users()
        .register(&body.username, &body.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User registered successfully",
            "username": username,
        })),
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let token = state.auth.login(&body.username, &body.password).await?;
    Ok(Json(token))
}

async fn quota(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.auth.authenticate_user(&headers).await?;
    let remaining = state.quota.remaining_requests(&identity.username).await?;

    Ok(Json(json!({
        "username": identity.username,
        "daily_limit": state.quota.daily_limit(),
        "remaining": remaining,
    })))
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    instruction: String,
    user_text: String,
}

async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GenerateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.auth.authenticate_user(&headers).await?;
    if body.user_text.trim().is_empty() {
        return Err(AppError::Validation("user_text must not be empty".to_string()));
    }

    if !state.quota.check_and_increment(&identity.username).await? {
        state.metrics.inc_quota_rejection();
        return Err(AppError::QuotaExceeded {
            limit: state.quota.daily_limit(),
        });
    }

    let generation = match state
        .generation
        .generate(&body.instruction, &body.user_text)
        .await
    {
        Ok(generation) => {
            state.metrics.inc_generation("success");
            generation
        }
        Err(error) => {
            state.metrics.inc_generation("error");
            warn!(username = %identity.username, error = %error, "generation failed");
            return Err(error);
        }
    };

    if let Some(interactions) = state.interactions.as_ref() {
        interactions
            .record(InteractionInput {
                user_id: identity.username.clone(),
                instruction: body.instruction,
                user_text: body.user_text,
                ai_response: generation.text.clone(),
                token_usage: generation.usage,
            })
            .await;
    }

    let remaining = state.quota.remaining_requests(&identity.username).await?;

    Ok(Json(json!({
        "result": generation.text,
        "remaining": remaining,
    })))
}

async fn admin_login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse, AppError> {
    let token = state.auth.admin_login(&body.username, &body.password)?;
    Ok(Json(token))
}

#[derive(Debug, Serialize)]
struct AdminUsage {
    total_users: usize,
    #[serde(flatten)]
    summary: UsageSummary,
}

async fn admin_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate_admin(&headers)?;
    let summary = state.quota.usage_summary().await?;

    Ok(Json(AdminUsage {
        total_users: state.auth.users().len().await,
        summary,
    }))
}

async fn admin_reset_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let admin = state.auth.authenticate_admin(&headers)?;
    state.quota.reset_all().await?;
    info!(admin = %admin.username, "admin cleared all usage");

    Ok(Json(json!({"message": "All usage has been reset"})))
}

#[derive(Debug, Deserialize)]
struct ResetUserRequest {
    username: String,
}

async fn admin_reset_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    let admin = state.auth.authenticate_admin(&headers)?;
    let username = body.username.trim();
    let reset = state.quota.reset_user(username).await?;
    info!(admin = %admin.username, username, reset, "admin reset user usage");

    Ok(Json(json!({
        "username": username,
        "reset": reset,
    })))
}

async fn admin_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let admin = state.auth.authenticate_admin(&headers)?;
    if !state.auth.users().delete(&username).await? {
        return Err(AppError::NotFound(format!("user {username} does not exist")));
    }
    info!(admin = %admin.username, username = %username, "admin deleted user");

    Ok(Json(json!({
        "username": username,
        "deleted": true,
    })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn admin_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, AppError> {
    state.auth.authenticate_admin(&headers)?;
    let Some(interactions) = state.interactions.as_ref() else {
        return Err(AppError::NotFound(
            "interaction logging is disabled".to_string(),
        ));
    };

    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, 1000);
    let entries = interactions.recent(limit).await?;

    Ok(Json(json!({
        "count": entries.len(),
        "interactions": entries,
    })))
}

async fn request_context_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    state.metrics.inc_http_requests();

    let request_id = next_request_id();
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", header_value);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = tracing::info_span!("http_request", request_id = %request_id, method = %method, path = %path);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

fn next_request_id() -> String {
    let id = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{id}")
}
