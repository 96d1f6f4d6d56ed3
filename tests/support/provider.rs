use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

/// How the stub chat-completions endpoint answers.
#[derive(Debug, Clone)]
pub enum StubReply {
    Text(String),
    Status(StatusCode),
}

#[derive(Clone)]
struct StubState {
    reply: StubReply,
    calls: Arc<AtomicUsize>,
    last_prompt: Arc<std::sync::Mutex<Option<String>>>,
    last_authorization: Arc<std::sync::Mutex<Option<String>>>,
}

/// OpenAI-compatible provider bound to an ephemeral local port.
pub struct StubProvider {
    base_url: String,
    state: StubState,
    task: JoinHandle<()>,
}

impl StubProvider {
    pub async fn start(reply: StubReply) -> Result<Self> {
        let state = StubState {
            reply,
            calls: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(std::sync::Mutex::new(None)),
            last_authorization: Arc::new(std::sync::Mutex::new(None)),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(state.clone());

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .context("failed to bind stub provider")?;
        let address = listener
            .local_addr()
            .context("stub provider has no local address")?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            base_url: format!("http://{address}"),
            state,
            task,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.state
            .last_prompt
            .lock()
            .ok()
            .and_then(|prompt| prompt.clone())
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state
            .last_authorization
            .lock()
            .ok()
            .and_then(|value| value.clone())
    }
}

impl Drop for StubProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn chat_completions(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut prompt) = state.last_prompt.lock() {
        *prompt = body["messages"][0]["content"].as_str().map(str::to_string);
    }
    if let Ok(mut authorization) = state.last_authorization.lock() {
        *authorization = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
    }

    match &state.reply {
        StubReply::Text(text) => Json(json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "model": body["model"],
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": format!("  {text}\n")},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 21, "completion_tokens": 7, "total_tokens": 28},
        }))
        .into_response(),
        StubReply::Status(status) => (
            *status,
            Json(json!({"error": {"message": "stub provider failure"}})),
        )
            .into_response(),
    }
}
