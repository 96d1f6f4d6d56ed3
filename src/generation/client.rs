use anyhow::{Context, Result};
use reqwest::Client;

use crate::{
    config::GenerationConfig,
    error::AppError,
    generation::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Generation},
    time::parse_std_duration,
};

#[derive(Clone)]
pub struct GenerationClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl GenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let timeout = parse_std_duration(&config.timeout)
            .with_context(|| format!("invalid generation.timeout: {}", config.timeout))?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("text-assistant/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build generation HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/v1/chat/completions",
                config.url.trim_end_matches('/')
            ),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub async fn generate(&self, instruction: &str, user_text: &str) -> Result<Generation, AppError> {
        let prompt = build_prompt(instruction, user_text);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens: self.max_tokens,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| AppError::Generation(format!("request failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Generation(format!(
                "provider returned status {status}"
            )));
        }

        let completion = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|error| AppError::Generation(format!("undecodable response: {error}")))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| AppError::Generation("response contained no choices".to_string()))?;

        Ok(Generation {
            text,
            usage: completion.usage,
        })
    }
}

pub fn build_prompt(instruction: &str, user_text: &str) -> String {
    format!("{instruction}\n\nText:\n{user_text}")
}
