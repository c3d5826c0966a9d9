use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use opgate_core::config::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm backend is not configured")]
    Unavailable,
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm reply had no message content")]
    MissingContent,
}

/// Small structured-answer chat interface used by the classifier and the
/// intent judge. Replies are parsed defensively by callers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        top_p: f32,
    ) -> Result<String, LlmError>;

    fn model_name(&self) -> Option<String> {
        None
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    format: &'a str,
    options: ChatOptions,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ReplyMessage>,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

/// Ollama `/api/chat` client.
#[derive(Clone, Debug)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let mut client =
            Self::new(config.base_url.clone(), config.model.clone(), Duration::from_secs(config.timeout_secs))?;
        client.api_key = config.api_key.clone();
        Ok(client)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat_json(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        top_p: f32,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            stream: false,
            format: "json",
            options: ChatOptions { temperature, top_p },
            messages: [
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
        };

        let mut request = self.client.post(self.chat_url()).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(event_name = "opgate.llm.status", status, "llm backend returned an error status");
            return Err(LlmError::Status { status, body });
        }

        let reply: ChatResponse =
            response.json().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        reply
            .message
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::MissingContent)
    }

    fn model_name(&self) -> Option<String> {
        Some(self.model.clone())
    }
}

/// Returns the outermost JSON object in a reply, tolerating code fences and
/// surrounding prose.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}
