//! Chat-completion collaborators used by the summarizer stage.
//!
//! Two backends are supported: the hosted OpenAI chat completions API, which bills through the
//! shared [`CostLedger`], and a local Ollama runtime. Both are asked for a JSON object and return
//! the raw message content; parsing belongs to the stage.

use crate::collaborator::CollaboratorError;
use crate::config::{ChatProvider, Config};
use crate::usage::CostLedger;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// One chat exchange: a system prompt and a single user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Instructions for the model.
    pub system: String,
    /// The user turn.
    pub user: String,
    /// Ask the provider to constrain output to a JSON object.
    pub json_response: bool,
}

/// Interface implemented by chat providers.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Return the assistant's message content.
    async fn complete(&self, request: ChatRequest) -> Result<String, CollaboratorError>;
}

/// Build the chat client selected by `CHAT_PROVIDER`.
pub fn chat_client_from_config(
    config: &Config,
    ledger: Arc<CostLedger>,
) -> Result<Arc<dyn ChatClient>, CollaboratorError> {
    match config.chat_provider {
        ChatProvider::OpenAI => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                CollaboratorError::Unavailable("OPENAI_API_KEY is not set".into())
            })?;
            let base_url = config
                .chat_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
            Ok(Arc::new(OpenAiChatClient::new(
                base_url,
                api_key,
                config.chat_model.clone(),
                ledger,
            )?))
        }
        ChatProvider::Ollama => {
            let base_url = config
                .chat_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Arc::new(OllamaChatClient::new(
                base_url,
                config.chat_model.clone(),
            )?))
        }
    }
}

fn http_client() -> Result<Client, CollaboratorError> {
    Ok(Client::builder()
        .user_agent("decision-atlas/summarizer")
        .build()?)
}

fn messages(request: &ChatRequest) -> Value {
    json!([
        { "role": "system", "content": request.system },
        { "role": "user", "content": request.user },
    ])
}

/// OpenAI chat completions client. Token usage is billed to the cost ledger.
pub struct OpenAiChatClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    ledger: Arc<CostLedger>,
}

impl OpenAiChatClient {
    /// Create a client for `model` at `base_url`.
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        ledger: Arc<CostLedger>,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client()?,
            base_url,
            api_key,
            model,
            ledger,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, CollaboratorError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages(&request),
            "temperature": 0,
        });
        if request.json_response {
            payload["response_format"] = json!({ "type": "json_object" });
        }

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                CollaboratorError::Unavailable(format!(
                    "failed to reach OpenAI at {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "OpenAI returned {status}: {body}"
            )));
        }

        let body: OpenAiResponse = response.json().await.map_err(|error| {
            CollaboratorError::InvalidResponse(format!("failed to decode OpenAI response: {error}"))
        })?;

        if let Some(usage) = &body.usage {
            self.ledger.add_tokens(&self.model, usage.total_tokens)?;
        }

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| CollaboratorError::InvalidResponse("OpenAI returned no choices".into()))
    }
}

/// Chat client for a local Ollama runtime.
pub struct OllamaChatClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaChatClient {
    /// Create a client for `model` at `base_url`.
    pub fn new(base_url: String, model: String) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client()?,
            base_url,
            model,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: ChatMessage,
    done: bool,
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, CollaboratorError> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages(&request),
            "stream": false,
            "options": {
                "temperature": 0.1,
            }
        });
        if request.json_response {
            payload["format"] = json!("json");
        }

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                CollaboratorError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CollaboratorError::Unavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            CollaboratorError::InvalidResponse(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(CollaboratorError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        body.message
            .content
            .map(|content| content.trim().to_string())
            .ok_or_else(|| CollaboratorError::InvalidResponse("Ollama returned no content".into()))
    }
}
