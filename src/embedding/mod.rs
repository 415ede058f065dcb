//! Embedding collaborators used by the embedder stage.

pub mod chunking;

use crate::collaborator::CollaboratorError;
use crate::config::{Config, EmbeddingProvider};
use crate::usage::CostLedger;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";
const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce one embedding vector per input text, in input order.
    async fn generate_embeddings(&self, texts: Vec<String>)
    -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

/// Build the embedding client selected by `EMBEDDING_PROVIDER`.
///
/// Fails with [`CollaboratorError::Unavailable`] when no provider is configured, or when a
/// hosted provider has no `EMBEDDING_MODEL`.
pub fn embedding_client_from_config(
    config: &Config,
    ledger: Arc<CostLedger>,
) -> Result<Arc<dyn EmbeddingClient>, CollaboratorError> {
    let provider = config
        .embedding_provider
        .ok_or_else(|| CollaboratorError::Unavailable("EMBEDDING_PROVIDER is not set".into()))?;
    let model = || {
        config
            .embedding_model
            .clone()
            .ok_or_else(|| CollaboratorError::Unavailable("EMBEDDING_MODEL is not set".into()))
    };

    match provider {
        EmbeddingProvider::OpenAI => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                CollaboratorError::Unavailable("OPENAI_API_KEY is not set".into())
            })?;
            let base_url = config
                .embedding_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
            Ok(Arc::new(OpenAiEmbeddingClient::new(
                base_url,
                api_key,
                model()?,
                ledger,
            )?))
        }
        EmbeddingProvider::Ollama => {
            let base_url = config
                .embedding_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Arc::new(OllamaEmbeddingClient::new(base_url, model()?)?))
        }
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbeddingClient::new(config.embedding_dimension))),
    }
}

fn http_client() -> Result<Client, CollaboratorError> {
    Ok(Client::builder()
        .user_agent("decision-atlas/embedder")
        .build()?)
}

fn check_count(expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    if vectors.len() != expected {
        return Err(CollaboratorError::InvalidResponse(format!(
            "expected {expected} embeddings, received {}",
            vectors.len()
        )));
    }
    Ok(vectors)
}

/// OpenAI embeddings API client. Token usage is billed to the cost ledger.
pub struct OpenAiEmbeddingClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    ledger: Arc<CostLedger>,
}

impl OpenAiEmbeddingClient {
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
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let expected = texts.len();
        let response = self
            .http
            .post(format!("{}/v1/embeddings", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "OpenAI returned {status}: {body}"
            )));
        }

        let mut body: OpenAiEmbeddingResponse = response.json().await?;
        if let Some(usage) = &body.usage {
            self.ledger.add_tokens(&self.model, usage.total_tokens)?;
        }

        body.data.sort_by_key(|item| item.index);
        check_count(
            expected,
            body.data.into_iter().map(|item| item.embedding).collect(),
        )
    }
}

/// Embedding client for a local Ollama runtime (`/api/embed`).
pub struct OllamaEmbeddingClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbeddingClient {
    /// Create a client for `model` at `base_url`.
    pub fn new(base_url: String, model: String) -> Result<Self, CollaboratorError> {
        Ok(Self {
            http: http_client()?,
            base_url,
            model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let expected = texts.len();
        let response = self
            .http
            .post(format!("{}/api/embed", self.base_url.trim_end_matches('/')))
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|error| {
                CollaboratorError::Unavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaEmbeddingResponse = response.json().await?;
        check_count(expected, body.embeddings)
    }
}

/// Deterministic offline embeddings: bytes hashed into a unit vector.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Produce vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        for (idx, byte) in text.bytes().enumerate() {
            let position = (idx.wrapping_mul(31) ^ usize::from(byte)) % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        if self.dimension == 0 {
            return Err(CollaboratorError::Failed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::usage::ExceedPolicy;
    use httpmock::{Method::POST, MockServer};

    #[test]
    fn missing_embedding_settings_are_reported_by_the_factory() {
        let ledger = Arc::new(CostLedger::new(1.0, ExceedPolicy::Error));
        let mut config = test_config();

        let error = embedding_client_from_config(&config, ledger.clone()).err().expect("no provider");
        assert!(matches!(error, CollaboratorError::Unavailable(message) if message.contains("EMBEDDING_PROVIDER")));

        config.embedding_provider = Some(EmbeddingProvider::Ollama);
        let error = embedding_client_from_config(&config, ledger.clone()).err().expect("no model");
        assert!(matches!(error, CollaboratorError::Unavailable(message) if message.contains("EMBEDDING_MODEL")));

        config.embedding_provider = Some(EmbeddingProvider::Hash);
        assert!(embedding_client_from_config(&config, ledger).is_ok());
    }

    #[tokio::test]
    async fn hash_client_is_deterministic_and_normalized() {
        let client = HashEmbeddingClient::new(16);
        let first = client
            .generate_embeddings(vec!["Ανάθεση έργου".into(), String::new()])
            .await
            .expect("embeddings");
        let second = client
            .generate_embeddings(vec!["Ανάθεση έργου".into()])
            .await
            .expect("embeddings");

        assert_eq!(first[0], second[0]);
        let norm: f32 = first[0].iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(first[1].iter().all(|value| *value == 0.0));
    }

    #[tokio::test]
    async fn openai_client_orders_by_index_and_bills_usage() {
        let server = MockServer::start_async().await;
        let ledger = Arc::new(CostLedger::new(1.0, ExceedPolicy::Error));
        let client = OpenAiEmbeddingClient::new(
            server.base_url(),
            "sk-test".into(),
            "text-embedding-ada-002".into(),
            ledger.clone(),
        )
        .expect("client");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        { "index": 1, "embedding": [0.0, 1.0] },
                        { "index": 0, "embedding": [1.0, 0.0] }
                    ],
                    "usage": { "total_tokens": 1000 }
                }));
            })
            .await;

        let vectors = client
            .generate_embeddings(vec!["a".into(), "b".into()])
            .await
            .expect("embeddings");
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!((ledger.total_cost_usd() - 0.0004).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ollama_client_rejects_short_responses() {
        let server = MockServer::start_async().await;
        let client =
            OllamaEmbeddingClient::new(server.base_url(), "nomic-embed-text".into()).expect("client");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(json!({ "embeddings": [[0.5, 0.5]] }));
            })
            .await;

        let error = client
            .generate_embeddings(vec!["a".into(), "b".into()])
            .await
            .expect_err("count mismatch");
        assert!(matches!(error, CollaboratorError::InvalidResponse(_)));
    }
}
