use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_DATABASE_URL: &str = "sqlite://decision-atlas.db";
const DEFAULT_DIAVGEIA_URL: &str = "https://diavgeia.gov.gr";
const DEFAULT_TEXT_EXTRACTION_URL: &str = "http://127.0.0.1:9998";
const DEFAULT_MAX_COST_USD: f64 = 10.0;
const DEFAULT_BATCH_CONCURRENCY: usize = 5;
const DEFAULT_MAX_BODY_CHUNKS: usize = 8;
const DEFAULT_TASK_LEASE_SECS: u64 = 3600;
const DEFAULT_SERVER_PORT: u16 = 4100;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the pipeline binary and the read API.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite connection string for the task registry and lineage tables.
    pub database_url: String,
    /// Spend ceiling enforced by the process-wide cost ledger.
    pub max_cost_usd: f64,
    /// Base URL of the Diavgeia open data API.
    pub diavgeia_url: String,
    /// Base URL of the Apache Tika server used for text extraction.
    pub text_extraction_url: String,
    /// Embedding provider used by the embedder stage, when one is configured.
    pub embedding_provider: Option<EmbeddingProvider>,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: Option<String>,
    /// Dimensionality of the vectors produced by the offline `hash` provider.
    pub embedding_dimension: usize,
    /// Optional base URL override for the embedding provider.
    pub embedding_url: Option<String>,
    /// Chat provider used by the summarizer stage.
    pub chat_provider: ChatProvider,
    /// Chat model identifier passed to the provider.
    pub chat_model: String,
    /// Optional base URL override for the chat provider.
    pub chat_url: Option<String>,
    /// API key for OpenAI-compatible providers.
    pub openai_api_key: Option<String>,
    /// Optional pacing for chat calls.
    pub chat_requests_per_minute: Option<u32>,
    /// Number of concurrent in-flight collaborator calls per page.
    pub batch_concurrency: usize,
    /// Optional override for the automatic chunk size selection.
    pub text_splitter_chunk_size: Option<usize>,
    /// Upper bound on body chunks embedded per text.
    pub embedding_max_body_chunks: usize,
    /// Age after which a `running` task without updates is considered dead.
    pub task_lease_secs: u64,
    /// Port for the read-only HTTP API.
    pub server_port: u16,
}

/// Supported embedding backends for the embedder stage.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI embeddings API.
    OpenAI,
    /// Deterministic offline vectors, useful for dry runs.
    Hash,
}

/// Supported chat backends for the summarizer stage.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    /// Local Ollama runtime.
    Ollama,
    /// Hosted OpenAI chat completions API.
    OpenAI,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: load_env_optional("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_cost_usd: parse_optional("MAX_COST_USD")?.unwrap_or(DEFAULT_MAX_COST_USD),
            diavgeia_url: load_env_optional("DIAVGEIA_URL")
                .unwrap_or_else(|| DEFAULT_DIAVGEIA_URL.to_string()),
            text_extraction_url: load_env_optional("TEXT_EXTRACTION_URL")
                .unwrap_or_else(|| DEFAULT_TEXT_EXTRACTION_URL.to_string()),
            embedding_provider: load_env_optional("EMBEDDING_PROVIDER")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))
                })
                .transpose()?,
            embedding_model: load_env_optional("EMBEDDING_MODEL"),
            embedding_dimension: parse_optional("EMBEDDING_DIMENSION")?.unwrap_or(768),
            embedding_url: load_env_optional("EMBEDDING_URL"),
            chat_provider: load_env_optional("CHAT_PROVIDER")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|()| ConfigError::InvalidValue("CHAT_PROVIDER".to_string()))
                })
                .transpose()?
                .unwrap_or(ChatProvider::OpenAI),
            chat_model: load_env_optional("CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".into()),
            chat_url: load_env_optional("CHAT_URL"),
            openai_api_key: load_env_optional("OPENAI_API_KEY"),
            chat_requests_per_minute: parse_optional("CHAT_REQUESTS_PER_MINUTE")?,
            batch_concurrency: parse_optional("BATCH_CONCURRENCY")?
                .unwrap_or(DEFAULT_BATCH_CONCURRENCY)
                .max(1),
            text_splitter_chunk_size: parse_optional("TEXT_SPLITTER_CHUNK_SIZE")?,
            embedding_max_body_chunks: parse_optional("EMBEDDING_MAX_BODY_CHUNKS")?
                .unwrap_or(DEFAULT_MAX_BODY_CHUNKS),
            task_lease_secs: parse_optional("TASK_LEASE_SECS")?.unwrap_or(DEFAULT_TASK_LEASE_SECS),
            server_port: parse_optional("SERVER_PORT")?.unwrap_or(DEFAULT_SERVER_PORT),
        })
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "hash" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

impl std::str::FromStr for ChatProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        database_url = %config.database_url,
        embedding_provider = ?config.embedding_provider,
        embedding_model = ?config.embedding_model,
        chat_provider = ?config.chat_provider,
        chat_model = %config.chat_model,
        max_cost_usd = config.max_cost_usd,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

/// Defaults with no collaborators configured, as `from_env` yields for an empty environment.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        database_url: DEFAULT_DATABASE_URL.to_string(),
        max_cost_usd: DEFAULT_MAX_COST_USD,
        diavgeia_url: DEFAULT_DIAVGEIA_URL.to_string(),
        text_extraction_url: DEFAULT_TEXT_EXTRACTION_URL.to_string(),
        embedding_provider: None,
        embedding_model: None,
        embedding_dimension: 768,
        embedding_url: None,
        chat_provider: ChatProvider::OpenAI,
        chat_model: "gpt-4o-mini".into(),
        chat_url: None,
        openai_api_key: None,
        chat_requests_per_minute: None,
        batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        text_splitter_chunk_size: None,
        embedding_max_body_chunks: DEFAULT_MAX_BODY_CHUNKS,
        task_lease_secs: DEFAULT_TASK_LEASE_SECS,
        server_port: DEFAULT_SERVER_PORT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_parse_case_insensitively() {
        assert_eq!("OpenAI".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::OpenAI));
        assert_eq!("hash".parse::<EmbeddingProvider>(), Ok(EmbeddingProvider::Hash));
        assert_eq!("OLLAMA".parse::<ChatProvider>(), Ok(ChatProvider::Ollama));
        assert!("cohere".parse::<ChatProvider>().is_err());
    }
}
