//! Token-budgeted semantic chunking of decision bodies.
//!
//! Bodies are split with `semchunk-rs` so each chunk fits the embedding model's budget.
//! Token counting prefers `tiktoken-rs` encodings and falls back to whitespace counting for
//! models without a known tokenizer (typical for local runtimes and the offline hash provider).

use crate::config::EmbeddingProvider;
use anyhow::Error as TokenizerError;
use semchunk_rs::Chunker;
use std::sync::Arc;
use thiserror::Error;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, model::get_context_size, o200k_base, p50k_base,
    r50k_base,
};

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

const MIN_AUTOMATIC_CHUNK_SIZE: usize = 256;
const MAX_AUTOMATIC_CHUNK_SIZE: usize = 1024;

/// Errors raised while preparing a chunker.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// A zero token budget was requested.
    #[error("Chunk size must be greater than zero")]
    InvalidChunkSize,
    /// No tokenizer could be loaded for the model.
    #[error("Failed to load tokenizer for {model}: {source}")]
    Tokenizer {
        /// Model whose tokenizer was requested.
        model: String,
        /// Underlying tokenizer error.
        source: TokenizerError,
    },
}

/// Splits text into chunks of at most `chunk_size` tokens.
#[derive(Clone)]
pub struct BodyChunker {
    chunk_size: usize,
    counter: TokenCounter,
}

impl BodyChunker {
    /// Chunker sized for `provider`/`model`, unless `override_size` pins the budget.
    pub fn for_model(
        provider: EmbeddingProvider,
        model: &str,
        override_size: Option<usize>,
    ) -> Result<Self, ChunkingError> {
        if override_size == Some(0) {
            return Err(ChunkingError::InvalidChunkSize);
        }
        let chunk_size = determine_chunk_size(override_size, provider, model);
        let counter = build_token_counter(provider, model)?;
        tracing::debug!(model, chunk_size, "Prepared body chunker");
        Ok(Self {
            chunk_size,
            counter,
        })
    }

    /// Chunker that counts whitespace-separated words.
    pub fn whitespace(chunk_size: usize) -> Result<Self, ChunkingError> {
        if chunk_size == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        Ok(Self {
            chunk_size,
            counter: whitespace_counter(),
        })
    }

    /// Token budget per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Split `text`; blank input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let counter = self.counter.clone();
        let chunker = Chunker::new(
            self.chunk_size,
            Box::new(move |segment: &str| counter.as_ref()(segment)),
        );
        chunker
            .chunk(text)
            .into_iter()
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect()
    }
}

/// Explicit override wins; otherwise a quarter of the model's context window, clamped.
fn determine_chunk_size(
    override_size: Option<usize>,
    provider: EmbeddingProvider,
    model: &str,
) -> usize {
    if let Some(explicit) = override_size {
        return explicit.max(1);
    }

    let window = embedding_context_window(provider, model);
    (window / 4).clamp(MIN_AUTOMATIC_CHUNK_SIZE, MAX_AUTOMATIC_CHUNK_SIZE)
}

fn embedding_context_window(provider: EmbeddingProvider, model: &str) -> usize {
    match provider {
        EmbeddingProvider::OpenAI if model.starts_with("text-embedding-") => 8192,
        EmbeddingProvider::OpenAI => get_context_size(model),
        EmbeddingProvider::Ollama => match model.to_lowercase().as_str() {
            "nomic-embed-text" | "mxbai-embed-large" | "bge-m3" => 8192,
            value if value.contains("all-minilm") => 512,
            value if value.contains("e5-large") => 4096,
            _ => 4096,
        },
        EmbeddingProvider::Hash => 2048,
    }
}

fn build_token_counter(
    provider: EmbeddingProvider,
    model: &str,
) -> Result<TokenCounter, ChunkingError> {
    match provider {
        EmbeddingProvider::OpenAI => build_tiktoken_counter(model),
        EmbeddingProvider::Hash => Ok(whitespace_counter()),
        EmbeddingProvider::Ollama => match build_tiktoken_counter(model) {
            Ok(counter) => Ok(counter),
            Err(error) => {
                tracing::warn!(
                    model,
                    error = %error,
                    "Tokenizer unavailable for Ollama model; counting whitespace tokens"
                );
                Ok(whitespace_counter())
            }
        },
    }
}

fn build_tiktoken_counter(model: &str) -> Result<TokenCounter, ChunkingError> {
    let target = match model.trim() {
        "" => "cl100k_base",
        trimmed => trimmed,
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);
    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    if let Ok(encoding) = get_bpe_from_model(model) {
        return Ok(encoding);
    }
    match model {
        "o200k_base" => o200k_base(),
        "p50k_base" => p50k_base(),
        "r50k_base" | "gpt2" => r50k_base(),
        _ => {
            tracing::debug!(model, "Unknown tokenizer; using cl100k_base");
            cl100k_base()
        }
    }
}

fn whitespace_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_chunker_respects_budget() {
        let chunker = BodyChunker::whitespace(2).expect("chunker");
        assert_eq!(chunker.chunk_size(), 2);
        assert_eq!(
            chunker.chunk("one two three four five"),
            vec!["one two", "three four", "five"]
        );
    }

    #[test]
    fn blank_text_has_no_chunks() {
        let chunker = BodyChunker::whitespace(4).expect("chunker");
        assert!(chunker.chunk(" \n ").is_empty());
    }

    #[test]
    fn zero_budget_is_rejected() {
        assert!(matches!(
            BodyChunker::whitespace(0),
            Err(ChunkingError::InvalidChunkSize)
        ));
        assert!(matches!(
            BodyChunker::for_model(EmbeddingProvider::Hash, "hash", Some(0)),
            Err(ChunkingError::InvalidChunkSize)
        ));
    }

    #[test]
    fn tiktoken_chunks_keep_every_word() {
        let text = "The quick brown fox jumps over the lazy dog.";
        let chunker = BodyChunker::for_model(
            EmbeddingProvider::OpenAI,
            "text-embedding-3-small",
            Some(5),
        )
        .expect("chunker");
        let chunks = chunker.chunk(text);
        for chunk in &chunks {
            assert!(chunker.counter.as_ref()(chunk) <= 5);
        }
        let words: Vec<&str> = chunks.iter().flat_map(|chunk| chunk.split_whitespace()).collect();
        assert_eq!(words, text.split_whitespace().collect::<Vec<_>>());
    }

    #[test]
    fn automatic_size_follows_the_model_window() {
        assert_eq!(
            determine_chunk_size(None, EmbeddingProvider::OpenAI, "text-embedding-3-small"),
            1024
        );
        assert_eq!(
            determine_chunk_size(None, EmbeddingProvider::Ollama, "all-minilm-l6-v2"),
            256
        );
        assert_eq!(determine_chunk_size(None, EmbeddingProvider::Hash, "hash"), 512);
        assert_eq!(determine_chunk_size(Some(42), EmbeddingProvider::Hash, "hash"), 42);
        let chunker = BodyChunker::for_model(EmbeddingProvider::Hash, "", None).expect("chunker");
        assert_eq!(chunker.chunk_size(), 512);
    }
}
