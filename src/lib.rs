#![deny(missing_docs)]

//! Versioned task pipeline over Diavgeia decisions, publishing immutable configurations.

/// Read-only HTTP routes over published configurations.
pub mod api;
/// Shared collaborator errors and call pacing.
pub mod collaborator;
/// Environment-driven configuration management.
pub mod config;
/// Immutable stage bindings and the store that publishes them.
pub mod configurations;
/// SQLite connections and embedded migrations.
pub mod db;
/// Embedding clients and body chunking.
pub mod embedding;
/// Document text extraction.
pub mod extraction;
/// Structured logging and tracing setup.
pub mod logging;
/// Stage orchestration and configuration publication.
pub mod pipeline;
/// 2D projection of embedding vectors.
pub mod projection;
/// Decision source client.
pub mod source;
/// Built-in stages and the implementation catalog.
pub mod stages;
/// Chat clients used for summarization.
pub mod summarization;
/// Task registry, runner and batch processor.
pub mod tasks;
/// Process-wide cost ledger.
pub mod usage;
/// Read-side views keyed by configuration id.
pub mod views;
