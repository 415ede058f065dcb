//! Built-in stage implementations and the catalog that maps implementation names to them.

pub mod embedder;
pub mod ingestor;
pub mod reducer;
pub mod summarizer;
pub mod text_extractor;

use crate::collaborator::Pacer;
use crate::embedding::EmbeddingClient;
use crate::embedding::chunking::BodyChunker;
use crate::extraction::TextExtraction;
use crate::projection::Projector;
use crate::source::DecisionSource;
use crate::summarization::ChatClient;
use crate::tasks::{StageBehavior, TaskType};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Tuning shared by every stage.
#[derive(Debug, Clone, Copy)]
pub struct StageSettings {
    /// In-flight collaborator calls per page.
    pub concurrency: usize,
    /// Upper bound on body chunks embedded per text.
    pub max_body_chunks: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_body_chunks: 8,
        }
    }
}

/// External systems available to stage constructors.
///
/// Optional collaborators are only required by the stages that call them, so a command that
/// never summarizes does not need chat credentials.
#[derive(Clone)]
pub struct Collaborators {
    /// Decision source for the ingestor.
    pub source: Arc<dyn DecisionSource>,
    /// Document text extraction.
    pub extraction: Arc<dyn TextExtraction>,
    /// Chat completions for the summarizer.
    pub chat: Option<Arc<dyn ChatClient>>,
    /// Minimum spacing between chat calls.
    pub chat_pacer: Option<Arc<Pacer>>,
    /// Embedding vectors for the embedder.
    pub embeddings: Option<Arc<dyn EmbeddingClient>>,
    /// Body splitter for the embedder.
    pub chunker: BodyChunker,
    /// 2D projection for the dimensionality reducer.
    pub projector: Arc<dyn Projector>,
    /// Shared tuning.
    pub settings: StageSettings,
}

/// Errors raised while resolving a stage implementation.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No implementation is registered under that name.
    #[error("Unknown {task_type} implementation '{implementation}' (available: {available})")]
    UnknownImplementation {
        /// Stage that was asked for.
        task_type: TaskType,
        /// Requested implementation name.
        implementation: String,
        /// Comma separated list of registered names.
        available: String,
    },
    /// The implementation needs a collaborator that was not configured.
    #[error("{implementation} requires a {collaborator} collaborator, but none is configured")]
    MissingCollaborator {
        /// Implementation being built.
        implementation: String,
        /// Missing collaborator.
        collaborator: &'static str,
    },
}

/// Builds a stage behavior from the available collaborators.
pub type StageConstructor = fn(&Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError>;

/// Explicit registry of stage implementations, keyed by stage and implementation name.
#[derive(Clone)]
pub struct StageCatalog {
    constructors: BTreeMap<(TaskType, String), StageConstructor>,
}

impl StageCatalog {
    /// Catalog with no implementations.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Catalog with every built-in implementation.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register(TaskType::Ingestor, ingestor::IMPLEMENTATION, ingestor::build);
        catalog.register(
            TaskType::TextExtractor,
            text_extractor::IMPLEMENTATION,
            text_extractor::build,
        );
        catalog.register(TaskType::Summarizer, summarizer::IMPLEMENTATION, summarizer::build);
        catalog.register(TaskType::Embedder, embedder::IMPLEMENTATION, embedder::build);
        catalog.register(
            TaskType::DimensionalityReducer,
            reducer::IMPLEMENTATION,
            reducer::build,
        );
        catalog
    }

    /// Add or replace an implementation.
    pub fn register(
        &mut self,
        task_type: TaskType,
        implementation: impl Into<String>,
        constructor: StageConstructor,
    ) -> &mut Self {
        self.constructors
            .insert((task_type, implementation.into()), constructor);
        self
    }

    /// Registered implementation names for a stage.
    pub fn implementations(&self, task_type: TaskType) -> Vec<&str> {
        self.constructors
            .keys()
            .filter(|(registered, _)| *registered == task_type)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// Construct the behavior registered under `(task_type, implementation)`.
    pub fn build(
        &self,
        task_type: TaskType,
        implementation: &str,
        collaborators: &Collaborators,
    ) -> Result<Arc<dyn StageBehavior>, CatalogError> {
        let constructor = self
            .constructors
            .get(&(task_type, implementation.to_string()))
            .ok_or_else(|| CatalogError::UnknownImplementation {
                task_type,
                implementation: implementation.to_string(),
                available: self.implementations(task_type).join(", "),
            })?;
        constructor(collaborators)
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Implementation used when none is named.
pub fn default_implementation(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Ingestor => ingestor::IMPLEMENTATION,
        TaskType::TextExtractor => text_extractor::IMPLEMENTATION,
        TaskType::Summarizer => summarizer::IMPLEMENTATION,
        TaskType::Embedder => embedder::IMPLEMENTATION,
        TaskType::DimensionalityReducer => reducer::IMPLEMENTATION,
    }
}

fn require<T: ?Sized>(
    collaborator: &Option<Arc<T>>,
    implementation: &str,
    name: &'static str,
) -> Result<Arc<T>, CatalogError> {
    collaborator
        .clone()
        .ok_or_else(|| CatalogError::MissingCollaborator {
            implementation: implementation.to_string(),
            collaborator: name,
        })
}
