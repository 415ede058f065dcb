//! `multi-facet-embedder`: several embedding vectors per text, one per semantic facet.

use super::{CatalogError, Collaborators, require};
use crate::collaborator::CollaboratorError;
use crate::embedding::EmbeddingClient;
use crate::embedding::chunking::BodyChunker;
use crate::tasks::{
    BatchProcessor, BatchProgress, BatchStage, StageBehavior, StageError, TaskContext, TaskId,
    TaskType, parse_params,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::types::Json;
use std::fmt;
use std::sync::Arc;

/// Registered implementation name.
pub const IMPLEMENTATION: &str = "multi-facet-embedder";

const PAGE_SIZE: u64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbedParams {
    text_extractor_task_id: TaskId,
    summarizer_task_id: Option<TaskId>,
    only: Option<u64>,
}

/// Aspect of a decision an embedding represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    /// Model-written summary.
    Summary,
    /// Decision subject line.
    Subject,
    /// Recipient of awarded money.
    Beneficiary,
    /// A chunk of the document body.
    Body,
}

impl Facet {
    /// Persisted facet name.
    pub fn as_str(self) -> &'static str {
        match self {
            Facet::Summary => "summary",
            Facet::Subject => "subject",
            Facet::Beneficiary => "beneficiary",
            Facet::Body => "body",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that feed the facets of one text.
#[derive(Debug, Default, Clone, sqlx::FromRow)]
pub struct FacetSource {
    /// Text row id.
    pub text_id: i64,
    /// Extracted body.
    pub text: Option<String>,
    /// Decision subject.
    pub subject: Option<String>,
    /// Summary, when a summarizer task was joined.
    pub summary: Option<String>,
    /// Beneficiary extracted by the summarizer.
    pub beneficiary: Option<String>,
}

/// Facets of one text in embedding order: summary, subject, beneficiary, then body chunks.
pub fn facets(source: &FacetSource, chunker: &BodyChunker, max_body_chunks: usize) -> Vec<(Facet, String)> {
    let present = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let mut facets = Vec::new();
    if let Some(summary) = present(&source.summary) {
        facets.push((Facet::Summary, summary));
    }
    if let Some(subject) = present(&source.subject) {
        facets.push((Facet::Subject, subject));
    }
    if let Some(beneficiary) = present(&source.beneficiary) {
        facets.push((Facet::Beneficiary, beneficiary));
    }
    if let Some(text) = source.text.as_deref() {
        facets.extend(
            chunker
                .chunk(text)
                .into_iter()
                .take(max_body_chunks)
                .map(|chunk| (Facet::Body, chunk)),
        );
    }
    facets
}

/// Embeds every text of a text extractor task, optionally enriched with summaries.
pub struct MultiFacetEmbedder {
    embeddings: Arc<dyn EmbeddingClient>,
    chunker: BodyChunker,
    max_body_chunks: usize,
    concurrency: usize,
}

impl MultiFacetEmbedder {
    /// Embed with `embeddings`, splitting bodies with `chunker`.
    pub fn new(
        embeddings: Arc<dyn EmbeddingClient>,
        chunker: BodyChunker,
        max_body_chunks: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            embeddings,
            chunker,
            max_body_chunks,
            concurrency,
        }
    }
}

pub(super) fn build(collaborators: &Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError> {
    Ok(Arc::new(MultiFacetEmbedder::new(
        require(&collaborators.embeddings, IMPLEMENTATION, "embedding")?,
        collaborators.chunker.clone(),
        collaborators.settings.max_body_chunks,
        collaborators.settings.concurrency,
    )))
}

#[async_trait]
impl StageBehavior for MultiFacetEmbedder {
    fn task_type(&self) -> TaskType {
        TaskType::Embedder
    }

    fn implementation(&self) -> &str {
        IMPLEMENTATION
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["textExtractorTaskId"]
    }

    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError> {
        let params: EmbedParams = parse_params(params)?;
        ctx.require_upstream(TaskType::TextExtractor, params.text_extractor_task_id)
            .await?;
        if let Some(summarizer_task_id) = params.summarizer_task_id {
            let summarizer = ctx
                .require_upstream(TaskType::Summarizer, summarizer_task_id)
                .await?;
            // Both upstreams must read the same text extractor task.
            let key = TaskType::TextExtractor.upstream_param();
            let summarized = summarizer.params.get(key).and_then(Value::as_i64);
            if summarized != Some(params.text_extractor_task_id) {
                return Err(StageError::LineageMismatch {
                    id: summarizer_task_id,
                    key,
                    expected: params.text_extractor_task_id,
                    actual: summarized,
                });
            }
        }

        let run = EmbeddingRun {
            embeddings: self.embeddings.clone(),
            chunker: self.chunker.clone(),
            max_body_chunks: self.max_body_chunks,
            pool: ctx.pool().clone(),
            task_id: ctx.task_id(),
            text_extractor_task_id: params.text_extractor_task_id,
            summarizer_task_id: params.summarizer_task_id,
        };
        let progress = BatchProcessor::new(PAGE_SIZE, self.concurrency)
            .with_max_items(params.only)
            .run(&run, ctx)
            .await?;
        Ok(run.page_metrics(&progress))
    }
}

struct EmbeddingRow {
    text_id: i64,
    seq: i64,
    facet: Facet,
    vector: Vec<f32>,
}

struct EmbeddingRun {
    embeddings: Arc<dyn EmbeddingClient>,
    chunker: BodyChunker,
    max_body_chunks: usize,
    pool: SqlitePool,
    task_id: TaskId,
    text_extractor_task_id: TaskId,
    summarizer_task_id: Option<TaskId>,
}

#[async_trait]
impl BatchStage for EmbeddingRun {
    type Input = FacetSource;
    type Output = EmbeddingRow;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<FacetSource>, StageError> {
        Ok(sqlx::query_as(
            r#"
            SELECT t.id AS text_id,
                   t.text AS text,
                   json_extract(d.metadata, '$.subject') AS subject,
                   s.summary AS summary,
                   json_extract(s.extracted_data, '$.beneficiary') AS beneficiary
            FROM texts t
            LEFT JOIN decisions d ON d.id = t.decision_id
            LEFT JOIN summaries s ON s.text_id = t.id AND s.summarizer_task_id = ?
            WHERE t.text_extractor_task_id = ?
            ORDER BY t.id LIMIT ? OFFSET ?
            "#,
        )
        .bind(self.summarizer_task_id)
        .bind(self.text_extractor_task_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn process_item(&self, source: FacetSource) -> Result<Vec<EmbeddingRow>, CollaboratorError> {
        let facets = facets(&source, &self.chunker, self.max_body_chunks);
        if facets.is_empty() {
            tracing::debug!(text_id = source.text_id, "Nothing to embed");
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = facets.iter().map(|(_, input)| input.clone()).collect();
        let vectors = self.embeddings.generate_embeddings(inputs).await?;
        if vectors.len() != facets.len() {
            return Err(CollaboratorError::InvalidResponse(format!(
                "expected {} embeddings, received {}",
                facets.len(),
                vectors.len()
            )));
        }

        Ok(facets
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, ((facet, _), vector))| EmbeddingRow {
                text_id: source.text_id,
                seq: index as i64 + 1,
                facet,
                vector,
            })
            .collect())
    }

    async fn persist_page(&self, rows: Vec<EmbeddingRow>) -> Result<(), StageError> {
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            sqlx::query(
                "INSERT INTO embeddings (embedder_task_id, text_id, embedding_seq, facet, embedding) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(row.text_id)
            .bind(row.seq)
            .bind(row.facet.as_str())
            .bind(Json(&row.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn page_metrics(&self, progress: &BatchProgress) -> Value {
        json!({
            "processed": progress.processed,
            "texts_processed": progress.processed,
            "embeddings_generated": progress.outputs,
            "failures": progress.failures,
        })
    }
}
