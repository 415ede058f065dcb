//! `simple-text-extractor`: downloads each ingested document and records its text.

use super::{CatalogError, Collaborators};
use crate::collaborator::CollaboratorError;
use crate::extraction::{ExtractedDocument, TextExtraction};
use crate::tasks::{
    BatchProcessor, BatchProgress, BatchStage, StageBehavior, StageError, TaskContext, TaskId,
    TaskType, parse_params,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::types::Json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registered implementation name.
pub const IMPLEMENTATION: &str = "simple-text-extractor";

const PAGE_SIZE: u64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractParams {
    ingestor_task_id: TaskId,
    only: Option<u64>,
}

/// Extracts text for every decision of an ingestor task.
pub struct SimpleTextExtractor {
    extraction: Arc<dyn TextExtraction>,
    concurrency: usize,
}

impl SimpleTextExtractor {
    /// Extract through `extraction`, `concurrency` documents at a time.
    pub fn new(extraction: Arc<dyn TextExtraction>, concurrency: usize) -> Self {
        Self {
            extraction,
            concurrency,
        }
    }
}

pub(super) fn build(collaborators: &Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError> {
    Ok(Arc::new(SimpleTextExtractor::new(
        collaborators.extraction.clone(),
        collaborators.settings.concurrency,
    )))
}

#[async_trait]
impl StageBehavior for SimpleTextExtractor {
    fn task_type(&self) -> TaskType {
        TaskType::TextExtractor
    }

    fn implementation(&self) -> &str {
        IMPLEMENTATION
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["ingestorTaskId"]
    }

    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError> {
        let params: ExtractParams = parse_params(params)?;
        ctx.require_upstream(TaskType::Ingestor, params.ingestor_task_id)
            .await?;

        let run = ExtractionRun {
            extraction: self.extraction.clone(),
            pool: ctx.pool().clone(),
            task_id: ctx.task_id(),
            ingestor_task_id: params.ingestor_task_id,
            extraction_failures: AtomicU64::new(0),
        };
        let progress = BatchProcessor::new(PAGE_SIZE, self.concurrency)
            .with_max_items(params.only)
            .run(&run, ctx)
            .await?;
        Ok(run.page_metrics(&progress))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DecisionDocument {
    id: i64,
    ada: String,
    document_url: Option<String>,
}

struct ExtractedText {
    decision_id: i64,
    decision_ada: String,
    document: ExtractedDocument,
}

struct ExtractionRun {
    extraction: Arc<dyn TextExtraction>,
    pool: SqlitePool,
    task_id: TaskId,
    ingestor_task_id: TaskId,
    extraction_failures: AtomicU64,
}

#[async_trait]
impl BatchStage for ExtractionRun {
    type Input = DecisionDocument;
    type Output = ExtractedText;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<DecisionDocument>, StageError> {
        Ok(sqlx::query_as(
            "SELECT id, ada, document_url FROM decisions WHERE ingestor_task_id = ? ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(self.ingestor_task_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn process_item(&self, decision: DecisionDocument) -> Result<Vec<ExtractedText>, CollaboratorError> {
        let document = match decision.document_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                tracing::debug!(ada = %decision.ada, url, "Extracting text");
                self.extraction.extract_text(url).await?
            }
            _ => {
                tracing::warn!(ada = %decision.ada, "Decision has no document");
                ExtractedDocument::missing_document()
            }
        };
        if document.text.is_none() {
            self.extraction_failures.fetch_add(1, Ordering::Relaxed);
        }

        Ok(vec![ExtractedText {
            decision_id: decision.id,
            decision_ada: decision.ada,
            document,
        }])
    }

    async fn persist_page(&self, texts: Vec<ExtractedText>) -> Result<(), StageError> {
        let mut tx = self.pool.begin().await?;
        for text in &texts {
            sqlx::query(
                "INSERT INTO texts (text_extractor_task_id, decision_id, decision_ada, text, document_metadata) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(text.decision_id)
            .bind(&text.decision_ada)
            .bind(&text.document.text)
            .bind(Json(&text.document.metadata))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn page_metrics(&self, progress: &BatchProgress) -> Value {
        json!({
            "processed": progress.processed,
            "documents_processed": progress.processed,
            "texts_saved": progress.outputs,
            "extraction_failures": self.extraction_failures.load(Ordering::Relaxed),
            "failures": progress.failures,
        })
    }
}
