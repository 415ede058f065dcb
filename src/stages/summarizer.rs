//! `gpt-summarizer`: one-sentence summaries and structured fields for extracted texts.

use super::{CatalogError, Collaborators, require};
use crate::collaborator::{CollaboratorError, Pacer};
use crate::summarization::{ChatClient, ChatRequest};
use crate::tasks::{
    BatchProcessor, BatchProgress, BatchStage, StageBehavior, StageError, TaskContext, TaskId,
    TaskType, parse_params,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::types::Json;
use std::sync::Arc;

/// Registered implementation name.
pub const IMPLEMENTATION: &str = "gpt-summarizer";

const PAGE_SIZE: u64 = 20;
const MAX_ATTEMPTS: usize = 3;

const SYSTEM_PROMPT: &str = r#"You extract data and summaries from Greek public-sector decisions published on Diavgeia.
The user sends the text of one decision. Respond only with a JSON object with these fields:
- lawRef: string[] - laws the decision refers to (e.g. "Ν. 1234/2021")
- adaRef: string[] - ADA identifiers of other decisions it refers to (e.g. "ΒΓΔ23ΟΞΞ-ΓΞΔ")
- summary: string - a one-sentence summary in Greek
- awardAmount: number - the amount in euros awarded to the beneficiary
- beneficiary: string - the company, person or organization receiving the amount
Any field may be null. awardAmount and beneficiary must be null when no money is awarded.
The summary starts with a verb, for example "Εγκρίνεται...", "Ανατίθεται..." or "Αποφασίζεται...",
skips phrases such as "Η πράξη περιγράφει..." and omits references to laws and earlier decisions.
Base your answer solely on the given text."#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummarizeParams {
    text_extractor_task_id: TaskId,
    only: Option<u64>,
}

/// Fields the model is asked to extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFields {
    /// One-sentence summary.
    pub summary: String,
    /// Awarded amount in euros.
    #[serde(default)]
    pub award_amount: Option<f64>,
    /// Recipient of the awarded amount.
    #[serde(default)]
    pub beneficiary: Option<String>,
    /// Laws the decision refers to.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub law_ref: Vec<String>,
    /// Other decisions the decision refers to.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ada_ref: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse a model reply, requiring a non-empty `summary`.
pub fn parse_summary(content: &str) -> Result<ExtractedFields, CollaboratorError> {
    let fields: ExtractedFields = serde_json::from_str(content).map_err(|error| {
        CollaboratorError::InvalidResponse(format!("summary is not valid JSON: {error}"))
    })?;
    if fields.summary.trim().is_empty() {
        return Err(CollaboratorError::InvalidResponse(
            "summary field is empty".into(),
        ));
    }
    Ok(fields)
}

/// Summarizes every non-empty text of a text extractor task.
pub struct GptSummarizer {
    chat: Arc<dyn ChatClient>,
    pacer: Option<Arc<Pacer>>,
    concurrency: usize,
}

impl GptSummarizer {
    /// Summarize with `chat`, waiting on `pacer` before each call when given.
    pub fn new(chat: Arc<dyn ChatClient>, pacer: Option<Arc<Pacer>>, concurrency: usize) -> Self {
        Self {
            chat,
            pacer,
            concurrency,
        }
    }
}

pub(super) fn build(collaborators: &Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError> {
    Ok(Arc::new(GptSummarizer::new(
        require(&collaborators.chat, IMPLEMENTATION, "chat")?,
        collaborators.chat_pacer.clone(),
        collaborators.settings.concurrency,
    )))
}

#[async_trait]
impl StageBehavior for GptSummarizer {
    fn task_type(&self) -> TaskType {
        TaskType::Summarizer
    }

    fn implementation(&self) -> &str {
        IMPLEMENTATION
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["textExtractorTaskId"]
    }

    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError> {
        let params: SummarizeParams = parse_params(params)?;
        ctx.require_upstream(TaskType::TextExtractor, params.text_extractor_task_id)
            .await?;

        let run = SummaryRun {
            chat: self.chat.clone(),
            pacer: self.pacer.clone(),
            pool: ctx.pool().clone(),
            task_id: ctx.task_id(),
            text_extractor_task_id: params.text_extractor_task_id,
        };
        let progress = BatchProcessor::new(PAGE_SIZE, self.concurrency)
            .with_max_items(params.only)
            .run(&run, ctx)
            .await?;
        Ok(run.page_metrics(&progress))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TextToSummarize {
    id: i64,
    decision_ada: String,
    text: String,
}

struct Summary {
    text_id: i64,
    decision_ada: String,
    fields: ExtractedFields,
}

struct SummaryRun {
    chat: Arc<dyn ChatClient>,
    pacer: Option<Arc<Pacer>>,
    pool: SqlitePool,
    task_id: TaskId,
    text_extractor_task_id: TaskId,
}

impl SummaryRun {
    /// Up to [`MAX_ATTEMPTS`] chat calls; budget exhaustion is never retried.
    async fn complete_with_retries(&self, request: ChatRequest, ada: &str) -> Result<String, CollaboratorError> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(pacer) = &self.pacer {
                pacer.wait().await;
            }
            match self.chat.complete(request.clone()).await {
                Ok(content) => return Ok(content),
                Err(error @ CollaboratorError::BudgetExceeded(_)) => return Err(error),
                Err(error) => {
                    tracing::warn!(ada, attempt, error = %error, "Summary attempt failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CollaboratorError::Failed("no attempts made".into())))
    }
}

#[async_trait]
impl BatchStage for SummaryRun {
    type Input = TextToSummarize;
    type Output = Summary;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<TextToSummarize>, StageError> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, decision_ada, text FROM texts
            WHERE text_extractor_task_id = ? AND text IS NOT NULL AND text != ''
            ORDER BY id LIMIT ? OFFSET ?
            "#,
        )
        .bind(self.text_extractor_task_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn process_item(&self, text: TextToSummarize) -> Result<Vec<Summary>, CollaboratorError> {
        let request = ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!(
                "Ακολουθεί το κείμενο της πράξης με ΑΔΑ {}:\n----\n{}",
                text.decision_ada, text.text
            ),
            json_response: true,
        };
        let content = self.complete_with_retries(request, &text.decision_ada).await?;
        let fields = parse_summary(&content)?;
        tracing::debug!(ada = %text.decision_ada, summary = %fields.summary, "Summarized text");

        Ok(vec![Summary {
            text_id: text.id,
            decision_ada: text.decision_ada,
            fields,
        }])
    }

    async fn persist_page(&self, summaries: Vec<Summary>) -> Result<(), StageError> {
        let mut tx = self.pool.begin().await?;
        for summary in &summaries {
            sqlx::query(
                "INSERT INTO summaries (summarizer_task_id, text_id, decision_ada, summary, extracted_data) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(summary.text_id)
            .bind(&summary.decision_ada)
            .bind(&summary.fields.summary)
            .bind(Json(&summary.fields))
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
            "summaries_generated": progress.outputs,
            "failures": progress.failures,
        })
    }
}
