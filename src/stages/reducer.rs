//! `pca-dimensionality-reducer`: projects a random sample of decisions to 2D points.
//!
//! The sample is bounded by `sampleSize`, so this stage reads its input in one pass and writes
//! its points in one transaction instead of paging through the batch processor.

use super::{CatalogError, Collaborators};
use crate::projection::Projector;
use crate::tasks::{StageBehavior, StageError, TaskContext, TaskId, TaskType, parse_params};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::types::Json;
use std::sync::Arc;

/// Registered implementation name.
pub const IMPLEMENTATION: &str = "pca-dimensionality-reducer";

const DEFAULT_SAMPLE_SIZE: u64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReduceParams {
    embedder_task_id: TaskId,
    sample_size: Option<u64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SampledDecision {
    decision_id: i64,
    decision_ada: String,
}

/// Averages each sampled decision's embeddings and projects the averages.
pub struct PcaDimensionalityReducer {
    projector: Arc<dyn Projector>,
}

impl PcaDimensionalityReducer {
    /// Reduce with `projector`.
    pub fn new(projector: Arc<dyn Projector>) -> Self {
        Self { projector }
    }
}

pub(super) fn build(collaborators: &Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError> {
    Ok(Arc::new(PcaDimensionalityReducer::new(
        collaborators.projector.clone(),
    )))
}

/// SQLite reads a negative `LIMIT` as unbounded, so oversized samples saturate instead.
fn sample_limit(sample_size: u64) -> i64 {
    i64::try_from(sample_size).unwrap_or(i64::MAX)
}

/// Component-wise mean of equally sized vectors.
pub fn average(vectors: &[Vec<f32>]) -> Result<Vec<f64>, StageError> {
    let Some(dimension) = vectors.first().map(Vec::len) else {
        return Err(StageError::Other("no embeddings to average".into()));
    };
    if let Some(other) = vectors.iter().find(|vector| vector.len() != dimension) {
        return Err(StageError::Other(format!(
            "embedding dimensions differ: {dimension} and {}",
            other.len()
        )));
    }

    let mut mean = vec![0.0_f64; dimension];
    for vector in vectors {
        for (slot, value) in mean.iter_mut().zip(vector) {
            *slot += f64::from(*value);
        }
    }
    let count = vectors.len() as f64;
    mean.iter_mut().for_each(|value| *value /= count);
    Ok(mean)
}

#[async_trait]
impl StageBehavior for PcaDimensionalityReducer {
    fn task_type(&self) -> TaskType {
        TaskType::DimensionalityReducer
    }

    fn implementation(&self) -> &str {
        IMPLEMENTATION
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["embedderTaskId"]
    }

    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError> {
        let params: ReduceParams = parse_params(params)?;
        ctx.require_upstream(TaskType::Embedder, params.embedder_task_id)
            .await?;
        let sample_size = params.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);

        let sample: Vec<SampledDecision> = sqlx::query_as(
            r#"
            SELECT decision_id, decision_ada FROM (
                SELECT DISTINCT t.decision_id AS decision_id, t.decision_ada AS decision_ada
                FROM embeddings e
                JOIN texts t ON t.id = e.text_id
                WHERE e.embedder_task_id = ?
            )
            ORDER BY RANDOM()
            LIMIT ?
            "#,
        )
        .bind(params.embedder_task_id)
        .bind(sample_limit(sample_size))
        .fetch_all(ctx.pool())
        .await?;
        tracing::info!(task_id = ctx.task_id(), sampled = sample.len(), sample_size, "Sampled decisions");

        let mut averages = Vec::with_capacity(sample.len());
        for decision in &sample {
            let vectors: Vec<Json<Vec<f32>>> = sqlx::query_scalar(
                r#"
                SELECT e.embedding FROM embeddings e
                JOIN texts t ON t.id = e.text_id
                WHERE e.embedder_task_id = ? AND t.decision_id = ?
                ORDER BY e.id
                "#,
            )
            .bind(params.embedder_task_id)
            .bind(decision.decision_id)
            .fetch_all(ctx.pool())
            .await?;
            let vectors: Vec<Vec<f32>> = vectors.into_iter().map(|Json(vector)| vector).collect();
            averages.push(average(&vectors)?);
        }

        if let Some(first) = averages.first()
            && let Some(other) = averages.iter().find(|vector| vector.len() != first.len())
        {
            return Err(StageError::Other(format!(
                "embedding dimensions differ across decisions: {} and {}",
                first.len(),
                other.len()
            )));
        }

        let points = self.projector.project(averages).await?;
        if points.len() != sample.len() {
            return Err(StageError::Other(format!(
                "projector returned {} points for {} decisions",
                points.len(),
                sample.len()
            )));
        }

        let mut tx = ctx.pool().begin().await?;
        for (decision, (x, y)) in sample.iter().zip(&points) {
            sqlx::query(
                "INSERT INTO semantic_points (dimensionality_reducer_task_id, decision_id, decision_ada, x, y) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(ctx.task_id())
            .bind(decision.decision_id)
            .bind(&decision.decision_ada)
            .bind(x)
            .bind(y)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let metrics = json!({
            "processed": points.len(),
            "documents_processed": points.len(),
            "sample_size": sample_size,
        });
        ctx.update_metrics(&metrics).await?;
        Ok(metrics)
    }
}
