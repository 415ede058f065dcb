//! `diavgeia-ingestor`: pulls decisions for a date range and decision types.

use super::{CatalogError, Collaborators};
use crate::source::{DecisionQuery, DecisionSource, Organization, Signer, SourceDecision, Unit};
use crate::collaborator::CollaboratorError;
use crate::tasks::{
    BatchProcessor, BatchProgress, BatchStage, StageBehavior, StageError, TaskContext, TaskId,
    TaskType, parse_params,
};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::types::Json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Registered implementation name.
pub const IMPLEMENTATION: &str = "diavgeia-ingestor";

const PAGE_SIZE: u64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestParams {
    start_date: String,
    end_date: String,
    decision_types: String,
    only: Option<u64>,
}

/// Ingests decisions and the organizations, units and signers they reference.
pub struct DiavgeiaIngestor {
    source: Arc<dyn DecisionSource>,
    concurrency: usize,
}

impl DiavgeiaIngestor {
    /// Ingest from `source`, resolving references `concurrency` at a time.
    pub fn new(source: Arc<dyn DecisionSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency,
        }
    }
}

pub(super) fn build(collaborators: &Collaborators) -> Result<Arc<dyn StageBehavior>, CatalogError> {
    Ok(Arc::new(DiavgeiaIngestor::new(
        collaborators.source.clone(),
        collaborators.settings.concurrency,
    )))
}

#[async_trait]
impl StageBehavior for DiavgeiaIngestor {
    fn task_type(&self) -> TaskType {
        TaskType::Ingestor
    }

    fn implementation(&self) -> &str {
        IMPLEMENTATION
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["startDate", "endDate", "decisionTypes"]
    }

    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError> {
        let params: IngestParams = parse_params(params)?;
        let query = DecisionQuery::new(&params.decision_types, &params.start_date, &params.end_date);
        if query.decision_types.is_empty() {
            return Err(StageError::InvalidParams(
                "decisionTypes must name at least one type".into(),
            ));
        }
        if let Some(only) = params.only {
            tracing::info!(task_id = ctx.task_id(), only, "Only ingesting the first decisions");
        }

        let total = self.source.total_count(&query).await?;
        tracing::info!(task_id = ctx.task_id(), total, query = %query.expression(), "Decisions matching query");

        let run = IngestRun {
            source: self.source.clone(),
            query,
            pool: ctx.pool().clone(),
            task_id: ctx.task_id(),
            concurrency: self.concurrency,
            total,
            seen: Mutex::new(SeenReferences::default()),
            reference_failures: AtomicU64::new(0),
        };
        let progress = BatchProcessor::new(PAGE_SIZE, self.concurrency)
            .with_max_items(params.only)
            .run(&run, ctx)
            .await?;

        tracing::info!(
            task_id = ctx.task_id(),
            decisions = progress.processed,
            total,
            "Finished ingesting decisions"
        );
        Ok(run.page_metrics(&progress))
    }
}

#[derive(Default)]
struct SeenReferences {
    organizations: HashSet<String>,
    units: HashSet<String>,
    signers: HashSet<String>,
}

struct IngestRun {
    source: Arc<dyn DecisionSource>,
    query: DecisionQuery,
    pool: SqlitePool,
    task_id: TaskId,
    concurrency: usize,
    total: u64,
    seen: Mutex<SeenReferences>,
    reference_failures: AtomicU64,
}

impl IngestRun {
    fn seen(&self) -> std::sync::MutexGuard<'_, SeenReferences> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve new ids in parallel; failures are logged, counted and left unseen.
    async fn resolve(&self, requests: Vec<(ReferenceKind, String)>) -> Vec<Reference> {
        if requests.is_empty() {
            return Vec::new();
        }
        tracing::info!(task_id = self.task_id, count = requests.len(), "Fetching new references");

        let results: Vec<_> = stream::iter(requests)
            .map(|(kind, id)| self.fetch_reference(kind, id))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(kind, id, result)| match result {
                Ok(reference) => Some(reference),
                Err(error) => {
                    self.reference_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(task_id = self.task_id, ?kind, id = %id, error = %error, "Reference fetch failed");
                    None
                }
            })
            .collect()
    }

    async fn fetch_reference(
        &self,
        kind: ReferenceKind,
        id: String,
    ) -> (ReferenceKind, String, Result<Reference, CollaboratorError>) {
        let result = match kind {
            ReferenceKind::Organization => self
                .source
                .fetch_organization(&id)
                .await
                .map(Reference::Organization),
            ReferenceKind::Unit => self.source.fetch_unit(&id).await.map(Reference::Unit),
            ReferenceKind::Signer => self.source.fetch_signer(&id).await.map(Reference::Signer),
        };
        (kind, id, result)
    }
}

#[derive(Debug, Clone, Copy)]
enum ReferenceKind {
    Organization,
    Unit,
    Signer,
}

enum Reference {
    Organization(Organization),
    Unit(Unit),
    Signer(Signer),
}

fn unseen<'a>(ids: impl Iterator<Item = &'a String>, seen: &HashSet<String>) -> Vec<String> {
    let mut fresh: Vec<String> = ids
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    fresh.sort();
    fresh
}

#[async_trait]
impl BatchStage for IngestRun {
    type Input = SourceDecision;
    type Output = SourceDecision;

    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<SourceDecision>, StageError> {
        // The source pages by number; an offset off the page grid means the last page was short.
        if offset % limit != 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .source
            .fetch_page(&self.query, offset / limit, limit)
            .await?)
    }

    async fn process_item(&self, item: SourceDecision) -> Result<Vec<SourceDecision>, CollaboratorError> {
        Ok(vec![item])
    }

    async fn persist_page(&self, decisions: Vec<SourceDecision>) -> Result<(), StageError> {
        let requests: Vec<(ReferenceKind, String)> = {
            let seen = self.seen();
            let organizations = unseen(
                decisions.iter().filter_map(|d| d.organization_id.as_ref()),
                &seen.organizations,
            );
            let units = unseen(decisions.iter().flat_map(|d| &d.unit_ids), &seen.units);
            let signers = unseen(decisions.iter().flat_map(|d| &d.signer_ids), &seen.signers);

            organizations
                .into_iter()
                .map(|id| (ReferenceKind::Organization, id))
                .chain(units.into_iter().map(|id| (ReferenceKind::Unit, id)))
                .chain(signers.into_iter().map(|id| (ReferenceKind::Signer, id)))
                .collect()
        };

        let mut organizations = Vec::new();
        let mut units = Vec::new();
        let mut signers = Vec::new();
        for reference in self.resolve(requests).await {
            match reference {
                Reference::Organization(entity) => organizations.push(entity),
                Reference::Unit(entity) => units.push(entity),
                Reference::Signer(entity) => signers.push(entity),
            }
        }

        let mut tx = self.pool.begin().await?;
        for decision in &decisions {
            sqlx::query(
                "INSERT INTO decisions (ingestor_task_id, ada, document_url, issue_date, organization_id, metadata) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(&decision.ada)
            .bind(&decision.document_url)
            .bind(&decision.issue_date)
            .bind(&decision.organization_id)
            .bind(Json(&decision.metadata))
            .execute(&mut *tx)
            .await?;

            for unit_id in &decision.unit_ids {
                sqlx::query("INSERT INTO decision_units (ingestor_task_id, decision_ada, unit_id) VALUES (?, ?, ?)")
                    .bind(self.task_id)
                    .bind(&decision.ada)
                    .bind(unit_id)
                    .execute(&mut *tx)
                    .await?;
            }
            for signer_id in &decision.signer_ids {
                sqlx::query("INSERT INTO decision_signers (ingestor_task_id, decision_ada, signer_id) VALUES (?, ?, ?)")
                    .bind(self.task_id)
                    .bind(&decision.ada)
                    .bind(signer_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        for organization in &organizations {
            sqlx::query(
                "INSERT INTO organizations (ingestor_task_id, diavgeia_id, name, category, vat_number, raw_data) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(&organization.diavgeia_id)
            .bind(&organization.name)
            .bind(&organization.category)
            .bind(&organization.vat_number)
            .bind(Json(&organization.raw_data))
            .execute(&mut *tx)
            .await?;
        }
        for unit in &units {
            sqlx::query(
                "INSERT INTO units (ingestor_task_id, diavgeia_id, name, category, raw_data) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(&unit.diavgeia_id)
            .bind(&unit.name)
            .bind(&unit.category)
            .bind(Json(&unit.raw_data))
            .execute(&mut *tx)
            .await?;
        }
        for signer in &signers {
            sqlx::query(
                "INSERT INTO signers (ingestor_task_id, diavgeia_id, first_name, last_name, organization_id, raw_data) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(self.task_id)
            .bind(&signer.diavgeia_id)
            .bind(&signer.first_name)
            .bind(&signer.last_name)
            .bind(&signer.organization_id)
            .bind(Json(&signer.raw_data))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut seen = self.seen();
        seen.organizations
            .extend(organizations.into_iter().map(|entity| entity.diavgeia_id));
        seen.units.extend(units.into_iter().map(|entity| entity.diavgeia_id));
        seen.signers
            .extend(signers.into_iter().map(|entity| entity.diavgeia_id));
        Ok(())
    }

    fn page_metrics(&self, progress: &BatchProgress) -> Value {
        let seen = self.seen();
        json!({
            "processed": progress.processed,
            "decisions_processed": progress.processed,
            "organizations_processed": seen.organizations.len(),
            "units_processed": seen.units.len(),
            "signers_processed": seen.signers.len(),
            "decisions_total": self.total,
            "failures": progress.failures + self.reference_failures.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_ids_are_deduplicated_and_sorted() {
        let seen: HashSet<String> = ["b".to_string()].into_iter().collect();
        let ids = ["c", "b", "a", "c"].map(String::from);
        assert_eq!(unseen(ids.iter(), &seen), vec!["a", "c"]);
    }
}
