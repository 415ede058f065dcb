//! Read-side views keyed by a configuration id.
//!
//! Each view resolves the configuration first and then only reads lineage rows tagged with the
//! task ids it binds, so a reader pinned to a configuration never sees rows from later runs.

use crate::configurations::{Configuration, ConfigurationError, ConfigurationId, ConfigurationStore};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading a view.
#[derive(Debug, Error)]
pub enum ViewError {
    /// No configuration has that id.
    #[error("Configuration {0} not found")]
    ConfigurationNotFound(ConfigurationId),
    /// Loading the configuration failed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// Query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row could not be rendered as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The six views exposed to the search layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Decisions joined with text, summary and semantic point.
    Decisions,
    /// Organizations seen by the ingestor.
    Organizations,
    /// Signers seen by the ingestor.
    Signers,
    /// Units seen by the ingestor.
    Units,
    /// Decision to unit links.
    DecisionUnits,
    /// Decision to signer links.
    DecisionSigners,
}

impl ViewKind {
    /// Every view, in display order.
    pub const ALL: [ViewKind; 6] = [
        ViewKind::Decisions,
        ViewKind::Organizations,
        ViewKind::Signers,
        ViewKind::Units,
        ViewKind::DecisionUnits,
        ViewKind::DecisionSigners,
    ];

    /// URL segment naming the view.
    pub fn as_str(self) -> &'static str {
        match self {
            ViewKind::Decisions => "decisions",
            ViewKind::Organizations => "organizations",
            ViewKind::Signers => "signers",
            ViewKind::Units => "units",
            ViewKind::DecisionUnits => "decision-units",
            ViewKind::DecisionSigners => "decision-signers",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ViewKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown view '{value}'"))
    }
}

/// One decision with everything later stages produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRow {
    /// Decision identifier.
    pub ada: String,
    /// Document URL.
    pub document_url: Option<String>,
    /// Issue date as `YYYY-MM-DD`.
    pub issue_date: Option<String>,
    /// Issuing organization id.
    pub organization_id: Option<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Extracted text.
    pub text: Option<String>,
    /// Summary, absent when the configuration skipped summarization.
    pub summary: Option<String>,
    /// Awarded amount in euros.
    pub award_amount: Option<f64>,
    /// Recipient of the awarded amount.
    pub beneficiary: Option<String>,
    /// Projected x coordinate, absent when the decision was not sampled.
    pub x: Option<f64>,
    /// Projected y coordinate.
    pub y: Option<f64>,
}

/// Organization referenced by ingested decisions.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRow {
    /// Source identifier.
    pub diavgeia_id: String,
    /// Display name.
    pub name: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// Tax number.
    pub vat_number: Option<String>,
}

/// Signer referenced by ingested decisions.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SignerRow {
    /// Source identifier.
    pub diavgeia_id: String,
    /// First name.
    pub first_name: Option<String>,
    /// Last name.
    pub last_name: Option<String>,
    /// Organization the signer belongs to.
    pub organization_id: Option<String>,
}

/// Unit referenced by ingested decisions.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UnitRow {
    /// Source identifier.
    pub diavgeia_id: String,
    /// Display name.
    pub name: Option<String>,
    /// Category.
    pub category: Option<String>,
}

/// Link between a decision and one of its units.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DecisionUnitRow {
    /// Decision identifier.
    pub decision_ada: String,
    /// Unit source identifier.
    pub unit_id: String,
}

/// Link between a decision and one of its signers.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DecisionSignerRow {
    /// Decision identifier.
    pub decision_ada: String,
    /// Signer source identifier.
    pub signer_id: String,
}

/// Query surface for the search layer.
#[derive(Clone)]
pub struct Views {
    pool: SqlitePool,
    configurations: ConfigurationStore,
}

impl Views {
    /// Read through `pool`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            configurations: ConfigurationStore::new(pool.clone()),
            pool,
        }
    }

    async fn configuration(&self, id: ConfigurationId) -> Result<Configuration, ViewError> {
        self.configurations
            .get(id)
            .await?
            .ok_or(ViewError::ConfigurationNotFound(id))
    }

    /// `decisionsView(configId)`.
    pub async fn decisions(&self, id: ConfigurationId) -> Result<Vec<DecisionRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            r#"
            SELECT d.ada AS ada,
                   d.document_url AS document_url,
                   d.issue_date AS issue_date,
                   d.organization_id AS organization_id,
                   json_extract(d.metadata, '$.subject') AS subject,
                   t.text AS text,
                   s.summary AS summary,
                   CAST(json_extract(s.extracted_data, '$.awardAmount') AS REAL) AS award_amount,
                   json_extract(s.extracted_data, '$.beneficiary') AS beneficiary,
                   p.x AS x,
                   p.y AS y
            FROM decisions d
            LEFT JOIN texts t ON t.decision_id = d.id AND t.text_extractor_task_id = ?
            LEFT JOIN summaries s ON s.text_id = t.id AND s.summarizer_task_id = ?
            LEFT JOIN semantic_points p ON p.decision_id = d.id AND p.dimensionality_reducer_task_id = ?
            WHERE d.ingestor_task_id = ?
            ORDER BY d.id
            "#,
        )
        .bind(tasks.text_extractor_task_id)
        .bind(tasks.summarizer_task_id)
        .bind(tasks.dimensionality_reducer_task_id)
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `organizationsView(configId)`.
    pub async fn organizations(&self, id: ConfigurationId) -> Result<Vec<OrganizationRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            "SELECT diavgeia_id, name, category, vat_number FROM organizations WHERE ingestor_task_id = ? ORDER BY id",
        )
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `signersView(configId)`.
    pub async fn signers(&self, id: ConfigurationId) -> Result<Vec<SignerRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            "SELECT diavgeia_id, first_name, last_name, organization_id FROM signers WHERE ingestor_task_id = ? ORDER BY id",
        )
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `unitsView(configId)`.
    pub async fn units(&self, id: ConfigurationId) -> Result<Vec<UnitRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            "SELECT diavgeia_id, name, category FROM units WHERE ingestor_task_id = ? ORDER BY id",
        )
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `decisionUnitsView(configId)`.
    pub async fn decision_units(&self, id: ConfigurationId) -> Result<Vec<DecisionUnitRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            "SELECT decision_ada, unit_id FROM decision_units WHERE ingestor_task_id = ? ORDER BY rowid",
        )
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `decisionSignersView(configId)`.
    pub async fn decision_signers(&self, id: ConfigurationId) -> Result<Vec<DecisionSignerRow>, ViewError> {
        let tasks = self.configuration(id).await?.tasks;
        Ok(sqlx::query_as(
            "SELECT decision_ada, signer_id FROM decision_signers WHERE ingestor_task_id = ? ORDER BY rowid",
        )
        .bind(tasks.ingestor_task_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Any view rendered as JSON rows.
    pub async fn load(&self, kind: ViewKind, id: ConfigurationId) -> Result<serde_json::Value, ViewError> {
        let rows = match kind {
            ViewKind::Decisions => to_rows(self.decisions(id).await?)?,
            ViewKind::Organizations => to_rows(self.organizations(id).await?)?,
            ViewKind::Signers => to_rows(self.signers(id).await?)?,
            ViewKind::Units => to_rows(self.units(id).await?)?,
            ViewKind::DecisionUnits => to_rows(self.decision_units(id).await?)?,
            ViewKind::DecisionSigners => to_rows(self.decision_signers(id).await?)?,
        };
        Ok(serde_json::Value::Array(rows))
    }
}

fn to_rows<T: Serialize>(rows: Vec<T>) -> Result<Vec<serde_json::Value>, serde_json::Error> {
    rows.into_iter().map(serde_json::to_value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurations::StageTaskIds;
    use crate::db;
    use serde_json::json;
    use sqlx::types::Json;
    use std::collections::BTreeMap;

    #[test]
    fn rows_that_cannot_be_rendered_are_an_error() {
        let unrenderable = vec![BTreeMap::from([((1, 2), "tuple keys are not JSON")])];
        assert!(to_rows(unrenderable).is_err());
        assert_eq!(to_rows(vec![json!({ "ada": "ADA-1" })]).expect("rows").len(), 1);
    }

    async fn decision(pool: &SqlitePool, ingestor: i64, ada: &str) -> i64 {
        sqlx::query(
            "INSERT INTO decisions (ingestor_task_id, ada, document_url, issue_date, organization_id, metadata) VALUES (?, ?, NULL, '2021-06-01', '100', ?)",
        )
        .bind(ingestor)
        .bind(ada)
        .bind(Json(json!({ "subject": format!("Θέμα {ada}") })))
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn text(pool: &SqlitePool, extractor: i64, decision_id: i64, ada: &str) -> i64 {
        sqlx::query(
            "INSERT INTO texts (text_extractor_task_id, decision_id, decision_ada, text) VALUES (?, ?, ?, 'body')",
        )
        .bind(extractor)
        .bind(decision_id)
        .bind(ada)
        .execute(pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn decisions_view_only_joins_bound_tasks() {
        let pool = db::connect_in_memory().await.unwrap();
        let first = decision(&pool, 1, "ADA-1").await;
        decision(&pool, 99, "ADA-OTHER").await;
        let text_id = text(&pool, 2, first, "ADA-1").await;
        text(&pool, 98, first, "ADA-1").await;

        sqlx::query(
            "INSERT INTO summaries (summarizer_task_id, text_id, decision_ada, summary, extracted_data) VALUES (3, ?, 'ADA-1', 'Ανατίθεται έργο.', ?)",
        )
        .bind(text_id)
        .bind(Json(json!({ "summary": "Ανατίθεται έργο.", "awardAmount": 1200, "beneficiary": "ACME" })))
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO semantic_points (dimensionality_reducer_task_id, decision_id, decision_ada, x, y) VALUES (5, ?, 'ADA-1', 0.5, -0.25)",
        )
        .bind(first)
        .execute(&pool)
        .await
        .unwrap();

        let store = ConfigurationStore::new(pool.clone());
        let with_summaries = store
            .create(
                "june",
                &StageTaskIds {
                    ingestor_task_id: 1,
                    text_extractor_task_id: 2,
                    summarizer_task_id: Some(3),
                    embedder_task_id: 4,
                    dimensionality_reducer_task_id: 5,
                },
            )
            .await
            .unwrap();
        let without_summaries = store
            .create(
                "june-plain",
                &StageTaskIds {
                    ingestor_task_id: 1,
                    text_extractor_task_id: 2,
                    summarizer_task_id: None,
                    embedder_task_id: 4,
                    dimensionality_reducer_task_id: 5,
                },
            )
            .await
            .unwrap();

        let views = Views::new(pool);
        let rows = views.decisions(with_summaries).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.ada, "ADA-1");
        assert_eq!(row.subject.as_deref(), Some("Θέμα ADA-1"));
        assert_eq!(row.text.as_deref(), Some("body"));
        assert_eq!(row.award_amount, Some(1200.0));
        assert_eq!(row.beneficiary.as_deref(), Some("ACME"));
        assert_eq!((row.x, row.y), (Some(0.5), Some(-0.25)));

        let plain = views.decisions(without_summaries).await.unwrap();
        assert_eq!(plain[0].summary, None);
        assert_eq!(plain[0].text.as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn unknown_configuration_is_reported() {
        let views = Views::new(db::connect_in_memory().await.unwrap());
        assert!(matches!(
            views.load(ViewKind::Units, 7).await,
            Err(ViewError::ConfigurationNotFound(7))
        ));
    }

    #[test]
    fn view_names_round_trip_through_url_segments() {
        for kind in ViewKind::ALL {
            assert_eq!(kind.as_str().parse::<ViewKind>(), Ok(kind));
        }
        assert!("texts".parse::<ViewKind>().is_err());
    }
}
