//! Immutable, named bindings of one task id per stage.
//!
//! Publishing a configuration is the only mutation; readers pinned to an id never observe
//! later runs.

use crate::tasks::{TaskId, serialize_rfc3339};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use time::OffsetDateTime;

/// Database identifier of a configuration.
pub type ConfigurationId = i64;

/// Errors raised by the configuration store.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// An insert touched a number of rows other than one.
    #[error("Expected to create exactly one configuration, created {0}")]
    Inconsistent(u64),
    /// Nothing has been published yet.
    #[error("No configuration has been published")]
    Empty,
}

/// The task id bound for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTaskIds {
    /// Ingestor task.
    pub ingestor_task_id: TaskId,
    /// Text extractor task.
    pub text_extractor_task_id: TaskId,
    /// Summarizer task, absent when the stage was skipped.
    pub summarizer_task_id: Option<TaskId>,
    /// Embedder task.
    pub embedder_task_id: TaskId,
    /// Dimensionality reducer task.
    pub dimensionality_reducer_task_id: TaskId,
}

/// A published configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    /// Row identifier; the largest id is the latest configuration.
    pub id: ConfigurationId,
    /// Pipeline run name.
    pub name: String,
    /// Bound task ids.
    #[serde(flatten)]
    pub tasks: StageTaskIds,
    /// Publication time.
    #[serde(serialize_with = "serialize_rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct ConfigurationRow {
    id: i64,
    name: String,
    ingestor_task_id: i64,
    text_extractor_task_id: i64,
    summarizer_task_id: Option<i64>,
    embedder_task_id: i64,
    dimensionality_reducer_task_id: i64,
    created_at: OffsetDateTime,
}

impl From<ConfigurationRow> for Configuration {
    fn from(row: ConfigurationRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            tasks: StageTaskIds {
                ingestor_task_id: row.ingestor_task_id,
                text_extractor_task_id: row.text_extractor_task_id,
                summarizer_task_id: row.summarizer_task_id,
                embedder_task_id: row.embedder_task_id,
                dimensionality_reducer_task_id: row.dimensionality_reducer_task_id,
            },
            created_at: row.created_at,
        }
    }
}

const CONFIGURATION_COLUMNS: &str = "id, name, ingestor_task_id, text_extractor_task_id, summarizer_task_id, embedder_task_id, dimensionality_reducer_task_id, created_at";

/// Sole writer of the `configurations` table.
#[derive(Clone)]
pub struct ConfigurationStore {
    pool: SqlitePool,
}

impl ConfigurationStore {
    /// Wrap a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Publish a configuration and return its id.
    pub async fn create(
        &self,
        name: &str,
        tasks: &StageTaskIds,
    ) -> Result<ConfigurationId, ConfigurationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO configurations (name, ingestor_task_id, text_extractor_task_id, summarizer_task_id, embedder_task_id, dimensionality_reducer_task_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(tasks.ingestor_task_id)
        .bind(tasks.text_extractor_task_id)
        .bind(tasks.summarizer_task_id)
        .bind(tasks.embedder_task_id)
        .bind(tasks.dimensionality_reducer_task_id)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(ConfigurationError::Inconsistent(result.rows_affected()));
        }
        let id = result.last_insert_rowid();
        tracing::info!(configuration_id = id, name, ?tasks, "Published configuration");
        Ok(id)
    }

    /// The configuration with the largest id.
    pub async fn latest(&self) -> Result<Configuration, ConfigurationError> {
        sqlx::query_as::<_, ConfigurationRow>(&format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM configurations ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?
        .map(Configuration::from)
        .ok_or(ConfigurationError::Empty)
    }

    /// Load one configuration.
    pub async fn get(&self, id: ConfigurationId) -> Result<Option<Configuration>, ConfigurationError> {
        Ok(sqlx::query_as::<_, ConfigurationRow>(&format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM configurations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Configuration::from))
    }

    /// Every configuration, newest first.
    pub async fn list(&self) -> Result<Vec<Configuration>, ConfigurationError> {
        Ok(sqlx::query_as::<_, ConfigurationRow>(&format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM configurations ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Configuration::from)
        .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn tasks(base: i64, summarizer: Option<i64>) -> StageTaskIds {
        StageTaskIds {
            ingestor_task_id: base,
            text_extractor_task_id: base + 1,
            summarizer_task_id: summarizer,
            embedder_task_id: base + 2,
            dimensionality_reducer_task_id: base + 3,
        }
    }

    #[tokio::test]
    async fn latest_requires_a_configuration() {
        let store = ConfigurationStore::new(db::connect_in_memory().await.unwrap());
        assert!(matches!(store.latest().await, Err(ConfigurationError::Empty)));
    }

    #[tokio::test]
    async fn publishing_leaves_earlier_configurations_untouched() {
        let store = ConfigurationStore::new(db::connect_in_memory().await.unwrap());
        let first = store.create("june", &tasks(1, Some(9))).await.unwrap();
        let before = store.get(first).await.unwrap().expect("first");

        let second = store.create("july", &tasks(10, None)).await.unwrap();
        assert!(second > first);

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.tasks.summarizer_task_id, None);

        let after = store.get(first).await.unwrap().expect("first");
        assert_eq!(before, after);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn serializes_with_camel_case_task_ids() {
        let store = ConfigurationStore::new(db::connect_in_memory().await.unwrap());
        let id = store.create("june", &tasks(1, None)).await.unwrap();
        let value = serde_json::to_value(store.get(id).await.unwrap().unwrap()).unwrap();
        assert_eq!(value["ingestorTaskId"], 1);
        assert!(value["summarizerTaskId"].is_null());
        assert!(value["createdAt"].is_string());
    }
}
