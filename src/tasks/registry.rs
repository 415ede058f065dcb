//! Persistent store of task identity, status, params and metrics.

use super::types::{Task, TaskFilter, TaskId, TaskIdentity, TaskStatus, TaskType};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use sqlx::types::Json;
use std::time::Duration;
use time::OffsetDateTime;

const TASK_COLUMNS: &str =
    "id, type, implementation, name, version, status, created_at, updated_at, params, metrics";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    #[sqlx(rename = "type")]
    task_type: String,
    implementation: String,
    name: String,
    version: i64,
    status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    params: Json<Value>,
    metrics: Json<Value>,
}

impl TryFrom<TaskRow> for Task {
    type Error = sqlx::Error;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            task_type: row.task_type.parse().map_err(decode_error)?,
            implementation: row.implementation,
            name: row.name,
            version: row.version,
            status: row.status.parse().map_err(decode_error)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            params: row.params.0,
            metrics: row.metrics.0,
        })
    }
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

/// Handle on the `tasks` table. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct TaskRegistry {
    pool: SqlitePool,
}

impl TaskRegistry {
    /// Wrap a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool, shared with lineage writers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `max(version) + 1` for the identity, or `1` when it has never run.
    pub async fn next_version(&self, identity: &TaskIdentity) -> Result<i64, sqlx::Error> {
        let max_version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM tasks WHERE type = ? AND implementation = ? AND name = ?",
        )
        .bind(identity.task_type.as_str())
        .bind(&identity.implementation)
        .bind(&identity.name)
        .fetch_one(&self.pool)
        .await?;

        Ok(max_version.map_or(1, |version| version + 1))
    }

    /// Whether `(type, implementation, name, version)` is already recorded.
    pub async fn exists(&self, identity: &TaskIdentity, version: i64) -> Result<bool, sqlx::Error> {
        let filter = TaskFilter {
            task_type: Some(identity.task_type),
            implementation: Some(identity.implementation.clone()),
            name: Some(identity.name.clone()),
            version: Some(version),
            status: None,
        };
        Ok(self.count(&filter).await? > 0)
    }

    /// Count tasks matching every populated field of `filter`.
    pub async fn count(&self, filter: &TaskFilter) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE (? IS NULL OR type = ?)
              AND (? IS NULL OR implementation = ?)
              AND (? IS NULL OR name = ?)
              AND (? IS NULL OR version = ?)
              AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(filter.task_type.map(TaskType::as_str))
        .bind(filter.task_type.map(TaskType::as_str))
        .bind(filter.implementation.as_deref())
        .bind(filter.implementation.as_deref())
        .bind(filter.name.as_deref())
        .bind(filter.name.as_deref())
        .bind(filter.version)
        .bind(filter.version)
        .bind(filter.status.map(TaskStatus::as_str))
        .bind(filter.status.map(TaskStatus::as_str))
        .fetch_one(&self.pool)
        .await
    }

    /// Persist a new task in `running` state and return its permanent id.
    ///
    /// Fails with a unique violation when the identity and version already exist.
    pub async fn insert_running(
        &self,
        identity: &TaskIdentity,
        version: i64,
        params: &Value,
    ) -> Result<TaskId, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        sqlx::query_scalar(
            r#"
            INSERT INTO tasks (type, implementation, name, version, status, created_at, updated_at, params, metrics)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(identity.task_type.as_str())
        .bind(&identity.implementation)
        .bind(&identity.name)
        .bind(version)
        .bind(TaskStatus::Running.as_str())
        .bind(now)
        .bind(now)
        .bind(Json(params))
        .bind(Json(json!({})))
        .fetch_one(&self.pool)
        .await
    }

    /// Replace the metrics of a task and refresh its heartbeat.
    pub async fn update_metrics(&self, id: TaskId, metrics: &Value) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET metrics = ?, updated_at = ? WHERE id = ?")
            .bind(Json(metrics))
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a terminal status, optionally replacing the metrics at the same time.
    pub async fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        metrics: Option<&Value>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET status = ?, metrics = COALESCE(?, metrics), updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(metrics.map(Json))
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load one task.
    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, sqlx::Error> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Task::try_from).transpose()
    }

    /// Every task, newest first.
    pub async fn list(&self) -> Result<Vec<Task>, sqlx::Error> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC"
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
    }

    /// Id of the most recently created task of `task_type`, whatever its status.
    pub async fn last_task_id(&self, task_type: TaskType) -> Result<Option<TaskId>, sqlx::Error> {
        sqlx::query_scalar("SELECT MAX(id) FROM tasks WHERE type = ?")
            .bind(task_type.as_str())
            .fetch_one(&self.pool)
            .await
    }

    /// Id of the newest `task_type` task whose params reference the `upstream` task `upstream_id`.
    pub async fn last_task_id_consuming(
        &self,
        task_type: TaskType,
        upstream: TaskType,
        upstream_id: TaskId,
    ) -> Result<Option<TaskId>, sqlx::Error> {
        sqlx::query_scalar("SELECT MAX(id) FROM tasks WHERE type = ? AND json_extract(params, ?) = ?")
            .bind(task_type.as_str())
            .bind(format!("$.{}", upstream.upstream_param()))
            .bind(upstream_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Mark `running` tasks whose heartbeat is older than `lease` as `failed`.
    ///
    /// Returns the ids of the reaped tasks.
    pub async fn reap_stale(&self, lease: Duration) -> Result<Vec<TaskId>, sqlx::Error> {
        let cutoff = OffsetDateTime::now_utc() - lease;
        let running = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id"
        ))
        .bind(TaskStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut reaped = Vec::new();
        for row in running {
            let task = Task::try_from(row)?;
            if task.updated_at >= cutoff {
                continue;
            }

            let mut metrics = match task.metrics.clone() {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            metrics.insert("reaped".into(), Value::Bool(true));
            metrics.insert("reason".into(), Value::String("lease expired".into()));
            self.finish(task.id, TaskStatus::Failed, Some(&Value::Object(metrics)))
                .await?;
            tracing::warn!(
                task_id = task.id,
                identifier = %task.identity().identifier(task.version),
                "Reaped stale running task"
            );
            reaped.push(task.id);
        }

        Ok(reaped)
    }
}
