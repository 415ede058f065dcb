//! Lifecycle driver for one stage execution.
//!
//! A [`TaskRunner`] validates params, resolves the version, persists the task as `running`,
//! hands control to a [`StageBehavior`] and always persists the terminal status before
//! returning or propagating the stage's failure.

use super::registry::TaskRegistry;
use super::types::{Task, TaskId, TaskIdentity, TaskStatus, TaskType};
use crate::collaborator::CollaboratorError;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

/// Unhandled failure inside a stage. Aborts the stage and marks its task `failed`.
#[derive(Debug, Error)]
pub enum StageError {
    /// Lineage or registry query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A collaborator failure that cannot be treated as item scoped.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    /// Params passed validation but could not be interpreted.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    /// The referenced upstream task does not exist.
    #[error("Upstream task {id} referenced by '{key}' does not exist")]
    UpstreamNotFound {
        /// Parameter key that carried the reference.
        key: &'static str,
        /// Referenced task id.
        id: TaskId,
    },
    /// The referenced upstream task belongs to another stage.
    #[error("Upstream task {id} is a {actual} task, expected {expected}")]
    UpstreamTypeMismatch {
        /// Referenced task id.
        id: TaskId,
        /// Stage the reference should point to.
        expected: TaskType,
        /// Stage the referenced task actually belongs to.
        actual: TaskType,
    },
    /// An upstream task was produced from a different input than the one this stage reads.
    #[error("Upstream task {id} was built from {key} {actual:?}, expected {expected}")]
    LineageMismatch {
        /// Referenced upstream task id.
        id: TaskId,
        /// Param key naming the shared input.
        key: &'static str,
        /// Input this stage reads.
        expected: TaskId,
        /// Input the upstream task recorded, if any.
        actual: Option<TaskId>,
    },
    /// Metrics or lineage payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Any other stage-specific fatal condition.
    #[error("{0}")]
    Other(String),
}

/// Errors returned by [`TaskRunner::start`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// Params were rejected before anything was persisted.
    #[error("Invalid parameters for {identifier}: {reason}")]
    Validation {
        /// Task identifier the params were meant for.
        identifier: String,
        /// What was wrong.
        reason: String,
    },
    /// Identity and version are already recorded; nothing was persisted.
    #[error("Task {identifier} has already been run")]
    DuplicateRun {
        /// Identifier of the existing task.
        identifier: String,
    },
    /// The task registry could not be read or written.
    #[error("Task registry error: {0}")]
    Registry(#[from] sqlx::Error),
    /// The stage failed; the task row is `failed`.
    #[error("Task {identifier} failed: {source}")]
    Stage {
        /// Identifier of the failed task.
        identifier: String,
        /// Underlying stage failure.
        source: StageError,
    },
}

/// Domain logic of one stage implementation.
#[async_trait]
pub trait StageBehavior: Send + Sync {
    /// Stage this behavior implements.
    fn task_type(&self) -> TaskType;

    /// Implementation name recorded on every task it runs.
    fn implementation(&self) -> &str;

    /// Param keys that must be present, non-null and non-empty.
    fn required_params(&self) -> &'static [&'static str];

    /// Execute the stage and return its final metrics.
    async fn run(&self, ctx: &TaskContext, params: &Value) -> Result<Value, StageError>;
}

/// Handle given to a running stage.
pub struct TaskContext {
    task_id: TaskId,
    identifier: String,
    registry: TaskRegistry,
}

impl TaskContext {
    /// Id of the running task; stamp it on every lineage row.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// `type/implementation/name#version` of the running task.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Pool shared with the registry.
    pub fn pool(&self) -> &SqlitePool {
        self.registry.pool()
    }

    /// Persist live progress and refresh the heartbeat.
    pub async fn update_metrics<M>(&self, metrics: &M) -> Result<(), StageError>
    where
        M: Serialize + ?Sized,
    {
        let metrics = serde_json::to_value(metrics)?;
        tracing::info!(
            task_id = self.task_id,
            identifier = %self.identifier,
            metrics = %metrics,
            "Updated task metrics"
        );
        self.registry.update_metrics(self.task_id, &metrics).await?;
        Ok(())
    }

    /// Resolve the upstream task referenced by `id`, checking it exists and has `expected` type.
    ///
    /// Upstream tasks that are not `succeeded` are accepted with a warning.
    pub async fn require_upstream(
        &self,
        expected: TaskType,
        id: TaskId,
    ) -> Result<Task, StageError> {
        let key = expected.upstream_param();
        let task = self
            .registry
            .get(id)
            .await?
            .ok_or(StageError::UpstreamNotFound { key, id })?;

        if task.task_type != expected {
            return Err(StageError::UpstreamTypeMismatch {
                id,
                expected,
                actual: task.task_type,
            });
        }

        if task.status != TaskStatus::Succeeded {
            tracing::warn!(
                task_id = self.task_id,
                upstream = %task.identifier(),
                status = %task.status,
                "Upstream task has not succeeded"
            );
        }

        Ok(task)
    }
}

/// Deserialize params into a stage's typed param struct.
pub fn parse_params<T: DeserializeOwned>(params: &Value) -> Result<T, StageError> {
    serde_json::from_value(params.clone()).map_err(|error| StageError::InvalidParams(error.to_string()))
}

/// Drives one stage behavior through validation, execution and status finalization.
pub struct TaskRunner {
    registry: TaskRegistry,
    behavior: Arc<dyn StageBehavior>,
    identity: TaskIdentity,
}

impl TaskRunner {
    /// Create a runner for `behavior` under the run name `name`.
    pub fn new(registry: TaskRegistry, behavior: Arc<dyn StageBehavior>, name: impl Into<String>) -> Self {
        let identity = TaskIdentity::new(behavior.task_type(), behavior.implementation(), name);
        Self {
            registry,
            behavior,
            identity,
        }
    }

    /// Identity shared by every version this runner creates.
    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    /// Version an unversioned `start` would use.
    pub async fn next_version(&self) -> Result<i64, TaskError> {
        Ok(self.registry.next_version(&self.identity).await?)
    }

    /// Run the stage and return the id of the task that recorded it.
    ///
    /// `version` pins an explicit version; otherwise the next free one is used.
    pub async fn start(&self, params: Value, version: Option<i64>) -> Result<TaskId, TaskError> {
        let missing = missing_params(self.behavior.required_params(), &params);
        if !missing.is_empty() {
            return Err(TaskError::Validation {
                identifier: self.identity.identifier(version.unwrap_or_default()),
                reason: format!("missing required parameters: {}", missing.join(", ")),
            });
        }

        let version = match version {
            Some(version) if version < 1 => {
                return Err(TaskError::Validation {
                    identifier: self.identity.identifier(version),
                    reason: "version must be positive".into(),
                });
            }
            Some(version) => version,
            None => self.next_version().await?,
        };
        let identifier = self.identity.identifier(version);

        if self.registry.exists(&self.identity, version).await? {
            return Err(TaskError::DuplicateRun { identifier });
        }

        let task_id = match self
            .registry
            .insert_running(&self.identity, version, &params)
            .await
        {
            Ok(task_id) => task_id,
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                return Err(TaskError::DuplicateRun { identifier });
            }
            Err(error) => return Err(error.into()),
        };

        tracing::info!(task_id, identifier = %identifier, params = %params, "Task started");

        let ctx = TaskContext {
            task_id,
            identifier: identifier.clone(),
            registry: self.registry.clone(),
        };
        let outcome = AssertUnwindSafe(self.behavior.run(&ctx, &params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(metrics)) => {
                let metrics = (!metrics.is_null()).then_some(metrics);
                self.registry
                    .finish(task_id, TaskStatus::Succeeded, metrics.as_ref())
                    .await?;
                tracing::info!(task_id, identifier = %identifier, "Task succeeded");
                Ok(task_id)
            }
            Ok(Err(source)) => {
                tracing::error!(task_id, identifier = %identifier, error = %source, "Task failed");
                self.mark_failed(task_id, &identifier).await;
                Err(TaskError::Stage { identifier, source })
            }
            Err(panic) => {
                tracing::error!(task_id, identifier = %identifier, "Task panicked");
                self.mark_failed(task_id, &identifier).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn mark_failed(&self, task_id: TaskId, identifier: &str) {
        if let Err(error) = self.registry.finish(task_id, TaskStatus::Failed, None).await {
            tracing::error!(task_id, identifier, error = %error, "Could not persist failed status");
        }
    }
}

fn missing_params<'a>(required: &[&'a str], params: &Value) -> Vec<&'a str> {
    required
        .iter()
        .copied()
        .filter(|key| match params.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::String(value)) => value.is_empty(),
            Some(_) => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    struct Recording {
        fail: bool,
    }

    #[async_trait]
    impl StageBehavior for Recording {
        fn task_type(&self) -> TaskType {
            TaskType::TextExtractor
        }

        fn implementation(&self) -> &str {
            "recording"
        }

        fn required_params(&self) -> &'static [&'static str] {
            &["ingestorTaskId"]
        }

        async fn run(&self, ctx: &TaskContext, _params: &Value) -> Result<Value, StageError> {
            ctx.update_metrics(&json!({ "processed": 1 })).await?;
            if self.fail {
                return Err(StageError::Other("boom".into()));
            }
            Ok(json!({ "processed": 2 }))
        }
    }

    async fn runner(fail: bool) -> (TaskRegistry, TaskRunner) {
        let registry = TaskRegistry::new(db::connect_in_memory().await.expect("database"));
        let runner = TaskRunner::new(registry.clone(), Arc::new(Recording { fail }), "unit");
        (registry, runner)
    }

    #[test]
    fn null_and_empty_values_count_as_missing() {
        let params = json!({ "a": null, "b": "", "c": 0, "d": "x" });
        assert_eq!(missing_params(&["a", "b", "c", "d", "e"], &params), vec!["a", "b", "e"]);
    }

    #[tokio::test]
    async fn successive_runs_get_increasing_versions() {
        let (registry, runner) = runner(false).await;
        let first = runner.start(json!({ "ingestorTaskId": 1 }), None).await.unwrap();
        let second = runner.start(json!({ "ingestorTaskId": 1 }), None).await.unwrap();

        assert_eq!(registry.get(first).await.unwrap().unwrap().version, 1);
        let second = registry.get(second).await.unwrap().unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.status, TaskStatus::Succeeded);
        assert_eq!(second.metrics, json!({ "processed": 2 }));
    }

    #[tokio::test]
    async fn missing_params_fail_before_persisting() {
        let (registry, runner) = runner(false).await;
        let error = runner.start(json!({}), None).await.unwrap_err();
        assert!(matches!(error, TaskError::Validation { .. }));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_duplicate_version_is_rejected() {
        let (registry, runner) = runner(false).await;
        runner.start(json!({ "ingestorTaskId": 1 }), Some(3)).await.unwrap();
        let error = runner
            .start(json!({ "ingestorTaskId": 1 }), Some(3))
            .await
            .unwrap_err();
        assert!(matches!(error, TaskError::DuplicateRun { ref identifier } if identifier.ends_with("#3")));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failures_are_persisted_before_propagating() {
        let (registry, runner) = runner(true).await;
        let error = runner
            .start(json!({ "ingestorTaskId": 1 }), None)
            .await
            .unwrap_err();
        assert!(matches!(error, TaskError::Stage { source: StageError::Other(_), .. }));

        let tasks = registry.list().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].metrics, json!({ "processed": 1 }));
    }
}
