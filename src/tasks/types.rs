//! Task identity, status and the persisted task record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Database identifier of a task row. Assigned on first persist and never reused.
pub type TaskId = i64;

/// Pipeline stage a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    /// Pulls decisions from the document source.
    Ingestor,
    /// Turns decision documents into text.
    TextExtractor,
    /// Produces summaries and structured fields from texts.
    Summarizer,
    /// Produces embedding vectors from texts.
    Embedder,
    /// Projects embeddings to 2D points.
    DimensionalityReducer,
}

impl TaskType {
    /// Every stage, in pipeline dependency order.
    pub const ALL: [TaskType; 5] = [
        TaskType::Ingestor,
        TaskType::TextExtractor,
        TaskType::Summarizer,
        TaskType::Embedder,
        TaskType::DimensionalityReducer,
    ];

    /// Persisted name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Ingestor => "ingestor",
            TaskType::TextExtractor => "text-extractor",
            TaskType::Summarizer => "summarizer",
            TaskType::Embedder => "embedder",
            TaskType::DimensionalityReducer => "dimensionality-reducer",
        }
    }

    /// Parameter key downstream stages use to reference a task of this type.
    pub fn upstream_param(self) -> &'static str {
        match self {
            TaskType::Ingestor => "ingestorTaskId",
            TaskType::TextExtractor => "textExtractorTaskId",
            TaskType::Summarizer => "summarizerTaskId",
            TaskType::Embedder => "embedderTaskId",
            TaskType::DimensionalityReducer => "dimensionalityReducerTaskId",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|task_type| task_type.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// Lifecycle state of a task. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Persisted and executing (or abandoned by a crashed process).
    Running,
    /// Stage logic returned normally.
    Succeeded,
    /// Stage logic raised an error or the task was reaped.
    Failed,
}

impl TaskStatus {
    /// Persisted name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// The `(type, implementation, name)` triple that versions are counted against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskIdentity {
    /// Stage of the task.
    pub task_type: TaskType,
    /// Implementation name, e.g. `diavgeia-ingestor`.
    pub implementation: String,
    /// Human-friendly run name.
    pub name: String,
}

impl TaskIdentity {
    /// Build an identity from its parts.
    pub fn new(task_type: TaskType, implementation: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            task_type,
            implementation: implementation.into(),
            name: name.into(),
        }
    }

    /// Render `type/implementation/name#version`.
    pub fn identifier(&self, version: i64) -> String {
        format!(
            "{}/{}/{}#{}",
            self.task_type, self.implementation, self.name, version
        )
    }
}

/// A persisted task row.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Row identifier.
    pub id: TaskId,
    /// Stage of the task.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Implementation name.
    pub implementation: String,
    /// Human-friendly run name.
    pub name: String,
    /// Positive version, unique per identity.
    pub version: i64,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// When the task was first persisted.
    #[serde(serialize_with = "serialize_rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last status or metrics update; doubles as the liveness heartbeat.
    #[serde(serialize_with = "serialize_rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Parameters the task was started with.
    pub params: Value,
    /// Latest metrics reported by the stage.
    pub metrics: Value,
}

impl Task {
    /// Identity triple of this task.
    pub fn identity(&self) -> TaskIdentity {
        TaskIdentity::new(self.task_type, &self.implementation, &self.name)
    }

    /// Render `type/implementation/name#version`.
    pub fn identifier(&self) -> String {
        self.identity().identifier(self.version)
    }
}

pub(crate) fn serialize_rfc3339<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let formatted = value
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

/// Optional filter used to count or list tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to one stage.
    pub task_type: Option<TaskType>,
    /// Restrict to one implementation.
    pub implementation: Option<String>,
    /// Restrict to one run name.
    pub name: Option<String>,
    /// Restrict to one version.
    pub version: Option<i64>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_its_persisted_name() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>(), Ok(task_type));
        }
        assert!("reducer".parse::<TaskType>().is_err());
    }

    #[test]
    fn identifier_includes_every_part() {
        let identity = TaskIdentity::new(TaskType::TextExtractor, "simple-text-extractor", "june");
        assert_eq!(identity.identifier(3), "text-extractor/simple-text-extractor/june#3");
    }
}
