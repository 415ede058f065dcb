//! Runs every stage in dependency order and publishes the result as one configuration.
//!
//! The orchestrator threads each stage's task id into the next stage's upstream parameter. Any
//! stage failure aborts the run before later stages start, and nothing is published.

use crate::configurations::{ConfigurationError, ConfigurationId, ConfigurationStore, StageTaskIds};
use crate::stages::{CatalogError, Collaborators, StageCatalog, default_implementation};
use crate::tasks::{TaskError, TaskId, TaskRegistry, TaskRunner, TaskType};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that stop a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Only the summarizer may be skipped.
    #[error("The {0} stage cannot be skipped; only the summarizer is optional")]
    InvalidSkip(TaskType),
    /// A stage implementation could not be built.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// A stage failed; later stages did not run.
    #[error("Pipeline aborted at the {stage} stage: {source}")]
    Aborted {
        /// Stage that failed.
        stage: TaskType,
        /// Underlying task failure.
        #[source]
        source: TaskError,
    },
    /// Publishing the configuration failed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Inputs for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Run name shared by every stage task and by the configuration.
    pub name: String,
    /// Ingestor parameters (`startDate`, `endDate`, `decisionTypes`, optional `only`).
    pub ingest: Value,
    /// Implementation overrides per stage.
    pub implementations: BTreeMap<TaskType, String>,
    /// Extra parameters per stage. Upstream task ids always take precedence.
    pub stage_params: BTreeMap<TaskType, Map<String, Value>>,
    /// Stages to leave out.
    pub skip: Vec<TaskType>,
}

impl PipelineRequest {
    /// Run with the built-in implementations and no skipped stages.
    pub fn new(name: impl Into<String>, ingest: Value) -> Self {
        Self {
            name: name.into(),
            ingest,
            implementations: BTreeMap::new(),
            stage_params: BTreeMap::new(),
            skip: Vec::new(),
        }
    }

    /// Leave `task_type` out of the run.
    pub fn skip(mut self, task_type: TaskType) -> Self {
        if !self.skip.contains(&task_type) {
            self.skip.push(task_type);
        }
        self
    }

    /// Use `implementation` for `task_type`.
    pub fn with_implementation(mut self, task_type: TaskType, implementation: impl Into<String>) -> Self {
        self.implementations.insert(task_type, implementation.into());
        self
    }

    /// Pass an extra parameter to `task_type`.
    pub fn with_stage_param(mut self, task_type: TaskType, key: impl Into<String>, value: Value) -> Self {
        self.stage_params
            .entry(task_type)
            .or_default()
            .insert(key.into(), value);
        self
    }

    fn implementation(&self, task_type: TaskType) -> &str {
        self.implementations
            .get(&task_type)
            .map(String::as_str)
            .unwrap_or_else(|| default_implementation(task_type))
    }

    fn is_skipped(&self, task_type: TaskType) -> bool {
        self.skip.contains(&task_type)
    }

    fn params(&self, task_type: TaskType, upstream: Value) -> Value {
        let mut params = self.stage_params.get(&task_type).cloned().unwrap_or_default();
        if let Value::Object(upstream) = upstream {
            params.extend(upstream);
        }
        Value::Object(params)
    }
}

/// A published pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// Id of the new configuration.
    pub configuration_id: ConfigurationId,
    /// Task ids bound by the configuration.
    pub task_ids: StageTaskIds,
}

/// Runs the stage chain and owns configuration publication.
pub struct PipelineOrchestrator {
    registry: TaskRegistry,
    catalog: StageCatalog,
    collaborators: Collaborators,
}

impl PipelineOrchestrator {
    /// Orchestrate with the stages in `catalog`.
    pub fn new(registry: TaskRegistry, catalog: StageCatalog, collaborators: Collaborators) -> Self {
        Self {
            registry,
            catalog,
            collaborators,
        }
    }

    /// Run every stage and publish a configuration named after the run.
    pub async fn run(&self, request: &PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        if let Some(stage) = request
            .skip
            .iter()
            .find(|stage| **stage != TaskType::Summarizer)
        {
            return Err(PipelineError::InvalidSkip(*stage));
        }
        // Resolve everything up front so a bad name never leaves a half-run pipeline behind.
        for task_type in TaskType::ALL {
            if !request.is_skipped(task_type) {
                self.catalog.build(
                    task_type,
                    request.implementation(task_type),
                    &self.collaborators,
                )?;
            }
        }
        tracing::info!(name = %request.name, skip = ?request.skip, "Starting pipeline");

        let ingestor = self
            .run_stage(request, TaskType::Ingestor, request.params(TaskType::Ingestor, request.ingest.clone()))
            .await?;
        let text_extractor = self
            .run_stage(
                request,
                TaskType::TextExtractor,
                request.params(TaskType::TextExtractor, json!({ "ingestorTaskId": ingestor })),
            )
            .await?;

        let summarizer = if request.is_skipped(TaskType::Summarizer) {
            tracing::info!(name = %request.name, "Skipping summarizer");
            None
        } else {
            Some(
                self.run_stage(
                    request,
                    TaskType::Summarizer,
                    request.params(
                        TaskType::Summarizer,
                        json!({ "textExtractorTaskId": text_extractor }),
                    ),
                )
                .await?,
            )
        };

        let mut embed = json!({ "textExtractorTaskId": text_extractor });
        if let Some(summarizer) = summarizer {
            embed["summarizerTaskId"] = json!(summarizer);
        }
        let embedder = self
            .run_stage(request, TaskType::Embedder, request.params(TaskType::Embedder, embed))
            .await?;
        let dimensionality_reducer = self
            .run_stage(
                request,
                TaskType::DimensionalityReducer,
                request.params(
                    TaskType::DimensionalityReducer,
                    json!({ "embedderTaskId": embedder }),
                ),
            )
            .await?;

        let task_ids = StageTaskIds {
            ingestor_task_id: ingestor,
            text_extractor_task_id: text_extractor,
            summarizer_task_id: summarizer,
            embedder_task_id: embedder,
            dimensionality_reducer_task_id: dimensionality_reducer,
        };
        let configuration_id = ConfigurationStore::new(self.registry.pool().clone())
            .create(&request.name, &task_ids)
            .await?;
        tracing::info!(name = %request.name, configuration_id, "Pipeline finished");

        Ok(PipelineOutcome {
            configuration_id,
            task_ids,
        })
    }

    async fn run_stage(
        &self,
        request: &PipelineRequest,
        task_type: TaskType,
        params: Value,
    ) -> Result<TaskId, PipelineError> {
        let behavior = self.catalog.build(
            task_type,
            request.implementation(task_type),
            &self.collaborators,
        )?;
        let runner = TaskRunner::new(self.registry.clone(), behavior, request.name.clone());
        runner.start(params, None).await.map_err(|source| {
            tracing::error!(name = %request.name, stage = %task_type, error = %source, "Pipeline aborted");
            PipelineError::Aborted {
                stage: task_type,
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_ids_override_stage_params() {
        let request = PipelineRequest::new("june", json!({}))
            .with_stage_param(TaskType::DimensionalityReducer, "sampleSize", json!(10))
            .with_stage_param(TaskType::DimensionalityReducer, "embedderTaskId", json!(1));

        let params = request.params(TaskType::DimensionalityReducer, json!({ "embedderTaskId": 7 }));
        assert_eq!(params, json!({ "sampleSize": 10, "embedderTaskId": 7 }));
    }

    #[test]
    fn implementations_default_to_the_builtin_names() {
        let request = PipelineRequest::new("june", json!({}))
            .with_implementation(TaskType::Summarizer, "other-summarizer");
        assert_eq!(request.implementation(TaskType::Summarizer), "other-summarizer");
        assert_eq!(request.implementation(TaskType::Embedder), "multi-facet-embedder");
    }
}
