//! Read-only HTTP surface for the search layer.
//!
//! - `GET /status` – task counts per status and the latest configuration id.
//! - `GET /configurations` – every published configuration, newest first.
//! - `GET /configurations/latest` – the configuration with the largest id.
//! - `GET /configurations/:id` – one configuration.
//! - `GET /configurations/:id/:view` – one of the six views (`decisions`, `organizations`,
//!   `signers`, `units`, `decision-units`, `decision-signers`) pinned to that configuration.
//!
//! Nothing here writes; configurations are only published by the pipeline.

use crate::configurations::{Configuration, ConfigurationError, ConfigurationId, ConfigurationStore};
use crate::tasks::{TaskFilter, TaskRegistry, TaskStatus};
use crate::views::{ViewError, ViewKind, Views};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::sync::Arc;

struct ApiState {
    registry: TaskRegistry,
    configurations: ConfigurationStore,
    views: Views,
}

/// Build the read-only router over `pool`.
pub fn create_router(pool: SqlitePool) -> Router {
    let state = Arc::new(ApiState {
        registry: TaskRegistry::new(pool.clone()),
        configurations: ConfigurationStore::new(pool.clone()),
        views: Views::new(pool),
    });

    Router::new()
        .route("/status", get(get_status))
        .route("/configurations", get(list_configurations))
        .route("/configurations/latest", get(latest_configuration))
        .route("/configurations/:id", get(get_configuration))
        .route("/configurations/:id/:view", get(get_view))
        .with_state(state)
}

/// Response body for `GET /status`.
#[derive(Serialize)]
struct StatusResponse {
    running: i64,
    succeeded: i64,
    failed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_configuration_id: Option<ConfigurationId>,
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, AppError> {
    let count = |status| {
        let registry = state.registry.clone();
        async move {
            registry
                .count(&TaskFilter {
                    status: Some(status),
                    ..TaskFilter::default()
                })
                .await
        }
    };
    let latest = match state.configurations.latest().await {
        Ok(configuration) => Some(configuration.id),
        Err(ConfigurationError::Empty) => None,
        Err(error) => return Err(error.into()),
    };

    Ok(Json(StatusResponse {
        running: count(TaskStatus::Running).await?,
        succeeded: count(TaskStatus::Succeeded).await?,
        failed: count(TaskStatus::Failed).await?,
        latest_configuration_id: latest,
    }))
}

/// Response body for `GET /configurations`.
#[derive(Serialize)]
struct ConfigurationsResponse {
    configurations: Vec<Configuration>,
}

async fn list_configurations(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ConfigurationsResponse>, AppError> {
    let configurations = state.configurations.list().await?;
    Ok(Json(ConfigurationsResponse { configurations }))
}

async fn latest_configuration(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Configuration>, AppError> {
    Ok(Json(state.configurations.latest().await?))
}

async fn get_configuration(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<ConfigurationId>,
) -> Result<Json<Configuration>, AppError> {
    state
        .configurations
        .get(id)
        .await?
        .map(Json)
        .ok_or(AppError::NotFound(format!("Configuration {id} not found")))
}

async fn get_view(
    State(state): State<Arc<ApiState>>,
    Path((id, view)): Path<(ConfigurationId, String)>,
) -> Result<Json<Value>, AppError> {
    let kind: ViewKind = view.parse().map_err(AppError::NotFound)?;
    let rows = state.views.load(kind, id).await?;
    tracing::debug!(configuration_id = id, view = %kind, "Served view");
    Ok(Json(json!({ "configurationId": id, "view": kind.as_str(), "rows": rows })))
}

enum AppError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Internal(message) => {
                tracing::error!(error = %message, "Read API request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ConfigurationError> for AppError {
    fn from(inner: ConfigurationError) -> Self {
        match inner {
            ConfigurationError::Empty => Self::NotFound(inner.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ViewError> for AppError {
    fn from(inner: ViewError) -> Self {
        match inner {
            ViewError::ConfigurationNotFound(_) => Self::NotFound(inner.to_string()),
            ViewError::Configuration(inner) => inner.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(inner: sqlx::Error) -> Self {
        Self::Internal(inner.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::create_router;
    use crate::configurations::{ConfigurationStore, StageTaskIds};
    use crate::db;
    use crate::tasks::{TaskIdentity, TaskRegistry, TaskType};
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use sqlx::SqlitePool;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("router response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    async fn publish(pool: &SqlitePool, name: &str) -> i64 {
        ConfigurationStore::new(pool.clone())
            .create(
                name,
                &StageTaskIds {
                    ingestor_task_id: 1,
                    text_extractor_task_id: 2,
                    summarizer_task_id: None,
                    embedder_task_id: 3,
                    dimensionality_reducer_task_id: 4,
                },
            )
            .await
            .expect("configuration")
    }

    #[tokio::test]
    async fn latest_is_not_found_before_anything_is_published() {
        let pool = db::connect_in_memory().await.expect("db");
        let (status, body) = get(create_router(pool), "/configurations/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("No configuration"));
    }

    #[tokio::test]
    async fn latest_route_wins_over_the_id_route() {
        let pool = db::connect_in_memory().await.expect("db");
        publish(&pool, "june").await;
        let second = publish(&pool, "july").await;

        let (status, body) = get(create_router(pool.clone()), "/configurations/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], second);
        assert_eq!(body["name"], "july");

        let (_, body) = get(create_router(pool), "/configurations").await;
        assert_eq!(body["configurations"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn views_are_served_per_configuration() {
        let pool = db::connect_in_memory().await.expect("db");
        sqlx::query("INSERT INTO units (ingestor_task_id, diavgeia_id, name) VALUES (1, 'U1', 'Τμήμα')")
            .execute(&pool)
            .await
            .expect("unit");
        let id = publish(&pool, "june").await;

        let (status, body) = get(create_router(pool.clone()), &format!("/configurations/{id}/units")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["view"], "units");
        assert_eq!(body["rows"], json!([{ "diavgeiaId": "U1", "name": "Τμήμα", "category": null }]));

        let (status, _) = get(create_router(pool.clone()), &format!("/configurations/{id}/texts")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get(create_router(pool), "/configurations/99/decisions").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_counts_tasks_by_state() {
        let pool = db::connect_in_memory().await.expect("db");
        let registry = TaskRegistry::new(pool.clone());
        registry
            .insert_running(
                &TaskIdentity::new(TaskType::Ingestor, "diavgeia-ingestor", "june"),
                1,
                &json!({}),
            )
            .await
            .expect("task");

        let (status, body) = get(create_router(pool), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], 1);
        assert_eq!(body["succeeded"], 0);
        assert!(body.get("latest_configuration_id").is_none());
    }
}
