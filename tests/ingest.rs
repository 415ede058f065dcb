mod common;

use common::{FakeSource, PageCall, collaborators};
use decision_atlas::db;
use decision_atlas::stages::{StageCatalog, ingestor};
use decision_atlas::tasks::{TaskRegistry, TaskRunner, TaskStatus, TaskType};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn ingests_every_page_and_counts_decisions() {
    let pool = db::connect_in_memory().await.expect("db");
    let registry = TaskRegistry::new(pool.clone());
    let source = Arc::new(FakeSource::new(120));
    let behavior = StageCatalog::builtin()
        .build(
            TaskType::Ingestor,
            ingestor::IMPLEMENTATION,
            &collaborators(source.clone()),
        )
        .expect("ingestor");

    let task_id = TaskRunner::new(registry.clone(), behavior, "june")
        .start(
            json!({
                "startDate": "2021-06-01",
                "endDate": "2021-06-02",
                "decisionTypes": "X.1"
            }),
            None,
        )
        .await
        .expect("ingest succeeds");

    let sizes: Vec<usize> = source.pages().await.iter().map(|call| call.returned).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(
        source.pages().await[2],
        PageCall {
            page: 2,
            size: 50,
            returned: 20
        }
    );
    assert_eq!(
        source.queries().await[0],
        r#"decisionTypeUid:["X.1"] AND issueDate:[DT(2021-06-01T00:00:00) TO DT(2021-06-02T00:00:00)]"#
    );

    let task = registry.get(task_id).await.expect("query").expect("task");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.version, 1);
    assert_eq!(task.metrics["decisions_processed"], 120);
    assert_eq!(task.metrics["decisions_total"], 120);
    assert_eq!(task.metrics["organizations_processed"], 3);
    assert_eq!(task.metrics["units_processed"], 4);
    assert_eq!(task.metrics["signers_processed"], 5);
    assert_eq!(task.metrics["failures"], 0);

    let decisions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM decisions WHERE ingestor_task_id = ?")
        .bind(task_id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(decisions, 120);

    // Each referenced entity is fetched and stored once, however many pages mention it.
    let organizations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM organizations WHERE ingestor_task_id = ?")
        .bind(task_id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(organizations, 3);
    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM decision_signers WHERE ingestor_task_id = ?")
        .bind(task_id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(links, 120);
}

#[tokio::test]
async fn only_caps_the_number_of_decisions() {
    let pool = db::connect_in_memory().await.expect("db");
    let registry = TaskRegistry::new(pool.clone());
    let source = Arc::new(FakeSource::new(120));
    let behavior = StageCatalog::builtin()
        .build(
            TaskType::Ingestor,
            ingestor::IMPLEMENTATION,
            &collaborators(source.clone()),
        )
        .expect("ingestor");

    let task_id = TaskRunner::new(registry.clone(), behavior, "sample")
        .start(
            json!({
                "startDate": "2021-06-01",
                "endDate": "2021-06-02",
                "decisionTypes": "X.1, Β.2.1",
                "only": 60
            }),
            None,
        )
        .await
        .expect("ingest succeeds");

    assert_eq!(source.pages().await.len(), 2);
    let task = registry.get(task_id).await.expect("query").expect("task");
    assert_eq!(task.metrics["decisions_processed"], 60);
    assert_eq!(task.metrics["decisions_total"], 120);
}

#[tokio::test]
async fn empty_source_succeeds_without_rows() {
    let pool = db::connect_in_memory().await.expect("db");
    let registry = TaskRegistry::new(pool.clone());
    let source = Arc::new(FakeSource::new(0));
    let behavior = StageCatalog::builtin()
        .build(TaskType::Ingestor, ingestor::IMPLEMENTATION, &collaborators(source))
        .expect("ingestor");

    let task_id = TaskRunner::new(registry.clone(), behavior, "empty")
        .start(
            json!({ "startDate": "2021-06-01", "endDate": "2021-06-02", "decisionTypes": "X.1" }),
            None,
        )
        .await
        .expect("ingest succeeds");

    let task = registry.get(task_id).await.expect("query").expect("task");
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.metrics["processed"], 0);
}
