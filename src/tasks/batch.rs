//! Paginated, bounded-concurrency iteration over upstream rows.

use super::runner::{StageError, TaskContext};
use crate::collaborator::CollaboratorError;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{StreamExt, pin_mut, stream};
use serde::Serialize;
use serde_json::{Value, json};

/// Cumulative counters for one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    /// Pages that were fetched and persisted.
    pub pages: u64,
    /// Upstream items handed to `process_item`.
    pub processed: u64,
    /// Items whose processing succeeded.
    pub succeeded: u64,
    /// Items whose collaborator call failed.
    pub failures: u64,
    /// Output rows persisted.
    pub outputs: u64,
}

/// Stage-specific half of a batch run.
#[async_trait]
pub trait BatchStage: Send + Sync {
    /// Upstream row.
    type Input: Send;
    /// Lineage row produced from an upstream row.
    type Output: Send;

    /// Fetch up to `limit` upstream rows starting at `offset`, in a stable order.
    async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<Self::Input>, StageError>;

    /// Turn one upstream row into zero or more output rows.
    async fn process_item(&self, item: Self::Input) -> Result<Vec<Self::Output>, CollaboratorError>;

    /// Persist one page of outputs in a single transaction.
    async fn persist_page(&self, outputs: Vec<Self::Output>) -> Result<(), StageError>;

    /// Metrics reported after each page.
    fn page_metrics(&self, progress: &BatchProgress) -> Value {
        json!({
            "pages": progress.pages,
            "processed": progress.processed,
            "succeeded": progress.succeeded,
            "failures": progress.failures,
            "outputs": progress.outputs,
        })
    }
}

/// Drives a [`BatchStage`] page by page.
#[derive(Debug, Clone, Copy)]
pub struct BatchProcessor {
    page_size: u64,
    concurrency: usize,
    max_items: Option<u64>,
}

impl BatchProcessor {
    /// Pages of `page_size` rows, at most `concurrency` items in flight.
    pub fn new(page_size: u64, concurrency: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            concurrency: concurrency.max(1),
            max_items: None,
        }
    }

    /// Stop after `max_items` upstream rows.
    pub fn with_max_items(mut self, max_items: Option<u64>) -> Self {
        self.max_items = max_items;
        self
    }

    /// Process every upstream row, reporting metrics after each page.
    ///
    /// Item failures are counted and skipped. Budget exhaustion and persistence failures abort.
    pub async fn run<S: BatchStage>(
        &self,
        stage: &S,
        ctx: &TaskContext,
    ) -> Result<BatchProgress, StageError> {
        let mut progress = BatchProgress::default();
        let pages = self.pages(stage);
        pin_mut!(pages);

        while let Some(page) = pages.next().await {
            let (offset, items) = page?;
            let item_count = items.len() as u64;
            tracing::debug!(
                task_id = ctx.task_id(),
                page = progress.pages + 1,
                offset,
                items = item_count,
                "Processing page"
            );

            let results: Vec<_> = stream::iter(items)
                .map(|item| stage.process_item(item))
                .buffered(self.concurrency)
                .collect()
                .await;

            let mut outputs = Vec::new();
            for result in results {
                match result {
                    Ok(mut produced) => {
                        progress.succeeded += 1;
                        outputs.append(&mut produced);
                    }
                    Err(CollaboratorError::BudgetExceeded(exceeded)) => {
                        return Err(CollaboratorError::BudgetExceeded(exceeded).into());
                    }
                    Err(error) => {
                        progress.failures += 1;
                        tracing::warn!(
                            task_id = ctx.task_id(),
                            identifier = ctx.identifier(),
                            offset,
                            error = %error,
                            "Item failed"
                        );
                    }
                }
            }

            let output_count = outputs.len() as u64;
            if !outputs.is_empty() {
                stage.persist_page(outputs).await?;
            }

            progress.pages += 1;
            progress.processed += item_count;
            progress.outputs += output_count;
            ctx.update_metrics(&stage.page_metrics(&progress)).await?;
        }

        Ok(progress)
    }

    fn pages<'a, S: BatchStage>(
        &'a self,
        stage: &'a S,
    ) -> impl Stream<Item = Result<(u64, Vec<S::Input>), StageError>> + Send + 'a {
        try_stream! {
            let mut offset = 0;
            loop {
                let remaining = self.max_items.map(|max| max.saturating_sub(offset));
                if remaining == Some(0) {
                    break;
                }

                let mut items = stage.fetch_page(offset, self.page_size).await?;
                if items.is_empty() {
                    break;
                }
                if let Some(remaining) = remaining {
                    items.truncate(remaining as usize);
                }

                let fetched = items.len() as u64;
                yield (offset, items);
                offset += fetched;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::tasks::{StageBehavior, TaskRegistry, TaskRunner, TaskStatus, TaskType};
    use crate::usage::BudgetExceeded;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct Numbers {
        total: u64,
        fail_every: Option<u64>,
        budget_at: Option<u64>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        persisted: Mutex<Vec<Vec<u64>>>,
    }

    impl Numbers {
        fn new(total: u64) -> Self {
            Self {
                total,
                fail_every: None,
                budget_at: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                persisted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchStage for Numbers {
        type Input = u64;
        type Output = u64;

        async fn fetch_page(&self, offset: u64, limit: u64) -> Result<Vec<u64>, StageError> {
            Ok((offset..(offset + limit).min(self.total)).collect())
        }

        async fn process_item(&self, item: u64) -> Result<Vec<u64>, CollaboratorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.budget_at == Some(item) {
                return Err(BudgetExceeded {
                    spent_usd: 2.0,
                    max_usd: 1.0,
                }
                .into());
            }
            if self.fail_every.is_some_and(|every| item % every == 0) {
                return Err(CollaboratorError::Failed(format!("item {item}")));
            }
            Ok(vec![item * 10])
        }

        async fn persist_page(&self, outputs: Vec<u64>) -> Result<(), StageError> {
            self.persisted.lock().await.push(outputs);
            Ok(())
        }
    }

    struct Wrapper {
        stage: Arc<Numbers>,
        processor: BatchProcessor,
    }

    #[async_trait]
    impl StageBehavior for Wrapper {
        fn task_type(&self) -> TaskType {
            TaskType::Embedder
        }

        fn implementation(&self) -> &str {
            "numbers"
        }

        fn required_params(&self) -> &'static [&'static str] {
            &[]
        }

        async fn run(&self, ctx: &TaskContext, _params: &Value) -> Result<Value, StageError> {
            let progress = self.processor.run(self.stage.as_ref(), ctx).await?;
            Ok(self.stage.page_metrics(&progress))
        }
    }

    async fn run(stage: Numbers, processor: BatchProcessor) -> (Arc<Numbers>, TaskRegistry, Result<i64, crate::tasks::TaskError>) {
        let registry = TaskRegistry::new(db::connect_in_memory().await.expect("database"));
        let stage = Arc::new(stage);
        let behavior = Wrapper {
            stage: stage.clone(),
            processor,
        };
        let result = TaskRunner::new(registry.clone(), Arc::new(behavior), "batch")
            .start(json!({}), None)
            .await;
        (stage, registry, result)
    }

    #[tokio::test]
    async fn empty_upstream_succeeds_with_nothing_processed() {
        let (stage, registry, result) = run(Numbers::new(0), BatchProcessor::new(10, 2)).await;
        let task = registry.get(result.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.metrics["processed"], 0);
        assert!(stage.persisted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pages_are_persisted_in_order_with_bounded_fan_out() {
        let (stage, registry, result) = run(Numbers::new(25), BatchProcessor::new(10, 3)).await;
        let task = registry.get(result.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.metrics["pages"], 3);
        assert_eq!(task.metrics["processed"], 25);
        assert_eq!(task.metrics["outputs"], 25);

        let persisted = stage.persisted.lock().await;
        let sizes: Vec<usize> = persisted.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(persisted[2], vec![200, 210, 220, 230, 240]);
        assert!(stage.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn every_item_failing_still_succeeds() {
        let mut numbers = Numbers::new(12);
        numbers.fail_every = Some(1);
        let (stage, registry, result) = run(numbers, BatchProcessor::new(5, 2)).await;
        let task = registry.get(result.unwrap()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.metrics["failures"], 12);
        assert_eq!(task.metrics["processed"], 12);
        assert!(stage.persisted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn max_items_truncates_the_final_page() {
        let processor = BatchProcessor::new(10, 2).with_max_items(Some(14));
        let (stage, _, result) = run(Numbers::new(100), processor).await;
        result.unwrap();
        let sizes: Vec<usize> = stage.persisted.lock().await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 4]);
    }

    #[tokio::test]
    async fn budget_exhaustion_aborts_the_stage() {
        let mut numbers = Numbers::new(30);
        numbers.budget_at = Some(12);
        let (stage, registry, result) = run(numbers, BatchProcessor::new(10, 2)).await;
        assert!(matches!(
            result,
            Err(crate::tasks::TaskError::Stage {
                source: StageError::Collaborator(CollaboratorError::BudgetExceeded(_)),
                ..
            })
        ));
        assert_eq!(stage.persisted.lock().await.len(), 1);
        let tasks = registry.list().await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].metrics["processed"], 10);
    }
}
