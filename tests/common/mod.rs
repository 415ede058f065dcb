#![allow(dead_code)]

use async_trait::async_trait;
use decision_atlas::collaborator::CollaboratorError;
use decision_atlas::embedding::HashEmbeddingClient;
use decision_atlas::embedding::chunking::BodyChunker;
use decision_atlas::extraction::{ExtractedDocument, TextExtraction};
use decision_atlas::projection::PcaProjector;
use decision_atlas::source::{DecisionQuery, DecisionSource, Organization, Signer, SourceDecision, Unit};
use decision_atlas::stages::{Collaborators, StageSettings};
use decision_atlas::summarization::{ChatClient, ChatRequest};
use decision_atlas::tasks::{
    StageBehavior, StageError, TaskContext, TaskError, TaskId, TaskRegistry, TaskRunner, TaskType,
};
use decision_atlas::usage::BudgetExceeded;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// A page request observed by [`FakeSource`] and the number of decisions it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCall {
    pub page: u64,
    pub size: u64,
    pub returned: usize,
}

/// In-memory decision source with `total` decisions spread over 3 organizations,
/// 4 units and 5 signers.
pub struct FakeSource {
    total: u64,
    pages: Mutex<Vec<PageCall>>,
    queries: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            pages: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub async fn pages(&self) -> Vec<PageCall> {
        self.pages.lock().await.clone()
    }

    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }
}

fn decision(index: u64) -> SourceDecision {
    SourceDecision {
        ada: format!("ADA-{index:04}"),
        document_url: format!("https://docs.example/{index}.pdf"),
        issue_date: Some("2021-06-01".into()),
        organization_id: Some(format!("org-{}", index % 3)),
        signer_ids: vec![format!("signer-{}", index % 5)],
        unit_ids: vec![format!("unit-{}", index % 4)],
        metadata: json!({ "subject": format!("Ανάθεση έργου {index}") }),
    }
}

#[async_trait]
impl DecisionSource for FakeSource {
    async fn total_count(&self, _query: &DecisionQuery) -> Result<u64, CollaboratorError> {
        Ok(self.total)
    }

    async fn fetch_page(
        &self,
        query: &DecisionQuery,
        page: u64,
        size: u64,
    ) -> Result<Vec<SourceDecision>, CollaboratorError> {
        let start = page * size;
        let end = (start + size).min(self.total);
        let decisions: Vec<SourceDecision> = (start..end).map(decision).collect();
        self.pages.lock().await.push(PageCall {
            page,
            size,
            returned: decisions.len(),
        });
        self.queries.lock().await.push(query.expression());
        Ok(decisions)
    }

    async fn fetch_organization(&self, id: &str) -> Result<Organization, CollaboratorError> {
        Ok(Organization {
            diavgeia_id: id.to_string(),
            name: Some(format!("Δήμος {id}")),
            category: Some("MUNICIPALITY".into()),
            vat_number: None,
            raw_data: json!({ "uid": id }),
        })
    }

    async fn fetch_unit(&self, id: &str) -> Result<Unit, CollaboratorError> {
        Ok(Unit {
            diavgeia_id: id.to_string(),
            name: Some(format!("Τμήμα {id}")),
            category: None,
            raw_data: json!({ "uid": id }),
        })
    }

    async fn fetch_signer(&self, id: &str) -> Result<Signer, CollaboratorError> {
        Ok(Signer {
            diavgeia_id: id.to_string(),
            first_name: Some("Μαρία".into()),
            last_name: Some(format!("Παπαδοπούλου {id}")),
            organization_id: Some("org-0".into()),
            raw_data: json!({ "uid": id }),
        })
    }
}

/// Extraction that echoes the document URL as text.
pub struct FakeExtraction;

#[async_trait]
impl TextExtraction for FakeExtraction {
    async fn extract_text(&self, document_url: &str) -> Result<ExtractedDocument, CollaboratorError> {
        Ok(ExtractedDocument {
            text: Some(format!("Κείμενο της πράξης στο {document_url} για την ανάθεση έργου")),
            metadata: json!({ "hasDocument": true, "contentType": "application/pdf" }),
        })
    }
}

/// Extraction service that is always down.
#[derive(Default)]
pub struct UnreachableExtraction {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TextExtraction for UnreachableExtraction {
    async fn extract_text(&self, _document_url: &str) -> Result<ExtractedDocument, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CollaboratorError::Unavailable("connection refused".into()))
    }
}

/// Chat model that answers every text with the same structured summary.
#[derive(Default)]
pub struct FakeChat {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn complete(&self, _request: ChatRequest) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "summary": "Ανατίθεται η προμήθεια υλικών.",
            "awardAmount": 1500,
            "beneficiary": "ACME Α.Ε.",
            "lawRef": ["Ν. 4412/2016"],
            "adaRef": null
        })
        .to_string())
    }
}

/// Chat model that fails the first `failures` calls for every distinct text, then answers
/// like [`FakeChat`].
pub struct FlakyChat {
    failures: usize,
    attempts: Mutex<HashMap<String, usize>>,
    pub calls: AtomicUsize,
}

impl FlakyChat {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A model that never answers.
    pub fn down() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl ChatClient for FlakyChat {
    async fn complete(&self, request: ChatRequest) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let attempt = attempts.entry(request.user.clone()).or_default();
            *attempt += 1;
            *attempt
        };
        if attempt <= self.failures {
            return Err(CollaboratorError::Unavailable("model overloaded".into()));
        }
        FakeChat::default().complete(request).await
    }
}

/// Chat model whose every call crosses the spend ceiling.
#[derive(Default)]
pub struct OverBudgetChat {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ChatClient for OverBudgetChat {
    async fn complete(&self, _request: ChatRequest) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BudgetExceeded {
            spent_usd: 10.5,
            max_usd: 10.0,
        }
        .into())
    }
}

/// Run the built-in `implementation` of `task_type` once under `name`.
pub async fn run_stage(
    registry: &TaskRegistry,
    collaborators: &Collaborators,
    task_type: TaskType,
    implementation: &str,
    params: Value,
) -> Result<TaskId, TaskError> {
    let behavior = decision_atlas::stages::StageCatalog::builtin()
        .build(task_type, implementation, collaborators)
        .expect("built-in stage");
    TaskRunner::new(registry.clone(), behavior, "june")
        .start(params, None)
        .await
}

/// Summarizer that always fails, registered to simulate a stage crash.
pub struct FailingSummarizer;

pub const FAILING_SUMMARIZER: &str = "failing-summarizer";

#[async_trait]
impl StageBehavior for FailingSummarizer {
    fn task_type(&self) -> TaskType {
        TaskType::Summarizer
    }

    fn implementation(&self) -> &str {
        FAILING_SUMMARIZER
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["textExtractorTaskId"]
    }

    async fn run(&self, _ctx: &TaskContext, _params: &Value) -> Result<Value, StageError> {
        Err(StageError::Other("summarizer crashed".into()))
    }
}

pub fn failing_summarizer(_: &Collaborators) -> Result<Arc<dyn StageBehavior>, decision_atlas::stages::CatalogError> {
    Ok(Arc::new(FailingSummarizer))
}

/// Collaborators backed entirely by in-process fakes.
pub fn collaborators(source: Arc<FakeSource>) -> Collaborators {
    Collaborators {
        source,
        extraction: Arc::new(FakeExtraction),
        chat: Some(Arc::new(FakeChat::default())),
        chat_pacer: None,
        embeddings: Some(Arc::new(HashEmbeddingClient::new(16))),
        chunker: BodyChunker::whitespace(4).expect("chunker"),
        projector: Arc::new(PcaProjector),
        settings: StageSettings {
            concurrency: 4,
            max_body_chunks: 2,
        },
    }
}
