//! Text extraction collaborator backed by an Apache Tika server.

use crate::collaborator::CollaboratorError;
use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::{Map, Value};

/// Text and diagnostics for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    /// Extracted text; `None` when nothing usable came out.
    pub text: Option<String>,
    /// `hasDocument`, `textExtractionFailure`, `emptyText`, `contentType`, `byteLength`,
    /// `failureReason`, as far as they are known.
    pub metadata: Value,
}

impl ExtractedDocument {
    /// Record for a decision that has no document at all.
    pub fn missing_document() -> Self {
        let mut metadata = Map::new();
        metadata.insert("hasDocument".into(), Value::Bool(false));
        Self {
            text: None,
            metadata: Value::Object(metadata),
        }
    }

    fn failed(mut metadata: Map<String, Value>, reason: String) -> Self {
        metadata.insert("textExtractionFailure".into(), Value::Bool(true));
        metadata.insert("failureReason".into(), Value::String(reason));
        Self {
            text: None,
            metadata: Value::Object(metadata),
        }
    }
}

/// Turns a document URL into plain text.
///
/// Problems with the document itself are reported inside [`ExtractedDocument::metadata`];
/// only an unusable extraction service is an error.
#[async_trait]
pub trait TextExtraction: Send + Sync {
    /// Download and extract the document at `document_url`.
    async fn extract_text(&self, document_url: &str) -> Result<ExtractedDocument, CollaboratorError>;
}

/// Downloads documents and hands the bytes to Tika's `/tika` endpoint.
pub struct TikaExtractionClient {
    http: Client,
    tika_url: String,
}

impl TikaExtractionClient {
    /// Create a client for the Tika server at `tika_url`.
    pub fn new(tika_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        let http = Client::builder()
            .user_agent("decision-atlas/text-extractor")
            .build()?;
        Ok(Self {
            http,
            tika_url: tika_url.into(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/tika", self.tika_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TextExtraction for TikaExtractionClient {
    async fn extract_text(&self, document_url: &str) -> Result<ExtractedDocument, CollaboratorError> {
        let mut metadata = Map::new();
        metadata.insert("hasDocument".into(), Value::Bool(true));

        let document = match self
            .http
            .get(document_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
        {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(document_url, error = %error, "Could not download document");
                return Ok(ExtractedDocument::failed(metadata, error.to_string()));
            }
        };

        let content_type = document
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/pdf")
            .to_string();
        let bytes = match document.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(document_url, error = %error, "Document download interrupted");
                return Ok(ExtractedDocument::failed(metadata, error.to_string()));
            }
        };
        metadata.insert("contentType".into(), Value::String(content_type.clone()));
        metadata.insert("byteLength".into(), Value::from(bytes.len()));

        let response = self
            .http
            .put(self.endpoint())
            .header(header::ACCEPT, "text/plain; charset=utf-8")
            .header(header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|error| {
                CollaboratorError::Unavailable(format!(
                    "failed to reach Tika at {}: {error}",
                    self.tika_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(document_url, %status, "Tika rejected document");
            return Ok(ExtractedDocument::failed(
                metadata,
                format!("Tika returned {status}"),
            ));
        }

        let text = response.text().await?.replace('\0', "");
        if text.trim().is_empty() {
            tracing::warn!(document_url, "Document has empty text");
            metadata.insert("emptyText".into(), Value::Bool(true));
            return Ok(ExtractedDocument::failed(metadata, "empty text".into()));
        }

        metadata.insert("textExtractionFailure".into(), Value::Bool(false));
        metadata.insert("emptyText".into(), Value::Bool(false));
        Ok(ExtractedDocument {
            text: Some(text.trim().to_string()),
            metadata: Value::Object(metadata),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{
        Method::{GET, PUT},
        MockServer,
    };

    #[tokio::test]
    async fn extracts_text_and_strips_nul_characters() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/doc/A1");
                then.status(200)
                    .header("content-type", "application/pdf")
                    .body("%PDF-1.4 fake");
            })
            .await;
        let tika = server
            .mock_async(|when, then| {
                when.method(PUT).path("/tika").header("content-type", "application/pdf");
                then.status(200).body("Απόφαση\u{0} ανάθεσης\n");
            })
            .await;

        let client = TikaExtractionClient::new(server.base_url()).expect("client");
        let document = client
            .extract_text(&server.url("/doc/A1"))
            .await
            .expect("extraction");

        tika.assert_async().await;
        assert_eq!(document.text.as_deref(), Some("Απόφαση ανάθεσης"));
        assert_eq!(document.metadata["textExtractionFailure"], false);
        assert_eq!(document.metadata["byteLength"], 13);
    }

    #[tokio::test]
    async fn unreachable_document_is_recorded_not_raised() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/doc/gone");
                then.status(404);
            })
            .await;

        let client = TikaExtractionClient::new(server.base_url()).expect("client");
        let document = client
            .extract_text(&server.url("/doc/gone"))
            .await
            .expect("failure metadata");

        assert!(document.text.is_none());
        assert_eq!(document.metadata["hasDocument"], true);
        assert_eq!(document.metadata["textExtractionFailure"], true);
    }

    #[tokio::test]
    async fn blank_text_is_flagged_empty() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/doc/blank");
                then.status(200).body("bytes");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/tika");
                then.status(200).body("  \n\u{0} ");
            })
            .await;

        let client = TikaExtractionClient::new(server.base_url()).expect("client");
        let document = client
            .extract_text(&server.url("/doc/blank"))
            .await
            .expect("extraction");
        assert!(document.text.is_none());
        assert_eq!(document.metadata["emptyText"], true);
    }

    #[tokio::test]
    async fn unreachable_tika_is_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/doc/A1");
                then.status(200).body("bytes");
            })
            .await;

        let client = TikaExtractionClient::new("http://127.0.0.1:1").expect("client");
        let error = client
            .extract_text(&server.url("/doc/A1"))
            .await
            .expect_err("tika down");
        assert!(matches!(error, CollaboratorError::Unavailable(_)));
    }
}
