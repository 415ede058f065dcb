//! Decision source collaborator: the Diavgeia open data API.

use crate::collaborator::CollaboratorError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;

const DOCUMENT_URL_BASE: &str = "https://diavgeia.gov.gr/doc";

/// Date range and decision type filter for one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionQuery {
    /// Decision type uids, e.g. `Β.1.3`.
    pub decision_types: Vec<String>,
    /// Inclusive start date, `YYYY-MM-DD`.
    pub start_date: String,
    /// End date, `YYYY-MM-DD`.
    pub end_date: String,
}

impl DecisionQuery {
    /// Build a query from comma separated decision types.
    pub fn new(decision_types: &str, start_date: &str, end_date: &str) -> Self {
        Self {
            decision_types: decision_types
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect(),
            start_date: start_date.trim().to_string(),
            end_date: end_date.trim().to_string(),
        }
    }

    /// Render the advanced search expression understood by the source.
    pub fn expression(&self) -> String {
        let types = self
            .decision_types
            .iter()
            .map(|value| format!("\"{value}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "decisionTypeUid:[{types}] AND issueDate:[DT({}T00:00:00) TO DT({}T00:00:00)]",
            self.start_date, self.end_date
        )
    }
}

/// One decision as returned by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDecision {
    /// Publication identifier.
    pub ada: String,
    /// Where the signed document can be downloaded.
    pub document_url: String,
    /// Issue date, `YYYY-MM-DD`, when the source provided one.
    pub issue_date: Option<String>,
    /// Issuing organization id.
    pub organization_id: Option<String>,
    /// Signer ids referenced by the decision.
    pub signer_ids: Vec<String>,
    /// Unit ids referenced by the decision.
    pub unit_ids: Vec<String>,
    /// Selected decision fields kept for downstream stages.
    pub metadata: Value,
}

/// Organization referenced by decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    /// Source identifier.
    pub diavgeia_id: String,
    /// Display label.
    pub name: Option<String>,
    /// Organization category.
    pub category: Option<String>,
    /// Tax registration number.
    pub vat_number: Option<String>,
    /// Untouched source payload.
    pub raw_data: Value,
}

/// Organizational unit referenced by decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Source identifier.
    pub diavgeia_id: String,
    /// Display label.
    pub name: Option<String>,
    /// Unit category.
    pub category: Option<String>,
    /// Untouched source payload.
    pub raw_data: Value,
}

/// Person who signed decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct Signer {
    /// Source identifier.
    pub diavgeia_id: String,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Organization the signer belongs to.
    pub organization_id: Option<String>,
    /// Untouched source payload.
    pub raw_data: Value,
}

/// Paged access to published decisions and the entities they reference.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Number of decisions matching `query`.
    async fn total_count(&self, query: &DecisionQuery) -> Result<u64, CollaboratorError>;

    /// Zero-based `page` of `size` decisions.
    async fn fetch_page(
        &self,
        query: &DecisionQuery,
        page: u64,
        size: u64,
    ) -> Result<Vec<SourceDecision>, CollaboratorError>;

    /// Resolve an organization id.
    async fn fetch_organization(&self, id: &str) -> Result<Organization, CollaboratorError>;

    /// Resolve a unit id.
    async fn fetch_unit(&self, id: &str) -> Result<Unit, CollaboratorError>;

    /// Resolve a signer id.
    async fn fetch_signer(&self, id: &str) -> Result<Signer, CollaboratorError>;
}

/// HTTP client for the Diavgeia open data API.
pub struct DiavgeiaClient {
    http: Client,
    base_url: String,
}

impl DiavgeiaClient {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        let http = Client::builder()
            .user_agent("decision-atlas/ingestor")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/opendata/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn search(
        &self,
        query: &DecisionQuery,
        page: u64,
        size: u64,
    ) -> Result<SearchResponse, CollaboratorError> {
        let expression = query.expression();
        tracing::info!(page, size, query = %expression, "Fetching decision page");
        let response = self
            .http
            .get(self.endpoint("search/advanced.json"))
            .query(&[
                ("q", expression),
                ("page", page.to_string()),
                ("size", size.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn entity(&self, kind: &str, id: &str) -> Result<Value, CollaboratorError> {
        let response = self
            .http
            .get(self.endpoint(&format!("{kind}/{id}.json")))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    decisions: Vec<Value>,
    info: SearchInfo,
}

#[derive(Debug, Deserialize)]
struct SearchInfo {
    total: u64,
}

#[async_trait]
impl DecisionSource for DiavgeiaClient {
    async fn total_count(&self, query: &DecisionQuery) -> Result<u64, CollaboratorError> {
        Ok(self.search(query, 0, 1).await?.info.total)
    }

    async fn fetch_page(
        &self,
        query: &DecisionQuery,
        page: u64,
        size: u64,
    ) -> Result<Vec<SourceDecision>, CollaboratorError> {
        self.search(query, page, size)
            .await?
            .decisions
            .iter()
            .map(decision_from_json)
            .collect()
    }

    async fn fetch_organization(&self, id: &str) -> Result<Organization, CollaboratorError> {
        let data = self.entity("organizations", id).await?;
        Ok(Organization {
            diavgeia_id: string_field(&data, "uid").unwrap_or_else(|| id.to_string()),
            name: string_field(&data, "label"),
            category: string_field(&data, "category"),
            vat_number: string_field(&data, "vatNumber"),
            raw_data: data,
        })
    }

    async fn fetch_unit(&self, id: &str) -> Result<Unit, CollaboratorError> {
        let data = self.entity("units", id).await?;
        Ok(Unit {
            diavgeia_id: string_field(&data, "uid").unwrap_or_else(|| id.to_string()),
            name: string_field(&data, "label"),
            category: string_field(&data, "category"),
            raw_data: data,
        })
    }

    async fn fetch_signer(&self, id: &str) -> Result<Signer, CollaboratorError> {
        let data = self.entity("signers", id).await?;
        Ok(Signer {
            diavgeia_id: string_field(&data, "uid").unwrap_or_else(|| id.to_string()),
            first_name: string_field(&data, "firstName"),
            last_name: string_field(&data, "lastName"),
            organization_id: string_field(&data, "organizationId"),
            raw_data: data,
        })
    }
}

fn decision_from_json(raw: &Value) -> Result<SourceDecision, CollaboratorError> {
    let ada = string_field(raw, "ada")
        .ok_or_else(|| CollaboratorError::InvalidResponse("decision without ada".into()))?;
    let document_url = string_field(raw, "documentUrl")
        .unwrap_or_else(|| format!("{DOCUMENT_URL_BASE}/{ada}"));
    let extra = raw.get("extraFieldValues").cloned().unwrap_or(Value::Null);

    let metadata = json!({
        "protocolNumber": raw.get("protocolNumber"),
        "subject": raw.get("subject"),
        "issueDate": raw.get("issueDate"),
        "organizationId": raw.get("organizationId"),
        "signerIds": raw.get("signerIds"),
        "unitIds": raw.get("unitIds"),
        "decisionTypeId": raw.get("decisionTypeId"),
        "thematicCategoryIds": raw.get("thematicCategoryIds"),
        "ada": ada,
        "documentUrl": document_url,
        "publishTimestamp": raw.get("publishTimestamp"),
        "submissionTimestamp": raw.get("submissionTimestamp"),
        "financialYear": extra.get("financialYear"),
        "budgetType": extra.get("budgetType"),
        "amountWithVAT": extra.get("amountWithVAT"),
        "amountWithKae": extra.get("amountWithKae"),
    });

    Ok(SourceDecision {
        issue_date: raw.get("issueDate").and_then(issue_date),
        organization_id: string_field(raw, "organizationId"),
        signer_ids: string_list(raw, "signerIds"),
        unit_ids: string_list(raw, "unitIds"),
        ada,
        document_url,
        metadata,
    })
}

/// The source reports issue dates as epoch milliseconds; older exports use strings.
fn issue_date(value: &Value) -> Option<String> {
    match value {
        Value::Number(millis) => {
            let seconds = millis.as_i64()? / 1000;
            OffsetDateTime::from_unix_timestamp(seconds)
                .ok()
                .map(|moment| moment.date().to_string())
        }
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
