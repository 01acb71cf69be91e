//! Reporting-API adapter, credential provider and schema reconciliation for
//! item-details carbon emission reports.

use std::fmt;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use emissions_core::{
    ColumnType, EmissionRecord, PartitionKey, UnknownColumn, ITEM_DETAILS_COLUMNS,
};
use emissions_storage::{FetchError, FetchedResponse, HttpFetcher, RawResponseArchive};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "emissions-adapters";

pub const DEFAULT_REPORT_API_URL: &str = "https://management.azure.com/providers/Microsoft.Carbon/carbonEmissionReports?api-version=2024-02-01-preview";
pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com";
pub const DEFAULT_CATEGORY_TYPE: &str = "Resource";
pub const ITEM_DETAILS_REPORT: &str = "ItemDetailsReport";
pub const ORDER_BY_LATEST_MONTH_EMISSIONS: &str = "LatestMonthEmissions";
pub const SORT_DESCENDING: &str = "Desc";
pub const PAGE_SIZE: usize = 1000;

/// Columns whose value comes from the requested partition, never the payload.
pub const STAMPED_COLUMNS: [&str; 2] = ["reportMonth", "emissionScope"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub report_type: String,
    pub subscription_list: Vec<String>,
    pub carbon_scope_list: Vec<String>,
    pub category_type: String,
    pub order_by: String,
    pub sort_direction: String,
    pub page_size: usize,
    pub date_range: DateRange,
}

impl ReportRequest {
    /// One month, one scope, one subscription, largest emitters first.
    pub fn item_details(subscription_id: &str, category_type: &str, key: &PartitionKey) -> Self {
        let month = key.month_str();
        Self {
            report_type: ITEM_DETAILS_REPORT.to_string(),
            subscription_list: vec![subscription_id.to_string()],
            carbon_scope_list: vec![key.scope.as_str().to_string()],
            category_type: category_type.to_string(),
            order_by: ORDER_BY_LATEST_MONTH_EMISSIONS.to_string(),
            sort_direction: SORT_DESCENDING.to_string(),
            page_size: PAGE_SIZE,
            date_range: DateRange {
                start: month.clone(),
                end: month,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPage {
    #[serde(default)]
    pub value: Vec<JsonValue>,
    #[serde(default)]
    pub skip_token: Option<String>,
}

/// Result of one partition request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Records(Vec<JsonValue>),
    Empty,
    HttpError { status: u16, body: String },
}

/// Everything a run needs to address the reporting API, resolved once.
#[derive(Clone)]
pub struct ReportContext {
    pub bearer_token: String,
    pub subscription_id: String,
    pub category_type: String,
}

impl fmt::Debug for ReportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportContext")
            .field("bearer_token", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .field("category_type", &self.category_type)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding report response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_partition(
        &self,
        ctx: &ReportContext,
        key: &PartitionKey,
    ) -> Result<FetchOutcome, AdapterError>;
}

/// Map a raw HTTP response onto a typed outcome.
pub fn classify_response(
    key: &PartitionKey,
    response: &FetchedResponse,
) -> Result<FetchOutcome, AdapterError> {
    if !response.is_success() {
        return Ok(FetchOutcome::HttpError {
            status: response.status.as_u16(),
            body: response.body_text(),
        });
    }

    let page: ReportPage = serde_json::from_slice(&response.body)?;
    if page.skip_token.as_deref().is_some_and(|t| !t.is_empty()) || page.value.len() >= PAGE_SIZE {
        warn!(
            partition = %key,
            records = page.value.len(),
            "report page is full; records beyond the first page are not fetched"
        );
    }
    if page.value.is_empty() {
        return Ok(FetchOutcome::Empty);
    }
    Ok(FetchOutcome::Records(page.value))
}

/// HTTP implementation of [`ReportSource`] against the carbon emission reports API.
pub struct CarbonReportAdapter {
    http: HttpFetcher,
    api_url: String,
    archive: Option<RawResponseArchive>,
}

impl CarbonReportAdapter {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: RawResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl ReportSource for CarbonReportAdapter {
    fn source_id(&self) -> &'static str {
        "carbon-emission-reports"
    }

    async fn fetch_partition(
        &self,
        ctx: &ReportContext,
        key: &PartitionKey,
    ) -> Result<FetchOutcome, AdapterError> {
        let request = ReportRequest::item_details(&ctx.subscription_id, &ctx.category_type, key);
        let response = self
            .http
            .post_json(&self.api_url, &ctx.bearer_token, &request)
            .await?;

        // The archive is a side copy; losing it must not cost the partition.
        if let (true, Some(archive)) = (response.is_success(), &self.archive) {
            match archive.store_response(Utc::now(), key, &response.body).await {
                Ok(stored) => {
                    debug!(partition = %key, path = %stored.relative_path.display(), "raw response archived")
                }
                Err(err) => warn!(partition = %key, error = %err, "raw response not archived"),
            }
        }

        classify_response(key, &response)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("record {row} is not a JSON object")]
    NotAnObject { row: usize },
    #[error("record {row}: cannot cast {column}={value} to {expected:?}")]
    Cast {
        row: usize,
        column: &'static str,
        value: String,
        expected: ColumnType,
    },
    #[error(transparent)]
    Column(#[from] UnknownColumn),
}

/// Flatten nested objects into dot-joined keys (`tags.env`), leaving scalars
/// and arrays as leaves.
pub fn flatten_record(record: &Map<String, JsonValue>) -> Map<String, JsonValue> {
    fn walk(prefix: Option<&str>, object: &Map<String, JsonValue>, out: &mut Map<String, JsonValue>) {
        for (name, value) in object {
            let key = match prefix {
                Some(prefix) => format!("{prefix}.{name}"),
                None => name.clone(),
            };
            match value {
                JsonValue::Object(inner) if !inner.is_empty() => walk(Some(&key), inner, out),
                other => {
                    out.insert(key, other.clone());
                }
            }
        }
    }

    let mut out = Map::new();
    walk(None, record, &mut out);
    out
}

fn cast_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(value.to_string()),
    }
}

fn cast_double(value: &JsonValue) -> Result<Option<f64>, ()> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Number(n) => n.as_f64().map(Some).ok_or(()),
        JsonValue::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| ()),
        JsonValue::Array(_) | JsonValue::Object(_) => Err(()),
    }
}

fn cast_date(value: &JsonValue) -> Result<Option<NaiveDate>, ()> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => {
            let day = s.trim().get(..10).ok_or(())?;
            NaiveDate::parse_from_str(day, "%Y-%m-%d").map(Some).map_err(|_| ())
        }
        _ => Err(()),
    }
}

/// Reconcile one raw record onto the item-details schema.
///
/// Every declared column is extracted from the flattened record, missing ones
/// default to null, and the value is cast to the column type. Undeclared
/// fields are dropped. `reportMonth` and `emissionScope` are overwritten with
/// the requested partition before casting.
pub fn reconcile_record(
    row: usize,
    raw: &JsonValue,
    key: &PartitionKey,
) -> Result<EmissionRecord, ReconcileError> {
    let JsonValue::Object(object) = raw else {
        return Err(ReconcileError::NotAnObject { row });
    };
    let mut flat = flatten_record(object);
    flat.insert(STAMPED_COLUMNS[0].to_string(), JsonValue::String(key.month_str()));
    flat.insert(
        STAMPED_COLUMNS[1].to_string(),
        JsonValue::String(key.scope.as_str().to_string()),
    );

    let mut record = EmissionRecord::default();
    for col in ITEM_DETAILS_COLUMNS {
        let value = flat.get(col.name).unwrap_or(&JsonValue::Null);
        let cast_error = || ReconcileError::Cast {
            row,
            column: col.name,
            value: value.to_string(),
            expected: col.column_type,
        };
        match col.column_type {
            ColumnType::Utf8 => record.set_text(col.name, cast_text(value))?,
            ColumnType::Float64 => {
                record.set_number(col.name, cast_double(value).map_err(|()| cast_error())?)?
            }
            ColumnType::Date => {
                record.set_date(col.name, cast_date(value).map_err(|()| cast_error())?)?
            }
        }
    }
    Ok(record)
}

/// Reconcile a whole response. Fails on the first record that cannot be cast,
/// so a partition is either fully normalized or not at all.
pub fn normalize_records(
    records: &[JsonValue],
    key: &PartitionKey,
) -> Result<Vec<EmissionRecord>, ReconcileError> {
    records
        .iter()
        .enumerate()
        .map(|(row, raw)| reconcile_record(row, raw, key))
        .collect()
}

#[derive(Clone)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("token response has no access_token")]
    MissingToken,
    #[error("decoding token response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// OAuth2 client-credentials grant against the v1 token endpoint.
pub struct ClientCredentialsProvider {
    http: HttpFetcher,
    authority_url: String,
    credentials: ClientCredentials,
}

impl ClientCredentialsProvider {
    pub fn new(http: HttpFetcher, authority_url: impl Into<String>, credentials: ClientCredentials) -> Self {
        Self {
            http,
            authority_url: authority_url.into(),
            credentials,
        }
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/token",
            self.authority_url.trim_end_matches('/'),
            self.credentials.tenant_id
        )
    }
}

#[async_trait]
impl CredentialProvider for ClientCredentialsProvider {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("resource", MANAGEMENT_RESOURCE),
        ];
        let response = self.http.post_form(&self.token_url(), &form).await?;
        parse_token_response(&response)
    }
}

/// Extract the bearer token from a token-endpoint response.
pub fn parse_token_response(response: &FetchedResponse) -> Result<String, CredentialError> {
    if !response.is_success() {
        return Err(CredentialError::Rejected {
            status: response.status.as_u16(),
            body: response.body_text(),
        });
    }
    let token: TokenResponse = serde_json::from_slice(&response.body)?;
    token
        .access_token
        .filter(|t| !t.trim().is_empty())
        .ok_or(CredentialError::MissingToken)
}
