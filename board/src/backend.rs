//! The inventory backend collaborator.
//!
//! The board only ever asks the backend two things: the current state of a
//! filtered set of rows, and to apply one idempotent state change. The
//! [`InventoryBackend`] trait is that seam; [`HttpBackend`] implements it over
//! the resilient [`UpdateClient`].

use crate::client::{SendOptions, TransportRequest, UpdateClient, UpdateError};
use crate::config::{BackendEnv, BoardConfig};
use crate::location::normalize;
use crate::types::{InventoryUnit, PackingAction, RequestId, RowIndexRef, UnitStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Page number per column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPages {
    /// Page of the manufactured column
    pub manufactured: u32,
    /// Page of the stock column
    pub stock: u32,
    /// Page of the shipped column
    pub shipped: u32,
}

impl Default for ColumnPages {
    fn default() -> Self {
        Self {
            manufactured: 1,
            stock: 1,
            shipped: 1,
        }
    }
}

/// Which slice of the inventory a query reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum QueryScope {
    /// All three columns of the board
    #[default]
    Board,
    /// Unfinished manufactured rows outside the given date
    Backlog {
        /// Date whose rows are already on the board
        exclude_date: NaiveDate,
    },
    /// Shipped rows, narrowed by shipping date
    Archive {
        /// Year
        year: Option<i32>,
        /// Month, 1-12
        month: Option<u32>,
        /// Day of the month
        day: Option<u32>,
    },
}

/// Query parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Board, backlog or archive
    #[serde(default)]
    pub scope: QueryScope,
    /// Manufacture date; also pulls in the backlog of earlier unfinished rows
    pub date: Option<NaiveDate>,
    /// Free-text product filter
    pub product: Option<String>,
    /// Only rows in this stage
    pub status: Option<UnitStatus>,
    /// Smallest base quantity
    pub quantity_min: Option<i64>,
    /// Largest base quantity
    pub quantity_max: Option<i64>,
    /// Page per column
    pub pages: ColumnPages,
    /// Cards per column page
    pub page_size: u32,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            scope: QueryScope::Board,
            date: None,
            product: None,
            status: None,
            quantity_min: None,
            quantity_max: None,
            pages: ColumnPages::default(),
            page_size: 10,
        }
    }
}

impl QueryFilter {
    /// Query-string parameters for the search endpoint.
    ///
    /// Backlog and archive queries page a single column and ignore the board
    /// filters.
    #[must_use]
    pub fn to_query_pairs(&self, env: BackendEnv) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("env", env.as_str().to_string())];
        match self.scope {
            QueryScope::Board => {},
            QueryScope::Backlog { exclude_date } => {
                pairs.push(("scope", "backlog".to_string()));
                pairs.push(("excludeDate", exclude_date.format("%Y-%m-%d").to_string()));
                pairs.push(("paginate", "1".to_string()));
                pairs.push(("pageSize", self.page_size.to_string()));
                pairs.push(("pageManufactured", self.pages.manufactured.to_string()));
                return pairs;
            },
            QueryScope::Archive { year, month, day } => {
                pairs.push(("scope", "archive".to_string()));
                pairs.extend(year.map(|year| ("year", year.to_string())));
                pairs.extend(month.map(|month| ("month", month.to_string())));
                pairs.extend(day.map(|day| ("day", day.to_string())));
                pairs.push(("paginate", "1".to_string()));
                pairs.push(("pageSize", self.page_size.to_string()));
                pairs.push(("pageShipped", self.pages.shipped.to_string()));
                return pairs;
            },
        }
        if let Some(date) = self.date {
            pairs.push(("date", date.format("%Y-%m-%d").to_string()));
            pairs.push(("includeBacklog", "1".to_string()));
        }
        if let Some(product) = self.product.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            pairs.push(("product", product.to_string()));
        }
        if let Some(status) = self.status {
            pairs.push(("status", status.legacy_label().to_string()));
        }
        if let Some(min) = self.quantity_min {
            pairs.push(("quantityMin", min.to_string()));
        }
        if let Some(max) = self.quantity_max {
            pairs.push(("quantityMax", max.to_string()));
        }
        pairs.push(("paginate", "1".to_string()));
        pairs.push(("pageSize", self.page_size.to_string()));
        pairs.push(("pageManufactured", self.pages.manufactured.to_string()));
        pairs.push(("pageStock", self.pages.stock.to_string()));
        pairs.push(("pageShipped", self.pages.shipped.to_string()));
        pairs
    }

    /// Whether a unit passes the scope, product, status and quantity filters.
    #[must_use]
    pub fn matches(&self, unit: &InventoryUnit) -> bool {
        match self.scope {
            QueryScope::Board => {},
            QueryScope::Backlog { exclude_date } => {
                let excluded = exclude_date.format("%Y-%m-%d").to_string();
                return unit.status == UnitStatus::Manufactured
                    && unit.manufactured_on.as_deref() != Some(excluded.as_str());
            },
            QueryScope::Archive { .. } => return unit.status == UnitStatus::Shipped,
        }
        let product_ok = match self.product.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(needle) => unit.product.as_deref().is_some_and(|product| product.contains(needle)),
            None => true,
        };
        product_ok
            && self.status.is_none_or(|status| unit.status == status)
            && self.quantity_min.is_none_or(|min| unit.base_quantity >= min)
            && self.quantity_max.is_none_or(|max| unit.base_quantity <= max)
    }
}

/// Pagination of one column as reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageInfo {
    /// Records in the column
    pub total: u64,
    /// Current page
    pub page: u32,
    /// Records per page
    pub page_size: u32,
    /// Number of pages
    pub total_pages: u32,
}

/// Pagination of every column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnPagination {
    /// Manufactured column
    pub manufactured: PageInfo,
    /// Stock column
    pub stock: PageInfo,
    /// Shipped column
    pub shipped: PageInfo,
}

/// Environment the backend says it served.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServedEnv {
    /// `test` or `prod`
    pub key: String,
    /// Display label
    #[serde(default)]
    pub label: String,
}

/// Years, months and days the archive can be narrowed to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveFacets {
    /// Years with shipments
    pub years: Vec<i32>,
    /// Months of the selected year
    pub months: Vec<u32>,
    /// Days of the selected month
    pub days: Vec<u32>,
}

/// Response metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Pagination per column
    pub pagination: Option<ColumnPagination>,
    /// Unfinished rows from before the queried date
    pub backlog_count: Option<u64>,
    /// Dates that hold shipped rows, for archive queries
    pub archive: Option<ArchiveFacets>,
    /// Environment the backend served
    pub env: Option<ServedEnv>,
}

/// Authoritative state returned by a query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryResponse {
    /// Records
    pub units: Vec<InventoryUnit>,
    /// Known location labels
    pub locations: Vec<String>,
    /// Metadata
    pub meta: QueryMeta,
}

/// Audit trail attached to every update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLog {
    /// When the operator acted
    pub when: DateTime<Utc>,
    /// Carrier label for shipments
    pub ship_type: Option<String>,
    /// Operator
    pub user: Option<String>,
    /// Source location label
    pub from_location: Option<String>,
    /// Destination location label
    pub to_location: Option<String>,
}

/// One state change sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Transition
    pub action: PackingAction,
    /// Target row
    pub row: RowIndexRef,
    /// Location label after the change
    pub resulting_location: Option<String>,
    /// Units moved into the resulting state
    pub resulting_quantity: i64,
    /// Units left on the source card
    pub remaining_quantity: i64,
    /// Audit trail
    pub audit: AuditLog,
    /// Deduplication id
    pub request_id: RequestId,
}

impl UpdateRequest {
    /// JSON body of the update endpoint.
    #[must_use]
    pub fn to_wire_json(&self) -> Value {
        json!({
            "action": self.action.as_str(),
            "rowIndex": self.row.0,
            "packingData": {
                "quantity": self.resulting_quantity,
                "remaining": self.remaining_quantity,
                "location": self.resulting_location,
                "from": self.audit.from_location,
                "to": self.audit.to_location,
            },
            "log": {
                "when": self.audit.when.to_rfc3339(),
                "shipType": self.audit.ship_type,
                "user": self.audit.user,
                "fromLocation": self.audit.from_location,
                "toLocation": self.audit.to_location,
            },
            "requestId": self.request_id.as_str(),
        })
    }
}

/// Result of an applied update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The backend had already applied this request id
    pub dedup: bool,
}

/// Backend failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached or kept failing
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    /// The backend refused the request
    #[error("Backend rejected the request: {0}")]
    Rejected(String),
    /// The backend answered with something unreadable
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),
    /// The configured URL is unusable
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
    /// The request was cancelled
    #[error("Request cancelled")]
    Cancelled,
}

impl BackendError {
    /// Message shown to the operator.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Unavailable(_) => {
                "Could not reach the inventory backend. Check the connection and try again.".to_string()
            },
            Self::Rejected(reason) => format!("The inventory backend rejected the change: {reason}"),
            Self::InvalidResponse(_) => "The inventory backend sent an unreadable response.".to_string(),
            Self::InvalidUrl(_) => "The inventory backend is misconfigured.".to_string(),
            Self::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

impl From<UpdateError> for BackendError {
    fn from(error: UpdateError) -> Self {
        match error {
            UpdateError::Cancelled => Self::Cancelled,
            UpdateError::Status { status, body } if (400..500).contains(&status) => {
                Self::Rejected(error_message(&body).unwrap_or_else(|| format!("HTTP {status}")))
            },
            other => Self::Unavailable(other.to_string()),
        }
    }
}

fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

/// Query and update collaborator.
pub trait InventoryBackend: Send + Sync {
    /// Fetch the current state for a filter.
    fn query(
        &self,
        filter: QueryFilter,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResponse, BackendError>> + Send + '_>>;

    /// Apply one state change. Resubmitting a request id must not apply it
    /// twice; the backend reports `dedup` instead.
    fn apply(
        &self,
        request: UpdateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome, BackendError>> + Send + '_>>;
}

/// [`InventoryBackend`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: UpdateClient,
    base_url: String,
    env: BackendEnv,
    update_options: SendOptions,
    query_timeout: Duration,
}

impl HttpBackend {
    /// Create a backend at `base_url` with default update options.
    #[must_use]
    pub fn new(client: UpdateClient, base_url: impl Into<String>, env: BackendEnv) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            env,
            update_options: SendOptions::default(),
            query_timeout: Duration::from_secs(30),
        }
    }

    /// Create a backend for the configured environment.
    ///
    /// Returns `None` when the environment has no URL.
    #[must_use]
    pub fn from_config(client: UpdateClient, config: &BoardConfig) -> Option<Self> {
        let url = config.backend_url()?;
        Some(
            Self::new(client, url, config.env)
                .with_update_options(SendOptions {
                    timeout: config.update_timeout(),
                    max_retries: config.update_max_retries,
                    retry_delay_base: config.retry_delay_base(),
                    ..SendOptions::default()
                })
                .with_query_timeout(config.query_timeout()),
        )
    }

    /// Override the retry options used for updates.
    #[must_use]
    pub fn with_update_options(mut self, options: SendOptions) -> Self {
        self.update_options = options;
        self
    }

    /// Override the query timeout.
    #[must_use]
    pub const fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    async fn search(&self, filter: QueryFilter) -> Result<QueryResponse, BackendError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/search", self.base_url),
            filter.to_query_pairs(self.env),
        )
        .map_err(|e| BackendError::InvalidUrl(e.to_string()))?;

        let options = SendOptions {
            timeout: self.query_timeout,
            max_retries: 0,
            ..SendOptions::default()
        };
        let response = self.client.execute(TransportRequest::get(url.as_str()), &options).await?;
        parse_search_response(&response.body)
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateOutcome, BackendError> {
        let options = self
            .update_options
            .clone()
            .header("X-Request-Id", request.request_id.as_str());
        let url = format!("{}/update", self.base_url);

        let response = self.client.send(&url, &request.to_wire_json(), &options).await?;
        if response.dedup() {
            return Ok(UpdateOutcome { dedup: true });
        }

        let body: Value = serde_json::from_str(&response.body).unwrap_or(Value::Null);
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(BackendError::Rejected(
                error_message(&response.body).unwrap_or_else(|| "update failed".to_string()),
            ));
        }
        Ok(UpdateOutcome { dedup: false })
    }
}

impl InventoryBackend for HttpBackend {
    fn query(
        &self,
        filter: QueryFilter,
    ) -> Pin<Box<dyn Future<Output = Result<QueryResponse, BackendError>> + Send + '_>> {
        Box::pin(self.search(filter))
    }

    fn apply(
        &self,
        request: UpdateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome, BackendError>> + Send + '_>> {
        Box::pin(self.update(request))
    }
}

#[derive(Deserialize)]
struct WireSearchResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<WireRecord>,
    #[serde(default)]
    masters: Option<WireMasters>,
    #[serde(default)]
    meta: Option<WireMeta>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct WireMasters {
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Deserialize)]
struct WireMeta {
    #[serde(default)]
    pagination: Option<ColumnPagination>,
    #[serde(default)]
    backlog: Option<WireBacklog>,
    #[serde(default)]
    archive: Option<ArchiveFacets>,
    #[serde(default)]
    env: Option<ServedEnv>,
}

#[derive(Deserialize)]
struct WireBacklog {
    #[serde(default)]
    count: u64,
}

#[derive(Deserialize, Default)]
struct WirePackingInfo {
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    quantity: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    row_index: Value,
    #[serde(default)]
    manufacture_date: Option<String>,
    #[serde(default)]
    batch_no: Option<String>,
    #[serde(default)]
    quantity: Option<Value>,
    #[serde(default)]
    manufacture_product: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    packing_info: Option<WirePackingInfo>,
    #[serde(default)]
    stock_qty: Option<Value>,
    #[serde(default)]
    ship_type: Option<String>,
}

/// Numbers arrive as JSON numbers or numeric strings.
#[allow(clippy::cast_possible_truncation)]
fn lenient_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f.trunc() as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl WireRecord {
    fn into_unit(self) -> Option<InventoryUnit> {
        let row = lenient_i64(Some(&self.row_index)).and_then(|r| u64::try_from(r).ok())?;
        let status = UnitStatus::parse(&self.status)?;
        let base_quantity = lenient_i64(self.quantity.as_ref()).unwrap_or(0);
        let packing = self.packing_info.unwrap_or_default();
        let packed = lenient_i64(packing.quantity.as_ref());
        let stock_qty = lenient_i64(self.stock_qty.as_ref());

        let quantity_at_location = match status {
            UnitStatus::Stocked => packed.or(stock_qty).unwrap_or(0),
            UnitStatus::Manufactured => stock_qty.unwrap_or(base_quantity),
            UnitStatus::Shipped => stock_qty
                .or(packed.filter(|q| *q > 0))
                .unwrap_or(base_quantity),
        };

        let location = packing
            .location
            .as_deref()
            .map(normalize)
            .filter(|location| !location.is_empty());

        Some(InventoryUnit {
            row: RowIndexRef(row),
            base_quantity,
            status,
            location,
            quantity_at_location,
            batch_no: self.batch_no,
            product: self.manufacture_product,
            manufactured_on: self.manufacture_date,
            ship_type: self.ship_type,
        })
    }
}

/// Parse a search response body.
///
/// Records with an unknown status or row are skipped.
///
/// # Errors
///
/// Returns [`BackendError::InvalidResponse`] for malformed JSON and
/// [`BackendError::Rejected`] when the body reports `success: false`.
pub fn parse_search_response(body: &str) -> Result<QueryResponse, BackendError> {
    let wire: WireSearchResponse =
        serde_json::from_str(body).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    if !wire.success {
        return Err(BackendError::Rejected(
            wire.error.unwrap_or_else(|| "search failed".to_string()),
        ));
    }

    let total = wire.data.len();
    let units: Vec<InventoryUnit> = wire.data.into_iter().filter_map(WireRecord::into_unit).collect();
    if units.len() < total {
        tracing::debug!(skipped = total - units.len(), "Skipped unreadable records");
    }

    let meta = wire.meta.map_or_else(QueryMeta::default, |meta| QueryMeta {
        pagination: meta.pagination,
        backlog_count: meta.backlog.map(|backlog| backlog.count),
        archive: meta.archive,
        env: meta.env,
    });

    Ok(QueryResponse {
        units,
        locations: wire.masters.map(|masters| masters.locations).unwrap_or_default(),
        meta,
    })
}
