//! Tabular source access: CSV tokenizer, retrying HTTP fetch, sheet readers,
//! and the OAuth credential manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsheet_core::{Credential, RawRow, RawTable, SheetLocator, SyncError};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsheet-source";

/// Safety margin before token expiry under which a refresh is attempted.
pub const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";
const DEFAULT_EXPORT_BASE: &str = "https://docs.google.com";
const VALUES_RANGE: &str = "A1:ZZ10000";

// ---------------------------------------------------------------------------
// CSV tokenizer
// ---------------------------------------------------------------------------

/// Parse RFC4180 CSV text into a header-keyed raw table.
///
/// Quoted fields may contain commas, newlines, and doubled-quote escapes.
/// Blank lines are skipped. The first non-blank line is the header row
/// (trimmed); short data rows pad missing trailing fields with the empty
/// string, long rows drop the extras. Duplicate headers resolve last-wins
/// when cells are read back by name.
pub fn parse_csv(text: &str) -> RawTable {
    let records = tokenize_records(text);
    let mut records = records.into_iter();
    let Some(header_record) = records.next() else {
        return RawTable::default();
    };
    let headers: Vec<String> = header_record.iter().map(|h| h.trim().to_string()).collect();

    let mut rows = Vec::new();
    for (index, record) in records.enumerate() {
        let mut values = BTreeMap::new();
        for (position, header) in headers.iter().enumerate() {
            let cell = record.get(position).cloned().unwrap_or_default();
            values.insert(header.clone(), cell);
        }
        rows.push(RawRow {
            // Header row is row 1, so the first data row is row 2.
            row_number: index as u32 + 2,
            values,
        });
    }

    RawTable { headers, rows }
}

fn tokenize_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
                // A trailing comma still means one more (empty) field.
                if chars.peek().is_none() {
                    record.push(String::new());
                    records.push(std::mem::take(&mut record));
                }
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_record(&mut records, &mut record, &mut field);
            }
            '\n' => end_record(&mut records, &mut record, &mut field),
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

fn end_record(records: &mut Vec<Vec<String>>, record: &mut Vec<String>, field: &mut String) {
    // A line with no separators and no content is blank: skip it.
    if record.is_empty() && field.is_empty() {
        return;
    }
    record.push(std::mem::take(field));
    records.push(std::mem::take(record));
}

// ---------------------------------------------------------------------------
// HTTP fetch with classified retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded retry with capped exponential backoff, applied uniformly to
/// network-classified failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET a URL, retrying transient failures, without classifying the
    /// final status. Non-2xx statuses are returned to the caller, which
    /// owns the source-specific classification.
    pub async fn get(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, SyncError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| SyncError::Network("http fetcher shut down".into()))?;

        let span = info_span!("http_fetch", url);
        async {
            let mut last_error: Option<reqwest::Error> = None;
            for attempt in 0..=self.backoff.max_retries {
                let mut request = self.client.get(url);
                if let Some(token) = bearer_token {
                    request = request.bearer_auth(token);
                }
                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|e| SyncError::Network(e.to_string()))?
                            .to_vec();
                        return Ok(FetchedResponse { status, body });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(SyncError::Network(err.to_string()));
                    }
                }
            }
            Err(SyncError::Network(
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "request retries exhausted".into()),
            ))
        }
        .instrument(span)
        .await
    }
}

/// Map a non-success HTTP status from the spreadsheet host to the error
/// taxonomy callers dispatch remediation on.
pub fn classify_source_status(status: StatusCode) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED => SyncError::AuthRequired,
        StatusCode::FORBIDDEN => SyncError::AccessDenied,
        StatusCode::NOT_FOUND => SyncError::NotFound("spreadsheet or tab not found".into()),
        other => SyncError::Network(format!("unexpected status {other}")),
    }
}

/// An HTML body where tabular data was expected is the host's access-gate
/// page, not data.
pub fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().get(..64).unwrap_or(body.trim_start());
    let lowered = head.to_ascii_lowercase();
    lowered.starts_with("<!doctype") || lowered.starts_with("<html")
}

// ---------------------------------------------------------------------------
// Sheet readers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub title: String,
    pub gid: String,
}

/// Uniform access to one spreadsheet tab, regardless of fetch strategy.
#[async_trait]
pub trait SheetReader: Send + Sync {
    /// Fetch headers + data rows. `max_rows`, when given, bounds the data
    /// rows (preview fetches); the header row is always included.
    async fn fetch_rows(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
        max_rows: Option<usize>,
    ) -> Result<RawTable, SyncError>;

    /// List tab titles + gids for multi-tab analysis.
    async fn list_tabs(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
    ) -> Result<Vec<TabInfo>, SyncError>;
}

/// Authenticated reader against the spreadsheet API.
pub struct ApiSheetReader {
    http: Arc<HttpFetcher>,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

impl ApiSheetReader {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn spreadsheet_meta(
        &self,
        locator: &SheetLocator,
        token: &str,
    ) -> Result<SpreadsheetMeta, SyncError> {
        let url = format!(
            "{}/v4/spreadsheets/{}?fields=sheets.properties",
            self.base_url, locator.spreadsheet_id
        );
        let resp = self.http.get(&url, Some(token)).await?;
        if !resp.status.is_success() {
            return Err(classify_source_status(resp.status));
        }
        let text = resp.text();
        if looks_like_html(&text) {
            return Err(SyncError::MalformedResponse(
                "spreadsheet metadata endpoint returned HTML".into(),
            ));
        }
        serde_json::from_str(&text)
            .map_err(|e| SyncError::MalformedResponse(format!("spreadsheet metadata: {e}")))
    }

    /// Resolve the tab title to read: an explicit tab wins, then the tab
    /// whose gid matches, then the first tab of the workbook.
    async fn resolve_tab(&self, locator: &SheetLocator, token: &str) -> Result<String, SyncError> {
        if let Some(tab) = &locator.tab {
            return Ok(tab.clone());
        }
        let meta = self.spreadsheet_meta(locator, token).await?;
        if meta.sheets.is_empty() {
            return Err(SyncError::EmptySource);
        }
        if let Some(gid) = &locator.gid {
            if let Some(sheet) = meta
                .sheets
                .iter()
                .find(|s| s.properties.sheet_id.to_string() == *gid)
            {
                return Ok(sheet.properties.title.clone());
            }
            return Err(SyncError::NotFound(format!("no tab with gid {gid}")));
        }
        Ok(meta.sheets[0].properties.title.clone())
    }

    fn values_url(&self, locator: &SheetLocator, tab: &str) -> Result<String, SyncError> {
        let mut url = reqwest::Url::parse(&format!(
            "{}/v4/spreadsheets/{}/values/ignored",
            self.base_url, locator.spreadsheet_id
        ))
        .map_err(|e| SyncError::InvalidLocator(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidLocator("cannot-be-a-base api url".into()))?
            .pop()
            .push(&format!("{tab}!{VALUES_RANGE}"));
        Ok(url.to_string())
    }
}

#[async_trait]
impl SheetReader for ApiSheetReader {
    async fn fetch_rows(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
        max_rows: Option<usize>,
    ) -> Result<RawTable, SyncError> {
        let token = access_token.ok_or(SyncError::AuthRequired)?;
        let tab = self.resolve_tab(locator, token).await?;
        let url = self.values_url(locator, &tab)?;
        let resp = self.http.get(&url, Some(token)).await?;
        if !resp.status.is_success() {
            return Err(classify_source_status(resp.status));
        }
        let text = resp.text();
        if looks_like_html(&text) {
            return Err(SyncError::MalformedResponse(
                "values endpoint returned HTML".into(),
            ));
        }
        let range: ValueRange = serde_json::from_str(&text)
            .map_err(|e| SyncError::MalformedResponse(format!("value range: {e}")))?;
        let mut table = table_from_value_rows(range.values)?;
        if let Some(max) = max_rows {
            table.truncate(max);
        }
        Ok(table)
    }

    async fn list_tabs(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
    ) -> Result<Vec<TabInfo>, SyncError> {
        let token = access_token.ok_or(SyncError::AuthRequired)?;
        let meta = self.spreadsheet_meta(locator, token).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|s| TabInfo {
                title: s.properties.title,
                gid: s.properties.sheet_id.to_string(),
            })
            .collect())
    }
}

/// Build a raw table from API value rows; the first row is always headers.
pub fn table_from_value_rows(value_rows: Vec<Vec<JsonValue>>) -> Result<RawTable, SyncError> {
    let mut rows_iter = value_rows.into_iter();
    let Some(header_cells) = rows_iter.next() else {
        return Err(SyncError::EmptySource);
    };
    let headers: Vec<String> = header_cells
        .iter()
        .map(|c| cell_to_string(c).trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, cells) in rows_iter.enumerate() {
        let mut values = BTreeMap::new();
        for (position, header) in headers.iter().enumerate() {
            let cell = cells.get(position).map(cell_to_string).unwrap_or_default();
            values.insert(header.clone(), cell);
        }
        rows.push(RawRow {
            row_number: index as u32 + 2,
            values,
        });
    }
    if rows.is_empty() {
        return Err(SyncError::EmptySource);
    }
    Ok(RawTable { headers, rows })
}

fn cell_to_string(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Unauthenticated reader against the public CSV export endpoint.
pub struct ExportSheetReader {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ExportSheetReader {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: DEFAULT_EXPORT_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn export_url(&self, locator: &SheetLocator) -> String {
        let gid = locator.gid.as_deref().unwrap_or("0");
        format!(
            "{}/spreadsheets/d/{}/export?format=csv&gid={}",
            self.base_url, locator.spreadsheet_id, gid
        )
    }
}

#[async_trait]
impl SheetReader for ExportSheetReader {
    async fn fetch_rows(
        &self,
        locator: &SheetLocator,
        _access_token: Option<&str>,
        max_rows: Option<usize>,
    ) -> Result<RawTable, SyncError> {
        let url = self.export_url(locator);
        let resp = self.http.get(&url, None).await?;
        if !resp.status.is_success() {
            return Err(classify_source_status(resp.status));
        }
        let text = resp.text();
        if looks_like_html(&text) {
            return Err(SyncError::MalformedResponse(
                "export returned an HTML page; the sheet is not link-viewable".into(),
            ));
        }
        let mut table = parse_csv(&text);
        if table.is_empty() {
            return Err(SyncError::EmptySource);
        }
        if let Some(max) = max_rows {
            table.truncate(max);
        }
        Ok(table)
    }

    async fn list_tabs(
        &self,
        _locator: &SheetLocator,
        _access_token: Option<&str>,
    ) -> Result<Vec<TabInfo>, SyncError> {
        // The export endpoint serves one tab at a time and exposes no
        // workbook metadata.
        Err(SyncError::AuthRequired)
    }
}

/// Strategy reader: authenticated when a token is supplied, public export
/// otherwise or when the authenticated path fails with a source error.
pub struct FallbackSheetReader {
    api: Arc<dyn SheetReader>,
    export: Arc<dyn SheetReader>,
}

impl FallbackSheetReader {
    pub fn new(api: Arc<dyn SheetReader>, export: Arc<dyn SheetReader>) -> Self {
        Self { api, export }
    }

    pub fn from_http(http: Arc<HttpFetcher>) -> Self {
        Self {
            api: Arc::new(ApiSheetReader::new(http.clone())),
            export: Arc::new(ExportSheetReader::new(http)),
        }
    }
}

#[async_trait]
impl SheetReader for FallbackSheetReader {
    async fn fetch_rows(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
        max_rows: Option<usize>,
    ) -> Result<RawTable, SyncError> {
        if access_token.is_some() {
            match self.api.fetch_rows(locator, access_token, max_rows).await {
                Ok(table) => return Ok(table),
                Err(err) => {
                    warn!(
                        code = err.code(),
                        spreadsheet_id = %locator.spreadsheet_id,
                        "authenticated fetch failed; falling back to csv export"
                    );
                }
            }
        }
        self.export.fetch_rows(locator, None, max_rows).await
    }

    async fn list_tabs(
        &self,
        locator: &SheetLocator,
        access_token: Option<&str>,
    ) -> Result<Vec<TabInfo>, SyncError> {
        self.api.list_tabs(locator, access_token).await
    }
}

// ---------------------------------------------------------------------------
// Credential manager
// ---------------------------------------------------------------------------

/// Persistence port for per-user OAuth credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(&self, user_id: Uuid) -> Result<Option<Credential>, SyncError>;
    async fn upsert_credential(&self, credential: &Credential) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
}

impl OAuthConfig {
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Token expiry is judged against a fixed safety margin so a token cannot
/// expire between the check and its use.
pub fn needs_refresh(credential: &Credential, now: DateTime<Utc>) -> bool {
    let margin = chrono::Duration::from_std(TOKEN_EXPIRY_MARGIN).unwrap_or_default();
    credential.expires_at - now <= margin
}

pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    oauth: OAuthConfig,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, client: reqwest::Client, oauth: OAuthConfig) -> Self {
        Self {
            store,
            client,
            oauth,
        }
    }

    /// Return a usable access token for the user, refreshing if expired.
    ///
    /// `None` means "proceed without a credential": no credential stored,
    /// or the refresh failed. Refresh failures degrade to the public export
    /// path rather than failing the sync.
    pub async fn get_valid_token(&self, user_id: Uuid) -> Result<Option<String>, SyncError> {
        let Some(credential) = self.store.credential(user_id).await? else {
            return Ok(None);
        };
        if !needs_refresh(&credential, Utc::now()) {
            return Ok(Some(credential.access_token));
        }
        match self.refresh(&credential).await {
            Ok(refreshed) => Ok(Some(refreshed.access_token)),
            Err(err) => {
                warn!(
                    code = err.code(),
                    %user_id,
                    "token refresh failed; continuing without a credential"
                );
                Ok(None)
            }
        }
    }

    /// Exchange the refresh token for a new access token and persist it.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, SyncError> {
        let params = [
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("refresh_token", credential.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let resp = self
            .client
            .post(&self.oauth.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::RefreshFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::RefreshFailed(format!(
                "token endpoint returned {status}"
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::RefreshFailed(format!("token response: {e}")))?;

        let now = Utc::now();
        let refreshed = Credential {
            user_id: credential.user_id,
            access_token: token.access_token,
            refresh_token: credential.refresh_token.clone(),
            expires_at: now + chrono::Duration::seconds(token.expires_in),
            updated_at: now,
        };
        self.store.upsert_credential(&refreshed).await?;
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn csv_round_trip_with_quoted_comma_and_escaped_quotes() {
        let table = parse_csv("Name,Email,\"Notes, w/ comma\"\nAda,ada@x.com,\"Hello, \"\"world\"\"\"\n");
        assert_eq!(table.headers, vec!["Name", "Email", "Notes, w/ comma"]);
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.row_number, 2);
        assert_eq!(row.get("Name"), Some("Ada"));
        assert_eq!(row.get("Email"), Some("ada@x.com"));
        assert_eq!(row.get("Notes, w/ comma"), Some("Hello, \"world\""));
    }

    #[test]
    fn csv_skips_blank_lines_and_pads_short_rows() {
        let table = parse_csv("a,b,c\n\n1,2\n\n4,5,6,7\n");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].get("c"), Some(""));
        // Long rows drop trailing extras.
        assert_eq!(table.rows[1].get("c"), Some("6"));
        // Blank lines do not consume row numbers.
        assert_eq!(table.rows[1].row_number, 3);
    }

    #[test]
    fn csv_newline_inside_quotes_is_literal() {
        let table = parse_csv("name,notes\nAda,\"line one\nline two\"\n");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].get("notes"), Some("line one\nline two"));
    }

    #[test]
    fn csv_crlf_records_and_trailing_comma() {
        let table = parse_csv("a,b\r\n1,\r\n");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].get("a"), Some("1"));
        assert_eq!(table.rows[0].get("b"), Some(""));
    }

    #[test]
    fn csv_duplicate_headers_last_occurrence_wins() {
        let table = parse_csv("email,name,email\nfirst@x.com,Ada,second@x.com\n");
        assert_eq!(table.rows[0].get("email"), Some("second@x.com"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn source_status_classification() {
        assert_eq!(
            classify_source_status(StatusCode::UNAUTHORIZED).code(),
            "AUTH_REQUIRED"
        );
        assert_eq!(
            classify_source_status(StatusCode::FORBIDDEN).code(),
            "ACCESS_DENIED"
        );
        assert_eq!(
            classify_source_status(StatusCode::NOT_FOUND).code(),
            "NOT_FOUND"
        );
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn html_sniffing_catches_access_gate_pages() {
        assert!(looks_like_html("<!DOCTYPE html><html>..."));
        assert!(looks_like_html("  <html lang=\"en\">"));
        assert!(!looks_like_html("name,email\nAda,a@x.com"));
        assert!(!looks_like_html("{\"values\": []}"));
    }

    #[test]
    fn value_rows_become_a_table_with_header_offset() {
        let table = table_from_value_rows(vec![
            vec![json!("Name"), json!("Revenue")],
            vec![json!("Ada"), json!(5000)],
            vec![json!("Grace")],
        ])
        .unwrap();
        assert_eq!(table.headers, vec!["Name", "Revenue"]);
        assert_eq!(table.rows[0].row_number, 2);
        assert_eq!(table.rows[0].get("Revenue"), Some("5000"));
        assert_eq!(table.rows[1].get("Revenue"), Some(""));
    }

    #[test]
    fn value_rows_without_data_are_empty_source() {
        let err = table_from_value_rows(vec![vec![json!("Name")]]).unwrap_err();
        assert_eq!(err.code(), "EMPTY_SOURCE");
        let err = table_from_value_rows(vec![]).unwrap_err();
        assert_eq!(err.code(), "EMPTY_SOURCE");
    }

    #[test]
    fn refresh_is_needed_inside_the_expiry_margin() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let mut credential = Credential {
            user_id: Uuid::nil(),
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: now + chrono::Duration::seconds(300),
            updated_at: now,
        };
        assert!(!needs_refresh(&credential, now));
        credential.expires_at = now + chrono::Duration::seconds(59);
        assert!(needs_refresh(&credential, now));
        credential.expires_at = now - chrono::Duration::seconds(10);
        assert!(needs_refresh(&credential, now));
    }

    #[test]
    fn export_url_defaults_gid_zero() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let reader = ExportSheetReader::new(http);
        let url = reader.export_url(&SheetLocator::new("abc"));
        assert_eq!(
            url,
            "https://docs.google.com/spreadsheets/d/abc/export?format=csv&gid=0"
        );
        let url = reader.export_url(&SheetLocator::new("abc").with_gid("417"));
        assert!(url.ends_with("gid=417"));
    }

    struct FailingReader;

    #[async_trait]
    impl SheetReader for FailingReader {
        async fn fetch_rows(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
            _max_rows: Option<usize>,
        ) -> Result<RawTable, SyncError> {
            Err(SyncError::AccessDenied)
        }

        async fn list_tabs(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
        ) -> Result<Vec<TabInfo>, SyncError> {
            Err(SyncError::AccessDenied)
        }
    }

    struct TableReader(RawTable);

    #[async_trait]
    impl SheetReader for TableReader {
        async fn fetch_rows(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
            max_rows: Option<usize>,
        ) -> Result<RawTable, SyncError> {
            let mut table = self.0.clone();
            if let Some(max) = max_rows {
                table.truncate(max);
            }
            Ok(table)
        }

        async fn list_tabs(
            &self,
            _locator: &SheetLocator,
            _access_token: Option<&str>,
        ) -> Result<Vec<TabInfo>, SyncError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn fallback_degrades_to_export_and_yields_identical_rows() {
        let table = parse_csv("Name,Email\nAda,ada@x.com\n");
        let reader = FallbackSheetReader::new(
            Arc::new(FailingReader),
            Arc::new(TableReader(table.clone())),
        );
        let locator = SheetLocator::new("abc");

        let with_token = reader.fetch_rows(&locator, Some("tok"), None).await.unwrap();
        let anonymous = reader.fetch_rows(&locator, None, None).await.unwrap();
        assert_eq!(with_token, anonymous);
        assert_eq!(with_token, table);
    }

    #[test]
    fn values_url_percent_encodes_tab_titles() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let reader = ApiSheetReader::new(http);
        let url = reader
            .values_url(&SheetLocator::new("abc"), "Q1 Appointments")
            .unwrap();
        assert!(url.contains("/v4/spreadsheets/abc/values/"));
        assert!(url.contains("Q1%20Appointments"));
        assert!(!url.contains(' '));
    }
}
