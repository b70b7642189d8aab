//! Core domain model, column mappings, and error taxonomy for Leadsheet.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsheet-core";

/// Canonical entity type a sheet connection maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Team,
    Leads,
    Appointments,
    Calls,
    Deals,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Team,
        EntityKind::Leads,
        EntityKind::Appointments,
        EntityKind::Calls,
        EntityKind::Deals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Team => "team",
            EntityKind::Leads => "leads",
            EntityKind::Appointments => "appointments",
            EntityKind::Calls => "calls",
            EntityKind::Deals => "deals",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "team" | "team_members" => Ok(EntityKind::Team),
            "leads" | "lead" => Ok(EntityKind::Leads),
            "appointments" | "appointment" => Ok(EntityKind::Appointments),
            "calls" | "call" => Ok(EntityKind::Calls),
            "deals" | "deal" => Ok(EntityKind::Deals),
            other => Err(SyncError::InvalidLocator(format!(
                "unknown entity kind {other:?}"
            ))),
        }
    }
}

/// Locator for one spreadsheet tab: the workbook id plus an optional tab
/// reference (gid from the URL fragment, or a resolved tab title).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetLocator {
    pub spreadsheet_id: String,
    pub gid: Option<String>,
    pub tab: Option<String>,
}

impl SheetLocator {
    pub fn new(spreadsheet_id: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            gid: None,
            tab: None,
        }
    }

    pub fn with_gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = Some(gid.into());
        self
    }

    pub fn with_tab(mut self, tab: impl Into<String>) -> Self {
        self.tab = Some(tab.into());
        self
    }

    /// Parse a shared Google Sheets URL (or a bare spreadsheet id).
    ///
    /// Accepts `.../spreadsheets/d/<id>/edit#gid=<gid>` and `gid` given as a
    /// query parameter; a bare token is treated as a spreadsheet id.
    pub fn parse_url(url: &str) -> Result<Self, SyncError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SyncError::InvalidLocator("empty sheet url".into()));
        }

        let spreadsheet_id = if let Some(rest) = url.split("/d/").nth(1) {
            rest.split(['/', '?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        } else if !url.contains('/') && !url.contains(' ') {
            url.to_string()
        } else {
            return Err(SyncError::InvalidLocator(format!(
                "no spreadsheet id in {url:?}"
            )));
        };

        if spreadsheet_id.is_empty() {
            return Err(SyncError::InvalidLocator(format!(
                "no spreadsheet id in {url:?}"
            )));
        }

        let gid = ["#gid=", "?gid=", "&gid="].iter().find_map(|marker| {
            url.split(marker).nth(1).map(|rest| {
                rest.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
            })
        });
        let gid = gid.filter(|g| !g.is_empty());

        Ok(Self {
            spreadsheet_id,
            gid,
            tab: None,
        })
    }
}

/// Named value transformation applied while mapping a source column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Trim,
    LowercaseTrim,
    CleanPhone,
    ParseCurrency,
    SkipIfPlaceholder,
    CombineDatetime,
}

/// One stored column-to-field mapping entry on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub target_field: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_key: Option<String>,
}

impl ColumnMapping {
    pub fn new(source_column: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_field: target_field.into(),
            confidence: 50.0,
            transformation: None,
            custom_key: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transformation = Some(transform);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// One source row: 1-based row number (the header row is row 1) plus the
/// column-name -> cell-value map. Duplicate source headers resolve
/// last-occurrence-wins when the map is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub row_number: u32,
    pub values: BTreeMap<String, String>,
}

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }
}

/// Header-ordered table of raw rows as fetched from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep at most `max_rows` data rows (header excluded).
    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }
}

/// Reconciliation key tying a persisted record to its source row.
///
/// Identity is row-position based: if rows are inserted, deleted, or
/// reordered in the source sheet between syncs, subsequent syncs re-attach
/// data to whatever record currently owns that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowProvenance {
    pub connection_id: Uuid,
    pub source_row_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    Completed,
    Rescheduled,
    Canceled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Rescheduled => "rescheduled",
            AppointmentStatus::Canceled => "canceled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    ClosedWon,
    NoClose,
    NoShow,
    FollowUp,
    Canceled,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::ClosedWon => "closed_won",
            CallOutcome::NoClose => "no_close",
            CallOutcome::NoShow => "no_show",
            CallOutcome::FollowUp => "follow_up",
            CallOutcome::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Unqualified,
    Nurturing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Won,
    Lost,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TeamMemberFields {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LeadFields {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub status: Option<LeadStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppointmentFields {
    pub lead_name: Option<String>,
    pub lead_email: Option<String>,
    pub phone: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub setter_name: Option<String>,
    pub closer_name: Option<String>,
    pub setter_id: Option<Uuid>,
    pub closer_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub call_outcome: Option<CallOutcome>,
    pub revenue: Option<Decimal>,
    pub cash_collected: Option<Decimal>,
    pub payment_platform: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallFields {
    pub lead_name: Option<String>,
    pub lead_email: Option<String>,
    pub phone: Option<String>,
    pub called_at: Option<DateTime<Utc>>,
    pub outcome: Option<CallOutcome>,
    pub setter_name: Option<String>,
    pub setter_id: Option<Uuid>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DealFields {
    pub lead_name: Option<String>,
    pub lead_email: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub revenue: Option<Decimal>,
    pub cash_collected: Option<Decimal>,
    pub payment_platform: Option<String>,
    pub setter_name: Option<String>,
    pub closer_name: Option<String>,
    pub setter_id: Option<Uuid>,
    pub closer_id: Option<Uuid>,
    pub status: Option<DealStatus>,
    pub source_appointment_id: Option<String>,
}

/// Typed canonical payload, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityFields {
    Team(TeamMemberFields),
    Lead(LeadFields),
    Appointment(AppointmentFields),
    Call(CallFields),
    Deal(DealFields),
}

impl EntityFields {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Team(_) => EntityKind::Team,
            EntityFields::Lead(_) => EntityKind::Leads,
            EntityFields::Appointment(_) => EntityKind::Appointments,
            EntityFields::Call(_) => EntityKind::Calls,
            EntityFields::Deal(_) => EntityKind::Deals,
        }
    }

    /// The human-identifying name field, if any.
    pub fn display_name(&self) -> Option<&str> {
        match self {
            EntityFields::Team(f) => f.full_name.as_deref(),
            EntityFields::Lead(f) => f.name.as_deref(),
            EntityFields::Appointment(f) => f.lead_name.as_deref(),
            EntityFields::Call(f) => f.lead_name.as_deref(),
            EntityFields::Deal(f) => f.lead_name.as_deref(),
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            EntityFields::Team(f) => f.email.as_deref(),
            EntityFields::Lead(f) => f.email.as_deref(),
            EntityFields::Appointment(f) => f.lead_email.as_deref(),
            EntityFields::Call(f) => f.lead_email.as_deref(),
            EntityFields::Deal(f) => f.lead_email.as_deref(),
        }
    }
}

/// One spreadsheet row projected into a typed entity shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub external_id: String,
    pub provenance: RowProvenance,
    pub fields: EntityFields,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn kind(&self) -> EntityKind {
        self.fields.kind()
    }
}

/// Relational counterpart of a canonical record, stamped with sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: Uuid,
    pub kind: EntityKind,
    pub external_id: String,
    pub connection_id: Uuid,
    pub source_row_number: u32,
    pub fields: EntityFields,
    pub custom_fields: BTreeMap<String, String>,
    pub last_synced_at: DateTime<Utc>,
    pub modified_locally: bool,
}

/// A user-scoped binding of one spreadsheet tab to one canonical entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub sheet_url: String,
    pub sheet_name: Option<String>,
    pub sheet_type: EntityKind,
    pub mappings: Vec<ColumnMapping>,
    pub is_active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SheetConnection {
    pub fn locator(&self) -> Result<SheetLocator, SyncError> {
        SheetLocator::parse_url(&self.sheet_url)
    }
}

/// Per-user OAuth token pair. One live credential per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Non-sensitive projection; the only shape exposed outside the core.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            user_id: self.user_id,
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSummary {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared person identity; deduplicated by case-insensitive full name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: String,
}

/// Classified pipeline error with a stable machine-readable code.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication required")]
    AuthRequired,
    #[error("access denied by the source")]
    AccessDenied,
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("invalid sheet locator: {0}")]
    InvalidLocator(String),
    #[error("source has no data rows")]
    EmptySource,
    #[error("malformed response from source: {0}")]
    MalformedResponse(String),
    #[error("mapping suggestion unavailable: {0}")]
    SuggestionUnavailable(String),
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("a sync for this connection is already in progress")]
    InProgress,
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AuthRequired => "AUTH_REQUIRED",
            SyncError::AccessDenied => "ACCESS_DENIED",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::InvalidLocator(_) => "INVALID_LOCATOR",
            SyncError::EmptySource => "EMPTY_SOURCE",
            SyncError::MalformedResponse(_) => "MALFORMED_RESPONSE",
            SyncError::SuggestionUnavailable(_) => "MAPPING_SUGGESTION_UNAVAILABLE",
            SyncError::RefreshFailed(_) => "REFRESH_FAILED",
            SyncError::Persistence(_) => "PERSISTENCE_ERROR",
            SyncError::Network(_) => "NETWORK",
            SyncError::InProgress => "SYNC_IN_PROGRESS",
        }
    }

    /// Whether a bounded retry may help. Only transport-level failures
    /// qualify; classification errors need caller remediation instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parses_shared_url_with_fragment_gid() {
        let locator = SheetLocator::parse_url(
            "https://docs.google.com/spreadsheets/d/1AbC-dEf_123/edit#gid=417",
        )
        .unwrap();
        assert_eq!(locator.spreadsheet_id, "1AbC-dEf_123");
        assert_eq!(locator.gid.as_deref(), Some("417"));
    }

    #[test]
    fn locator_parses_query_gid_and_bare_id() {
        let locator =
            SheetLocator::parse_url("https://docs.google.com/spreadsheets/d/xyz/view?gid=0")
                .unwrap();
        assert_eq!(locator.gid.as_deref(), Some("0"));

        let bare = SheetLocator::parse_url("1AbC-dEf_123").unwrap();
        assert_eq!(bare.spreadsheet_id, "1AbC-dEf_123");
        assert_eq!(bare.gid, None);
    }

    #[test]
    fn locator_rejects_urls_without_an_id() {
        let err = SheetLocator::parse_url("https://docs.google.com/spreadsheets/").unwrap_err();
        assert_eq!(err.code(), "INVALID_LOCATOR");
    }

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("invoices".parse::<EntityKind>().is_err());
    }

    #[test]
    fn mapping_serde_uses_snake_case_transform_names() {
        let mapping = ColumnMapping::new("Cash Collected", "cash_collected")
            .with_transform(Transform::ParseCurrency);
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["transformation"], "parse_currency");
        let back: ColumnMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn credential_summary_never_carries_tokens() {
        let credential = Credential {
            user_id: Uuid::nil(),
            access_token: "super-secret-access".into(),
            refresh_token: "super-secret-refresh".into(),
            expires_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&credential.summary()).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SyncError::AccessDenied.code(), "ACCESS_DENIED");
        assert_eq!(SyncError::EmptySource.code(), "EMPTY_SOURCE");
        assert_eq!(
            SyncError::MalformedResponse("html".into()).code(),
            "MALFORMED_RESPONSE"
        );
        assert!(SyncError::Network("timeout".into()).is_retryable());
        assert!(!SyncError::AccessDenied.is_retryable());
    }
}
