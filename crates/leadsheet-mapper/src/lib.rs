//! Canonical mapping: named value transformations, status normalization,
//! header-based entity type detection, and the mapping suggestion contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use leadsheet_core::{
    AppointmentFields, AppointmentStatus, CallFields, CallOutcome, CanonicalRecord, ColumnMapping,
    DealFields, DealStatus, EntityFields, EntityKind, LeadFields, LeadStatus, RawRow,
    RowProvenance, SyncError, TeamMemberFields, Transform,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsheet-mapper";

// ---------------------------------------------------------------------------
// Value transformations
// ---------------------------------------------------------------------------

/// Sentinel cell values that mean "no data here", not data.
const PLACEHOLDER_VALUES: [&str; 7] = ["in crm", "n/a", "na", "-", "--", "tbd", "none"];

pub fn is_placeholder(raw: &str) -> bool {
    PLACEHOLDER_VALUES.contains(&raw.trim().to_ascii_lowercase().as_str())
}

/// Strip everything but digits, keeping a leading `+`.
pub fn clean_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut out = String::new();
    for (index, c) in trimmed.chars().enumerate() {
        if c == '+' && index == 0 {
            out.push(c);
        } else if c.is_ascii_digit() {
            out.push(c);
        }
    }
    out
}

/// Strip `$`, grouping commas, and spaces, then parse as a decimal amount.
pub fn parse_currency(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(*c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<Decimal>().ok()
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"];
const TIME_FORMATS: [&str; 3] = ["%H:%M:%S", "%H:%M", "%I:%M %p"];
const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%y %H:%M",
];

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
}

/// Parse a full timestamp; RFC3339 first, then common sheet formats, then a
/// bare date at midnight UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    parse_date(raw).map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap_or_default()))
}

/// Lowercased, alphanumeric-only rendition of a header or name.
pub fn slugify(input: &str, separator: char) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

#[derive(Debug, Clone, PartialEq)]
enum TransformedValue {
    Text(String),
    Money(Decimal),
    Stamp(DateTime<Utc>),
    DatePart(NaiveDate),
    TimePart(NaiveTime),
    Dropped,
}

fn apply_transform(transform: Option<Transform>, raw: &str) -> TransformedValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return TransformedValue::Dropped;
    }
    match transform {
        None | Some(Transform::Trim) => TransformedValue::Text(trimmed.to_string()),
        Some(Transform::LowercaseTrim) => {
            TransformedValue::Text(trimmed.to_ascii_lowercase())
        }
        Some(Transform::CleanPhone) => TransformedValue::Text(clean_phone(trimmed)),
        Some(Transform::ParseCurrency) => match parse_currency(trimmed) {
            Some(amount) => TransformedValue::Money(amount),
            None => TransformedValue::Dropped,
        },
        Some(Transform::SkipIfPlaceholder) => {
            if is_placeholder(trimmed) {
                TransformedValue::Dropped
            } else {
                TransformedValue::Text(trimmed.to_string())
            }
        }
        Some(Transform::CombineDatetime) => {
            if let Some(stamp) = parse_datetime_strict(trimmed) {
                TransformedValue::Stamp(stamp)
            } else if let Some(date) = parse_date(trimmed) {
                TransformedValue::DatePart(date)
            } else if let Some(time) = parse_time(trimmed) {
                TransformedValue::TimePart(time)
            } else {
                TransformedValue::Dropped
            }
        }
    }
}

// A bare date must become a DatePart (so a sibling time column can merge
// into it), so the strict variant refuses date-only inputs.
fn parse_datetime_strict(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    DATETIME_FORMATS.iter().find_map(|fmt| {
        chrono::NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

fn value_to_string(value: &TransformedValue) -> String {
    match value {
        TransformedValue::Text(s) => s.clone(),
        TransformedValue::Money(d) => d.to_string(),
        TransformedValue::Stamp(dt) => dt.to_rfc3339(),
        TransformedValue::DatePart(d) => d.to_string(),
        TransformedValue::TimePart(t) => t.to_string(),
        TransformedValue::Dropped => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Status normalization
// ---------------------------------------------------------------------------
//
// Ordered substring rules; multi-token matches run before single-token
// fallbacks ("no show" before "show", "no close" before "closed").

pub fn normalize_appointment_status(raw: &str) -> Option<AppointmentStatus> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if (s.contains("no") && s.contains("show")) || s.contains("dns") || s.contains("did not show")
    {
        return Some(AppointmentStatus::NoShow);
    }
    if s.contains("resched") {
        return Some(AppointmentStatus::Rescheduled);
    }
    if s.contains("cancel") {
        return Some(AppointmentStatus::Canceled);
    }
    if s.contains("confirm") {
        return Some(AppointmentStatus::Confirmed);
    }
    if s.contains("complete") || s.contains("done") || s.contains("attended") || s.contains("show")
    {
        return Some(AppointmentStatus::Completed);
    }
    if s.contains("sched") || s.contains("book") || s.contains("set") {
        return Some(AppointmentStatus::Scheduled);
    }
    None
}

pub fn normalize_call_outcome(raw: &str) -> Option<CallOutcome> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if (s.contains("no") && s.contains("show")) || s.contains("dns") || s.contains("did not show")
    {
        return Some(CallOutcome::NoShow);
    }
    if s.contains("no close")
        || s.contains("no-close")
        || s.contains("not closed")
        || s.contains("didn't close")
        || s.contains("lost")
    {
        return Some(CallOutcome::NoClose);
    }
    if s.contains("cancel") {
        return Some(CallOutcome::Canceled);
    }
    if s.contains("follow") {
        return Some(CallOutcome::FollowUp);
    }
    if s.contains("won") || s.contains("close") || s.contains("paid in full") {
        return Some(CallOutcome::ClosedWon);
    }
    None
}

pub fn normalize_lead_status(raw: &str) -> Option<LeadStatus> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.contains("unqualif") || s.contains("disqualif") || s == "dq" {
        return Some(LeadStatus::Unqualified);
    }
    if s.contains("qualif") {
        return Some(LeadStatus::Qualified);
    }
    if s.contains("nurtur") || s.contains("warm") {
        return Some(LeadStatus::Nurturing);
    }
    if s.contains("contact") || s.contains("reach") {
        return Some(LeadStatus::Contacted);
    }
    if s.contains("new") || s.contains("fresh") {
        return Some(LeadStatus::New);
    }
    None
}

pub fn normalize_deal_status(raw: &str) -> Option<DealStatus> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.contains("lost") || s.contains("refund") || s.contains("churn") {
        return Some(DealStatus::Lost);
    }
    if s.contains("won") || s.contains("close") || s.contains("paid") {
        return Some(DealStatus::Won);
    }
    if s.contains("pend") || s.contains("open") || s.contains("progress") {
        return Some(DealStatus::Pending);
    }
    None
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Result of mapping one raw row. A row that fails validation is skipped
/// with a reason; it never aborts the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Record(CanonicalRecord),
    Skip { reason: String },
}

fn empty_fields(kind: EntityKind) -> EntityFields {
    match kind {
        EntityKind::Team => EntityFields::Team(TeamMemberFields::default()),
        EntityKind::Leads => EntityFields::Lead(LeadFields::default()),
        EntityKind::Appointments => EntityFields::Appointment(AppointmentFields::default()),
        EntityKind::Calls => EntityFields::Call(CallFields::default()),
        EntityKind::Deals => EntityFields::Deal(DealFields::default()),
    }
}

/// Apply a stored mapping to one raw row, producing a typed canonical
/// record with provenance attached.
pub fn map_row(
    kind: EntityKind,
    row: &RawRow,
    mappings: &[ColumnMapping],
    connection_id: Uuid,
) -> MapOutcome {
    let mut fields = empty_fields(kind);
    let mut custom_fields = BTreeMap::new();
    let mut date_parts: BTreeMap<String, NaiveDate> = BTreeMap::new();
    let mut time_parts: BTreeMap<String, NaiveTime> = BTreeMap::new();
    let mut external_id: Option<String> = None;
    let mut any_value = false;

    for mapping in mappings {
        let Some(raw) = row.get(&mapping.source_column) else {
            continue;
        };
        if raw.trim().is_empty() {
            continue;
        }
        any_value = true;

        let value = apply_transform(mapping.transformation, raw);
        if value == TransformedValue::Dropped {
            continue;
        }
        if let Some(key) = &mapping.custom_key {
            custom_fields.insert(key.clone(), value_to_string(&value));
            continue;
        }

        let target = slugify(&mapping.target_field, '_');
        match value {
            TransformedValue::DatePart(date) => {
                date_parts.insert(target, date);
            }
            TransformedValue::TimePart(time) => {
                time_parts.insert(target, time);
            }
            other => {
                if target == "id" || target == "external_id" {
                    external_id = Some(value_to_string(&other));
                } else if !set_field(&mut fields, &target, &other) {
                    // Unknown named targets overflow into the custom bag.
                    custom_fields.insert(target, value_to_string(&other));
                }
            }
        }
    }

    if !any_value {
        return MapOutcome::Skip {
            reason: "empty row".into(),
        };
    }

    // Merge buffered date/time halves into one timestamp per target. A date
    // with no time lands at midnight; a time with no date is dropped at the
    // field level.
    for (target, date) in date_parts {
        let time = time_parts
            .remove(&target)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default());
        let stamp = TransformedValue::Stamp(Utc.from_utc_datetime(&date.and_time(time)));
        if !set_field(&mut fields, &target, &stamp) {
            custom_fields.insert(target, value_to_string(&stamp));
        }
    }

    if let Some(reason) = validation_error(kind, &fields) {
        return MapOutcome::Skip {
            reason: reason.to_string(),
        };
    }

    MapOutcome::Record(CanonicalRecord {
        external_id: external_id.unwrap_or_else(|| format!("row-{}", row.row_number)),
        provenance: RowProvenance {
            connection_id,
            source_row_number: row.row_number,
        },
        fields,
        custom_fields,
    })
}

fn validation_error(kind: EntityKind, fields: &EntityFields) -> Option<&'static str> {
    let has_name = fields
        .display_name()
        .map(|n| !n.trim().is_empty())
        .unwrap_or(false);
    let has_email = fields
        .email()
        .map(|e| !e.trim().is_empty())
        .unwrap_or(false);
    match kind {
        EntityKind::Team => (!has_email).then_some("missing required field (email)"),
        _ => (!has_name && !has_email).then_some("missing required field (name or email)"),
    }
}

fn as_text(value: &TransformedValue) -> Option<String> {
    match value {
        TransformedValue::Text(s) => Some(s.clone()),
        TransformedValue::Money(d) => Some(d.to_string()),
        TransformedValue::Stamp(dt) => Some(dt.to_rfc3339()),
        _ => None,
    }
}

fn as_money(value: &TransformedValue) -> Option<Decimal> {
    match value {
        TransformedValue::Money(d) => Some(*d),
        TransformedValue::Text(s) => parse_currency(s),
        _ => None,
    }
}

fn as_stamp(value: &TransformedValue) -> Option<DateTime<Utc>> {
    match value {
        TransformedValue::Stamp(dt) => Some(*dt),
        TransformedValue::Text(s) => parse_datetime(s),
        _ => None,
    }
}

/// Assign a transformed value to a named canonical field. Returns false when
/// the entity has no such field, so the caller can overflow to the custom
/// bag instead.
fn set_field(fields: &mut EntityFields, target: &str, value: &TransformedValue) -> bool {
    match fields {
        EntityFields::Team(f) => match target {
            "full_name" | "name" => f.full_name = as_text(value),
            "email" => f.email = as_text(value),
            "phone" => f.phone = as_text(value),
            "role" => f.role = as_text(value),
            _ => return false,
        },
        EntityFields::Lead(f) => match target {
            "name" | "full_name" | "lead_name" => f.name = as_text(value),
            "email" | "lead_email" => f.email = as_text(value),
            "phone" => f.phone = as_text(value),
            "source" | "lead_source" => f.source = as_text(value),
            "status" => f.status = as_text(value).and_then(|s| normalize_lead_status(&s)),
            "notes" => f.notes = as_text(value),
            _ => return false,
        },
        EntityFields::Appointment(f) => match target {
            "lead_name" | "name" | "full_name" => f.lead_name = as_text(value),
            "lead_email" | "email" => f.lead_email = as_text(value),
            "phone" => f.phone = as_text(value),
            "scheduled_at" | "date" | "datetime" => f.scheduled_at = as_stamp(value),
            "setter_name" | "setter" => f.setter_name = as_text(value),
            "closer_name" | "closer" => f.closer_name = as_text(value),
            "status" => {
                f.status = as_text(value).and_then(|s| normalize_appointment_status(&s))
            }
            "call_outcome" | "call_result" | "result" => {
                f.call_outcome = as_text(value).and_then(|s| normalize_call_outcome(&s))
            }
            "revenue" => f.revenue = as_money(value),
            "cash_collected" | "cash" => f.cash_collected = as_money(value),
            "payment_platform" | "payment" => f.payment_platform = as_text(value),
            "notes" => f.notes = as_text(value),
            _ => return false,
        },
        EntityFields::Call(f) => match target {
            "lead_name" | "name" | "full_name" => f.lead_name = as_text(value),
            "lead_email" | "email" => f.lead_email = as_text(value),
            "phone" => f.phone = as_text(value),
            "called_at" | "date" | "datetime" => f.called_at = as_stamp(value),
            "outcome" | "result" | "status" => {
                f.outcome = as_text(value).and_then(|s| normalize_call_outcome(&s))
            }
            "setter_name" | "setter" => f.setter_name = as_text(value),
            "notes" => f.notes = as_text(value),
            _ => return false,
        },
        EntityFields::Deal(f) => match target {
            "lead_name" | "name" | "full_name" => f.lead_name = as_text(value),
            "lead_email" | "email" => f.lead_email = as_text(value),
            "closed_at" | "date" | "datetime" => f.closed_at = as_stamp(value),
            "revenue" => f.revenue = as_money(value),
            "cash_collected" | "cash" => f.cash_collected = as_money(value),
            "payment_platform" | "payment" => f.payment_platform = as_text(value),
            "setter_name" | "setter" => f.setter_name = as_text(value),
            "closer_name" | "closer" => f.closer_name = as_text(value),
            "status" => f.status = as_text(value).and_then(|s| normalize_deal_status(&s)),
            _ => return false,
        },
    }
    true
}

// ---------------------------------------------------------------------------
// Entity type detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedKind {
    pub kind: EntityKind,
    pub confidence: f64,
}

const KIND_KEYWORDS: [(EntityKind, &[(&str, f64)]); 5] = [
    (
        EntityKind::Appointments,
        &[
            ("appointment", 3.0),
            ("appt", 3.0),
            ("setter", 2.0),
            ("closer", 2.0),
            ("scheduled", 2.0),
            ("booked", 1.5),
            ("show", 1.0),
            ("cash collected", 1.5),
            ("call result", 1.5),
        ],
    ),
    (
        EntityKind::Leads,
        &[
            ("lead", 3.0),
            ("source", 1.5),
            ("interest", 1.0),
            ("opt in", 1.5),
            ("funnel", 1.0),
        ],
    ),
    (
        EntityKind::Team,
        &[
            ("team", 3.0),
            ("member", 2.0),
            ("role", 2.0),
            ("rep", 1.0),
            ("hire", 1.0),
        ],
    ),
    (
        EntityKind::Calls,
        &[
            ("call", 2.0),
            ("dial", 2.0),
            ("duration", 2.0),
            ("connected", 1.5),
            ("voicemail", 1.5),
        ],
    ),
    (
        EntityKind::Deals,
        &[
            ("deal", 3.0),
            ("revenue", 1.5),
            ("contract", 2.0),
            ("payment", 1.0),
            ("mrr", 1.5),
            ("closed", 1.0),
        ],
    ),
];

/// Weighted keyword classifier over header text. Returns `None` when no
/// keyword matches at all.
pub fn detect_entity_kind(headers: &[String]) -> Option<DetectedKind> {
    let text = headers
        .iter()
        .map(|h| slugify(h, ' '))
        .collect::<Vec<_>>()
        .join(" ");

    let mut best: Option<(EntityKind, f64)> = None;
    let mut total = 0.0;
    for (kind, keywords) in KIND_KEYWORDS {
        let score: f64 = keywords
            .iter()
            .filter(|(keyword, _)| text.contains(keyword))
            .map(|(_, weight)| weight)
            .sum();
        total += score;
        if score > 0.0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((kind, score));
        }
    }

    best.map(|(kind, score)| DetectedKind {
        kind,
        confidence: (score / total.max(score) * 100.0).clamp(0.0, 100.0),
    })
}

// ---------------------------------------------------------------------------
// Mapping suggestion port
// ---------------------------------------------------------------------------

/// Confidence as external collaborators encode it: numeric 0-100 or a
/// coarse high/medium/low label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfidenceValue {
    Number(f64),
    Label(String),
}

/// Reconcile confidence encodings into one numeric 0-100 scale.
pub fn normalize_confidence(value: Option<&ConfidenceValue>) -> f64 {
    match value {
        None => 50.0,
        Some(ConfidenceValue::Number(n)) => n.clamp(0.0, 100.0),
        Some(ConfidenceValue::Label(label)) => match label.trim().to_ascii_lowercase().as_str() {
            "high" => 90.0,
            "medium" => 60.0,
            "low" => 30.0,
            other => other.parse::<f64>().map(|n| n.clamp(0.0, 100.0)).unwrap_or(50.0),
        },
    }
}

/// Suggested mapping entry as produced by an external collaborator; accepts
/// both snake_case and camelCase key spellings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSuggestedMapping {
    #[serde(alias = "sourceColumn")]
    pub source_column: String,
    #[serde(alias = "targetField")]
    pub target_field: String,
    #[serde(default)]
    pub confidence: Option<ConfidenceValue>,
    #[serde(default, alias = "transform")]
    pub transformation: Option<String>,
    #[serde(default, alias = "customKey")]
    pub custom_key: Option<String>,
}

fn parse_transform(name: &str) -> Option<Transform> {
    match name.trim() {
        "trim" => Some(Transform::Trim),
        "lowercase_trim" | "lowercaseTrim" => Some(Transform::LowercaseTrim),
        "clean_phone" | "cleanPhone" => Some(Transform::CleanPhone),
        "parse_currency" | "parseCurrency" => Some(Transform::ParseCurrency),
        "skip_if_placeholder" | "skipIfPlaceholder" => Some(Transform::SkipIfPlaceholder),
        "combine_datetime" | "combineDatetime" => Some(Transform::CombineDatetime),
        _ => None,
    }
}

pub fn mapping_from_raw(raw: &RawSuggestedMapping) -> ColumnMapping {
    ColumnMapping {
        source_column: raw.source_column.clone(),
        target_field: raw.target_field.clone(),
        confidence: normalize_confidence(raw.confidence.as_ref()),
        transformation: raw.transformation.as_deref().and_then(parse_transform),
        custom_key: raw.custom_key.clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingSuggestion {
    pub entity_kind: EntityKind,
    pub confidence: f64,
    pub mappings: Vec<ColumnMapping>,
    pub warnings: Vec<String>,
    pub suggested_defaults: BTreeMap<String, String>,
}

/// External collaborator proposing header-to-field mappings. Advisory only:
/// the pipeline works even when suggestions are low-confidence or wrong,
/// because the user reviews mappings before a connection goes active.
#[async_trait]
pub trait MappingSuggestionPort: Send + Sync {
    async fn suggest(
        &self,
        hint: Option<EntityKind>,
        headers: &[String],
        sample_rows: &[RawRow],
    ) -> Result<MappingSuggestion, SyncError>;
}

/// Cross-check a suggestion's entity kind against the header heuristic;
/// disagreement lowers confidence and leaves a warning for the review step.
pub fn cross_check_kind(suggestion: &mut MappingSuggestion, headers: &[String]) {
    if let Some(detected) = detect_entity_kind(headers) {
        if detected.kind != suggestion.entity_kind {
            suggestion.warnings.push(format!(
                "header heuristic detected {} but the suggestion says {}",
                detected.kind, suggestion.entity_kind
            ));
            suggestion.confidence = suggestion.confidence.min(50.0);
        }
    }
}

/// Built-in rule-engine suggestion port: exact synonyms, fuzzy header
/// matching, and date/time pair detection. The AI-backed implementation
/// lives behind the same trait outside this repo.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleSuggestionPort;

fn timestamp_target(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Appointments => Some("scheduled_at"),
        EntityKind::Calls => Some("called_at"),
        EntityKind::Deals => Some("closed_at"),
        _ => None,
    }
}

fn field_candidates(kind: EntityKind) -> &'static [(&'static str, Option<Transform>)] {
    match kind {
        EntityKind::Team => &[
            ("full_name", Some(Transform::Trim)),
            ("email", Some(Transform::LowercaseTrim)),
            ("phone", Some(Transform::CleanPhone)),
            ("role", Some(Transform::LowercaseTrim)),
        ],
        EntityKind::Leads => &[
            ("name", Some(Transform::Trim)),
            ("email", Some(Transform::LowercaseTrim)),
            ("phone", Some(Transform::CleanPhone)),
            ("source", Some(Transform::Trim)),
            ("status", Some(Transform::Trim)),
            ("notes", Some(Transform::Trim)),
        ],
        EntityKind::Appointments => &[
            ("lead_name", Some(Transform::Trim)),
            ("lead_email", Some(Transform::LowercaseTrim)),
            ("phone", Some(Transform::CleanPhone)),
            ("setter_name", Some(Transform::Trim)),
            ("closer_name", Some(Transform::Trim)),
            ("status", Some(Transform::Trim)),
            ("call_outcome", Some(Transform::Trim)),
            ("revenue", Some(Transform::ParseCurrency)),
            ("cash_collected", Some(Transform::ParseCurrency)),
            ("payment_platform", Some(Transform::Trim)),
            ("notes", Some(Transform::Trim)),
        ],
        EntityKind::Calls => &[
            ("lead_name", Some(Transform::Trim)),
            ("lead_email", Some(Transform::LowercaseTrim)),
            ("phone", Some(Transform::CleanPhone)),
            ("outcome", Some(Transform::Trim)),
            ("setter_name", Some(Transform::Trim)),
            ("notes", Some(Transform::Trim)),
        ],
        EntityKind::Deals => &[
            ("lead_name", Some(Transform::Trim)),
            ("lead_email", Some(Transform::LowercaseTrim)),
            ("revenue", Some(Transform::ParseCurrency)),
            ("cash_collected", Some(Transform::ParseCurrency)),
            ("payment_platform", Some(Transform::Trim)),
            ("setter_name", Some(Transform::Trim)),
            ("closer_name", Some(Transform::Trim)),
            ("status", Some(Transform::Trim)),
        ],
    }
}

// Header spellings seen in the wild that an edit-distance match misses.
const HEADER_SYNONYMS: [(&str, &str); 14] = [
    ("full name", "full_name"),
    ("name", "lead_name"),
    ("client name", "lead_name"),
    ("prospect", "lead_name"),
    ("email address", "email"),
    ("e mail", "email"),
    ("phone number", "phone"),
    ("cell", "phone"),
    ("setter", "setter_name"),
    ("closer", "closer_name"),
    ("result", "call_outcome"),
    ("call result", "call_outcome"),
    ("cash", "cash_collected"),
    ("lead source", "source"),
];

const FUZZY_MATCH_THRESHOLD: f64 = 0.87;

fn suggest_for_header(
    kind: EntityKind,
    header: &str,
) -> Option<(String, Option<Transform>, f64)> {
    let slug = slugify(header, '_');
    let spaced = slugify(header, ' ');
    let candidates = field_candidates(kind);

    if let Some((field, transform)) = candidates.iter().find(|(field, _)| *field == slug) {
        return Some((field.to_string(), *transform, 95.0));
    }
    if let Some((_, target)) = HEADER_SYNONYMS.iter().find(|(from, _)| *from == spaced) {
        // Synonym targets are generic; pick the entity's own spelling when
        // the exact field does not exist on this kind.
        let resolved = candidates
            .iter()
            .find(|(field, _)| field == target || field.ends_with(target))
            .or_else(|| {
                candidates
                    .iter()
                    .find(|(field, _)| target.ends_with(*field) || field.contains(target))
            });
        if let Some((field, transform)) = resolved {
            return Some((field.to_string(), *transform, 90.0));
        }
    }
    let mut best: Option<(&str, Option<Transform>, f64)> = None;
    for (field, transform) in candidates {
        let score = jaro_winkler(&slug, field);
        if score >= FUZZY_MATCH_THRESHOLD && best.map(|(_, _, s)| score > s).unwrap_or(true) {
            best = Some((*field, *transform, score));
        }
    }
    best.map(|(field, transform, score)| {
        (
            field.to_string(),
            transform,
            (55.0 + 40.0 * (score - FUZZY_MATCH_THRESHOLD) / (1.0 - FUZZY_MATCH_THRESHOLD))
                .clamp(0.0, 95.0),
        )
    })
}

fn suggested_defaults_for(kind: EntityKind) -> BTreeMap<String, String> {
    let mut defaults = BTreeMap::new();
    match kind {
        EntityKind::Leads => {
            defaults.insert("status".into(), "new".into());
        }
        EntityKind::Appointments => {
            defaults.insert("status".into(), "scheduled".into());
        }
        EntityKind::Deals => {
            defaults.insert("status".into(), "pending".into());
        }
        _ => {}
    }
    defaults
}

#[async_trait]
impl MappingSuggestionPort for RuleSuggestionPort {
    async fn suggest(
        &self,
        hint: Option<EntityKind>,
        headers: &[String],
        _sample_rows: &[RawRow],
    ) -> Result<MappingSuggestion, SyncError> {
        let detected = detect_entity_kind(headers);
        let entity_kind = hint
            .or(detected.map(|d| d.kind))
            .ok_or_else(|| {
                SyncError::SuggestionUnavailable("no entity kind detectable from headers".into())
            })?;
        let confidence = detected
            .filter(|d| d.kind == entity_kind)
            .map(|d| d.confidence)
            .unwrap_or(50.0);

        let mut warnings = Vec::new();
        let mut mappings = Vec::new();
        for header in headers {
            if header.trim().is_empty() {
                continue;
            }
            let spaced = slugify(header, ' ');
            let is_date = spaced.contains("date") || spaced == "day";
            let is_time = !is_date && spaced.contains("time");
            if is_date || is_time {
                if let Some(target) = timestamp_target(entity_kind) {
                    mappings.push(ColumnMapping {
                        source_column: header.clone(),
                        target_field: target.to_string(),
                        confidence: 85.0,
                        transformation: Some(Transform::CombineDatetime),
                        custom_key: None,
                    });
                    continue;
                }
            }
            match suggest_for_header(entity_kind, header) {
                Some((target_field, transformation, confidence)) => {
                    mappings.push(ColumnMapping {
                        source_column: header.clone(),
                        target_field,
                        confidence,
                        transformation,
                        custom_key: None,
                    });
                }
                None => {
                    warnings.push(format!("no canonical field matched header {header:?}"));
                    mappings.push(ColumnMapping {
                        source_column: header.clone(),
                        target_field: "custom".to_string(),
                        confidence: 30.0,
                        transformation: Some(Transform::Trim),
                        custom_key: Some(slugify(header, '_')),
                    });
                }
            }
        }

        let mut suggestion = MappingSuggestion {
            entity_kind,
            confidence,
            mappings,
            warnings,
            suggested_defaults: suggested_defaults_for(entity_kind),
        };
        cross_check_kind(&mut suggestion, headers);
        Ok(suggestion)
    }
}
