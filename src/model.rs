//! Core record types shared between the protocol, store, and sync layers
//!
//! Parsers produce [`PatientRecord`]s and [`ResultRecord`]s, the store
//! assigns ids and owns identity resolution, and the sync engine flips
//! sync status after confirmed upstream acceptance. Records are never
//! deleted by this crate; retention is an external concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Patient sex, normalized from vendor tokens
///
/// Analyzers send `M`/`F`/`U`/`O` in various cases and occasionally the
/// spelled-out words. Anything unrecognized maps to [`Sex::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Unknown,
    Other,
}

impl Sex {
    /// Normalize a vendor token
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "M" | "MALE" => Sex::Male,
            "F" | "FEMALE" => Sex::Female,
            "O" | "OTHER" => Sex::Other,
            _ => Sex::Unknown,
        }
    }

    /// Single-letter wire form
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Unknown => "U",
            Sex::Other => "O",
        }
    }
}

impl Default for Sex {
    fn default() -> Self {
        Sex::Unknown
    }
}

/// Per-record synchronization state
///
/// Monotonic: a record moves `Local` -> `Synced` exactly once and never
/// reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Captured locally, not yet accepted upstream
    Local,
    /// Confirmed accepted by the remote endpoint
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Local => "local",
            SyncStatus::Synced => "synced",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => SyncStatus::Synced,
            _ => SyncStatus::Local,
        }
    }
}

/// A result value: numeric when it parses as a float, verbatim text otherwise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Numeric(f64),
    Text(String),
}

impl ResultValue {
    /// Parse a raw field, preferring the numeric interpretation
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(v) => ResultValue::Numeric(v),
            Err(_) => ResultValue::Text(trimmed.to_string()),
        }
    }

    /// Numeric value, if this result parsed as one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResultValue::Numeric(v) => Some(*v),
            ResultValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for ResultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultValue::Numeric(v) => write!(f, "{}", v),
            ResultValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Demographics extracted from one decoded message, before the store has
/// assigned an id
///
/// Identity resolution happens in the store: match by
/// `external_patient_id` when non-empty, else by `sample_id`; no match
/// inserts a new row. An empty patient id with a sample id present makes
/// the sample id the identity.
#[derive(Debug, Clone, Default)]
pub struct PatientDraft {
    /// Analyzer-supplied patient id; may be empty
    pub external_patient_id: String,
    /// Specimen id, fallback identity when the patient id is absent
    pub sample_id: String,
    pub name: String,
    /// ISO `YYYY-MM-DD` when the vendor token parsed, raw token otherwise
    pub date_of_birth: String,
    pub sex: Sex,
    pub physician: String,
    /// Verbatim message, kept for audit
    pub raw_payload: String,
}

/// A stored patient row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: i64,
    pub external_patient_id: String,
    pub sample_id: String,
    pub name: String,
    pub date_of_birth: String,
    pub sex: Sex,
    pub physician: String,
    pub raw_payload: String,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
}

/// A stored result row, owned by a patient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: i64,
    pub patient_id: i64,
    pub test_code: String,
    pub value: ResultValue,
    pub unit: String,
    /// Abnormal-flag text, vendor-mapped to a normalized vocabulary where known
    pub flags: String,
    /// Original message order; results sort by numeric sequence, then timestamp
    pub sequence: String,
    pub timestamp: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

/// Outcome class of one sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Success,
    Failed,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Error => "error",
        }
    }
}

/// One row of the append-only sync audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub timestamp: DateTime<Utc>,
    pub status: AttemptStatus,
    pub message: String,
    pub records_synced: usize,
}

/// Observer interface for events the core emits toward its host
///
/// Replaces ad-hoc callback plumbing with one explicit trait. All methods
/// default to no-ops; the core calls them synchronously and never depends
/// on a concrete presentation type.
pub trait LinkObserver: Send + Sync {
    /// A patient row was inserted or updated
    fn on_patient_updated(&self, _patient: &PatientRecord) {}

    /// A result row was inserted or its sync status changed
    fn on_result_updated(&self, _result: &ResultRecord) {}

    /// The number of live analyzer connections changed
    fn on_connection_count(&self, _count: usize) {}

    /// A noteworthy lifecycle event, already emitted through `tracing`,
    /// mirrored for hosts that surface connection activity in a UI
    fn on_log(&self, _level: tracing::Level, _message: &str) {}
}

/// Observer that ignores every event
#[derive(Debug, Default)]
pub struct NullObserver;

impl LinkObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sex_normalization() {
        assert_eq!(Sex::from_token("M"), Sex::Male);
        assert_eq!(Sex::from_token("f"), Sex::Female);
        assert_eq!(Sex::from_token("Female"), Sex::Female);
        assert_eq!(Sex::from_token("o"), Sex::Other);
        assert_eq!(Sex::from_token(""), Sex::Unknown);
        assert_eq!(Sex::from_token("X"), Sex::Unknown);
    }

    #[test]
    fn test_result_value_numeric() {
        assert_eq!(ResultValue::parse("8.76"), ResultValue::Numeric(8.76));
        assert_eq!(ResultValue::parse(" 42 "), ResultValue::Numeric(42.0));
    }

    #[test]
    fn test_result_value_text_fallback() {
        assert_eq!(
            ResultValue::parse("POSITIVE"),
            ResultValue::Text("POSITIVE".to_string())
        );
        assert_eq!(ResultValue::parse(">1000").as_f64(), None);
    }

    #[test]
    fn test_sync_status_round_trip() {
        assert_eq!(SyncStatus::from_str("local"), SyncStatus::Local);
        assert_eq!(SyncStatus::from_str("synced"), SyncStatus::Synced);
        assert_eq!(SyncStatus::from_str("garbage"), SyncStatus::Local);
    }

    #[test]
    fn test_result_value_serializes_untagged() {
        let n = serde_json::to_string(&ResultValue::Numeric(8.76)).unwrap();
        assert_eq!(n, "8.76");
        let t = serde_json::to_string(&ResultValue::Text("POS".into())).unwrap();
        assert_eq!(t, "\"POS\"");
    }
}
