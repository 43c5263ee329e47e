//! Persistence gateway contract
//!
//! Parsers and the sync engine share one [`ResultStore`]; writes that
//! touch the same patient identity are serialized inside the
//! implementation so an upsert-by-identity followed by result inserts is
//! atomic per patient even under concurrent sessions.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{
    AttemptStatus, PatientDraft, PatientRecord, ResultRecord, ResultValue, SyncAttempt, SyncStatus,
};
use chrono::{DateTime, Utc};

/// Persistence gateway consumed by the core
///
/// Records are mutated only to flip sync status local -> synced; nothing
/// in this crate deletes them.
pub trait ResultStore: Send + Sync {
    /// Insert or update a patient by identity resolution: match on
    /// `external_patient_id` when non-empty, else on `sample_id`; insert
    /// when neither matches. Returns the store id.
    fn upsert_patient(&self, draft: &PatientDraft) -> Result<i64>;

    /// Update an already-resolved patient row in place
    ///
    /// Used when the parser has the store id and later records enrich the
    /// demographics (order-derived ids, the final audit payload); bypasses
    /// identity resolution so a row with empty identifiers cannot fork.
    fn update_patient(&self, id: i64, draft: &PatientDraft) -> Result<()>;

    /// Insert one result owned by `patient_id`
    #[allow(clippy::too_many_arguments)]
    fn add_result(
        &self,
        patient_id: i64,
        test_code: &str,
        value: &ResultValue,
        unit: &str,
        flags: &str,
        timestamp: DateTime<Utc>,
        sequence: &str,
    ) -> Result<i64>;

    fn patient(&self, id: i64) -> Result<Option<PatientRecord>>;

    /// Results for one patient ordered by numeric sequence, then timestamp
    fn patient_results(&self, patient_id: i64) -> Result<Vec<ResultRecord>>;

    /// All results in the given sync state, up to `limit`
    fn results_by_sync_status(&self, status: SyncStatus, limit: usize) -> Result<Vec<ResultRecord>>;

    fn mark_patient_synced(&self, id: i64) -> Result<()>;

    fn mark_result_synced(&self, id: i64) -> Result<()>;

    /// Append one row to the sync audit log
    fn record_sync_attempt(&self, status: AttemptStatus, message: &str, count: usize)
        -> Result<()>;

    /// Audit log, newest first
    fn sync_attempts(&self, limit: usize) -> Result<Vec<SyncAttempt>>;
}
