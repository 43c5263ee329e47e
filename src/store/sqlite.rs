//! SQLite-backed persistence gateway
//!
//! One connection guarded by a mutex: every call runs under the lock, so
//! the identity upsert and the result inserts that follow it are
//! serialized per store and concurrent sessions cannot race a patient
//! into duplicate rows.

use crate::error::Result;
use crate::model::{
    AttemptStatus, PatientDraft, PatientRecord, ResultRecord, ResultValue, SyncAttempt, Sex,
    SyncStatus,
};
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS patients (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    external_patient_id TEXT NOT NULL DEFAULT '',
    sample_id           TEXT NOT NULL DEFAULT '',
    name                TEXT NOT NULL DEFAULT '',
    date_of_birth       TEXT NOT NULL DEFAULT '',
    sex                 TEXT NOT NULL DEFAULT 'U',
    physician           TEXT NOT NULL DEFAULT '',
    raw_payload         TEXT NOT NULL DEFAULT '',
    sync_status         TEXT NOT NULL DEFAULT 'local',
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_patients_external ON patients(external_patient_id);
CREATE INDEX IF NOT EXISTS idx_patients_sample ON patients(sample_id);

CREATE TABLE IF NOT EXISTS results (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id  INTEGER NOT NULL REFERENCES patients(id),
    test_code   TEXT NOT NULL DEFAULT '',
    value       TEXT NOT NULL DEFAULT '',
    unit        TEXT NOT NULL DEFAULT '',
    flags       TEXT NOT NULL DEFAULT '',
    sequence    TEXT NOT NULL DEFAULT '',
    timestamp   TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'local'
);
CREATE INDEX IF NOT EXISTS idx_results_patient ON results(patient_id);
CREATE INDEX IF NOT EXISTS idx_results_sync ON results(sync_status);

CREATE TABLE IF NOT EXISTS sync_attempts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp      TEXT NOT NULL,
    status         TEXT NOT NULL,
    message        TEXT NOT NULL DEFAULT '',
    records_synced INTEGER NOT NULL DEFAULT 0
);
";

/// SQLite implementation of [`ResultStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.as_ref().display(), "Result store opened");
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-write;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<PatientRecord> {
        let sex: String = row.get(5)?;
        let created: String = row.get(9)?;
        let status: String = row.get(8)?;
        Ok(PatientRecord {
            id: row.get(0)?,
            external_patient_id: row.get(1)?,
            sample_id: row.get(2)?,
            name: row.get(3)?,
            date_of_birth: row.get(4)?,
            sex: Sex::from_token(&sex),
            physician: row.get(6)?,
            raw_payload: row.get(7)?,
            sync_status: SyncStatus::from_str(&status),
            created_at: parse_ts(&created),
        })
    }

    fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultRecord> {
        let value: String = row.get(2)?;
        let ts: String = row.get(7)?;
        let status: String = row.get(8)?;
        Ok(ResultRecord {
            id: row.get(0)?,
            patient_id: row.get(1)?,
            value: ResultValue::parse(&value),
            test_code: row.get(3)?,
            unit: row.get(4)?,
            flags: row.get(5)?,
            sequence: row.get(6)?,
            timestamp: parse_ts(&ts),
            sync_status: SyncStatus::from_str(&status),
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const RESULT_COLUMNS: &str =
    "id, patient_id, value, test_code, unit, flags, sequence, timestamp, sync_status";

impl ResultStore for SqliteStore {
    fn upsert_patient(&self, draft: &PatientDraft) -> Result<i64> {
        let conn = self.lock();

        let existing: Option<i64> = if !draft.external_patient_id.is_empty() {
            conn.query_row(
                "SELECT id FROM patients WHERE external_patient_id = ?1",
                params![draft.external_patient_id],
                |row| row.get(0),
            )
            .ok()
        } else {
            None
        };

        let existing = match existing {
            Some(id) => Some(id),
            None if !draft.sample_id.is_empty() => conn
                .query_row(
                    "SELECT id FROM patients WHERE sample_id = ?1",
                    params![draft.sample_id],
                    |row| row.get(0),
                )
                .ok(),
            None => None,
        };

        match existing {
            Some(id) => {
                // Fill in fields learned later, never blank one out
                conn.execute(
                    "UPDATE patients SET
                        external_patient_id = CASE WHEN ?1 = '' THEN external_patient_id ELSE ?1 END,
                        sample_id = CASE WHEN ?2 = '' THEN sample_id ELSE ?2 END,
                        name = CASE WHEN ?3 = '' THEN name ELSE ?3 END,
                        date_of_birth = CASE WHEN ?4 = '' THEN date_of_birth ELSE ?4 END,
                        sex = CASE WHEN ?5 = 'U' THEN sex ELSE ?5 END,
                        physician = CASE WHEN ?6 = '' THEN physician ELSE ?6 END,
                        raw_payload = CASE WHEN ?7 = '' THEN raw_payload ELSE ?7 END
                     WHERE id = ?8",
                    params![
                        draft.external_patient_id,
                        draft.sample_id,
                        draft.name,
                        draft.date_of_birth,
                        draft.sex.as_str(),
                        draft.physician,
                        draft.raw_payload,
                        id
                    ],
                )?;
                debug!(patient_id = id, "Patient updated");
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO patients
                        (external_patient_id, sample_id, name, date_of_birth, sex,
                         physician, raw_payload, sync_status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'local', ?8)",
                    params![
                        draft.external_patient_id,
                        draft.sample_id,
                        draft.name,
                        draft.date_of_birth,
                        draft.sex.as_str(),
                        draft.physician,
                        draft.raw_payload,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                let id = conn.last_insert_rowid();
                debug!(patient_id = id, external_id = %draft.external_patient_id, "Patient inserted");
                Ok(id)
            }
        }
    }

    fn update_patient(&self, id: i64, draft: &PatientDraft) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE patients SET
                external_patient_id = CASE WHEN ?1 = '' THEN external_patient_id ELSE ?1 END,
                sample_id = CASE WHEN ?2 = '' THEN sample_id ELSE ?2 END,
                name = CASE WHEN ?3 = '' THEN name ELSE ?3 END,
                date_of_birth = CASE WHEN ?4 = '' THEN date_of_birth ELSE ?4 END,
                sex = CASE WHEN ?5 = 'U' THEN sex ELSE ?5 END,
                physician = CASE WHEN ?6 = '' THEN physician ELSE ?6 END,
                raw_payload = CASE WHEN ?7 = '' THEN raw_payload ELSE ?7 END
             WHERE id = ?8",
            params![
                draft.external_patient_id,
                draft.sample_id,
                draft.name,
                draft.date_of_birth,
                draft.sex.as_str(),
                draft.physician,
                draft.raw_payload,
                id
            ],
        )?;
        debug!(patient_id = id, "Patient updated in place");
        Ok(())
    }

    fn add_result(
        &self,
        patient_id: i64,
        test_code: &str,
        value: &ResultValue,
        unit: &str,
        flags: &str,
        timestamp: DateTime<Utc>,
        sequence: &str,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO results
                (patient_id, test_code, value, unit, flags, sequence, timestamp, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'local')",
            params![
                patient_id,
                test_code,
                value.to_string(),
                unit,
                flags,
                sequence,
                timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(result_id = id, patient_id, test_code, "Result inserted");
        Ok(id)
    }

    fn patient(&self, id: i64) -> Result<Option<PatientRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, external_patient_id, sample_id, name, date_of_birth, sex,
                    physician, raw_payload, sync_status, created_at
             FROM patients WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Self::patient_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn patient_results(&self, patient_id: i64) -> Result<Vec<ResultRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM results WHERE patient_id = ?1
             ORDER BY CAST(sequence AS INTEGER), timestamp"
        ))?;
        let rows = stmt.query_map(params![patient_id], Self::result_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn results_by_sync_status(&self, status: SyncStatus, limit: usize) -> Result<Vec<ResultRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM results WHERE sync_status = ?1
             ORDER BY id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], Self::result_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn mark_patient_synced(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE patients SET sync_status = 'synced' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn mark_result_synced(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE results SET sync_status = 'synced' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn record_sync_attempt(
        &self,
        status: AttemptStatus,
        message: &str,
        count: usize,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sync_attempts (timestamp, status, message, records_synced)
             VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), status.as_str(), message, count as i64],
        )?;
        Ok(())
    }

    fn sync_attempts(&self, limit: usize) -> Result<Vec<SyncAttempt>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, status, message, records_synced
             FROM sync_attempts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(0)?;
            let status: String = row.get(1)?;
            let count: i64 = row.get(3)?;
            Ok(SyncAttempt {
                timestamp: parse_ts(&ts),
                status: match status.as_str() {
                    "success" => AttemptStatus::Success,
                    "failed" => AttemptStatus::Failed,
                    _ => AttemptStatus::Error,
                },
                message: row.get(2)?,
                records_synced: count as usize,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(external: &str, sample: &str, name: &str) -> PatientDraft {
        PatientDraft {
            external_patient_id: external.to_string(),
            sample_id: sample.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_matches_external_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_patient(&draft("475371", "S1", "HARRIET ADUKO")).unwrap();
        let b = store.upsert_patient(&draft("475371", "S2", "HARRIET ADUKO")).unwrap();
        assert_eq!(a, b);
        // Sample id was refreshed in place
        assert_eq!(store.patient(a).unwrap().unwrap().sample_id, "S2");
    }

    #[test]
    fn test_upsert_falls_back_to_sample_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_patient(&draft("", "S77", "UNKNOWN")).unwrap();
        // Same sample id, patient id learned later: row gains the id
        let b = store.upsert_patient(&draft("990012", "S77", "JANE DOE")).unwrap();
        assert_eq!(a, b);
        let p = store.patient(a).unwrap().unwrap();
        assert_eq!(p.external_patient_id, "990012");
        assert_eq!(p.name, "JANE DOE");
    }

    #[test]
    fn test_distinct_identities_insert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_patient(&draft("1", "SA", "A")).unwrap();
        let b = store.upsert_patient(&draft("2", "SB", "B")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_results_ordered_by_numeric_sequence() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pid = store.upsert_patient(&draft("7", "S7", "P")).unwrap();
        let now = Utc::now();
        store
            .add_result(pid, "HGB", &ResultValue::Numeric(13.2), "g/dL", "N", now, "2")
            .unwrap();
        store
            .add_result(pid, "WBC", &ResultValue::Numeric(8.76), "10*3/uL", "N", now, "1")
            .unwrap();
        store
            .add_result(pid, "PLT", &ResultValue::Numeric(250.0), "10*3/uL", "N", now, "10")
            .unwrap();

        let results = store.patient_results(pid).unwrap();
        let seqs: Vec<&str> = results.iter().map(|r| r.sequence.as_str()).collect();
        // Numeric ordering, not lexicographic: 1, 2, 10
        assert_eq!(seqs, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_sync_status_sweep_and_mark() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pid = store.upsert_patient(&draft("9", "S9", "P")).unwrap();
        let rid = store
            .add_result(pid, "WBC", &ResultValue::Numeric(5.0), "", "N", Utc::now(), "1")
            .unwrap();

        assert_eq!(store.results_by_sync_status(SyncStatus::Local, 100).unwrap().len(), 1);
        store.mark_result_synced(rid).unwrap();
        assert!(store.results_by_sync_status(SyncStatus::Local, 100).unwrap().is_empty());
        let synced = store.results_by_sync_status(SyncStatus::Synced, 100).unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_sync_attempt_log_is_append_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.record_sync_attempt(AttemptStatus::Failed, "timeout", 0).unwrap();
        store.record_sync_attempt(AttemptStatus::Success, "ok", 3).unwrap();
        let attempts = store.sync_attempts(10).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, AttemptStatus::Success);
        assert_eq!(attempts[0].records_synced, 3);
        assert_eq!(attempts[1].status, AttemptStatus::Failed);
    }

    #[test]
    fn test_update_patient_sparse_draft_keeps_sex() {
        let store = SqliteStore::open_in_memory().unwrap();
        let full = PatientDraft {
            sex: Sex::Female,
            ..draft("880011", "S-42", "AMA OWUSU")
        };
        let id = store.upsert_patient(&full).unwrap();

        // An enrichment carrying only a sample id must not touch sex
        let sparse = PatientDraft {
            sample_id: "S-777".to_string(),
            ..Default::default()
        };
        store.update_patient(id, &sparse).unwrap();

        let p = store.patient(id).unwrap().unwrap();
        assert_eq!(p.sex, Sex::Female);
        assert_eq!(p.sample_id, "S-777");
    }

    #[test]
    fn test_upsert_sparse_rematch_keeps_demographics() {
        let store = SqliteStore::open_in_memory().unwrap();
        let full = PatientDraft {
            date_of_birth: "1990-07-12".to_string(),
            sex: Sex::Female,
            physician: "DR.BADU".to_string(),
            ..draft("880011", "S-42", "AMA OWUSU")
        };
        let a = store.upsert_patient(&full).unwrap();

        // Later message for the same identity with sparse demographics
        let b = store.upsert_patient(&draft("880011", "", "")).unwrap();
        assert_eq!(a, b);

        let p = store.patient(a).unwrap().unwrap();
        assert_eq!(p.name, "AMA OWUSU");
        assert_eq!(p.date_of_birth, "1990-07-12");
        assert_eq!(p.sex, Sex::Female);
        assert_eq!(p.physician, "DR.BADU");
    }

    #[test]
    fn test_text_value_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pid = store.upsert_patient(&draft("3", "S3", "P")).unwrap();
        store
            .add_result(pid, "HIV", &ResultValue::Text("NEGATIVE".into()), "", "N", Utc::now(), "1")
            .unwrap();
        let results = store.patient_results(pid).unwrap();
        assert_eq!(results[0].value, ResultValue::Text("NEGATIVE".into()));
    }
}
