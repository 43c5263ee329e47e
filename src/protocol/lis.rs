//! Proprietary LIS pipe dialect
//!
//! STX/ETX framed pipe records without checksums or frame numbers. The
//! record grammar resembles ASTM (H/P/O/R/L) but with its own compact
//! field layout: `P|id|sample|name|dob|sex|physician` and
//! `R|seq|test|value|unit|flags`. An ENQ is tolerated with an ACK even
//! though the dialect does not require the handshake.

use crate::model::{LinkObserver, PatientDraft, ResultRecord, ResultValue, Sex, SyncStatus};
use crate::protocol::{
    normalize_flag, normalize_name, parse_dob, Parser, SyncTrigger, ACK, ENQ, EOT, ETX, STX,
};
use crate::store::ResultStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Parser for the proprietary LIS pipe protocol
pub struct LisParser {
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
    sync_trigger: Option<SyncTrigger>,
    buffer: Vec<u8>,
    current_patient: Option<i64>,
    raw_lines: Vec<String>,
}

impl LisParser {
    pub fn new(store: Arc<dyn ResultStore>, observer: Arc<dyn LinkObserver>) -> Self {
        LisParser {
            store,
            observer,
            sync_trigger: None,
            buffer: Vec::new(),
            current_patient: None,
            raw_lines: Vec::new(),
        }
    }

    fn process_payload(&mut self, payload: &str) {
        for record in payload.split(['\r', '\n']).filter(|r| !r.trim().is_empty()) {
            self.handle_record(record.trim());
        }
    }

    fn handle_record(&mut self, record: &str) {
        self.raw_lines.push(record.to_string());
        let fields: Vec<&str> = record.split('|').collect();
        match fields[0] {
            "H" => trace!("LIS header record"),
            "P" => self.handle_patient(&fields),
            "O" => self.handle_order(&fields),
            "R" => self.handle_result(&fields),
            "L" => self.finalize_message(),
            other => warn!(record_type = other, "Unknown LIS record type, ignored"),
        }
    }

    fn handle_patient(&mut self, fields: &[&str]) {
        if fields.len() < 2 {
            warn!(fields = fields.len(), "LIS patient record too short, skipped");
            return;
        }
        let draft = PatientDraft {
            external_patient_id: field(fields, 1),
            sample_id: field(fields, 2),
            name: normalize_name(&field(fields, 3)),
            date_of_birth: parse_dob(&field(fields, 4)),
            sex: Sex::from_token(&field(fields, 5)),
            physician: field(fields, 6),
            raw_payload: String::new(),
        };
        match self.store.upsert_patient(&draft) {
            Ok(id) => {
                debug!(patient_id = id, external_id = %draft.external_patient_id, "LIS patient");
                self.current_patient = Some(id);
                if let Ok(Some(patient)) = self.store.patient(id) {
                    self.observer.on_patient_updated(&patient);
                }
            }
            Err(e) => warn!(error = %e, "LIS patient upsert failed"),
        }
    }

    fn handle_order(&mut self, fields: &[&str]) {
        let sample_id = field(fields, 1);
        if sample_id.is_empty() {
            return;
        }
        if let Some(id) = self.current_patient {
            let draft = PatientDraft {
                sample_id,
                ..PatientDraft::default()
            };
            if let Err(e) = self.store.update_patient(id, &draft) {
                warn!(patient_id = id, error = %e, "LIS order update failed");
            }
        }
    }

    fn handle_result(&mut self, fields: &[&str]) {
        if fields.len() < 4 {
            warn!(fields = fields.len(), "LIS result record too short, skipped");
            return;
        }
        let patient_id = match self.current_patient {
            Some(id) => id,
            None => {
                warn!(test_code = %field(fields, 2), "LIS result without patient, discarded");
                return;
            }
        };
        let test_code = field(fields, 2);
        let value = ResultValue::parse(&field(fields, 3));
        let unit = field(fields, 4);
        let flags = normalize_flag(&field(fields, 5));
        let sequence = field(fields, 1);
        let timestamp = Utc::now();
        match self.store.add_result(
            patient_id, &test_code, &value, &unit, &flags, timestamp, &sequence,
        ) {
            Ok(id) => self.observer.on_result_updated(&ResultRecord {
                id,
                patient_id,
                test_code,
                value,
                unit,
                flags,
                sequence,
                timestamp,
                sync_status: SyncStatus::Local,
            }),
            Err(e) => warn!(error = %e, "LIS result insert failed, continuing"),
        }
    }

    fn finalize_message(&mut self) {
        if let Some(id) = self.current_patient {
            let draft = PatientDraft {
                raw_payload: self.raw_lines.join("\n"),
                ..PatientDraft::default()
            };
            if let Err(e) = self.store.update_patient(id, &draft) {
                warn!(patient_id = id, error = %e, "LIS raw payload update failed");
            }
            if let Ok(Some(patient)) = self.store.patient(id) {
                self.observer.on_patient_updated(&patient);
            }
            if let Some(trigger) = &self.sync_trigger {
                trigger(id);
            }
        }
        self.current_patient = None;
        self.raw_lines.clear();
    }
}

fn field(fields: &[&str], idx: usize) -> String {
    fields.get(idx).map(|s| s.trim().to_string()).unwrap_or_default()
}

impl Parser for LisParser {
    fn handle_data(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut response = Vec::new();

        loop {
            match self.buffer.first() {
                None => break,
                Some(&ENQ) => {
                    self.buffer.remove(0);
                    response.push(ACK);
                }
                Some(&EOT) => {
                    self.buffer.remove(0);
                    self.current_patient = None;
                    self.raw_lines.clear();
                }
                Some(&STX) => {
                    let end = match self.buffer.iter().position(|&b| b == ETX) {
                        Some(pos) => pos,
                        None => break, // frame incomplete
                    };
                    let payload = String::from_utf8_lossy(&self.buffer[1..end]).into_owned();
                    self.buffer.drain(..=end);
                    // Trailing CR/LF after ETX belongs to the frame
                    while matches!(self.buffer.first(), Some(&b'\r') | Some(&b'\n')) {
                        self.buffer.remove(0);
                    }
                    self.process_payload(&payload);
                    response.push(ACK);
                }
                Some(&other) => {
                    trace!(byte = other, "Unexpected LIS byte dropped");
                    self.buffer.remove(0);
                }
            }
        }

        if response.is_empty() {
            None
        } else {
            Some(response)
        }
    }

    fn set_sync_trigger(&mut self, trigger: SyncTrigger) {
        self.sync_trigger = Some(trigger);
    }
}
