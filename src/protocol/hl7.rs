//! HL7 v2 over MLLP
//!
//! Framing is `VT message FS CR`; the message is CR-delimited segments
//! with `|`-delimited fields. PID carries the patient, OBR the sample id,
//! and each OBX is one result. Every decoded message is answered with a
//! synthesized MSH/MSA application-accept ACK in the same framing.

use crate::model::{LinkObserver, PatientDraft, ResultRecord, ResultValue, Sex, SyncStatus};
use crate::protocol::{normalize_flag, normalize_name, parse_dob, Parser, SyncTrigger, CR, FS, VT};
use crate::store::ResultStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// HL7 v2 MLLP parser
pub struct Hl7Parser {
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
    sync_trigger: Option<SyncTrigger>,
    buffer: Vec<u8>,
}

struct ParsedObx {
    sequence: String,
    test_code: String,
    value: ResultValue,
    unit: String,
    flags: String,
}

impl Hl7Parser {
    pub fn new(store: Arc<dyn ResultStore>, observer: Arc<dyn LinkObserver>) -> Self {
        Hl7Parser {
            store,
            observer,
            sync_trigger: None,
            buffer: Vec::new(),
        }
    }

    /// Decode one complete MLLP block and build its ACK
    fn process_message(&mut self, raw: &str) -> Vec<u8> {
        let mut control_id = String::new();
        let mut sending_app = String::new();
        let mut sending_facility = String::new();
        let mut draft: Option<PatientDraft> = None;
        let mut sample_id = String::new();
        let mut observations: Vec<ParsedObx> = Vec::new();

        for segment in raw.split(['\r', '\n']).filter(|s| !s.trim().is_empty()) {
            let fields: Vec<&str> = segment.split('|').collect();
            match fields[0] {
                "MSH" => {
                    sending_app = field(&fields, 2).to_string();
                    sending_facility = field(&fields, 3).to_string();
                    control_id = field(&fields, 9).to_string();
                }
                "PID" => {
                    draft = Some(PatientDraft {
                        external_patient_id: component(field(&fields, 3), 0).to_string(),
                        sample_id: String::new(),
                        name: normalize_name(field(&fields, 5)),
                        date_of_birth: parse_dob(field(&fields, 7)),
                        sex: Sex::from_token(field(&fields, 8)),
                        physician: String::new(),
                        raw_payload: raw.to_string(),
                    });
                }
                "OBR" => {
                    if sample_id.is_empty() {
                        sample_id = component(field(&fields, 3), 0).to_string();
                    }
                }
                "OBX" => {
                    if fields.len() <= 5 {
                        warn!(fields = fields.len(), "OBX segment too short, skipped");
                        continue;
                    }
                    observations.push(ParsedObx {
                        sequence: field(&fields, 1).to_string(),
                        test_code: component(field(&fields, 3), 0).to_string(),
                        value: ResultValue::parse(field(&fields, 5)),
                        unit: component(field(&fields, 6), 0).to_string(),
                        flags: normalize_flag(field(&fields, 8)),
                    });
                }
                other => trace!(segment = other, "Segment ignored"),
            }
        }

        match draft {
            Some(mut draft) => {
                draft.sample_id = sample_id;
                match self.store.upsert_patient(&draft) {
                    Ok(pid) => {
                        debug!(
                            patient_id = pid,
                            results = observations.len(),
                            "HL7 message decoded"
                        );
                        if let Ok(Some(patient)) = self.store.patient(pid) {
                            self.observer.on_patient_updated(&patient);
                        }
                        for obx in &observations {
                            self.persist_result(pid, obx);
                        }
                        if let Some(trigger) = &self.sync_trigger {
                            trigger(pid);
                        }
                    }
                    Err(e) => warn!(error = %e, "HL7 patient upsert failed"),
                }
            }
            None => {
                warn!(
                    observations = observations.len(),
                    "HL7 message without PID segment, results discarded"
                );
            }
        }

        build_ack(&sending_app, &sending_facility, &control_id)
    }

    fn persist_result(&self, patient_id: i64, obx: &ParsedObx) {
        let timestamp = Utc::now();
        match self.store.add_result(
            patient_id,
            &obx.test_code,
            &obx.value,
            &obx.unit,
            &obx.flags,
            timestamp,
            &obx.sequence,
        ) {
            Ok(id) => self.observer.on_result_updated(&ResultRecord {
                id,
                patient_id,
                test_code: obx.test_code.clone(),
                value: obx.value.clone(),
                unit: obx.unit.clone(),
                flags: obx.flags.clone(),
                sequence: obx.sequence.clone(),
                timestamp,
                sync_status: SyncStatus::Local,
            }),
            Err(e) => warn!(
                test_code = %obx.test_code,
                error = %e,
                "OBX insert failed, continuing"
            ),
        }
    }
}

fn field<'a>(fields: &'a [&str], idx: usize) -> &'a str {
    fields.get(idx).map(|s| s.trim()).unwrap_or("")
}

/// Caret-delimited component of an HL7 field
fn component(field: &str, idx: usize) -> &str {
    field.split('^').nth(idx).unwrap_or("").trim()
}

/// Synthesize an application-accept ACK, MLLP-framed
fn build_ack(sending_app: &str, sending_facility: &str, control_id: &str) -> Vec<u8> {
    let ts = Utc::now().format("%Y%m%d%H%M%S");
    let msh = format!(
        "MSH|^~\\&|LABLINK|LAB|{}|{}|{}||ACK^R01|{}|P|2.3.1",
        sending_app, sending_facility, ts, control_id
    );
    let msa = format!("MSA|AA|{}", control_id);

    let mut out = Vec::with_capacity(msh.len() + msa.len() + 4);
    out.push(VT);
    out.extend_from_slice(msh.as_bytes());
    out.push(CR);
    out.extend_from_slice(msa.as_bytes());
    out.push(CR);
    out.push(FS);
    out.push(CR);
    out
}

impl Parser for Hl7Parser {
    fn handle_data(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut response = Vec::new();

        loop {
            // Discard noise ahead of the start-of-block
            let start = match self.buffer.iter().position(|&b| b == VT) {
                Some(pos) => pos,
                None => {
                    self.buffer.clear();
                    break;
                }
            };
            if start > 0 {
                trace!(bytes = start, "Discarding bytes before VT");
                self.buffer.drain(..start);
            }

            let end = match self.buffer.iter().position(|&b| b == FS) {
                Some(pos) => pos,
                None => break, // block incomplete
            };

            let raw = String::from_utf8_lossy(&self.buffer[1..end]).into_owned();
            // Consume the block plus the trailing CR MLLP appends
            let mut consumed = end + 1;
            if self.buffer.get(consumed) == Some(&CR) {
                consumed += 1;
            }
            self.buffer.drain(..consumed);

            response.extend(self.process_message(&raw));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NullObserver;
    use crate::store::SqliteStore;

    fn parser() -> (Hl7Parser, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let parser = Hl7Parser::new(store.clone(), Arc::new(NullObserver));
        (parser, store)
    }

    fn mllp(message: &str) -> Vec<u8> {
        let mut out = vec![VT];
        out.extend_from_slice(message.as_bytes());
        out.push(FS);
        out.push(CR);
        out
    }

    const ORU: &str = "MSH|^~\\&|XN-550|HEMA|LIS|LAB|20240101101500||ORU^R01|MSG00042|P|2.3.1\r\
PID|1|475371|475371||ADUKO^HARRIET||20050101|F\r\
OBR|1||S-1001|CBC\r\
OBX|1|NM|WBC^Leukocytes||8.76|10*3/uL|4.0-10.0|N|||F\r\
OBX|2|NM|HGB^Hemoglobin||13.2|g/dL|12.0-16.0|N|||F";

    #[test]
    fn test_oru_message_persists_patient_and_results() {
        let (mut p, store) = parser();
        let ack = p.handle_data(&mllp(ORU)).unwrap();

        let text = String::from_utf8_lossy(&ack);
        assert_eq!(ack[0], VT);
        assert_eq!(ack[ack.len() - 2], FS);
        assert!(text.contains("MSA|AA|MSG00042"));

        let results = store.results_by_sync_status(SyncStatus::Local, 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].test_code, "WBC");
        assert_eq!(results[0].value, ResultValue::Numeric(8.76));

        let patient = store.patient(results[0].patient_id).unwrap().unwrap();
        assert_eq!(patient.external_patient_id, "475371");
        assert_eq!(patient.name, "HARRIET ADUKO");
        assert_eq!(patient.sex, Sex::Female);
        assert_eq!(patient.sample_id, "S-1001");
    }

    #[test]
    fn test_message_without_pid_is_acked_but_discarded() {
        let (mut p, store) = parser();
        let msg = "MSH|^~\\&|XN|H|L|L|20240101||ORU^R01|C7|P|2.3.1\rOBX|1|NM|WBC^L||5.0|g/L||N";
        let ack = p.handle_data(&mllp(msg)).unwrap();
        assert!(String::from_utf8_lossy(&ack).contains("MSA|AA|C7"));
        assert!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().is_empty());
    }

    #[test]
    fn test_block_split_across_reads() {
        let (mut p, store) = parser();
        let framed = mllp(ORU);
        let (a, b) = framed.split_at(40);
        assert_eq!(p.handle_data(a), None);
        assert!(p.handle_data(b).is_some());
        assert_eq!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_two_blocks_in_one_read() {
        let (mut p, store) = parser();
        let mut both = mllp(ORU);
        both.extend(mllp(ORU));
        let ack = p.handle_data(&both).unwrap();
        assert_eq!(ack.iter().filter(|&&b| b == VT).count(), 2);
        // Same identity, so one patient row with four results total
        let results = store.results_by_sync_status(SyncStatus::Local, 10).unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.patient_id == results[0].patient_id));
    }

    #[test]
    fn test_sync_trigger_fires_per_message() {
        let (mut p, _) = parser();
        let fired = Arc::new(std::sync::Mutex::new(0));
        let sink = fired.clone();
        p.set_sync_trigger(Arc::new(move |_| *sink.lock().unwrap() += 1));
        p.handle_data(&mllp(ORU));
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
