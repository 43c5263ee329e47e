//! ASTM E1394 family state machine
//!
//! One parser covers the generic standard and all vendor dialects; every
//! vendor difference (checksum enforcement, field positions, test-code
//! extraction) is data in [`DialectSpec`], not logic here.
//!
//! Session shape on the wire:
//!
//! ```text
//! analyzer: ENQ                          -> ACK
//! analyzer: STX fn payload ETX cs CR LF  -> ACK (or NAK on bad checksum)
//! ...
//! analyzer: EOT                          (no reply)
//! ```

use crate::error::{LinkError, Result};
use crate::model::{LinkObserver, PatientDraft, ResultRecord, ResultValue, Sex, SyncStatus};
use crate::protocol::dialect::DialectSpec;
use crate::protocol::{
    astm_checksum, embedded_numeric_id, normalize_flag, normalize_name, parse_dob, Parser,
    SyncTrigger, ACK, CR, ENQ, EOT, ETB, ETX, LF, NAK, STX,
};
use crate::store::ResultStore;
use chrono::Utc;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Minimum digits for a numeric id scavenged from an order record
const MIN_EMBEDDED_ID_DIGITS: usize = 4;

/// A result parsed before its patient record arrived (Vitros flow)
#[derive(Debug, Clone)]
struct OrphanResult {
    sequence: String,
    test_code: String,
    value: ResultValue,
    unit: String,
    flags: String,
}

/// ASTM E1394 protocol parser, parameterized by vendor dialect
pub struct AstmParser {
    dialect: &'static DialectSpec,
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
    sync_trigger: Option<SyncTrigger>,
    test_code_re: Option<Regex>,

    buffer: Vec<u8>,
    in_session: bool,
    expected_frame: u8,
    /// Payload carried over from ETB-terminated intermediate frames
    partial: String,

    current_patient: Option<i64>,
    current_draft: Option<PatientDraft>,
    /// Sample id from an order seen before any patient record
    pending_sample_id: String,
    /// Orphaned results keyed by sample id, for dialects that queue them
    pending_results: HashMap<String, Vec<OrphanResult>>,
    raw_lines: Vec<String>,
}

impl AstmParser {
    pub fn new(
        dialect: &'static DialectSpec,
        store: Arc<dyn ResultStore>,
        observer: Arc<dyn LinkObserver>,
    ) -> Self {
        let test_code_re = Regex::new(dialect.test_code_pattern).ok();
        if test_code_re.is_none() {
            warn!(dialect = dialect.name, "Test-code pattern failed to compile");
        }
        AstmParser {
            dialect,
            store,
            observer,
            sync_trigger: None,
            test_code_re,
            buffer: Vec::new(),
            in_session: false,
            expected_frame: 1,
            partial: String::new(),
            current_patient: None,
            current_draft: None,
            pending_sample_id: String::new(),
            pending_results: HashMap::new(),
            raw_lines: Vec::new(),
        }
    }

    fn reset_message(&mut self) {
        self.current_patient = None;
        self.current_draft = None;
        self.pending_sample_id.clear();
        self.raw_lines.clear();
        self.partial.clear();
    }

    /// Structural checks shared by every dialect: terminator position,
    /// checksum trailer, checksum value. Returns the terminator index and
    /// whether the frame is intermediate (ETB-terminated).
    fn validate_frame(&self, content: &[u8]) -> Result<(usize, bool)> {
        let term_pos = content
            .iter()
            .rposition(|&b| b == ETX || b == ETB)
            .filter(|&pos| pos >= 2)
            .ok_or_else(|| LinkError::InvalidFrame("missing ETX/ETB terminator".into()))?;

        if self.dialect.verify_checksum {
            let trailer = &content[term_pos + 1..];
            if trailer.len() != 2 {
                return Err(LinkError::InvalidFrame(format!(
                    "checksum trailer is {} bytes, expected 2",
                    trailer.len()
                )));
            }
            let received = std::str::from_utf8(trailer)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    LinkError::InvalidFrame("checksum trailer is not hex".into())
                })?;
            let computed = astm_checksum(&content[..=term_pos]);
            if received != computed {
                return Err(LinkError::ChecksumMismatch {
                    expected: received,
                    actual: computed,
                });
            }
        }

        Ok((term_pos, content[term_pos] == ETB))
    }

    /// Validate framing and checksum, then feed the payload to the record
    /// dispatcher. Returns the control byte owed to the analyzer.
    fn process_frame(&mut self, frame: &[u8]) -> u8 {
        // Strip trailing CR LF
        let mut end = frame.len();
        while end > 0 && (frame[end - 1] == LF || frame[end - 1] == CR) {
            end -= 1;
        }
        let content = &frame[..end];

        let (term_pos, intermediate) = match self.validate_frame(content) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(dialect = self.dialect.name, error = %e, "Frame rejected");
                return NAK;
            }
        };

        let frame_number = content[1].wrapping_sub(b'0');
        if self.dialect.verify_frame_number && frame_number != self.expected_frame {
            let e = LinkError::InvalidFrame(format!(
                "frame number {} out of sequence, expected {}",
                frame_number, self.expected_frame
            ));
            warn!(dialect = self.dialect.name, error = %e, "Frame rejected");
            return NAK;
        }
        self.expected_frame = (frame_number + 1) % 8;

        let payload = String::from_utf8_lossy(&content[2..term_pos]).into_owned();
        if intermediate {
            // Record continues in the next frame
            self.partial.push_str(&payload);
            return ACK;
        }

        let assembled = if self.partial.is_empty() {
            payload
        } else {
            let mut s = std::mem::take(&mut self.partial);
            s.push_str(&payload);
            s
        };

        for line in assembled.split('\r').filter(|l| !l.trim().is_empty()) {
            self.handle_record(line);
        }
        ACK
    }

    fn handle_record(&mut self, line: &str) {
        self.raw_lines.push(line.to_string());
        let fields: Vec<&str> = line.split('|').collect();

        let type_field = fields[0].trim();
        let type_char = if self.dialect.record_type_first {
            type_field.chars().next()
        } else {
            type_field.chars().last()
        };
        let type_char = match type_char {
            Some(c) => c.to_ascii_uppercase(),
            None => {
                warn!(dialect = self.dialect.name, "Empty record type field");
                return;
            }
        };

        match type_char {
            'H' => debug!(dialect = self.dialect.name, "Header record"),
            'P' => self.handle_patient(&fields),
            'O' => self.handle_order(&fields),
            'R' => self.handle_result(&fields),
            'C' => debug!(dialect = self.dialect.name, "Comment record"),
            'M' => debug!(dialect = self.dialect.name, "Manufacturer record"),
            'L' => self.finalize_message(),
            other => warn!(
                dialect = self.dialect.name,
                record_type = %other,
                "Unknown record type, skipped"
            ),
        }
    }

    fn handle_patient(&mut self, fields: &[&str]) {
        if fields.len() < 3 {
            let e = LinkError::InvalidRecord(format!(
                "patient record has {} fields, need at least 3",
                fields.len()
            ));
            warn!(dialect = self.dialect.name, error = %e, "Record skipped");
            return;
        }

        let d = self.dialect;
        let draft = PatientDraft {
            external_patient_id: field(fields, d.p_patient_id).to_string(),
            sample_id: field(fields, d.p_sample_id).to_string(),
            name: normalize_name(field(fields, d.p_name)),
            date_of_birth: parse_dob(field(fields, d.p_dob)),
            sex: Sex::from_token(field(fields, d.p_sex)),
            physician: field(fields, d.p_physician).to_string(),
            raw_payload: String::new(),
        };

        match self.store.upsert_patient(&draft) {
            Ok(id) => {
                trace!(
                    dialect = d.name,
                    patient_id = id,
                    external_id = %draft.external_patient_id,
                    "Patient record stored"
                );
                self.current_patient = Some(id);
                self.notify_patient(id);
                self.flush_orphans(id, &draft.sample_id);
                self.current_draft = Some(draft);
            }
            Err(e) => {
                warn!(dialect = d.name, error = %e, "Patient upsert failed, record skipped");
            }
        }
    }

    fn handle_order(&mut self, fields: &[&str]) {
        if fields.len() < 3 {
            warn!(dialect = self.dialect.name, "Order record too short, skipped");
            return;
        }
        let sample_id = field(fields, self.dialect.o_sample_id).to_string();

        match (self.current_patient, self.current_draft.take()) {
            (Some(pid), Some(mut draft)) => {
                if draft.sample_id.is_empty() && !sample_id.is_empty() {
                    draft.sample_id = sample_id;
                }
                if draft.external_patient_id.is_empty() {
                    // Scan the whole order for an embedded numeric id
                    if let Some(id) = fields
                        .iter()
                        .skip(1)
                        .find_map(|f| embedded_numeric_id(f, MIN_EMBEDDED_ID_DIGITS))
                    {
                        debug!(dialect = self.dialect.name, patient_id = %id, "Patient id recovered from order record");
                        draft.external_patient_id = id;
                    }
                }
                if let Err(e) = self.store.update_patient(pid, &draft) {
                    warn!(dialect = self.dialect.name, error = %e, "Order-driven patient update failed");
                }
                self.notify_patient(pid);
                self.flush_orphans(pid, &draft.sample_id);
                self.current_draft = Some(draft);
            }
            (_, draft) => {
                // Order ahead of its patient: remember the sample id so
                // queued results can be keyed to it
                self.current_draft = draft;
                self.pending_sample_id = sample_id;
            }
        }
    }

    fn handle_result(&mut self, fields: &[&str]) {
        let d = self.dialect;
        if fields.len() <= d.r_value {
            let e = LinkError::InvalidRecord(format!(
                "result record has {} fields, value expected at {}",
                fields.len(),
                d.r_value
            ));
            warn!(dialect = d.name, error = %e, "Record skipped");
            return;
        }

        let sequence = field(fields, d.r_sequence).to_string();
        let test_code = self.extract_test_code(field(fields, d.r_test));
        let value = ResultValue::parse(field(fields, d.r_value));
        let unit = field(fields, d.r_unit).to_string();
        let flags = normalize_flag(field(fields, d.r_flags));

        match self.current_patient {
            Some(pid) => {
                self.persist_result(pid, &sequence, &test_code, &value, &unit, &flags);
            }
            None if d.queue_orphan_results => {
                debug!(
                    dialect = d.name,
                    sample_id = %self.pending_sample_id,
                    test_code = %test_code,
                    "No patient context yet, result queued"
                );
                self.pending_results
                    .entry(self.pending_sample_id.clone())
                    .or_default()
                    .push(OrphanResult {
                        sequence,
                        test_code,
                        value,
                        unit,
                        flags,
                    });
            }
            None => {
                warn!(
                    dialect = d.name,
                    test_code = %test_code,
                    "Result with no patient context, discarded"
                );
            }
        }
    }

    fn persist_result(
        &self,
        patient_id: i64,
        sequence: &str,
        test_code: &str,
        value: &ResultValue,
        unit: &str,
        flags: &str,
    ) {
        let timestamp = Utc::now();
        match self.store.add_result(
            patient_id, test_code, value, unit, flags, timestamp, sequence,
        ) {
            Ok(id) => {
                trace!(result_id = id, test_code, "Result stored");
                self.observer.on_result_updated(&ResultRecord {
                    id,
                    patient_id,
                    test_code: test_code.to_string(),
                    value: value.clone(),
                    unit: unit.to_string(),
                    flags: flags.to_string(),
                    sequence: sequence.to_string(),
                    timestamp,
                    sync_status: SyncStatus::Local,
                });
            }
            Err(e) => {
                warn!(
                    dialect = self.dialect.name,
                    test_code,
                    error = %e,
                    "Result insert failed, continuing with remaining records"
                );
            }
        }
    }

    /// Flush queued orphan results now that their patient exists
    fn flush_orphans(&mut self, patient_id: i64, sample_id: &str) {
        if !self.dialect.queue_orphan_results {
            return;
        }
        let mut queued = self.pending_results.remove(sample_id).unwrap_or_default();
        if !sample_id.is_empty() {
            // Results seen before any order record were keyed to ""
            queued.extend(self.pending_results.remove("").unwrap_or_default());
        }
        if queued.is_empty() {
            return;
        }
        debug!(
            dialect = self.dialect.name,
            patient_id,
            count = queued.len(),
            "Flushing queued results"
        );
        for r in queued {
            self.persist_result(patient_id, &r.sequence, &r.test_code, &r.value, &r.unit, &r.flags);
        }
    }

    /// End-of-message: persist the audit payload, fire the sync hook,
    /// reset per-message context
    fn finalize_message(&mut self) {
        if let (Some(pid), Some(mut draft)) = (self.current_patient, self.current_draft.take()) {
            draft.raw_payload = self.raw_lines.join("\n");
            if let Err(e) = self.store.update_patient(pid, &draft) {
                warn!(dialect = self.dialect.name, error = %e, "Audit payload update failed");
            }
            self.notify_patient(pid);
            if let Some(trigger) = &self.sync_trigger {
                trigger(pid);
            }
        }
        self.reset_message();
    }

    fn notify_patient(&self, id: i64) {
        if let Ok(Some(patient)) = self.store.patient(id) {
            self.observer.on_patient_updated(&patient);
        }
    }

    fn extract_test_code(&self, raw: &str) -> String {
        if let Some(re) = &self.test_code_re {
            if let Some(caps) = re.captures(raw) {
                if let Some(m) = caps.get(1) {
                    return m.as_str().to_string();
                }
            }
        }
        raw.split('^')
            .map(str::trim)
            .find(|p| !p.is_empty())
            .unwrap_or(raw.trim())
            .to_string()
    }
}

/// Field accessor tolerating short records
fn field<'a>(fields: &'a [&str], idx: usize) -> &'a str {
    fields.get(idx).map(|s| s.trim()).unwrap_or("")
}

impl Parser for AstmParser {
    fn handle_data(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut response = Vec::new();

        loop {
            match self.buffer.first().copied() {
                Some(ENQ) => {
                    self.buffer.remove(0);
                    trace!(dialect = self.dialect.name, "ENQ: session opened");
                    self.in_session = true;
                    self.expected_frame = 1;
                    self.reset_message();
                    response.push(ACK);
                }
                Some(EOT) => {
                    self.buffer.remove(0);
                    trace!(dialect = self.dialect.name, "EOT: session closed");
                    self.in_session = false;
                    self.reset_message();
                    // EOT takes no reply
                }
                Some(STX) => {
                    if !self.in_session {
                        // Some instruments skip ENQ after a reconnect
                        trace!(dialect = self.dialect.name, "Frame without ENQ, accepting");
                        self.in_session = true;
                    }
                    let lf = match self.buffer.iter().position(|&b| b == LF) {
                        Some(pos) => pos,
                        None => break, // frame incomplete
                    };
                    let frame: Vec<u8> = self.buffer.drain(..=lf).collect();
                    response.push(self.process_frame(&frame));
                }
                Some(other) => {
                    trace!(
                        dialect = self.dialect.name,
                        byte = format!("{:#04x}", other),
                        "Discarding byte outside frame"
                    );
                    self.buffer.remove(0);
                }
                None => break,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NullObserver;
    use crate::protocol::dialect;
    use crate::protocol::format_checksum;
    use crate::store::SqliteStore;
    use std::sync::Mutex;

    fn parser(spec: &'static DialectSpec) -> (AstmParser, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let parser = AstmParser::new(spec, store.clone(), Arc::new(NullObserver));
        (parser, store)
    }

    /// Build a checksummed wire frame around a payload
    fn frame(number: u8, payload: &str, terminator: u8) -> Vec<u8> {
        let mut f = vec![STX, b'0' + number];
        f.extend_from_slice(payload.as_bytes());
        f.push(terminator);
        let sum = astm_checksum(&f);
        f.extend_from_slice(format_checksum(sum).as_bytes());
        f.push(CR);
        f.push(LF);
        f
    }

    #[test]
    fn test_enq_ack_handshake() {
        let (mut p, _) = parser(&dialect::GENERIC);
        assert_eq!(p.handle_data(&[ENQ]), Some(vec![ACK]));
        assert_eq!(p.handle_data(&[EOT]), None);
    }

    #[test]
    fn test_full_message_persists_patient_and_result() {
        let (mut p, store) = parser(&dialect::GENERIC);
        assert_eq!(p.handle_data(&[ENQ]), Some(vec![ACK]));
        assert_eq!(
            p.handle_data(&frame(1, "P|1|475371|||^ADUKO^HARRIET||20050101|F", ETX)),
            Some(vec![ACK])
        );
        assert_eq!(
            p.handle_data(&frame(2, "R|1|^^^WBC|8.76|10*3/uL||N", ETX)),
            Some(vec![ACK])
        );
        assert_eq!(p.handle_data(&frame(3, "L|1|N", ETX)), Some(vec![ACK]));
        p.handle_data(&[EOT]);

        let results = store.results_by_sync_status(SyncStatus::Local, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_code, "WBC");
        assert_eq!(results[0].value, ResultValue::Numeric(8.76));
        assert_eq!(results[0].unit, "10*3/uL");

        let patient = store.patient(results[0].patient_id).unwrap().unwrap();
        assert_eq!(patient.external_patient_id, "475371");
        assert_eq!(patient.name, "HARRIET ADUKO");
        assert_eq!(patient.date_of_birth, "2005-01-01");
        assert_eq!(patient.sex, Sex::Female);
        assert!(patient.raw_payload.contains("P|1|475371"));
    }

    #[test]
    fn test_out_of_order_sequences_sort_numerically() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        p.handle_data(&frame(1, "P|1|555001|||^DOE^JANE", ETX));
        p.handle_data(&frame(2, "R|2|^^^HGB|13.2|g/dL||N", ETX));
        p.handle_data(&frame(3, "R|1|^^^WBC|8.76|10*3/uL||N", ETX));
        p.handle_data(&frame(4, "L|1|N", ETX));

        let pid = store.results_by_sync_status(SyncStatus::Local, 10).unwrap()[0].patient_id;
        let results = store.patient_results(pid).unwrap();
        assert_eq!(results[0].sequence, "1");
        assert_eq!(results[0].test_code, "WBC");
        assert_eq!(results[1].sequence, "2");
    }

    #[test]
    fn test_checksum_mismatch_naks_without_mutation() {
        let (mut p, store) = parser(&dialect::COBAS_C311);
        p.handle_data(&[ENQ]);
        let mut bad = frame(1, "P|1|123456|||^DOE^JOHN", ETX);
        // Corrupt one checksum hex digit
        let cs_at = bad.len() - 4;
        bad[cs_at] = if bad[cs_at] == b'0' { b'1' } else { b'0' };
        assert_eq!(p.handle_data(&bad), Some(vec![NAK]));
        assert!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().is_empty());
        assert!(store.patient(1).unwrap().is_none());
    }

    #[test]
    fn test_generic_dialect_ignores_checksum() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        let mut f = frame(1, "P|1|222333|||^ROE^RICHARD", ETX);
        let cs_at = f.len() - 4;
        f[cs_at] = b'Z'; // invalid hex, generic does not care
        assert_eq!(p.handle_data(&f), Some(vec![ACK]));
        assert!(store.patient(1).unwrap().is_some());
    }

    #[test]
    fn test_frame_number_enforced_for_dimension() {
        let (mut p, _) = parser(&dialect::DIMENSION_EXL);
        p.handle_data(&[ENQ]);
        // First frame must be number 1
        assert_eq!(p.handle_data(&frame(3, "P|1|111222", ETX)), Some(vec![NAK]));
        assert_eq!(p.handle_data(&frame(1, "P|1|111222", ETX)), Some(vec![ACK]));
        assert_eq!(p.handle_data(&frame(2, "L|1|N", ETX)), Some(vec![ACK]));
    }

    #[test]
    fn test_malformed_checksum_trailer_naks() {
        let (mut p, store) = parser(&dialect::COBAS_C311);
        p.handle_data(&[ENQ]);

        // Valid frame shape but a non-hex checksum trailer
        let mut f = vec![STX, b'1'];
        f.extend_from_slice(b"P|1|123456|||^MENSAH^KOFI||19800315|M");
        f.push(ETX);
        f.extend_from_slice(b"ZZ");
        f.push(CR);
        f.push(LF);

        assert_eq!(p.handle_data(&f), Some(vec![NAK]));
        assert!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().is_empty());
    }

    #[test]
    fn test_short_records_skipped_session_continues() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        // P and R below the dialect's minimum field counts
        assert_eq!(p.handle_data(&frame(1, "P|1", ETX)), Some(vec![ACK]));
        assert_eq!(p.handle_data(&frame(2, "R|1|^^^WBC", ETX)), Some(vec![ACK]));
        // A well-formed message still parses afterwards
        assert_eq!(
            p.handle_data(&frame(3, "P|1|777001|||^BAAH^KOJO||19700101|M", ETX)),
            Some(vec![ACK])
        );
        assert_eq!(
            p.handle_data(&frame(4, "R|1|^^^HGB|14.2|g/dL||N", ETX)),
            Some(vec![ACK])
        );
        p.handle_data(&frame(5, "L|1|N", ETX));

        let results = store.results_by_sync_status(SyncStatus::Local, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_code, "HGB");
    }

    #[test]
    fn test_result_without_patient_discarded() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        assert_eq!(
            p.handle_data(&frame(1, "R|1|^^^WBC|8.76|10*3/uL||N", ETX)),
            Some(vec![ACK])
        );
        assert!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().is_empty());
    }

    #[test]
    fn test_vitros_queues_then_flushes_orphans() {
        let (mut p, store) = parser(&dialect::VITROS);
        p.handle_data(&[ENQ]);
        // Order first: carries the sample id the results will key to
        p.handle_data(&frame(1, "O|1|S-9001||^^^GLU", ETX));
        p.handle_data(&frame(2, "R|1|^^^GLU|5.4|mmol/L||N", ETX));
        assert!(store.results_by_sync_status(SyncStatus::Local, 10).unwrap().is_empty());

        // Patient arrives with the matching sample id (Vitros puts it at index 2)
        p.handle_data(&frame(3, "P|1|S-9001|||^MENSAH^KOFI||19800315|M", ETX));
        let results = store.results_by_sync_status(SyncStatus::Local, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_code, "GLU");
    }

    #[test]
    fn test_patient_id_recovered_from_order() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        p.handle_data(&frame(1, "P|1||||^ASANTE^AMA", ETX));
        p.handle_data(&frame(2, "O|1|SMP-884211||^^^CBC", ETX));
        p.handle_data(&frame(3, "L|1|N", ETX));

        let patient = store.patient(1).unwrap().unwrap();
        assert_eq!(patient.external_patient_id, "884211");
        assert_eq!(patient.sample_id, "SMP-884211");
    }

    #[test]
    fn test_unknown_record_type_continues_session() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        assert_eq!(p.handle_data(&frame(1, "X|1|strange", ETX)), Some(vec![ACK]));
        assert_eq!(
            p.handle_data(&frame(2, "P|1|424242|||^OWUSU^YAW", ETX)),
            Some(vec![ACK])
        );
        assert!(store.patient(1).unwrap().is_some());
    }

    #[test]
    fn test_etb_spans_record_across_frames() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        p.handle_data(&frame(1, "P|1|313131|||^BOA", ETB));
        p.handle_data(&frame(2, "TENG^ESI", ETX));
        let patient = store.patient(1).unwrap().unwrap();
        assert_eq!(patient.name, "ESI BOATENG");
    }

    #[test]
    fn test_split_delivery_reassembles_frame() {
        let (mut p, store) = parser(&dialect::GENERIC);
        p.handle_data(&[ENQ]);
        let f = frame(1, "P|1|515151|||^ANNAN^KOJO", ETX);
        assert_eq!(p.handle_data(&f[..5]), None);
        assert_eq!(p.handle_data(&f[5..]), Some(vec![ACK]));
        assert!(store.patient(1).unwrap().is_some());
    }

    #[test]
    fn test_sync_trigger_fires_on_terminator() {
        let (mut p, _) = parser(&dialect::GENERIC);
        let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        p.set_sync_trigger(Arc::new(move |pid| sink.lock().unwrap().push(pid)));

        p.handle_data(&[ENQ]);
        p.handle_data(&frame(1, "P|1|616161|||^MARFO^ABENA", ETX));
        p.handle_data(&frame(2, "L|1|N", ETX));
        assert_eq!(fired.lock().unwrap().as_slice(), &[1]);
    }
}
