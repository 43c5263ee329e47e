//! POCT1-A XML-framed dialect
//!
//! Uses the ASTM control bytes (ENQ/EOT/STX/ETX) but carries an XML
//! document between STX and ETX, accumulated across however many reads
//! it takes. Payloads are sanitized of stray control characters before
//! parsing, and element lookup ignores namespaces since devices disagree
//! on prefixes. Message kinds: OBS (patient + observations), EVT (device
//! event, logged), DIR (test directory, logged).

use crate::error::LinkError;
use crate::model::{LinkObserver, PatientDraft, ResultRecord, ResultValue, Sex, SyncStatus};
use crate::protocol::{
    normalize_flag, normalize_name, parse_dob, Parser, SyncTrigger, ACK, ENQ, EOT, ETX, NAK, STX,
};
use crate::store::ResultStore;
use chrono::Utc;
use roxmltree::{Document, Node};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// POCT1-A parser
pub struct Poct1aParser {
    store: Arc<dyn ResultStore>,
    observer: Arc<dyn LinkObserver>,
    sync_trigger: Option<SyncTrigger>,
    buffer: Vec<u8>,
    xml: Vec<u8>,
    in_message: bool,
}

impl Poct1aParser {
    pub fn new(store: Arc<dyn ResultStore>, observer: Arc<dyn LinkObserver>) -> Self {
        Poct1aParser {
            store,
            observer,
            sync_trigger: None,
            buffer: Vec::new(),
            xml: Vec::new(),
            in_message: false,
        }
    }

    /// Parse one complete XML payload, returning the control byte to send
    fn process_xml(&mut self, raw: &[u8]) -> u8 {
        let text = sanitize(raw);
        let doc = match Document::parse(&text) {
            Ok(doc) => doc,
            Err(e) => {
                let e = LinkError::InvalidRecord(format!("XML payload rejected: {e}"));
                warn!(error = %e, bytes = raw.len(), "Malformed POCT1-A message");
                return NAK;
            }
        };

        let root = doc.root_element();
        let kind = message_kind(&root);
        match kind.as_str() {
            "OBS" => self.handle_observations(&root, &text),
            "EVT" => info!(root = root.tag_name().name(), "POCT1-A device event"),
            "DIR" => info!(root = root.tag_name().name(), "POCT1-A test directory"),
            other => warn!(kind = other, "Unknown POCT1-A message kind, ignored"),
        }
        ACK
    }

    fn handle_observations(&mut self, root: &Node, raw: &str) {
        let draft = PatientDraft {
            external_patient_id: find_value(root, &["patient_id", "PID"]),
            sample_id: find_value(root, &["sample_id", "specimen_id"]),
            name: normalize_name(&find_value(root, &["patient_name", "name"])),
            date_of_birth: parse_dob(&find_value(root, &["birth_date", "date_of_birth"])),
            sex: Sex::from_token(&find_value(root, &["sex", "gender"])),
            physician: find_value(root, &["physician", "ordering_provider"]),
            raw_payload: raw.to_string(),
        };

        let patient_id = match self.store.upsert_patient(&draft) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "POCT1-A patient upsert failed");
                return;
            }
        };
        if let Ok(Some(patient)) = self.store.patient(patient_id) {
            self.observer.on_patient_updated(&patient);
        }

        let mut count = 0u32;
        for obs in root
            .descendants()
            .filter(|n| matches_name(n, &["observation", "obs"]))
        {
            let test_code = find_value(&obs, &["observation_id", "test_id", "code"]);
            if test_code.is_empty() {
                warn!("POCT1-A observation without test id, skipped");
                continue;
            }
            let value_node = obs
                .descendants()
                .find(|n| matches_name(n, &["value", "result"]));
            let value = ResultValue::parse(&value_node.map(node_value).unwrap_or_default());
            let unit = value_node
                .and_then(|n| n.attribute("U"))
                .map(str::trim)
                .unwrap_or("")
                .to_string();
            let flags = normalize_flag(&find_value(&obs, &["interpretation", "flag"]));
            let sequence = find_value(&obs, &["sequence", "seq"]);
            let timestamp = Utc::now();

            match self.store.add_result(
                patient_id, &test_code, &value, &unit, &flags, timestamp, &sequence,
            ) {
                Ok(id) => {
                    count += 1;
                    self.observer.on_result_updated(&ResultRecord {
                        id,
                        patient_id,
                        test_code,
                        value,
                        unit,
                        flags,
                        sequence,
                        timestamp,
                        sync_status: SyncStatus::Local,
                    });
                }
                Err(e) => warn!(error = %e, "POCT1-A result insert failed, continuing"),
            }
        }

        debug!(patient_id, results = count, "POCT1-A observations persisted");
        if let Some(trigger) = &self.sync_trigger {
            trigger(patient_id);
        }
    }
}

/// Strip control characters the XML parser would reject, keeping
/// tab/CR/LF whitespace
fn sanitize(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.chars()
        .filter(|&c| !c.is_control() || c == '\t' || c == '\r' || c == '\n')
        .collect()
}

/// Message kind from the root element name or its `type` attribute
///
/// POCT1-A names messages like `OBS.R01`; only the prefix matters here.
fn message_kind(root: &Node) -> String {
    let name = root
        .attribute("type")
        .unwrap_or_else(|| root.tag_name().name());
    name.split('.').next().unwrap_or("").to_ascii_uppercase()
}

fn matches_name(node: &Node, names: &[&str]) -> bool {
    node.is_element()
        && names
            .iter()
            .any(|n| node.tag_name().name().eq_ignore_ascii_case(n))
}

/// Value of the first matching descendant, from its `V` attribute or text
fn find_value(scope: &Node, names: &[&str]) -> String {
    scope
        .descendants()
        .find(|n| matches_name(n, names))
        .map(|n| node_value(n))
        .unwrap_or_default()
}

fn node_value(node: Node) -> String {
    node.attribute("V")
        .or_else(|| node.text())
        .map(str::trim)
        .unwrap_or("")
        .to_string()
}

impl Parser for Poct1aParser {
    fn handle_data(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut response = Vec::new();

        loop {
            if self.in_message {
                match self.buffer.iter().position(|&b| b == ETX) {
                    Some(end) => {
                        let payload: Vec<u8> = self.buffer.drain(..=end).collect();
                        self.xml.extend_from_slice(&payload[..payload.len() - 1]);
                        let xml = std::mem::take(&mut self.xml);
                        self.in_message = false;
                        response.push(self.process_xml(&xml));
                    }
                    None => {
                        // Keep accumulating until ETX arrives
                        self.xml.append(&mut self.buffer);
                        break;
                    }
                }
            } else {
                match self.buffer.first() {
                    None => break,
                    Some(&ENQ) => {
                        self.buffer.remove(0);
                        response.push(ACK);
                    }
                    Some(&EOT) => {
                        self.buffer.remove(0);
                        self.xml.clear();
                    }
                    Some(&STX) => {
                        self.buffer.remove(0);
                        self.in_message = true;
                    }
                    Some(&other) => {
                        trace!(byte = other, "Unexpected POCT1-A byte dropped");
                        self.buffer.remove(0);
                    }
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
