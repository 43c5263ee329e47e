//! Wire protocol implementations for analyzer connectivity
//!
//! Each supported protocol is a state machine implementing [`Parser`]:
//! it consumes raw socket bytes, extracts patient/result records into the
//! persistence gateway, and returns whatever control bytes (ACK/NAK/...)
//! must be written back to the analyzer.

pub mod astm;
pub mod dialect;
pub mod factory;
pub mod hl7;
pub mod lis;
pub mod poct1a;

use std::sync::Arc;

pub use astm::AstmParser;
pub use dialect::DialectSpec;
pub use factory::make_parser;
pub use hl7::Hl7Parser;
pub use lis::LisParser;
pub use poct1a::Poct1aParser;

/// Start of text: opens a frame
pub const STX: u8 = 0x02;
/// End of text: closes the final frame of a message
pub const ETX: u8 = 0x03;
/// End of transmission: analyzer is done with the session
pub const EOT: u8 = 0x04;
/// Enquiry: analyzer requests a session
pub const ENQ: u8 = 0x05;
/// Positive acknowledgment
pub const ACK: u8 = 0x06;
/// Negative acknowledgment: frame rejected, retransmit
pub const NAK: u8 = 0x15;
/// End of transmission block: closes an intermediate frame
pub const ETB: u8 = 0x17;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;
/// Vertical tab: MLLP start-of-block (HL7)
pub const VT: u8 = 0x0B;
/// File separator: MLLP end-of-block (HL7)
pub const FS: u8 = 0x1C;

/// Callback fired after a patient's full result set is persisted, to
/// request a real-time sync attempt for that patient
pub type SyncTrigger = Arc<dyn Fn(i64) + Send + Sync>;

/// Common contract for all protocol parsers
///
/// `handle_data` never errors across the boundary: every failure mode in
/// the taxonomy (framing, decode, persistence) is logged and degrades to
/// a NAK or a skipped record while the session continues.
pub trait Parser: Send {
    /// Feed raw bytes; returns control bytes to write back, or `None`
    /// when more input is needed
    fn handle_data(&mut self, data: &[u8]) -> Option<Vec<u8>>;

    /// Install the real-time sync hook
    fn set_sync_trigger(&mut self, trigger: SyncTrigger);
}

/// ASTM frame checksum: XOR over the given bytes, masked to 8 bits
///
/// Callers pass the slice from STX through the ETX/ETB terminator
/// inclusive; the wire carries it as two uppercase hex digits.
pub fn astm_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Format a checksum the way it appears on the wire
pub fn format_checksum(sum: u8) -> String {
    format!("{:02X}", sum)
}

/// Parse an 8-digit `YYYYMMDD` token into ISO `YYYY-MM-DD`
///
/// Falls back to the raw token when it does not parse as a date, per the
/// decode-error policy.
pub fn parse_dob(token: &str) -> String {
    let token = token.trim();
    if token.len() == 8 && token.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(token, "%Y%m%d") {
            return date.format("%Y-%m-%d").to_string();
        }
    }
    token.to_string()
}

/// Normalize a vendor name token to `FIRST LAST` display form
///
/// Handles both caret-delimited `^LAST^FIRST` and plain `FIRST LAST`.
pub fn normalize_name(token: &str) -> String {
    let token = token.trim();
    if token.contains('^') {
        let parts: Vec<&str> = token
            .split('^')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        match parts.as_slice() {
            [] => String::new(),
            [last] => (*last).to_string(),
            [last, first, rest @ ..] => {
                let mut name = format!("{} {}", first, last);
                for middle in rest {
                    name.push(' ');
                    name.push_str(middle);
                }
                name
            }
        }
    } else {
        token.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Map a vendor abnormal-flag token to the normalized vocabulary
///
/// Known values collapse to {N, L, H, LL, HH, A}; unknown tokens pass
/// through verbatim so no information is dropped.
pub fn normalize_flag(token: &str) -> String {
    match token.trim().to_ascii_uppercase().as_str() {
        "" | "N" | "NORMAL" => "N".to_string(),
        "L" | "LOW" | "B" => "L".to_string(),
        "H" | "HIGH" | "A+" => "H".to_string(),
        "LL" | "PL" | "CRITLOW" => "LL".to_string(),
        "HH" | "PH" | "CRITHIGH" => "HH".to_string(),
        "A" | "ABN" | "ABNORMAL" => "A".to_string(),
        other => other.to_string(),
    }
}

/// First numeric run of at least `min_digits` digits embedded in a field
///
/// Used when a P record carries no patient id and the order record must
/// be scanned for one.
pub fn embedded_numeric_id(field: &str, min_digits: usize) -> Option<String> {
    let bytes = field.as_bytes();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            if i - s >= min_digits {
                return Some(field[s..i].to_string());
            }
        }
    }
    if let Some(s) = start {
        if bytes.len() - s >= min_digits {
            return Some(field[s..].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_xor() {
        // XOR over STX .. ETX inclusive
        let frame = [STX, b'1', b'P', b'|', b'1', ETX];
        let sum = astm_checksum(&frame);
        assert_eq!(sum, 0x02 ^ b'1' ^ b'P' ^ b'|' ^ b'1' ^ 0x03);
        assert_eq!(format_checksum(0x0A), "0A");
        assert_eq!(format_checksum(0xF3), "F3");
    }

    #[test]
    fn test_parse_dob() {
        assert_eq!(parse_dob("20050101"), "2005-01-01");
        assert_eq!(parse_dob("19991231"), "1999-12-31");
        // Month 13 does not parse, raw token kept
        assert_eq!(parse_dob("20051301"), "20051301");
        assert_eq!(parse_dob("01/02/2003"), "01/02/2003");
        assert_eq!(parse_dob(""), "");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("^ADUKO^HARRIET"), "HARRIET ADUKO");
        assert_eq!(normalize_name("DOE^JANE^Q"), "JANE DOE Q");
        assert_eq!(normalize_name("HARRIET  ADUKO"), "HARRIET ADUKO");
        assert_eq!(normalize_name("^SMITH"), "SMITH");
        assert_eq!(normalize_name(""), "");
    }

    #[test]
    fn test_normalize_flag() {
        assert_eq!(normalize_flag("N"), "N");
        assert_eq!(normalize_flag("high"), "H");
        assert_eq!(normalize_flag("PL"), "LL");
        assert_eq!(normalize_flag("*W*"), "*W*");
    }

    #[test]
    fn test_embedded_numeric_id() {
        assert_eq!(
            embedded_numeric_id("SAMPLE-475371-A", 4),
            Some("475371".to_string())
        );
        assert_eq!(embedded_numeric_id("ABC-12", 4), None);
        assert_eq!(embedded_numeric_id("990012", 4), Some("990012".to_string()));
    }
}
