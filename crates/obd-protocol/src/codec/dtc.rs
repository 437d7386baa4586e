//! Diagnostic trouble code encoding
//!
//! Two bytes per code (SAE J2012): bits 7-6 of the first byte select the
//! system letter, the remaining 14 bits are four packed digits.

use super::describe::{describe_dtc, DtcSeverity};
use serde::{Deserialize, Serialize};

const SYSTEMS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Where a code was reported from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcStatus {
    /// Mode 03, confirmed
    Current,
    /// Mode 07, pending
    Pending,
    /// Mode 0A, permanent
    Permanent,
}

impl DtcStatus {
    /// Request mode byte
    pub fn mode(&self) -> u8 {
        match self {
            DtcStatus::Current => crate::mode::READ_DTC,
            DtcStatus::Pending => crate::mode::PENDING_DTC,
            DtcStatus::Permanent => crate::mode::PERMANENT_DTC,
        }
    }

    /// Positive response marker (mode + 0x40)
    pub fn response_marker(&self) -> u8 {
        self.mode() + 0x40
    }
}

/// A decoded trouble code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtcEntry {
    pub code: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub severity: Option<DtcSeverity>,
    pub status: Option<DtcStatus>,
}

impl DtcEntry {
    /// Bare code without enrichment
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: None,
            category: None,
            severity: None,
            status: None,
        }
    }

    /// Code with description, category and severity from the built-in table
    pub fn described(code: &str, status: DtcStatus) -> Self {
        let info = describe_dtc(code);
        Self {
            code: info.code,
            description: Some(info.description),
            category: Some(info.category),
            severity: Some(info.severity),
            status: Some(status),
        }
    }
}

/// Decode one two-byte code
pub fn decode_dtc(a: u8, b: u8) -> String {
    let system = SYSTEMS[((a & 0xC0) >> 6) as usize];
    format!(
        "{}{:X}{:X}{:X}{:X}",
        system,
        (a & 0x30) >> 4,
        a & 0x0F,
        (b & 0xF0) >> 4,
        b & 0x0F
    )
}

/// Whether `code` is `[PCBU][0-3][0-9A-F]{3}`
pub fn is_valid_dtc(code: &str) -> bool {
    let chars: Vec<char> = code.chars().collect();
    chars.len() == 5
        && SYSTEMS.contains(&chars[0])
        && matches!(chars[1], '0'..='3')
        && chars[2..]
            .iter()
            .all(|c| c.is_ascii_digit() || matches!(c, 'A'..='F'))
}

/// Encode a five-character code back into its two bytes
pub fn encode_dtc(code: &str) -> Option<[u8; 2]> {
    if !is_valid_dtc(code) {
        return None;
    }
    let mut chars = code.chars();
    let system = chars.next()?;
    let system_bits = SYSTEMS.iter().position(|s| *s == system)? as u8;
    let digits: Vec<u8> = chars
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;
    let a = (system_bits << 6) | (digits[0] << 4) | digits[1];
    let b = (digits[2] << 4) | digits[3];
    Some([a, b])
}

/// Parse the codes out of a mode 03/07/0A response.
///
/// Data starts after the first `marker` byte. CAN adapters prefix the
/// list with a count byte; when the data length is odd and its first byte
/// equals the number of following pairs, that byte is skipped. All-zero
/// pairs are padding. Duplicates are reported once.
pub fn parse_dtc_response(bytes: &[u8], marker: u8) -> Vec<String> {
    let Some(idx) = bytes.iter().position(|b| *b == marker) else {
        return Vec::new();
    };
    let mut data = &bytes[idx + 1..];
    if data.len() % 2 == 1 && data[0] as usize == data.len() / 2 {
        data = &data[1..];
    }

    let mut codes: Vec<String> = Vec::new();
    for pair in data.chunks_exact(2) {
        if pair[0] == 0 && pair[1] == 0 {
            continue;
        }
        let code = decode_dtc(pair[0], pair[1]);
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::response_bytes;
    use proptest::prelude::*;

    #[test]
    fn test_decode_known_codes() {
        assert_eq!(decode_dtc(0x01, 0x71), "P0171");
        assert_eq!(decode_dtc(0x04, 0x20), "P0420");
        assert_eq!(decode_dtc(0x41, 0x23), "C0123");
        assert_eq!(decode_dtc(0x80, 0x01), "B0001");
        assert_eq!(decode_dtc(0xC1, 0x00), "U0100");
        assert_eq!(decode_dtc(0x3F, 0xFF), "P3FFF");
    }

    #[test]
    fn test_parse_can_response_with_count() {
        let bytes = response_bytes("43 02 01 71 04 20");
        assert_eq!(parse_dtc_response(&bytes, 0x43), vec!["P0171", "P0420"]);
    }

    #[test]
    fn test_parse_legacy_response_with_padding() {
        let bytes = response_bytes("43 01 33 00 00 00 00");
        assert_eq!(parse_dtc_response(&bytes, 0x43), vec!["P0133"]);
    }

    #[test]
    fn test_parse_multiline_with_headers() {
        let bytes = response_bytes("7E8 08 43 03 01 71 04 20 03 01");
        assert_eq!(
            parse_dtc_response(&bytes, 0x43),
            vec!["P0171", "P0420", "P0301"]
        );
    }

    #[test]
    fn test_parse_no_codes() {
        assert!(parse_dtc_response(&response_bytes("43 00"), 0x43).is_empty());
        assert!(parse_dtc_response(&response_bytes("NO DATA"), 0x43).is_empty());
    }

    #[test]
    fn test_parse_deduplicates() {
        let bytes = response_bytes("43 01 71 01 71");
        assert_eq!(parse_dtc_response(&bytes, 0x43), vec!["P0171"]);
    }

    #[test]
    fn test_invalid_codes_rejected() {
        assert_eq!(encode_dtc("P4000"), None);
        assert_eq!(encode_dtc("X0171"), None);
        assert_eq!(encode_dtc("P017"), None);
        assert_eq!(encode_dtc("p0171"), None);
    }

    fn dtc_code() -> impl Strategy<Value = String> {
        "[PCBU][0-3][0-9A-F]{3}"
    }

    proptest! {
        #[test]
        fn prop_encode_then_decode(code in dtc_code()) {
            let [a, b] = encode_dtc(&code).unwrap();
            prop_assert_eq!(decode_dtc(a, b), code);
        }

        #[test]
        fn prop_decode_then_encode(a in any::<u8>(), b in any::<u8>()) {
            let code = decode_dtc(a, b);
            prop_assert!(is_valid_dtc(&code));
            prop_assert_eq!(encode_dtc(&code), Some([a, b]));
        }
    }
}
