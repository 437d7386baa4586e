//! PID and DTC codec
//!
//! Pure decoding of adapter payloads. Nothing here performs I/O; malformed
//! input yields `None` or an empty list rather than an error so that bulk
//! reads can degrade per field.

mod describe;
mod dtc;
mod pid;

pub use describe::{describe_dtc, normalize_dtc_code, severity_for, DtcDescription, DtcSeverity};
pub use dtc::{decode_dtc, encode_dtc, is_valid_dtc, parse_dtc_response, DtcEntry, DtcStatus};
pub use pid::{decode_pid, decode_pid_hex, lookup, Pid, PidDefinition, PID_TABLE};

/// Extract data bytes from a cleaned ELM327 response.
///
/// Tokens are split on whitespace. Even-length hex tokens are read as byte
/// pairs, which covers both spaced (`41 0C 1A F8`) and unspaced
/// (`410C1AF8`) output. An odd-length token is treated as carrying an 11-bit
/// CAN header (`7E8`) in its first three characters, which are dropped.
/// Tokens containing non-hex characters (`SEARCHING...`, `NO DATA`) are skipped.
pub fn response_bytes(response: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for token in response.split_whitespace() {
        if !token.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let digits = if token.len() % 2 == 1 {
            if token.len() < 3 {
                continue;
            }
            &token[3..]
        } else {
            token
        };
        if let Ok(decoded) = hex::decode(digits) {
            bytes.extend(decoded);
        }
    }
    bytes
}

/// Locate the Mode 01 reply for `pid` (`41 <pid>`) and return the bytes after it
pub fn extract_mode01_payload(bytes: &[u8], pid: u8) -> Option<&[u8]> {
    bytes
        .windows(2)
        .position(|w| w[0] == 0x41 && w[1] == pid)
        .map(|idx| &bytes[idx + 2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_bytes_spaced() {
        assert_eq!(response_bytes("41 0C 1A F8"), vec![0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_response_bytes_unspaced_with_header() {
        assert_eq!(
            response_bytes("7E804410C1AF8"),
            vec![0x04, 0x41, 0x0C, 0x1A, 0xF8]
        );
        assert_eq!(
            response_bytes("7E8 04 41 0C 1A F8"),
            vec![0x04, 0x41, 0x0C, 0x1A, 0xF8]
        );
    }

    #[test]
    fn test_response_bytes_skips_text() {
        assert_eq!(response_bytes("SEARCHING... 41 00 BE"), vec![0x41, 0x00, 0xBE]);
        assert!(response_bytes("NO DATA").is_empty());
        assert!(response_bytes("?").is_empty());
    }

    #[test]
    fn test_extract_mode01_payload() {
        let bytes = response_bytes("7E8 04 41 0C 1A F8");
        assert_eq!(extract_mode01_payload(&bytes, 0x0C), Some(&[0x1A, 0xF8][..]));
        assert_eq!(extract_mode01_payload(&bytes, 0x0D), None);
    }
}
