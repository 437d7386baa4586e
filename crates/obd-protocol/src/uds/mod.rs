//! ISO 14229 (UDS) over the ELM327 command driver
//!
//! Requests are sent as hex text through [`Elm327Driver`](crate::Elm327Driver)
//! and the replies are classified into positive responses (`SID + 0x40`)
//! and negative responses (`7F SID NRC`).

mod nrc;
mod service;

pub use nrc::NegativeResponseCode;
pub use service::{UdsService, ECU_RESET_SETTLE};

use crate::error::ObdError;
use serde::{Deserialize, Serialize};

/// Offset added to a service id in its positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

pub mod session {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    pub const SOFT_RESET: u8 = 0x03;
}

/// Data identifiers with a known interpretation
pub mod did {
    pub const VIN: u16 = 0xF190;
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    pub const HV_BATTERY_VOLTAGE: u16 = 0x0100;
    pub const HV_BATTERY_CURRENT: u16 = 0x0101;
    pub const HV_STATE_OF_CHARGE: u16 = 0x0102;
    pub const HV_BATTERY_TEMP: u16 = 0x0103;
    pub const INVERTER_TEMP: u16 = 0x0110;
    pub const MG1_SPEED: u16 = 0x0120;
    pub const MG2_SPEED: u16 = 0x0121;
}

/// Interpreted DID payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DidValue {
    Text(String),
    Number(f64),
    Raw(Vec<u8>),
}

/// One read-data-by-identifier result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidReading {
    pub did: u16,
    pub data: Vec<u8>,
    pub value: DidValue,
}

/// Interpret `data` for well-known DIDs, falling back to the raw bytes
pub fn parse_did_data(id: u16, data: &[u8]) -> DidValue {
    let word = || (data.len() >= 2).then(|| u16::from_be_bytes([data[0], data[1]]));
    let first = data.first().copied();

    let number = match id {
        did::VIN => return DidValue::Text(String::from_utf8_lossy(data).into_owned()),
        did::ECU_SERIAL_NUMBER => {
            let text = String::from_utf8_lossy(data).replace('\0', "");
            return DidValue::Text(text.trim().to_string());
        }
        did::HV_BATTERY_VOLTAGE => word().map(|raw| f64::from(raw) * 0.1),
        did::HV_BATTERY_CURRENT => word().map(|raw| f64::from(raw) / 10.0 - 100.0),
        did::HV_STATE_OF_CHARGE => first.map(f64::from),
        did::HV_BATTERY_TEMP | did::INVERTER_TEMP => first.map(|a| f64::from(a) - 40.0),
        did::MG1_SPEED | did::MG2_SPEED => word().map(f64::from),
        _ => None,
    };

    number
        .map(DidValue::Number)
        .unwrap_or_else(|| DidValue::Raw(data.to_vec()))
}

/// Classify a UDS reply to `service` and return the bytes after the
/// positive response id.
///
/// The first positive id or `7F <service>` pair found wins, which skips any
/// CAN header or length byte the adapter prepends.
pub fn parse_uds_response(bytes: &[u8], service: u8) -> Result<&[u8], ObdError> {
    let positive = service.wrapping_add(POSITIVE_RESPONSE_OFFSET);

    for (i, &byte) in bytes.iter().enumerate() {
        if byte == positive {
            return Ok(&bytes[i + 1..]);
        }
        if byte == service_id::NEGATIVE_RESPONSE && bytes.get(i + 1) == Some(&service) {
            let nrc = bytes.get(i + 2).copied().ok_or_else(|| {
                ObdError::Protocol(format!(
                    "truncated negative response to service 0x{:02X}",
                    service
                ))
            })?;
            return Err(ObdError::NegativeResponse {
                service_id: service,
                nrc: NegativeResponseCode::from(nrc),
            });
        }
    }

    Err(ObdError::Protocol(format!(
        "no response to service 0x{:02X} in {:02X?}",
        service, bytes
    )))
}
