//! Mode 01 PID 01 monitor status and the live-data bundle

use serde::{Deserialize, Serialize};

/// Ignition type reported in bit 3 of byte B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnitionType {
    Spark,
    Compression,
}

/// Readiness monitors; `true` means the monitor has completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub misfire: bool,
    pub fuel_system: bool,
    pub components: bool,
    pub catalyst: bool,
    pub heated_catalyst: bool,
    pub evap_system: bool,
    pub secondary_air_system: bool,
    pub ac_refrigerant: bool,
    pub oxygen_sensor: bool,
    pub oxygen_sensor_heater: bool,
    pub egr_system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdStatus {
    pub mil_on: bool,
    pub dtc_count: u8,
    pub ignition: IgnitionType,
    pub readiness: Readiness,
}

fn complete(byte: u8, mask: u8) -> bool {
    byte & mask == 0
}

/// Decode the `41 01 A B C D` reply
pub fn parse_status(bytes: &[u8]) -> Option<ObdStatus> {
    let payload = crate::codec::extract_mode01_payload(bytes, 0x01)?;
    let &[a, b, c, d] = payload.get(..4)? else {
        return None;
    };

    let ignition = if b & 0x08 == 0 {
        IgnitionType::Spark
    } else {
        IgnitionType::Compression
    };

    let mut readiness = Readiness {
        misfire: complete(b, 0x01),
        fuel_system: complete(b, 0x02),
        components: complete(b, 0x04),
        ..Default::default()
    };

    match ignition {
        IgnitionType::Spark => {
            readiness.catalyst = complete(c, 0x01);
            readiness.heated_catalyst = complete(c, 0x02);
            readiness.evap_system = complete(c, 0x04);
            readiness.secondary_air_system = complete(c, 0x08);
            readiness.ac_refrigerant = complete(c, 0x10);
            readiness.oxygen_sensor = complete(c, 0x20);
            readiness.oxygen_sensor_heater = complete(c, 0x40);
            readiness.egr_system = complete(c, 0x80);
        }
        IgnitionType::Compression => {
            readiness.catalyst = complete(d, 0x01);
            readiness.heated_catalyst = complete(d, 0x02);
            readiness.evap_system = complete(d, 0x04);
            // not monitored on diesel
            readiness.secondary_air_system = true;
            readiness.ac_refrigerant = complete(d, 0x08);
            readiness.oxygen_sensor = complete(d, 0x10);
            readiness.oxygen_sensor_heater = true;
            readiness.egr_system = complete(d, 0x20);
        }
    }

    Some(ObdStatus {
        mil_on: a & 0x80 != 0,
        dtc_count: a & 0x7F,
        ignition,
        readiness,
    })
}

/// Common live parameters; a field is `None` when its PID failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub rpm: Option<f64>,
    pub coolant_temp_c: Option<f64>,
    pub intake_temp_c: Option<f64>,
    pub vehicle_speed_kmh: Option<f64>,
    pub battery_voltage_v: Option<f64>,
    pub throttle_pos_percent: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::response_bytes;

    #[test]
    fn test_spark_status() {
        let status = parse_status(&response_bytes("41 01 83 07 65 04")).unwrap();
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 3);
        assert_eq!(status.ignition, IgnitionType::Spark);
        assert!(!status.readiness.misfire);
        assert!(!status.readiness.components);
        // C = 0x65 = 0110_0101
        assert!(!status.readiness.catalyst);
        assert!(status.readiness.heated_catalyst);
        assert!(!status.readiness.evap_system);
        assert!(status.readiness.secondary_air_system);
        assert!(!status.readiness.oxygen_sensor);
        assert!(status.readiness.egr_system);
    }

    #[test]
    fn test_compression_status() {
        let status = parse_status(&response_bytes("41 01 00 08 FF 21")).unwrap();
        assert!(!status.mil_on);
        assert_eq!(status.dtc_count, 0);
        assert_eq!(status.ignition, IgnitionType::Compression);
        assert!(status.readiness.misfire);
        assert!(!status.readiness.catalyst);
        assert!(status.readiness.heated_catalyst);
        assert!(status.readiness.secondary_air_system);
        assert!(status.readiness.oxygen_sensor_heater);
        assert!(!status.readiness.egr_system);
    }

    #[test]
    fn test_short_or_foreign_reply() {
        assert_eq!(parse_status(&response_bytes("41 01 83 07")), None);
        assert_eq!(parse_status(&response_bytes("41 0C 1A F8")), None);
        assert_eq!(parse_status(&response_bytes("NO DATA")), None);
    }
}
