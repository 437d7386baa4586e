//! OBD-II PID Definitions and Decoding
//!
//! Mode 01 parameter table with SAE J1979 formulas, keyed by (mode, pid).

use serde::{Deserialize, Serialize};

/// Commonly used Mode 01 PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Monitor status since DTCs cleared (0x01)
    MonitorStatus = 0x01,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
}

impl Pid {
    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Mode 01 request text, e.g. `010C`
    pub fn command(&self) -> String {
        format!("01{:02X}", self.as_hex())
    }

    /// Table entry for this PID
    pub fn definition(&self) -> Option<&'static PidDefinition> {
        lookup(crate::mode::CURRENT_DATA, self.as_hex())
    }
}

/// One queryable parameter
#[derive(Debug)]
pub struct PidDefinition {
    pub mode: u8,
    pub pid: u8,
    pub name: &'static str,
    /// Number of data bytes the formula consumes
    pub bytes: usize,
    pub unit: &'static str,
    pub min: f64,
    pub max: f64,
    formula: fn(&[u8]) -> f64,
}

impl PidDefinition {
    /// Decode a payload (data bytes after the `41 <pid>` marker)
    pub fn decode(&self, payload: &[u8]) -> Option<f64> {
        if payload.len() < self.bytes {
            return None;
        }
        let value = (self.formula)(&payload[..self.bytes]);
        value.is_finite().then_some(value)
    }

    /// Whether a decoded value lies inside the documented range
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

fn word(b: &[u8]) -> f64 {
    b[0] as f64 * 256.0 + b[1] as f64
}

pub static PID_TABLE: &[PidDefinition] = &[
    PidDefinition {
        mode: 0x01,
        pid: 0x04,
        name: "engine_load",
        bytes: 1,
        unit: "%",
        min: 0.0,
        max: 100.0,
        formula: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x05,
        name: "coolant_temp",
        bytes: 1,
        unit: "°C",
        min: -40.0,
        max: 215.0,
        formula: |b| b[0] as f64 - 40.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x06,
        name: "short_fuel_trim",
        bytes: 1,
        unit: "%",
        min: -100.0,
        max: 99.22,
        formula: |b| (b[0] as f64 - 128.0) * 100.0 / 128.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x07,
        name: "long_fuel_trim",
        bytes: 1,
        unit: "%",
        min: -100.0,
        max: 99.22,
        formula: |b| (b[0] as f64 - 128.0) * 100.0 / 128.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x0B,
        name: "intake_manifold_pressure",
        bytes: 1,
        unit: "kPa",
        min: 0.0,
        max: 255.0,
        formula: |b| b[0] as f64,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x0C,
        name: "rpm",
        bytes: 2,
        unit: "rpm",
        min: 0.0,
        max: 16383.75,
        formula: |b| word(b) / 4.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x0D,
        name: "vehicle_speed",
        bytes: 1,
        unit: "km/h",
        min: 0.0,
        max: 255.0,
        formula: |b| b[0] as f64,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x0E,
        name: "timing_advance",
        bytes: 1,
        unit: "°",
        min: -64.0,
        max: 63.5,
        formula: |b| b[0] as f64 / 2.0 - 64.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x0F,
        name: "intake_air_temp",
        bytes: 1,
        unit: "°C",
        min: -40.0,
        max: 215.0,
        formula: |b| b[0] as f64 - 40.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x10,
        name: "maf",
        bytes: 2,
        unit: "g/s",
        min: 0.0,
        max: 655.35,
        formula: |b| word(b) / 100.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x11,
        name: "throttle_position",
        bytes: 1,
        unit: "%",
        min: 0.0,
        max: 100.0,
        formula: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x1F,
        name: "run_time",
        bytes: 2,
        unit: "s",
        min: 0.0,
        max: 65535.0,
        formula: word,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x2F,
        name: "fuel_level",
        bytes: 1,
        unit: "%",
        min: 0.0,
        max: 100.0,
        formula: |b| b[0] as f64 * 100.0 / 255.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x33,
        name: "barometric_pressure",
        bytes: 1,
        unit: "kPa",
        min: 0.0,
        max: 255.0,
        formula: |b| b[0] as f64,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x42,
        name: "control_module_voltage",
        bytes: 2,
        unit: "V",
        min: 0.0,
        max: 65.535,
        formula: |b| word(b) / 1000.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x46,
        name: "ambient_air_temp",
        bytes: 1,
        unit: "°C",
        min: -40.0,
        max: 215.0,
        formula: |b| b[0] as f64 - 40.0,
    },
    PidDefinition {
        mode: 0x01,
        pid: 0x5C,
        name: "oil_temp",
        bytes: 1,
        unit: "°C",
        min: -40.0,
        max: 215.0,
        formula: |b| b[0] as f64 - 40.0,
    },
];

/// Find the definition for (mode, pid)
pub fn lookup(mode: u8, pid: u8) -> Option<&'static PidDefinition> {
    PID_TABLE.iter().find(|d| d.mode == mode && d.pid == pid)
}

/// Decode a payload; `None` when the PID is unknown or the payload is short
pub fn decode_pid(mode: u8, pid: u8, payload: &[u8]) -> Option<f64> {
    lookup(mode, pid)?.decode(payload)
}

/// Decode a hex payload such as `"1A F8"` or `"1AF8"`
pub fn decode_pid_hex(mode: u8, pid: u8, payload: &str) -> Option<f64> {
    let compact: String = payload.split_whitespace().collect();
    let bytes = hex::decode(compact).ok()?;
    decode_pid(mode, pid, &bytes)
}
