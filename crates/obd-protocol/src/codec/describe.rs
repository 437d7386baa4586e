//! Built-in DTC descriptions (SAE J2012 generic codes)

use serde::{Deserialize, Serialize};

/// How urgently a code should be acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcSeverity {
    Critical,
    Warning,
    Info,
}

/// Enrichment for one code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtcDescription {
    pub code: String,
    pub description: String,
    pub severity: DtcSeverity,
    pub prefix: char,
    pub category: String,
}

static DTC_TABLE: &[(&str, &str, &str)] = &[
    ("P0100", "Mass air flow sensor circuit malfunction", "Fuel/Air"),
    ("P0101", "Mass air flow sensor range/performance", "Fuel/Air"),
    ("P0102", "Mass air flow sensor circuit low input", "Fuel/Air"),
    ("P0103", "Mass air flow sensor circuit high input", "Fuel/Air"),
    ("P0105", "Manifold absolute pressure sensor circuit malfunction", "Fuel/Air"),
    ("P0106", "Manifold absolute pressure sensor range/performance", "Fuel/Air"),
    ("P0110", "Intake air temperature sensor circuit malfunction", "Fuel/Air"),
    ("P0113", "Intake air temperature sensor circuit high input", "Fuel/Air"),
    ("P0115", "Engine coolant temperature sensor circuit malfunction", "Fuel/Air"),
    ("P0117", "Engine coolant temperature sensor circuit low input", "Fuel/Air"),
    ("P0118", "Engine coolant temperature sensor circuit high input", "Fuel/Air"),
    ("P0120", "Throttle position sensor circuit malfunction", "Fuel/Air"),
    ("P0121", "Throttle position sensor range/performance", "Fuel/Air"),
    ("P0125", "Insufficient coolant temperature for closed loop fuel control", "Fuel/Air"),
    ("P0128", "Coolant temperature below thermostat regulating temperature", "Fuel/Air"),
    ("P0130", "O2 sensor circuit malfunction (bank 1, sensor 1)", "Fuel/Air"),
    ("P0133", "O2 sensor circuit slow response (bank 1, sensor 1)", "Fuel/Air"),
    ("P0135", "O2 sensor heater circuit malfunction (bank 1, sensor 1)", "Fuel/Air"),
    ("P0141", "O2 sensor heater circuit malfunction (bank 1, sensor 2)", "Fuel/Air"),
    ("P0171", "System too lean (bank 1)", "Fuel/Air"),
    ("P0172", "System too rich (bank 1)", "Fuel/Air"),
    ("P0174", "System too lean (bank 2)", "Fuel/Air"),
    ("P0175", "System too rich (bank 2)", "Fuel/Air"),
    ("P0200", "Injector circuit malfunction", "Ignition"),
    ("P0201", "Injector circuit malfunction, cylinder 1", "Ignition"),
    ("P0202", "Injector circuit malfunction, cylinder 2", "Ignition"),
    ("P0203", "Injector circuit malfunction, cylinder 3", "Ignition"),
    ("P0204", "Injector circuit malfunction, cylinder 4", "Ignition"),
    ("P0300", "Random/multiple cylinder misfire detected", "Misfire"),
    ("P0301", "Cylinder 1 misfire detected", "Misfire"),
    ("P0302", "Cylinder 2 misfire detected", "Misfire"),
    ("P0303", "Cylinder 3 misfire detected", "Misfire"),
    ("P0304", "Cylinder 4 misfire detected", "Misfire"),
    ("P0305", "Cylinder 5 misfire detected", "Misfire"),
    ("P0306", "Cylinder 6 misfire detected", "Misfire"),
    ("P0400", "Exhaust gas recirculation flow malfunction", "Emissions"),
    ("P0401", "Exhaust gas recirculation flow insufficient", "Emissions"),
    ("P0402", "Exhaust gas recirculation flow excessive", "Emissions"),
    ("P0420", "Catalyst system efficiency below threshold (bank 1)", "Emissions"),
    ("P0430", "Catalyst system efficiency below threshold (bank 2)", "Emissions"),
    ("P0440", "Evaporative emission control system malfunction", "Emissions"),
    ("P0442", "Evaporative emission control system leak detected (small leak)", "Emissions"),
    ("P0455", "Evaporative emission control system leak detected (large leak)", "Emissions"),
    ("P0456", "Evaporative emission control system leak detected (very small leak)", "Emissions"),
    ("P0500", "Vehicle speed sensor malfunction", "Speed/Idle"),
    ("P0505", "Idle control system malfunction", "Speed/Idle"),
    ("P0506", "Idle control system RPM lower than expected", "Speed/Idle"),
    ("P0507", "Idle control system RPM higher than expected", "Speed/Idle"),
    ("P0600", "Serial communication link malfunction", "Computer"),
    ("P0601", "Internal control module memory checksum error", "Computer"),
    ("P0603", "Internal control module keep alive memory error", "Computer"),
    ("P0606", "Control module processor fault", "Computer"),
    ("P0700", "Transmission control system malfunction", "Transmission"),
    ("P0705", "Transmission range sensor circuit malfunction", "Transmission"),
    ("P0720", "Output speed sensor circuit malfunction", "Transmission"),
    ("P0730", "Incorrect gear ratio", "Transmission"),
    ("P0740", "Torque converter clutch circuit malfunction", "Transmission"),
    ("B0001", "Driver frontal stage 1 deployment control", "Body"),
    ("B0002", "Driver frontal stage 2 deployment control", "Body"),
    ("C0040", "Right front wheel speed sensor circuit", "Chassis"),
    ("C0041", "Left front wheel speed sensor circuit", "Chassis"),
    ("U0100", "Lost communication with ECM/PCM", "Network"),
    ("U0101", "Lost communication with TCM", "Network"),
    ("U0121", "Lost communication with ABS control module", "Network"),
];

/// Uppercase, strip whitespace, pad three-digit codes (`P171` -> `P0171`)
pub fn normalize_dtc_code(code: &str) -> String {
    let normalized: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let mut chars = normalized.chars();
    match (chars.next(), normalized.len()) {
        (Some(p @ ('P' | 'C' | 'B' | 'U')), 4)
            if normalized[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            format!("{}0{}", p, &normalized[1..])
        }
        _ => normalized,
    }
}

fn prefix_of(code: &str) -> char {
    match code.chars().next() {
        Some(p @ ('P' | 'C' | 'B' | 'U')) => p,
        _ => 'P',
    }
}

fn category_for_prefix(prefix: char) -> &'static str {
    match prefix {
        'B' => "Body",
        'C' => "Chassis",
        'U' => "Network",
        _ => "Powertrain",
    }
}

/// Severity from the code family
pub fn severity_for(code: &str) -> DtcSeverity {
    let code = normalize_dtc_code(code);
    let num = |range: std::ops::Range<usize>| code.get(range).and_then(|s| s.parse::<u32>().ok());

    if code.len() != 5 {
        return DtcSeverity::Info;
    }
    match prefix_of(&code) {
        'P' => match (num(1..3), num(3..5)) {
            // misfire
            (Some(3), Some(_)) => DtcSeverity::Critical,
            // ECM internal
            (Some(6), Some(0..=19)) => DtcSeverity::Critical,
            (Some(4), Some(20 | 30)) => DtcSeverity::Warning,
            (Some(1), Some(71 | 72 | 74 | 75)) => DtcSeverity::Warning,
            // O2 sensors
            (Some(1), Some(30..=69)) => DtcSeverity::Warning,
            // injectors
            (Some(2), Some(0..=8)) => DtcSeverity::Warning,
            (Some(7), Some(_)) => DtcSeverity::Warning,
            _ => DtcSeverity::Info,
        },
        'U' if matches!(code.as_str(), "U0100" | "U0101" | "U0102" | "U0121") => {
            DtcSeverity::Critical
        }
        _ => DtcSeverity::Info,
    }
}

/// Description, category and severity for a code
pub fn describe_dtc(code: &str) -> DtcDescription {
    let code = normalize_dtc_code(code);
    let prefix = prefix_of(&code);
    let severity = severity_for(&code);

    match DTC_TABLE.iter().find(|(c, _, _)| *c == code) {
        Some((_, description, category)) => DtcDescription {
            code,
            description: description.to_string(),
            severity,
            prefix,
            category: category.to_string(),
        },
        None => {
            let category = category_for_prefix(prefix);
            DtcDescription {
                description: format!("Generic OBD-II {} code", category.to_lowercase()),
                code,
                severity: DtcSeverity::Info,
                prefix,
                category: category.to_string(),
            }
        }
    }
}
