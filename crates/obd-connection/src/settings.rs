//! Agent settings
//!
//! Typed defaults, an optional `kiosk-agent` file, then `OBD_*` environment
//! variables. `AGENT_ENV` and the Android markers are read directly.

use crate::retry::RetryPolicy;
use obd_protocol::{DriverOptions, ObdProtocol, RuntimeEnvironment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Environment variables whose presence marks an Android host
pub const ANDROID_MARKERS: [&str; 3] = ["ANDROID_ROOT", "ANDROID_DATA", "ANDROID_STORAGE"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// How Bluetooth takes part in connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BluetoothPolicy {
    /// Never attempted
    Disabled,
    /// Attempted after serial
    Fallback,
    /// Attempted before serial
    Preferred,
}

/// Interpret an `OBD_BLUETOOTH` value; `None` when the value is unrecognised
pub fn parse_bluetooth_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "bluetooth" => Some(true),
        "0" | "false" | "off" | "serial" => Some(false),
        _ => None,
    }
}

/// Whether the process runs on an Android host
pub fn detect_android() -> bool {
    ANDROID_MARKERS
        .iter()
        .any(|name| std::env::var_os(name).map_or(false, |v| !v.is_empty()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Raw `OBD_BLUETOOTH` flag
    pub bluetooth: Option<String>,
    pub timeout_ms: u64,
    pub baud_rate: u32,
    pub protocol_profile: String,
    /// Explicit protocol, bypasses negotiation
    pub protocol: Option<String>,
    pub port: Option<String>,
    pub bt_address: Option<String>,
    pub bt_name: Option<String>,
    pub bt_channel: Option<u8>,
    pub keepalive_ms: u64,
    /// Monitor period
    pub reconnect_interval_ms: u64,
    /// Minimum delay before retrying after a failed attempt
    pub reconnect_delay_ms: u64,
    pub bt_discovery_timeout_ms: u64,
    pub connect_max_attempts: Option<u32>,
    pub connect_base_delay_ms: Option<u64>,
    pub connect_max_delay_ms: Option<u64>,
    #[serde(skip)]
    pub android: bool,
    #[serde(skip, default = "default_environment")]
    pub environment: RuntimeEnvironment,
}

fn default_environment() -> RuntimeEnvironment {
    RuntimeEnvironment::Development
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            bluetooth: None,
            timeout_ms: 2000,
            baud_rate: 38400,
            protocol_profile: "auto".to_string(),
            protocol: None,
            port: None,
            bt_address: None,
            bt_name: None,
            bt_channel: None,
            keepalive_ms: 45_000,
            reconnect_interval_ms: 30_000,
            reconnect_delay_ms: 5000,
            bt_discovery_timeout_ms: 15_000,
            connect_max_attempts: None,
            connect_base_delay_ms: None,
            connect_max_delay_ms: None,
            android: false,
            environment: RuntimeEnvironment::Development,
        }
    }
}

impl AgentSettings {
    /// Load from the process environment
    pub fn load() -> Result<Self, SettingsError> {
        let mut settings =
            Self::load_from(config::Environment::with_prefix("OBD").try_parsing(true))?;
        settings.android = detect_android();
        settings.environment = RuntimeEnvironment::from_env();
        Ok(settings)
    }

    /// Load with an explicit environment source
    pub fn load_from(environment: config::Environment) -> Result<Self, SettingsError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("kiosk-agent").required(false))
            .add_source(environment)
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn bluetooth_policy(&self) -> BluetoothPolicy {
        match self.bluetooth.as_deref().and_then(parse_bluetooth_flag) {
            Some(true) => BluetoothPolicy::Preferred,
            Some(false) => BluetoothPolicy::Disabled,
            None if self.android => BluetoothPolicy::Preferred,
            None => BluetoothPolicy::Fallback,
        }
    }

    /// Explicit protocol, ignoring values that name no known protocol
    pub fn explicit_protocol(&self) -> Option<ObdProtocol> {
        let raw = self.protocol.as_deref()?;
        match raw.parse() {
            Ok(protocol) => Some(protocol),
            Err(e) => {
                warn!("[obd-connection] ignoring OBD_PROTOCOL: {}", e);
                None
            }
        }
    }

    /// Driver options for a connection attempt; keep-alive is started by the manager
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            timeout_ms: self.timeout_ms,
            baud_rate: self.baud_rate,
            keep_alive_interval_ms: None,
            protocol_profile: self.protocol_profile.clone(),
            protocol: self.explicit_protocol(),
        }
    }

    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::connect().with_overrides(
            self.connect_max_attempts,
            self.connect_base_delay_ms,
            self.connect_max_delay_ms,
        )
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.bt_discovery_timeout_ms)
    }
}
