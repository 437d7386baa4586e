//! Connection snapshot, event records and connect options

use chrono::{DateTime, Utc};
use obd_protocol::{DriverMetrics, ObdProtocol, TransportAddress, TransportKind};
use serde::{Deserialize, Serialize};

/// Failure reason recorded when no candidate transport produced an adapter
pub const ADAPTER_NOT_FOUND: &str = "adapter_not_found";

/// Failure reason recorded when a connected adapter goes away
pub const CONNECTION_LOST: &str = "connection_lost";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Externally visible manager state. Observers always get a copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub port_path: Option<String>,
    pub baud_rate: Option<u32>,
    /// Adapter identity reported by `ATI`
    pub identity: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub bluetooth_address: Option<String>,
    pub bluetooth_name: Option<String>,
    pub bluetooth_channel: Option<u8>,
    pub metrics: Option<DriverMetrics>,
    pub reconnect_attempts: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Replace the transport identity with `address`
    pub(crate) fn set_address(&mut self, address: &TransportAddress) {
        self.port_path = None;
        self.baud_rate = None;
        self.bluetooth_address = None;
        self.bluetooth_name = None;
        self.bluetooth_channel = None;
        match address {
            TransportAddress::Serial {
                port_path,
                baud_rate,
            } => {
                self.port_path = Some(port_path.clone());
                self.baud_rate = Some(*baud_rate);
            }
            TransportAddress::Bluetooth {
                address,
                name,
                channel,
            } => {
                self.bluetooth_address = Some(address.clone());
                self.bluetooth_name = name.clone();
                self.bluetooth_channel = Some(*channel);
            }
            TransportAddress::Simulated { .. } => {}
        }
    }
}

/// Entry in the connection event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionEvent {
    /// The connection state changed
    State {
        state: ConnectionState,
        transport: Option<TransportKind>,
        port_path: Option<String>,
        bluetooth_address: Option<String>,
        bluetooth_name: Option<String>,
        bluetooth_channel: Option<u8>,
        metrics: Option<DriverMetrics>,
    },
    /// A new failure reason was recorded
    Error {
        state: ConnectionState,
        error: String,
    },
}

impl ConnectionEvent {
    pub(crate) fn state_of(snapshot: &ConnectionSnapshot) -> Self {
        ConnectionEvent::State {
            state: snapshot.state,
            transport: snapshot.transport,
            port_path: snapshot.port_path.clone(),
            bluetooth_address: snapshot.bluetooth_address.clone(),
            bluetooth_name: snapshot.bluetooth_name.clone(),
            bluetooth_channel: snapshot.bluetooth_channel,
            metrics: snapshot.metrics.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            ConnectionEvent::State { state, .. } | ConnectionEvent::Error { state, .. } => *state,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ConnectionEvent::Error { error, .. } => Some(error),
            ConnectionEvent::State { .. } => None,
        }
    }
}

/// Per-call connection overrides; unset fields fall back to settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Reconnect even if an adapter is attached
    pub force: bool,
    /// Try this transport family first
    pub transport: Option<TransportKind>,
    pub port_path: Option<String>,
    pub port_hints: Vec<String>,
    pub baud_rate: Option<u32>,
    pub bluetooth_address: Option<String>,
    pub bluetooth_name: Option<String>,
    pub bluetooth_channel: Option<u8>,
    pub device_hints: Vec<String>,
    pub channel_hints: Vec<u8>,
    pub protocol_profile: Option<String>,
    pub protocol: Option<ObdProtocol>,
}

impl ConnectOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}
