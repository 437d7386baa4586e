//! Byte-stream transports for ELM327 adapters
//!
//! - Serial/USB via `tokio-serial`
//! - Bluetooth SPP over an RFCOMM socket (Linux)
//! - Deterministic simulated adapter for tests
//!
//! Transports know nothing about the ELM327 dialect. They deliver inbound
//! bytes, closure and errors through a broadcast subscription; dropping the
//! receiver detaches the listener.

pub mod bluetooth;
pub mod error;
pub mod serial;
pub mod simulated;
mod stream;

pub use bluetooth::{BluetoothDevice, BluetoothTransport};
pub use error::TransportError;
pub use serial::{list_ports, SerialPortDescriptor, SerialTransport};
pub use simulated::SimulatedTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Line terminator appended to every command
pub const LINE_TERMINATOR: &[u8] = b"\r";

/// Capacity of each transport's event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes received
    Data(Vec<u8>),
    /// Link closed (remote hang-up or local close)
    Closed,
    /// Link failed
    Error(String),
}

/// Transport family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Bluetooth,
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Bluetooth => write!(f, "bluetooth"),
            TransportKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Address of the underlying link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportAddress {
    Serial {
        port_path: String,
        baud_rate: u32,
    },
    Bluetooth {
        address: String,
        name: Option<String>,
        channel: u8,
    },
    Simulated {
        label: String,
    },
}

/// Runtime environment, used to refuse test-only transports in production
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    Development,
    Production,
}

impl RuntimeEnvironment {
    /// Interpret an `AGENT_ENV` value
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => RuntimeEnvironment::Production,
            _ => RuntimeEnvironment::Development,
        }
    }

    /// Read `AGENT_ENV` from the process environment
    pub fn from_env() -> Self {
        std::env::var("AGENT_ENV")
            .map(|v| Self::parse(&v))
            .unwrap_or(RuntimeEnvironment::Development)
    }

    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeEnvironment::Production)
    }
}

/// Duplex byte connection owned by one command driver
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the link
    async fn open(&self) -> Result<(), TransportError>;

    /// Release the link; closing a closed transport is a no-op
    async fn close(&self) -> Result<(), TransportError>;

    /// Write command bytes followed by [`LINE_TERMINATOR`]
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to data, close and error notifications
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Whether the link is currently open
    fn is_open(&self) -> bool;

    fn kind(&self) -> TransportKind;

    fn address(&self) -> TransportAddress;
}
