//! OBD-II Protocol Implementation
//!
//! Transports, the ELM327 command driver, PID/DTC decoding and a UDS
//! (ISO 14229) layer for OBD-II adapters reached over serial, Bluetooth SPP
//! or a simulated link.

pub mod codec;
pub mod driver;
mod error;
pub mod profile;
pub mod transport;
pub mod uds;

pub use codec::{DtcEntry, DtcSeverity, DtcStatus, Pid, PidDefinition};
pub use driver::{
    DriverEvent, DriverMetrics, DriverOptions, Elm327Driver, LiveData, ObdStatus, Readiness,
};
pub use error::ObdError;
pub use profile::{ObdProtocol, ProtocolProfile};
pub use transport::simulated::SimulatedReply;
pub use transport::{
    RuntimeEnvironment, SimulatedTransport, Transport, TransportAddress, TransportError,
    TransportEvent, TransportKind,
};
pub use uds::{DidReading, DidValue, NegativeResponseCode, UdsService};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Stored diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
