//! OBD-II Connection Management
//!
//! Discovers ELM327 adapters on serial ports and Bluetooth, keeps exactly one
//! initialized driver attached, and reconnects in the background when the
//! link drops.
//!
//! ```ignore
//! let settings = AgentSettings::load()?;
//! let manager = ConnectionManager::new(settings, Arc::new(SystemConnector));
//! manager.start();
//! let dtcs = manager.with_driver(|driver| async move { driver.read_dtc().await }).await?;
//! ```

mod connector;
pub mod discovery;
mod manager;
mod retry;
mod settings;
mod state;

pub use connector::{probe_adapter, AttemptPlan, DetectedAdapter, SystemConnector, TransportConnector};
pub use manager::{ConnectionManager, EventSubscription, EVENT_LOG_CAPACITY, EVENT_REPLAY};
pub use retry::RetryPolicy;
pub use settings::{detect_android, parse_bluetooth_flag, AgentSettings, BluetoothPolicy, SettingsError};
pub use state::{
    ConnectOptions, ConnectionEvent, ConnectionSnapshot, ConnectionState, ADAPTER_NOT_FOUND,
    CONNECTION_LOST,
};

pub use ring_buffer::{EventPage, LoggedEvent};
