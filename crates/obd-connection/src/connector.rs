//! Transport autodetection
//!
//! A [`TransportConnector`] performs one autodetection pass over a transport
//! family and hands back an initialized driver. The manager decides the order
//! of families and what to do with the result.

use crate::discovery::{
    baud_candidates, channel_candidates, rank_bluetooth_devices, rank_serial_ports,
    score_bluetooth_device,
};
use async_trait::async_trait;
use obd_protocol::transport::bluetooth::{
    connect_first_channel, discover_devices, find_spp_channel, parse_address, BluetoothDevice,
};
use obd_protocol::transport::{list_ports, SerialTransport};
use obd_protocol::{DriverOptions, Elm327Driver, ObdError, Transport, TransportError, TransportKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Inputs for one autodetection pass
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptPlan {
    /// Serial paths to try before enumerated ports
    pub port_hints: Vec<String>,
    pub baud_rate: u32,
    /// Bluetooth addresses or names to favour
    pub device_hints: Vec<String>,
    pub channel_hints: Vec<u8>,
    pub discovery_timeout: Duration,
    pub driver_options: DriverOptions,
}

/// An opened, initialized adapter
pub struct DetectedAdapter {
    pub driver: Arc<Elm327Driver>,
    /// `ATI` reply
    pub identity: Option<String>,
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Run autodetection over `kind`; `Ok(None)` when no adapter answered
    async fn connect(
        &self,
        kind: TransportKind,
        plan: &AttemptPlan,
    ) -> Result<Option<DetectedAdapter>, ObdError>;
}

/// Open and initialize a driver over `transport`
pub async fn probe_adapter(
    transport: Arc<dyn Transport>,
    options: DriverOptions,
) -> Result<DetectedAdapter, ObdError> {
    let driver = Arc::new(Elm327Driver::new(transport, options));
    driver.open().await?;
    let identity = match driver.identify().await {
        Ok(identity) if !identity.is_empty() => Some(identity),
        Ok(_) => None,
        Err(e) => {
            debug!("[obd-connection] ATI failed after init: {}", e);
            None
        }
    };
    Ok(DetectedAdapter { driver, identity })
}

/// Autodetection against the host's serial ports and BlueZ
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

impl SystemConnector {
    async fn detect_serial(&self, plan: &AttemptPlan) -> Option<DetectedAdapter> {
        let ports = list_ports().unwrap_or_else(|e| {
            warn!("[obd-connection] serial enumeration failed: {}", e);
            Vec::new()
        });
        let ranked = rank_serial_ports(ports, &plan.port_hints);
        if ranked.is_empty() {
            debug!("[obd-connection] no serial ports to probe");
            return None;
        }

        for port in ranked {
            for baud in baud_candidates(plan.baud_rate) {
                debug!("[obd-connection] probing {} at {} baud", port.path, baud);
                let transport = Arc::new(SerialTransport::new(&port.path, baud));
                let options = DriverOptions {
                    baud_rate: baud,
                    ..plan.driver_options.clone()
                };
                match probe_adapter(transport, options).await {
                    Ok(detected) => {
                        info!("[obd-connection] adapter found on {} at {} baud", port.path, baud);
                        return Some(detected);
                    }
                    // port cannot be opened at all, other rates will not help
                    Err(ObdError::Connection(e)) => {
                        debug!("[obd-connection] {} unavailable: {}", port.path, e);
                        break;
                    }
                    Err(e) => debug!("[obd-connection] {} at {} baud: {}", port.path, baud, e),
                }
            }
        }
        None
    }

    async fn detect_bluetooth(&self, plan: &AttemptPlan) -> Option<DetectedAdapter> {
        let mut devices = match discover_devices(plan.discovery_timeout).await {
            Ok(devices) => devices,
            Err(TransportError::Unsupported(reason)) => {
                info!("[obd-connection] bluetooth unavailable: {}", reason);
                return None;
            }
            Err(e) => {
                warn!("[obd-connection] bluetooth discovery failed: {}", e);
                Vec::new()
            }
        };
        for hint in &plan.device_hints {
            let known = devices.iter().any(|d| d.address.eq_ignore_ascii_case(hint));
            if !known && parse_address(hint).is_some() {
                devices.push(BluetoothDevice {
                    address: hint.to_uppercase(),
                    name: None,
                });
            }
        }

        // devices that are neither hinted nor adapter-like are skipped
        let candidates: Vec<BluetoothDevice> = rank_bluetooth_devices(devices, &plan.device_hints)
            .into_iter()
            .filter(|d| score_bluetooth_device(d, &plan.device_hints) >= 10)
            .collect();
        if candidates.is_empty() {
            debug!("[obd-connection] no bluetooth adapter candidates");
            return None;
        }

        for device in candidates {
            let advertised = find_spp_channel(&device.address).await;
            let channels = channel_candidates(&plan.channel_hints, advertised);
            let transport = match connect_first_channel(&device, &channels).await {
                Ok(transport) => transport,
                Err(e) => {
                    debug!("[obd-connection] {} not reachable: {}", device.address, e);
                    continue;
                }
            };
            let channel = transport.channel();
            match probe_adapter(Arc::new(transport), plan.driver_options.clone()).await {
                Ok(detected) => {
                    info!(
                        "[obd-connection] adapter found at {} channel {}",
                        device.address, channel
                    );
                    return Some(detected);
                }
                Err(e) => debug!("[obd-connection] {} did not initialize: {}", device.address, e),
            }
        }
        None
    }
}

#[async_trait]
impl TransportConnector for SystemConnector {
    async fn connect(
        &self,
        kind: TransportKind,
        plan: &AttemptPlan,
    ) -> Result<Option<DetectedAdapter>, ObdError> {
        Ok(match kind {
            TransportKind::Serial => self.detect_serial(plan).await,
            TransportKind::Bluetooth => self.detect_bluetooth(plan).await,
            TransportKind::Simulated => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::{RuntimeEnvironment, SimulatedTransport};

    #[tokio::test]
    async fn test_probe_adapter_reads_identity() {
        let sim = Arc::new(SimulatedTransport::new(RuntimeEnvironment::Development).unwrap());
        let detected = probe_adapter(sim, DriverOptions::default()).await.unwrap();
        assert!(detected.driver.is_connected());
        assert_eq!(detected.identity.as_deref(), Some("ELM327 v2.1"));
    }

    #[tokio::test]
    async fn test_probe_adapter_open_failure() {
        let sim = Arc::new(SimulatedTransport::new(RuntimeEnvironment::Development).unwrap());
        sim.set_fail_open(true);
        assert!(matches!(
            probe_adapter(sim, DriverOptions::default()).await,
            Err(ObdError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_system_connector_ignores_simulated_kind() {
        let plan = AttemptPlan {
            port_hints: vec![],
            baud_rate: 38400,
            device_hints: vec![],
            channel_hints: vec![],
            discovery_timeout: Duration::from_millis(10),
            driver_options: DriverOptions::default(),
        };
        let result = SystemConnector
            .connect(TransportKind::Simulated, &plan)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
