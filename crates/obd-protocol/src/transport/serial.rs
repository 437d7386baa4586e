//! Serial/USB transport

use super::stream::StreamLink;
use super::{Transport, TransportAddress, TransportError, TransportEvent, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::{debug, info};

/// Serial port as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortDescriptor {
    pub path: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub vendor_id: Option<u16>,
    /// Port is backed by a Bluetooth serial profile
    pub bluetooth: bool,
}

impl SerialPortDescriptor {
    /// Lowercased free-text description used for keyword matching
    pub fn description(&self) -> String {
        let mut text = self.path.clone();
        for part in [&self.manufacturer, &self.product].into_iter().flatten() {
            text.push(' ');
            text.push_str(part);
        }
        if self.bluetooth {
            text.push_str(" bluetooth");
        }
        text.to_lowercase()
    }
}

/// Enumerate serial ports
pub fn list_ports() -> Result<Vec<SerialPortDescriptor>, TransportError> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| TransportError::Io(e.to_string()))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => SerialPortDescriptor {
                path: port.port_name,
                manufacturer: usb.manufacturer,
                product: usb.product,
                vendor_id: Some(usb.vid),
                bluetooth: false,
            },
            SerialPortType::BluetoothPort => SerialPortDescriptor {
                path: port.port_name,
                manufacturer: None,
                product: None,
                vendor_id: None,
                bluetooth: true,
            },
            _ => SerialPortDescriptor {
                path: port.port_name,
                manufacturer: None,
                product: None,
                vendor_id: None,
                bluetooth: false,
            },
        })
        .collect())
}

/// ELM327 over a serial port
pub struct SerialTransport {
    port_path: String,
    baud_rate: u32,
    link: StreamLink,
}

impl SerialTransport {
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        let port_path = port_path.into();
        Self {
            link: StreamLink::new(format!("serial {}", port_path)),
            port_path,
            baud_rate,
        }
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        debug!("Opening serial port {} at {} baud", self.port_path, self.baud_rate);

        let stream = tokio_serial::new(&self.port_path, self.baud_rate)
            .open_native_async()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("{}: {}", self.port_path, e))
            })?;
        let (reader, writer) = tokio::io::split(stream);
        self.link.attach(reader, Box::new(writer)).await;

        info!("Serial port {} open", self.port_path);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.shutdown().await;
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.link.write_line(data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.subscribe()
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn address(&self) -> TransportAddress {
        TransportAddress::Serial {
            port_path: self.port_path.clone(),
            baud_rate: self.baud_rate,
        }
    }
}
