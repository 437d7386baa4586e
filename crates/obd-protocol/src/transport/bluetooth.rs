//! Bluetooth SPP transport
//!
//! Connects an RFCOMM stream socket to the adapter. Device and channel
//! discovery shell out to BlueZ (`bluetoothctl`, `sdptool`), which is what
//! kiosk images ship.

use super::stream::StreamLink;
use super::{Transport, TransportAddress, TransportError, TransportEvent, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default RFCOMM channel for the serial port profile
pub const DEFAULT_SPP_CHANNEL: u8 = 1;

/// Connect timeout for a single RFCOMM attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Device seen by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Parse `AA:BB:CC:DD:EE:FF`
pub fn parse_address(address: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = address.trim().split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 6];
    for (slot, part) in bytes.iter_mut().zip(parts) {
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    Some(bytes)
}

/// Parse `bluetoothctl devices` output (`Device <addr> <name>` per line)
pub fn parse_device_list(output: &str) -> Vec<BluetoothDevice> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ' ');
            if parts.next()? != "Device" {
                return None;
            }
            let address = parts.next()?;
            parse_address(address)?;
            let name = parts
                .next()
                .map(str::trim)
                .filter(|n| !n.is_empty() && *n != address.replace(':', "-"))
                .map(str::to_string);
            Some(BluetoothDevice {
                address: address.to_uppercase(),
                name,
            })
        })
        .collect()
}

/// Parse the SPP channel out of `sdptool search SP` output
pub fn parse_spp_channel(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Channel:")
            .and_then(|c| c.trim().parse().ok())
    })
}

/// List paired/known devices
pub async fn discover_devices(timeout: Duration) -> Result<Vec<BluetoothDevice>, TransportError> {
    let output = tokio::time::timeout(timeout, Command::new("bluetoothctl").arg("devices").output())
        .await
        .map_err(|_| TransportError::ConnectionFailed("bluetooth discovery timed out".into()))??;

    if !output.status.success() {
        return Err(TransportError::Unsupported(
            "bluetoothctl is not available".to_string(),
        ));
    }
    Ok(parse_device_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Ask the device's SDP server for its serial port channel
pub async fn find_spp_channel(address: &str) -> Option<u8> {
    let result = tokio::time::timeout(
        CONNECT_TIMEOUT,
        Command::new("sdptool")
            .args(["search", "--bdaddr", address, "SP"])
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            parse_spp_channel(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(_)) | Ok(Err(_)) => None,
        Err(_) => {
            debug!("SDP lookup for {} timed out", address);
            None
        }
    }
}

/// ELM327 over Bluetooth RFCOMM
pub struct BluetoothTransport {
    address: String,
    name: Option<String>,
    channel: u8,
    link: StreamLink,
}

impl BluetoothTransport {
    pub fn new(address: impl Into<String>, name: Option<String>, channel: u8) -> Self {
        let address = address.into().to_uppercase();
        Self {
            link: StreamLink::new(format!("bluetooth {}#{}", address, channel)),
            address,
            name,
            channel,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }
}

#[async_trait]
impl Transport for BluetoothTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.link.is_open() {
            return Ok(());
        }
        let bdaddr = parse_address(&self.address).ok_or_else(|| {
            TransportError::ConnectionFailed(format!("invalid address {}", self.address))
        })?;
        debug!("Connecting RFCOMM {} channel {}", self.address, self.channel);

        let stream = rfcomm::connect(bdaddr, self.channel, CONNECT_TIMEOUT).await?;
        let (reader, writer) = tokio::io::split(stream);
        self.link.attach(reader, Box::new(writer)).await;

        info!(
            "Bluetooth link to {} ({}) open on channel {}",
            self.address,
            self.name.as_deref().unwrap_or("unnamed"),
            self.channel
        );
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
        TransportKind::Bluetooth
    }

    fn address(&self) -> TransportAddress {
        TransportAddress::Bluetooth {
            address: self.address.clone(),
            name: self.name.clone(),
            channel: self.channel,
        }
    }
}

#[cfg(target_os = "linux")]
mod rfcomm {
    use super::TransportError;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::time::Duration;
    use tokio::net::UnixStream;

    const BTPROTO_RFCOMM: libc::c_int = 3;

    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    /// `SO_SNDTIMEO` value for `timeout`; zero would mean "wait forever"
    pub(super) fn send_timeout(timeout: Duration) -> libc::timeval {
        let timeout = timeout.max(Duration::from_millis(1));
        libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        }
    }

    fn connect_blocking(
        bdaddr: [u8; 6],
        channel: u8,
        timeout: Duration,
    ) -> std::io::Result<OwnedFd> {
        // SAFETY: plain socket(2) call, the result is checked before use
        let raw = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                BTPROTO_RFCOMM,
            )
        };
        if raw < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // bounds the blocking connect(2) to the caller's deadline
        let tv = send_timeout(timeout);
        // SAFETY: tv outlives the call and the length matches its type
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_SNDTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }

        // bdaddr_t is little-endian
        let mut reversed = bdaddr;
        reversed.reverse();
        let addr = SockaddrRc {
            rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: reversed,
            rc_channel: channel,
        };
        // SAFETY: addr is a valid sockaddr_rc for the duration of the call
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(fd)
    }

    pub(super) async fn connect(
        bdaddr: [u8; 6],
        channel: u8,
        timeout: Duration,
    ) -> Result<UnixStream, TransportError> {
        let task = tokio::task::spawn_blocking(move || connect_blocking(bdaddr, channel, timeout));
        // the kernel deadline ends the blocking task on its own if this one fires first
        let fd = tokio::time::timeout(timeout, task)
            .await
            .map_err(|_| TransportError::ConnectionFailed("RFCOMM connect timed out".into()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(UnixStream::from_std(std_stream)?)
    }
}

#[cfg(not(target_os = "linux"))]
mod rfcomm {
    use super::TransportError;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    pub(super) async fn connect(
        _bdaddr: [u8; 6],
        _channel: u8,
        _timeout: Duration,
    ) -> Result<DuplexStream, TransportError> {
        Err(TransportError::Unsupported(
            "RFCOMM sockets require Linux".to_string(),
        ))
    }
}

/// Try each channel in turn, returning the first transport that opens
pub async fn connect_first_channel(
    device: &BluetoothDevice,
    channels: &[u8],
) -> Result<BluetoothTransport, TransportError> {
    let mut last_error = TransportError::ConnectionFailed(format!(
        "no RFCOMM channel to try for {}",
        device.address
    ));
    for &channel in channels {
        let transport = BluetoothTransport::new(&device.address, device.name.clone(), channel);
        match transport.open().await {
            Ok(()) => return Ok(transport),
            Err(e) => {
                warn!("RFCOMM {} channel {} failed: {}", device.address, channel, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("00:1D:A5:68:98:8B"),
            Some([0x00, 0x1D, 0xA5, 0x68, 0x98, 0x8B])
        );
        assert_eq!(parse_address("00:1D:A5:68:98"), None);
        assert_eq!(parse_address("00:1D:A5:68:98:XZ"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_connect_deadline_reaches_the_socket() {
        let tv = rfcomm::send_timeout(Duration::from_millis(2500));
        assert_eq!((tv.tv_sec, tv.tv_usec), (2, 500_000));

        let tv = rfcomm::send_timeout(Duration::ZERO);
        assert_eq!((tv.tv_sec, tv.tv_usec), (0, 1_000));
    }

    #[test]
    fn test_parse_device_list() {
        let output = "Device 00:1D:A5:68:98:8B OBDII\n\
                      Device 11:22:33:44:55:66 Kitchen Speaker\n\
                      Device AA:BB:CC:DD:EE:FF AA-BB-CC-DD-EE-FF\n\
                      garbage line\n";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].name.as_deref(), Some("OBDII"));
        assert_eq!(devices[1].name.as_deref(), Some("Kitchen Speaker"));
        assert_eq!(devices[2].name, None);
    }

    #[test]
    fn test_parse_spp_channel() {
        let output = "Searching for SP on 00:1D:A5:68:98:8B ...\n\
                      Service Name: SPP\n\
                      Protocol Descriptor List:\n\
                      \x20 \"RFCOMM\" (0x0003)\n\
                      \x20   Channel: 2\n";
        assert_eq!(parse_spp_channel(output), Some(2));
        assert_eq!(parse_spp_channel("Failed to connect to SDP server"), None);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let transport = BluetoothTransport::new("not-an-address", None, 1);
        assert!(matches!(
            transport.open().await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
