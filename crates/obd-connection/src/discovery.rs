//! Candidate ranking for serial and Bluetooth autodetection

use crate::settings::BluetoothPolicy;
use obd_protocol::transport::bluetooth::{BluetoothDevice, DEFAULT_SPP_CHANNEL};
use obd_protocol::transport::SerialPortDescriptor;
use obd_protocol::TransportKind;
use std::collections::HashSet;
use std::hash::Hash;

/// Words that mark a port or device as an OBD adapter
pub const ADAPTER_KEYWORDS: [&str; 4] = ["ediag", "kingbolen", "obd", "elm"];

/// Adapter names seen on Bluetooth dongles
pub const BLUETOOTH_KEYWORDS: [&str; 7] = ["ediag", "kingbolen", "obd", "elm", "vlinker", "icar", "bt"];

/// Baud rates tried when the configured one does not answer
pub const BAUD_CANDIDATES: [u32; 3] = [38400, 115200, 9600];

/// Drop empty and repeated values, keeping first occurrences
pub fn dedupe_strings<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty() && seen.insert(v.clone()))
        .collect()
}

fn dedupe<T: Copy + Eq + Hash>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    values.into_iter().filter(|v| seen.insert(*v)).collect()
}

/// Number at the end of a port path (`/dev/ttyUSB3` -> 3, `COM12` -> 12)
fn trailing_number(path: &str) -> u32 {
    let digits: String = path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().unwrap_or(0)
}

pub fn score_serial_port(port: &SerialPortDescriptor, hints: &[String]) -> f64 {
    let mut score = 0.0;
    if hints.iter().any(|h| h.eq_ignore_ascii_case(&port.path)) {
        score += 50.0;
    }
    let description = port.description();
    for keyword in ADAPTER_KEYWORDS {
        if description.contains(keyword) {
            score += 10.0;
        }
    }
    if description.contains("bluetooth") {
        score += 5.0;
    }
    if description.contains("usb") {
        score += 2.0;
    }
    if port.vendor_id.is_some() {
        score += 1.0;
    }
    score - 0.01 * trailing_number(&port.path) as f64
}

/// Ports ordered best first; hinted paths missing from enumeration are tried first
pub fn rank_serial_ports(
    ports: Vec<SerialPortDescriptor>,
    hints: &[String],
) -> Vec<SerialPortDescriptor> {
    let mut ranked: Vec<(f64, SerialPortDescriptor)> = ports
        .into_iter()
        .map(|port| (score_serial_port(&port, hints), port))
        .collect();
    // stable sort keeps enumeration order between equal scores
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut ordered: Vec<SerialPortDescriptor> = hints
        .iter()
        .filter(|hint| !ranked.iter().any(|(_, p)| p.path.eq_ignore_ascii_case(hint)))
        .map(|hint| SerialPortDescriptor {
            path: hint.clone(),
            manufacturer: None,
            product: None,
            vendor_id: None,
            bluetooth: false,
        })
        .collect();
    ordered.extend(ranked.into_iter().map(|(_, port)| port));
    ordered
}

/// Configured baud first, then the usual adapter rates
pub fn baud_candidates(preferred: u32) -> Vec<u32> {
    dedupe(std::iter::once(preferred).chain(BAUD_CANDIDATES))
}

pub fn score_bluetooth_device(device: &BluetoothDevice, hints: &[String]) -> u32 {
    let name = device.name.as_deref().unwrap_or("");
    let mut score = 0;
    let hinted = hints.iter().any(|h| {
        h.eq_ignore_ascii_case(&device.address) || (!name.is_empty() && h.eq_ignore_ascii_case(name))
    });
    if hinted {
        score += 50;
    }
    let label = format!("{} {}", device.address, name).to_lowercase();
    for keyword in BLUETOOTH_KEYWORDS {
        if label.contains(keyword) {
            score += 10;
        }
    }
    score + name.chars().count().min(5) as u32
}

pub fn rank_bluetooth_devices(
    mut devices: Vec<BluetoothDevice>,
    hints: &[String],
) -> Vec<BluetoothDevice> {
    devices.sort_by_key(|d| std::cmp::Reverse(score_bluetooth_device(d, hints)));
    devices
}

/// Channel hints, then the SDP-advertised channel, then the standard SPP channel
pub fn channel_candidates(hints: &[u8], advertised: Option<u8>) -> Vec<u8> {
    dedupe(
        hints
            .iter()
            .copied()
            .chain(advertised)
            .chain(std::iter::once(DEFAULT_SPP_CHANNEL)),
    )
}

/// Transport families to try, in order
pub fn attempt_order(requested: Option<TransportKind>, policy: BluetoothPolicy) -> Vec<TransportKind> {
    let bluetooth_first = match requested {
        Some(TransportKind::Bluetooth) => true,
        Some(TransportKind::Serial) => false,
        _ => policy == BluetoothPolicy::Preferred,
    };
    let order = if bluetooth_first {
        vec![TransportKind::Bluetooth, TransportKind::Serial]
    } else {
        vec![TransportKind::Serial, TransportKind::Bluetooth]
    };
    order
        .into_iter()
        .filter(|kind| *kind != TransportKind::Bluetooth || policy != BluetoothPolicy::Disabled)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(path: &str, product: Option<&str>, vendor_id: Option<u16>) -> SerialPortDescriptor {
        SerialPortDescriptor {
            path: path.to_string(),
            manufacturer: None,
            product: product.map(str::to_string),
            vendor_id,
            bluetooth: false,
        }
    }

    fn device(address: &str, name: Option<&str>) -> BluetoothDevice {
        BluetoothDevice {
            address: address.to_string(),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_serial_ranking() {
        let ports = vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB1", Some("USB Serial"), Some(0x0403)),
            port("/dev/ttyUSB0", Some("OBDII ELM327 USB"), Some(0x0403)),
        ];
        let ranked = rank_serial_ports(ports.clone(), &[]);
        let paths: Vec<&str> = ranked.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyS0"]);

        // a hint outweighs keywords
        let ranked = rank_serial_ports(ports, &["/dev/ttyS0".to_string()]);
        assert_eq!(ranked[0].path, "/dev/ttyS0");
    }

    #[test]
    fn test_lower_port_number_wins_ties() {
        let ranked = rank_serial_ports(
            vec![port("COM12", None, None), port("COM3", None, None)],
            &[],
        );
        assert_eq!(ranked[0].path, "COM3");
    }

    #[test]
    fn test_unlisted_hint_is_tried_first() {
        let ranked = rank_serial_ports(
            vec![port("/dev/ttyUSB0", Some("ELM327"), None)],
            &["/dev/rfcomm0".to_string()],
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].path, "/dev/rfcomm0");
    }

    #[test]
    fn test_baud_candidates() {
        assert_eq!(baud_candidates(38400), vec![38400, 115200, 9600]);
        assert_eq!(baud_candidates(9600), vec![9600, 38400, 115200]);
        assert_eq!(baud_candidates(500000), vec![500000, 38400, 115200, 9600]);
    }

    #[test]
    fn test_bluetooth_ranking() {
        let devices = vec![
            device("11:22:33:44:55:66", Some("Speaker")),
            device("00:1D:A5:68:98:8B", Some("OBDII")),
            device("AA:BB:CC:DD:EE:FF", None),
        ];
        let ranked = rank_bluetooth_devices(devices.clone(), &[]);
        assert_eq!(ranked[0].address, "00:1D:A5:68:98:8B");

        let ranked = rank_bluetooth_devices(devices, &["aa:bb:cc:dd:ee:ff".to_string()]);
        assert_eq!(ranked[0].address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_channel_candidates() {
        assert_eq!(channel_candidates(&[], None), vec![1]);
        assert_eq!(channel_candidates(&[3], Some(2)), vec![3, 2, 1]);
        assert_eq!(channel_candidates(&[1, 1], Some(1)), vec![1]);
    }

    #[test]
    fn test_attempt_order() {
        use BluetoothPolicy::*;
        use TransportKind::*;
        assert_eq!(attempt_order(None, Fallback), vec![Serial, Bluetooth]);
        assert_eq!(attempt_order(None, Preferred), vec![Bluetooth, Serial]);
        assert_eq!(attempt_order(Some(Serial), Preferred), vec![Serial, Bluetooth]);
        assert_eq!(attempt_order(Some(Bluetooth), Fallback), vec![Bluetooth, Serial]);
        assert_eq!(attempt_order(Some(Bluetooth), Disabled), vec![Serial]);
        assert_eq!(attempt_order(None, Disabled), vec![Serial]);
    }

    #[test]
    fn test_dedupe_strings() {
        assert_eq!(
            dedupe_strings(["a", " a ", "", "b", "a"]),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
