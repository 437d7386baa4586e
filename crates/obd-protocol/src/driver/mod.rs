//! ELM327 command driver
//!
//! Owns one transport and turns it into typed diagnostic operations. All
//! commands pass through a single queue worker (see [`worker`]), so callers
//! may share the driver freely across tasks.

mod metrics;
mod status;
mod worker;

pub use metrics::DriverMetrics;
pub use status::{parse_status, IgnitionType, LiveData, ObdStatus, Readiness};
pub use worker::{take_frame, PROMPT};

use crate::codec::{
    decode_pid, extract_mode01_payload, parse_dtc_response, response_bytes, DtcEntry, DtcStatus,
    Pid,
};
use crate::error::ObdError;
use crate::mode;
use crate::profile::{ObdProtocol, ProtocolProfile};
use crate::transport::{Transport, TransportAddress, TransportKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use worker::{CommandQueue, Worker, WorkerShared};

/// Adapter initialization: reset, echo off, linefeeds off, spaces off, headers on
pub const INIT_SEQUENCE: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATS0", "ATH1"];

/// Supported-PIDs probe used for protocol validation and keep-alive
pub const PROBE_COMMAND: &str = "0100";

/// Default per-command timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Responses that reject a candidate protocol during negotiation
const PROBE_FAILURES: [&str; 2] = ["UNABLE TO CONNECT", "NO DATA"];

/// Driver construction options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    pub timeout_ms: u64,
    pub baud_rate: u32,
    /// Start the keep-alive after `open()` when set
    pub keep_alive_interval_ms: Option<u64>,
    /// Profile walked during negotiation
    pub protocol_profile: String,
    /// Explicit protocol; skips negotiation
    pub protocol: Option<ObdProtocol>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            baud_rate: DEFAULT_BAUD_RATE,
            keep_alive_interval_ms: None,
            protocol_profile: "auto".to_string(),
            protocol: None,
        }
    }
}

/// Notifications emitted by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Transport closed or failed; every outstanding command was rejected
    Disconnected { reason: String },
}

/// Command driver for ELM327-compatible adapters
pub struct Elm327Driver {
    transport: Arc<dyn Transport>,
    options: DriverOptions,
    timeout: Duration,
    queue: Mutex<Option<CommandQueue>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    keep_alive: Arc<Mutex<Option<JoinHandle<()>>>>,
    metrics: Arc<RwLock<DriverMetrics>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<DriverEvent>,
}

impl Elm327Driver {
    pub fn new(transport: Arc<dyn Transport>, options: DriverOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            transport,
            timeout: Duration::from_millis(options.timeout_ms),
            options,
            queue: Mutex::new(None),
            worker: Mutex::new(None),
            keep_alive: Arc::new(Mutex::new(None)),
            metrics: Arc::new(RwLock::new(DriverMetrics::default())),
            connected: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Open the transport, initialize the adapter and resolve the bus protocol.
    ///
    /// On any failure the transport is closed again and the driver stays
    /// disconnected.
    pub async fn open(&self) -> Result<(), ObdError> {
        if self.is_connected() {
            return Ok(());
        }
        info!(
            "[elm327] opening {} transport {:?}",
            self.transport.kind(),
            self.transport.address()
        );
        self.transport
            .open()
            .await
            .map_err(|e| ObdError::Connection(e.to_string()))?;
        self.spawn_worker();

        if let Err(e) = self.initialize().await {
            warn!("[elm327] initialization failed: {}", e);
            self.teardown().await;
            return Err(e);
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(
            protocol = self.metrics.read().protocol_used.as_deref().unwrap_or("auto"),
            "[elm327] adapter ready"
        );
        if let Some(ms) = self.options.keep_alive_interval_ms {
            self.start_keep_alive(Duration::from_millis(ms));
        }
        Ok(())
    }

    fn spawn_worker(&self) {
        let (worker, queue) = Worker::new(
            self.transport.clone(),
            WorkerShared {
                metrics: self.metrics.clone(),
                driver_events: self.events.clone(),
                connected: self.connected.clone(),
                keep_alive: self.keep_alive.clone(),
            },
        );
        let handle = tokio::spawn(worker.run());
        if let Some(previous) = self.worker.lock().replace(handle) {
            previous.abort();
        }
        *self.queue.lock() = Some(queue);
    }

    async fn initialize(&self) -> Result<(), ObdError> {
        for command in INIT_SEQUENCE {
            let response = self.send_command(command).await?;
            debug!("[elm327] {} -> {}", command, response);
        }

        let protocol = match self.options.protocol {
            Some(protocol) => {
                self.send_command(protocol.to_elm_command()).await?;
                protocol
            }
            None => {
                let profile = ProtocolProfile::get(&self.options.protocol_profile);
                self.run_profile_init(profile).await?;
                self.negotiate(profile).await?
            }
        };
        self.metrics.write().protocol_used = Some(protocol.id().to_string());
        Ok(())
    }

    /// Profile-specific setup; individual failures are tolerated
    async fn run_profile_init(&self, profile: &ProtocolProfile) -> Result<(), ObdError> {
        for command in profile.init_commands {
            if let Err(e) = self.send_command(command).await {
                if e.is_connection_failure() {
                    return Err(e);
                }
                warn!("[elm327] optional init {} failed: {}", command, e);
            }
        }
        Ok(())
    }

    /// Walk the profile's candidates; the first one answering the probe wins
    async fn negotiate(&self, profile: &ProtocolProfile) -> Result<ObdProtocol, ObdError> {
        for &candidate in profile.protocols {
            debug!("[elm327] trying protocol {}", candidate);
            if let Err(e) = self.send_command(candidate.to_elm_command()).await {
                if e.is_connection_failure() {
                    return Err(e);
                }
                warn!("[elm327] {} rejected: {}", candidate.to_elm_command(), e);
                continue;
            }
            match self.send_command(PROBE_COMMAND).await {
                Ok(response) if probe_accepted(&response) => {
                    info!(protocol = %candidate, "[elm327] protocol negotiated");
                    return Ok(candidate);
                }
                Ok(response) => debug!("[elm327] {} probe answered {}", candidate, response),
                Err(e) if e.is_connection_failure() => return Err(e),
                Err(e) => debug!("[elm327] {} probe failed: {}", candidate, e),
            }
        }

        warn!(
            "[elm327] no protocol in profile {} answered, falling back to auto",
            profile.name
        );
        self.send_command(ObdProtocol::Auto.to_elm_command()).await?;
        Ok(ObdProtocol::Auto)
    }

    /// Stop the keep-alive, reject outstanding commands and close the transport
    pub async fn close(&self) {
        info!("[elm327] closing");
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.stop_keep_alive();
        self.connected.store(false, Ordering::SeqCst);
        self.queue.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.transport.close().await {
            warn!("[elm327] transport close failed: {}", e);
        }
    }

    /// Queue a raw command with the default timeout
    pub async fn send_command(&self, command: &str) -> Result<String, ObdError> {
        self.send_command_with_timeout(command, self.timeout).await
    }

    pub async fn send_command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ObdError> {
        let queue = self.queue.lock().clone().ok_or(ObdError::NotConnected)?;
        queue.execute(command, timeout).await
    }

    /// Stored trouble codes (mode 03)
    pub async fn read_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        self.read_dtc_with_status(DtcStatus::Current).await
    }

    /// Pending trouble codes (mode 07)
    pub async fn read_pending_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        self.read_dtc_with_status(DtcStatus::Pending).await
    }

    /// Permanent trouble codes (mode 0A)
    pub async fn read_permanent_dtc(&self) -> Result<Vec<DtcEntry>, ObdError> {
        self.read_dtc_with_status(DtcStatus::Permanent).await
    }

    async fn read_dtc_with_status(&self, status: DtcStatus) -> Result<Vec<DtcEntry>, ObdError> {
        let command = format!("{:02X}", status.mode());
        let response = self.send_command(&command).await?;
        if response.to_ascii_uppercase().contains("NO DATA") {
            return Ok(Vec::new());
        }
        let codes = parse_dtc_response(&response_bytes(&response), status.response_marker());
        debug!("[elm327] {:?} DTCs: {:?}", status, codes);
        Ok(codes
            .iter()
            .map(|code| DtcEntry::described(code, status))
            .collect())
    }

    /// Clear stored codes and the MIL (mode 04)
    pub async fn clear_dtc(&self) -> Result<(), ObdError> {
        let command = format!("{:02X}", mode::CLEAR_DTC);
        let response = self.send_command(&command).await?;
        if response_bytes(&response).contains(&(mode::CLEAR_DTC + 0x40)) {
            info!("[elm327] DTCs cleared");
            Ok(())
        } else {
            Err(ObdError::Command(format!(
                "clear DTC not confirmed: {}",
                response
            )))
        }
    }

    /// MIL, stored DTC count and readiness monitors (mode 01 PID 01)
    pub async fn read_status(&self) -> Result<ObdStatus, ObdError> {
        let response = self.send_command(&Pid::MonitorStatus.command()).await?;
        parse_status(&response_bytes(&response))
            .ok_or_else(|| ObdError::Protocol(format!("unparseable status: {}", response)))
    }

    /// Read and decode one mode 01 PID.
    ///
    /// `Ok(None)` means the adapter answered but the payload was missing,
    /// malformed or the PID has no decoder.
    pub async fn read_pid(&self, pid: u8) -> Result<Option<f64>, ObdError> {
        let response = self
            .send_command(&format!("{:02X}{:02X}", mode::CURRENT_DATA, pid))
            .await?;
        let bytes = response_bytes(&response);
        let value = extract_mode01_payload(&bytes, pid)
            .and_then(|payload| decode_pid(mode::CURRENT_DATA, pid, payload));
        trace!("[elm327] PID {:02X} = {:?}", pid, value);
        Ok(value)
    }

    /// Common live parameters; a failing PID leaves its field empty
    pub async fn read_live_data(&self) -> Result<LiveData, ObdError> {
        if !self.is_connected() {
            return Err(ObdError::NotConnected);
        }
        let (rpm, coolant, intake, speed, voltage, throttle) = tokio::join!(
            self.read_pid(Pid::Rpm.as_hex()),
            self.read_pid(Pid::CoolantTemp.as_hex()),
            self.read_pid(Pid::IntakeAirTemp.as_hex()),
            self.read_pid(Pid::Speed.as_hex()),
            self.read_pid(Pid::ControlModuleVoltage.as_hex()),
            self.read_pid(Pid::ThrottlePosition.as_hex()),
        );
        Ok(LiveData {
            rpm: rpm.ok().flatten(),
            coolant_temp_c: coolant.ok().flatten(),
            intake_temp_c: intake.ok().flatten(),
            vehicle_speed_kmh: speed.ok().flatten(),
            battery_voltage_v: voltage.ok().flatten(),
            throttle_pos_percent: throttle.ok().flatten(),
        })
    }

    /// Adapter identity (`ATI`)
    pub async fn identify(&self) -> Result<String, ObdError> {
        Ok(self.send_command("ATI").await?.trim().to_string())
    }

    /// Ping the adapter every `interval`; failures are only logged
    pub fn start_keep_alive(&self, interval: Duration) {
        let Some(queue) = self.queue.lock().clone() else {
            warn!("[elm327] keep-alive requested on a closed driver");
            return;
        };
        self.stop_keep_alive();

        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match queue.execute(PROBE_COMMAND, timeout).await {
                    Ok(_) => trace!("[elm327] keep-alive ok"),
                    Err(e) if e.is_connection_failure() => {
                        debug!("[elm327] keep-alive stopping: {}", e);
                        break;
                    }
                    Err(e) => debug!("[elm327] keep-alive failed: {}", e),
                }
            }
        });
        *self.keep_alive.lock() = Some(handle);
        debug!("[elm327] keep-alive every {:?}", interval);
    }

    pub fn stop_keep_alive(&self) {
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Copy of the current metrics
    pub fn metrics(&self) -> DriverMetrics {
        self.metrics.read().clone()
    }

    pub fn protocol_used(&self) -> Option<String> {
        self.metrics.read().protocol_used.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport_address(&self) -> TransportAddress {
        self.transport.address()
    }
}

impl Drop for Elm327Driver {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

fn probe_accepted(response: &str) -> bool {
    let upper = response.to_ascii_uppercase();
    !PROBE_FAILURES.iter().any(|failure| upper.contains(failure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RuntimeEnvironment, SimulatedTransport};

    fn driver_with(options: DriverOptions) -> (Arc<SimulatedTransport>, Elm327Driver) {
        let sim = Arc::new(SimulatedTransport::new(RuntimeEnvironment::Development).unwrap());
        let driver = Elm327Driver::new(sim.clone(), options);
        (sim, driver)
    }

    #[test]
    fn test_probe_accepted() {
        assert!(probe_accepted("41 00 BE 3E B8 11"));
        assert!(probe_accepted("SEARCHING... 41 00 BE 3E B8 11"));
        assert!(!probe_accepted("UNABLE TO CONNECT"));
        assert!(!probe_accepted("SEARCHING... NO DATA"));
    }

    #[tokio::test]
    async fn test_open_runs_init_sequence() {
        let (sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();

        let written = sim.written();
        assert_eq!(&written[..5], &INIT_SEQUENCE);
        assert_eq!(&written[5..], &["ATSP0", "0100"]);
        assert!(driver.is_connected());
        assert_eq!(driver.protocol_used().as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn test_explicit_protocol_skips_negotiation() {
        let (sim, driver) = driver_with(DriverOptions {
            protocol: Some(ObdProtocol::Iso15765_4Can11bit500),
            ..Default::default()
        });
        driver.open().await.unwrap();

        assert_eq!(sim.written().last().map(String::as_str), Some("ATSP6"));
        assert!(!sim.written().contains(&PROBE_COMMAND.to_string()));
        assert_eq!(driver.protocol_used().as_deref(), Some("iso15765-4"));
    }

    #[tokio::test]
    async fn test_explicit_protocol_skips_profile_init() {
        let (sim, driver) = driver_with(DriverOptions {
            protocol_profile: "toyota_lexus".into(),
            protocol: Some(ObdProtocol::Iso9141_2),
            ..Default::default()
        });
        driver.open().await.unwrap();

        assert!(!sim.written().contains(&"ATCAF0".to_string()));
        assert_eq!(sim.written().last().map(String::as_str), Some("ATSP3"));
        assert_eq!(driver.protocol_used().as_deref(), Some("iso9141-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_init_failure_is_not_fatal() {
        let (sim, driver) = driver_with(DriverOptions {
            protocol_profile: "toyota_lexus".into(),
            ..Default::default()
        });
        sim.set_silent("ATCAF0");
        driver.open().await.unwrap();
        assert_eq!(driver.protocol_used().as_deref(), Some("iso15765-4"));
    }

    #[tokio::test]
    async fn test_open_failure_leaves_driver_closed() {
        let (sim, driver) = driver_with(DriverOptions::default());
        sim.set_fail_open(true);
        assert!(matches!(driver.open().await, Err(ObdError::Connection(_))));
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.send_command("ATI").await,
            Err(ObdError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_rpm_and_dtc_examples() {
        let (sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();

        assert_eq!(driver.read_pid(0x0C).await.unwrap(), Some(1726.0));

        sim.set_response("03", "43 02 01 71 04 20");
        let codes: Vec<String> = driver
            .read_dtc()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.code)
            .collect();
        assert_eq!(codes, vec!["P0171", "P0420"]);
    }

    #[tokio::test]
    async fn test_clear_dtc_requires_confirmation_byte() {
        let (sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();
        driver.clear_dtc().await.unwrap();

        sim.set_response("04", "?");
        assert!(matches!(driver.clear_dtc().await, Err(ObdError::Command(_))));
    }

    #[tokio::test]
    async fn test_identify_and_status() {
        let (_sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();
        assert_eq!(driver.identify().await.unwrap(), "ELM327 v2.1");

        let status = driver.read_status().await.unwrap();
        assert!(status.mil_on);
        assert_eq!(status.dtc_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_sends_probe() {
        let (sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();
        let before = sim.written().len();

        driver.start_keep_alive(Duration::from_secs(45));
        assert!(driver.is_keep_alive_running());
        tokio::time::sleep(Duration::from_secs(91)).await;

        let pings = sim.written()[before..]
            .iter()
            .filter(|c| c.as_str() == PROBE_COMMAND)
            .count();
        assert_eq!(pings, 2);

        driver.stop_keep_alive();
        assert!(!driver.is_keep_alive_running());
    }

    #[tokio::test]
    async fn test_transport_loss_emits_disconnect() {
        let (sim, driver) = driver_with(DriverOptions::default());
        driver.open().await.unwrap();
        let mut events = driver.subscribe();

        sim.inject_close();
        assert!(matches!(
            events.recv().await.unwrap(),
            DriverEvent::Disconnected { .. }
        ));
        assert!(!driver.is_connected());
        assert!(matches!(
            driver.read_pid(0x0C).await,
            Err(ObdError::ConnectionLost)
        ));
    }
}
