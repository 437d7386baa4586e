//! Kiosk OBD-II Agent
//!
//! Wires the connection manager, the polling scheduler and the diagnostics
//! services together for the kiosk process.

use async_trait::async_trait;
use obd_connection::{
    AgentSettings, ConnectOptions, ConnectionEvent, ConnectionManager, RetryPolicy,
    TransportConnector,
};
use obd_protocol::uds::did;
use obd_protocol::{ObdError, Pid, UdsService};
use obd_scheduler::{PidReader, PollSample, PollingOptions, PollingScheduler, Tier};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Live-data PIDs polled by the agent and their tiers
pub const LIVE_DATA_PIDS: [(Pid, Tier); 7] = [
    (Pid::Rpm, Tier::High),
    (Pid::Speed, Tier::High),
    (Pid::ThrottlePosition, Tier::High),
    (Pid::EngineLoad, Tier::Medium),
    (Pid::CoolantTemp, Tier::Medium),
    (Pid::IntakeAirTemp, Tier::Medium),
    (Pid::ControlModuleVoltage, Tier::Low),
];

const SAMPLE_BUFFER: usize = 256;

/// Initialize logging; `RUST_LOG` filters, `json` selects JSON lines
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

/// Whether `OBD_LOG_JSON` asks for JSON output
pub fn json_logging_requested() -> bool {
    std::env::var("OBD_LOG_JSON")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on"))
        .unwrap_or(false)
}

/// Reads PIDs through the manager's attached driver without triggering connects
pub struct ManagedReader {
    manager: Arc<ConnectionManager>,
}

impl ManagedReader {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PidReader for ManagedReader {
    async fn read_pid(&self, pid: u8) -> Result<Option<f64>, ObdError> {
        // reconnection is the monitor's job
        if !self.manager.is_connected() {
            return Err(ObdError::NotConnected);
        }
        self.manager
            .with_driver(|driver| async move { driver.read_pid(pid).await })
            .await
    }
}

/// The running agent
pub struct Agent {
    manager: Arc<ConnectionManager>,
    scheduler: PollingScheduler,
    samples: Option<mpsc::Receiver<PollSample>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn new(settings: AgentSettings, connector: Arc<dyn TransportConnector>) -> Self {
        let manager = Arc::new(ConnectionManager::new(settings, connector));
        let (tx, rx) = mpsc::channel(SAMPLE_BUFFER);
        let scheduler = PollingScheduler::with_sink(
            Arc::new(ManagedReader::new(manager.clone())),
            PollingOptions::default(),
            tx,
        );
        for (pid, tier) in LIVE_DATA_PIDS {
            scheduler.add_pid(pid.as_hex(), tier);
        }
        scheduler.reorder_by_priority();

        Self {
            manager,
            scheduler,
            samples: Some(rx),
            tasks: Vec::new(),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    /// Start background connection handling, run the startup diagnostics and begin polling
    pub async fn start(&mut self) {
        self.tasks.push(spawn_event_logger(&self.manager));
        if let Some(samples) = self.samples.take() {
            self.tasks.push(spawn_sample_logger(samples));
        }
        self.manager.start();

        let policy = self.manager.settings().connect_policy();
        let connected = policy
            .retry("connect", |_| self.manager.connect(ConnectOptions::default()))
            .await;
        match connected {
            Ok(_) => self.startup_diagnostics().await,
            Err(e) => warn!("[agent] no adapter yet ({}), background reconnect continues", e),
        }

        self.scheduler.start();
    }

    /// Log the VIN and stored trouble codes of the connected vehicle
    pub async fn startup_diagnostics(&self) {
        let vin = RetryPolicy::operation()
            .retry("read VIN", |_| {
                self.manager.with_driver(|driver| async move {
                    UdsService::new(driver).read_data_by_identifier(did::VIN).await
                })
            })
            .await;
        match vin {
            Ok(reading) => info!("[agent] VIN {:?}", reading.value),
            Err(e) => debug!("[agent] VIN unavailable: {}", e),
        }

        match self
            .manager
            .with_driver(|driver| async move { driver.read_dtc().await })
            .await
        {
            Ok(dtcs) if dtcs.is_empty() => info!("[agent] no stored trouble codes"),
            Ok(dtcs) => {
                for dtc in dtcs {
                    info!(
                        "[agent] DTC {} ({:?}): {}",
                        dtc.code,
                        dtc.severity,
                        dtc.description.as_deref().unwrap_or("no description")
                    );
                }
            }
            Err(e) => warn!("[agent] reading trouble codes failed: {}", e),
        }
    }

    pub async fn shutdown(&mut self) {
        self.scheduler.stop();
        self.manager.shutdown().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("[agent] stopped");
    }
}

fn spawn_event_logger(manager: &ConnectionManager) -> JoinHandle<()> {
    let mut events = manager.subscribe_events();
    tokio::spawn(async move {
        while let Some(logged) = events.recv().await {
            match &logged.event {
                ConnectionEvent::State {
                    state, transport, ..
                } => info!(
                    "[obd-connection] #{} state {:?} via {:?}",
                    logged.id, state, transport
                ),
                ConnectionEvent::Error { error, .. } => {
                    warn!("[obd-connection] #{} error {}", logged.id, error)
                }
            }
        }
    })
}

fn spawn_sample_logger(mut samples: mpsc::Receiver<PollSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = samples.recv().await {
            debug!(
                pid = sample.pid,
                value = ?sample.value,
                cycle = sample.cycle,
                "[polling] sample"
            );
        }
    })
}
