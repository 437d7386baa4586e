//! Connection manager
//!
//! Owns the single live [`Elm327Driver`]. Connection attempts are shared:
//! concurrent callers of [`ConnectionManager::connect`] await the same
//! in-flight attempt. State changes are published as snapshots on a watch
//! channel and recorded in a bounded event log.
//!
//! Background work:
//! - a reconnect timer armed after every failure or link loss
//! - a monitor that retries whenever the state is not connected
//! - a watcher per attached driver that reacts to link loss

use crate::connector::{AttemptPlan, DetectedAdapter, TransportConnector};
use crate::discovery::{attempt_order, dedupe_strings};
use crate::retry::RetryPolicy;
use crate::settings::AgentSettings;
use crate::state::{
    ConnectOptions, ConnectionEvent, ConnectionSnapshot, ConnectionState, ADAPTER_NOT_FOUND,
    CONNECTION_LOST,
};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use obd_protocol::{DriverEvent, DriverOptions, Elm327Driver, ObdError, TransportKind};
use parking_lot::Mutex;
use ring_buffer::{EventLog, EventPage, LoggedEvent};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Events kept for catch-up reads
pub const EVENT_LOG_CAPACITY: usize = 200;

/// Events replayed to a new subscriber
pub const EVENT_REPLAY: usize = 10;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Elm327Driver>, ObdError>>>;

/// Live event stream preceded by a replay of recent history
pub struct EventSubscription {
    backlog: VecDeque<LoggedEvent<ConnectionEvent>>,
    receiver: broadcast::Receiver<LoggedEvent<ConnectionEvent>>,
    last_id: u64,
}

impl EventSubscription {
    /// Next event; `None` once the manager is gone
    pub async fn recv(&mut self) -> Option<LoggedEvent<ConnectionEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_id = event.id;
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                // already delivered through the replay
                Ok(event) if event.id <= self.last_id => continue,
                Ok(event) => {
                    self.last_id = event.id;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[obd-connection] event subscriber lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready
    pub fn try_recv(&mut self) -> Option<LoggedEvent<ConnectionEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_id = event.id;
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.id <= self.last_id => continue,
                Ok(event) => {
                    self.last_id = event.id;
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

struct Inner {
    settings: AgentSettings,
    connector: Arc<dyn TransportConnector>,
    retry: RetryPolicy,
    driver: Mutex<Option<Arc<Elm327Driver>>>,
    in_flight: Mutex<Option<ConnectFuture>>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    events: broadcast::Sender<LoggedEvent<ConnectionEvent>>,
    log: EventLog<ConnectionEvent>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Orchestrates discovery, connection and reconnection of the adapter
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(settings: AgentSettings, connector: Arc<dyn TransportConnector>) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_LOG_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                retry: settings.connect_policy(),
                settings,
                connector,
                driver: Mutex::new(None),
                in_flight: Mutex::new(None),
                snapshot,
                events,
                log: EventLog::new(EVENT_LOG_CAPACITY),
                reconnect_timer: Mutex::new(None),
                monitor: Mutex::new(None),
                watcher: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start the monitor and an immediate background connection attempt
    pub fn start(&self) {
        self.inner.shut_down.store(false, Ordering::SeqCst);
        self.inner.start_monitor();
        self.inner.schedule_reconnect(Duration::ZERO);
    }

    /// Return the attached driver, or run one connection attempt shared with concurrent callers
    pub async fn connect(&self, options: ConnectOptions) -> Result<Arc<Elm327Driver>, ObdError> {
        self.inner.connect(options).await
    }

    /// Detach and close the driver. The monitor keeps running.
    pub async fn disconnect(&self) {
        let pending = self.inner.in_flight.lock().clone();
        if let Some(pending) = pending {
            let _ = pending.await;
        }
        if let Some(driver) = self.inner.detach_driver() {
            driver.close().await;
            info!("[obd-connection] adapter disconnected");
        }
        self.inner.update_snapshot(|s| {
            s.state = ConnectionState::Disconnected;
        });
    }

    /// Stop background tasks and disconnect
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.inner.monitor.lock().take() {
            monitor.abort();
        }
        self.inner.clear_reconnect_timer();
        self.disconnect().await;
    }

    /// Connected driver, connecting first when needed or when `force` is set
    pub async fn ensure_connected(&self, force: bool) -> Result<Arc<Elm327Driver>, ObdError> {
        if !force {
            if let Some(driver) = self.inner.current_driver() {
                return Ok(driver);
            }
        }
        self.connect(ConnectOptions {
            force,
            ..Default::default()
        })
        .await
    }

    /// Run `task` against a connected driver, propagating its error
    pub async fn with_driver<T, F, Fut>(&self, task: F) -> Result<T, ObdError>
    where
        F: FnOnce(Arc<Elm327Driver>) -> Fut,
        Fut: Future<Output = Result<T, ObdError>>,
    {
        let driver = match self.ensure_connected(false).await {
            Ok(driver) => driver,
            Err(e) => {
                debug!("[obd-connection] with_driver without adapter: {}", e);
                return Err(ObdError::NotConnected);
            }
        };
        task(driver).await
    }

    /// Current snapshot with fresh driver metrics
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut snapshot = self.inner.snapshot.borrow().clone();
        if let Some(driver) = self.inner.driver.lock().as_ref() {
            snapshot.metrics = Some(driver.metrics());
        }
        snapshot
    }

    /// Snapshot stream; the receiver starts at the current snapshot
    pub fn subscribe_snapshots(&self) -> watch::Receiver<ConnectionSnapshot> {
        let mut receiver = self.inner.snapshot.subscribe();
        receiver.mark_changed();
        receiver
    }

    /// Event stream that first replays the most recent events
    pub fn subscribe_events(&self) -> EventSubscription {
        let receiver = self.inner.events.subscribe();
        EventSubscription {
            backlog: self.inner.log.recent(EVENT_REPLAY).into(),
            receiver,
            last_id: 0,
        }
    }

    /// Events with an id above `newer_than`, at most `limit` (newest kept)
    pub fn events(&self, newer_than: u64, limit: Option<usize>) -> EventPage<ConnectionEvent> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(EVENT_LOG_CAPACITY);
        self.inner.log.newer_than(newer_than, limit)
    }

    pub fn latest_event_id(&self) -> u64 {
        self.inner.log.latest_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_driver().is_some()
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.inner.settings
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for slot in [
            &self.inner.monitor,
            &self.inner.reconnect_timer,
            &self.inner.watcher,
        ] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn current_driver(&self) -> Option<Arc<Elm327Driver>> {
        self.driver
            .lock()
            .as_ref()
            .filter(|d| d.is_connected())
            .cloned()
    }

    async fn connect(self: &Arc<Self>, options: ConnectOptions) -> Result<Arc<Elm327Driver>, ObdError> {
        let attempt = {
            let mut in_flight = self.in_flight.lock();
            if !options.force {
                if let Some(driver) = self.current_driver() {
                    return Ok(driver);
                }
            }
            match in_flight.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let weak = Arc::downgrade(self);
                    let attempt = async move {
                        let Some(inner) = weak.upgrade() else {
                            return Err(ObdError::NotConnected);
                        };
                        let result = inner.establish(options).await;
                        inner.in_flight.lock().take();
                        result
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    async fn establish(self: &Arc<Self>, options: ConnectOptions) -> Result<Arc<Elm327Driver>, ObdError> {
        if options.force {
            if let Some(previous) = self.detach_driver() {
                previous.close().await;
            }
        }

        let previous = self.snapshot.borrow().clone();
        self.update_snapshot(|s| {
            s.state = ConnectionState::Connecting;
            s.last_error = None;
        });

        let plan = build_plan(&self.settings, &options, &previous);
        let order = attempt_order(options.transport, self.settings.bluetooth_policy());
        info!(
            "[obd-connection] connecting, order {:?}, port hints {:?}, device hints {:?}",
            order, plan.port_hints, plan.device_hints
        );

        for kind in order {
            match self.connector.connect(kind, &plan).await {
                Ok(Some(detected)) => return Ok(self.attach(kind, detected)),
                Ok(None) => debug!("[obd-connection] no adapter over {}", kind),
                Err(e) => {
                    error!("[obd-connection] {} attempt failed: {}", kind, e);
                    self.record_failure(e.to_string());
                    return Err(e);
                }
            }
        }

        warn!("[obd-connection] adapter not found");
        self.record_failure(ADAPTER_NOT_FOUND.to_string());
        Err(ObdError::AdapterNotFound)
    }

    fn attach(self: &Arc<Self>, kind: TransportKind, detected: DetectedAdapter) -> Arc<Elm327Driver> {
        let DetectedAdapter { driver, identity } = detected;
        if let Some(previous) = self.driver.lock().replace(driver.clone()) {
            if !Arc::ptr_eq(&previous, &driver) {
                tokio::spawn(async move { previous.close().await });
            }
        }
        if let Some(interval) = self.settings.keep_alive_interval() {
            driver.start_keep_alive(interval);
        }
        self.clear_reconnect_timer();
        self.watch_driver(&driver);

        let address = driver.transport_address();
        info!(
            "[obd-connection] adapter connected over {} ({})",
            kind,
            identity.as_deref().unwrap_or("unknown adapter")
        );
        self.update_snapshot(|s| {
            s.state = ConnectionState::Connected;
            s.transport = Some(driver.transport_kind());
            s.set_address(&address);
            s.identity = identity;
            s.last_connected_at = Some(Utc::now());
            s.last_error = None;
            s.reconnect_attempts = 0;
            s.metrics = Some(driver.metrics());
        });
        driver
    }

    fn detach_driver(&self) -> Option<Arc<Elm327Driver>> {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.driver.lock().take()
    }

    fn record_failure(self: &Arc<Self>, reason: String) {
        if let Some(driver) = self.detach_driver() {
            tokio::spawn(async move { driver.close().await });
        }
        self.update_snapshot(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(reason);
            s.last_failure_at = Some(Utc::now());
        });
        self.schedule_reconnect(self.failure_delay());
    }

    fn failure_delay(&self) -> Duration {
        let attempts = self.snapshot.borrow().reconnect_attempts;
        self.settings
            .reconnect_delay()
            .max(self.retry.delay(attempts.saturating_add(1)))
    }

    /// React to link loss on the attached driver
    fn watch_driver(self: &Arc<Self>, driver: &Arc<Elm327Driver>) {
        let mut events = driver.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(self);
        let watched = Arc::downgrade(driver);
        let already_lost = !driver.is_connected();

        let handle = tokio::spawn(async move {
            let reason = if already_lost {
                "link closed during attach".to_string()
            } else {
                loop {
                    match events.recv().await {
                        Ok(DriverEvent::Disconnected { reason }) => break reason,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break "driver dropped".to_string(),
                    }
                }
            };
            let Some(inner) = weak.upgrade() else { return };
            inner.on_link_lost(&watched, reason);
        });
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    fn on_link_lost(self: &Arc<Self>, watched: &Weak<Elm327Driver>, reason: String) {
        let driver = {
            let mut slot = self.driver.lock();
            let is_current = match (slot.as_ref(), watched.upgrade()) {
                (Some(current), Some(watched)) => Arc::ptr_eq(current, &watched),
                _ => false,
            };
            if !is_current {
                return;
            }
            slot.take()
        };
        // this task is the watcher; dropping the handle does not abort it
        self.watcher.lock().take();

        warn!("[obd-connection] adapter disconnected: {}", reason);
        let metrics = driver.as_ref().map(|d| d.metrics());
        self.update_snapshot(|s| {
            s.state = ConnectionState::Disconnected;
            s.last_error = Some(CONNECTION_LOST.to_string());
            s.last_failure_at = Some(Utc::now());
            s.metrics = metrics;
        });
        if let Some(driver) = driver {
            tokio::spawn(async move { driver.close().await });
        }
        self.schedule_reconnect(self.failure_delay());
    }

    /// Arm the reconnect timer unless one is already pending
    fn schedule_reconnect(self: &Arc<Self>, delay: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut timer = self.reconnect_timer.lock();
        if timer.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(self);
        debug!("[obd-connection] reconnect in {:?}", delay);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            // release the slot so a failure below can arm the next timer
            inner.reconnect_timer.lock().take();
            if inner.current_driver().is_none() {
                if let Err(e) = inner.connect(ConnectOptions::default()).await {
                    debug!("[obd-connection] reconnect attempt failed: {}", e);
                }
            }
        }));
        drop(timer);

        if !delay.is_zero() {
            self.update_snapshot(|s| s.reconnect_attempts += 1);
        }
    }

    fn clear_reconnect_timer(&self) {
        if let Some(timer) = self.reconnect_timer.lock().take() {
            timer.abort();
        }
    }

    fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().map_or(false, |m| !m.is_finished()) {
            return;
        }
        let period = self.settings.reconnect_interval();
        let weak = Arc::downgrade(self);
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.snapshot.borrow().state == ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = inner.connect(ConnectOptions::default()).await {
                    debug!("[obd-connection] background connect failed: {}", e);
                }
            }
        }));
    }

    /// Apply `change` and log the state or error transitions it causes
    fn update_snapshot(&self, change: impl FnOnce(&mut ConnectionSnapshot)) {
        self.snapshot.send_modify(|snapshot| {
            let previous_state = snapshot.state;
            let previous_error = snapshot.last_error.clone();
            change(snapshot);

            let mut logged = Vec::new();
            if snapshot.state != previous_state {
                logged.push(ConnectionEvent::state_of(snapshot));
            }
            if let Some(error) = &snapshot.last_error {
                if previous_error.as_ref() != Some(error) {
                    logged.push(ConnectionEvent::Error {
                        state: snapshot.state,
                        error: error.clone(),
                    });
                }
            }
            for event in logged {
                let entry = self.log.append(event);
                let _ = self.events.send(entry);
            }
        });
    }
}

/// Hints and driver options for one attempt: previous identity, then caller hints, then settings
pub(crate) fn build_plan(
    settings: &AgentSettings,
    options: &ConnectOptions,
    previous: &ConnectionSnapshot,
) -> AttemptPlan {
    let previous_port = match previous.transport {
        Some(TransportKind::Serial) => previous.port_path.clone(),
        _ => None,
    };
    let (previous_address, previous_name) = match previous.transport {
        Some(TransportKind::Bluetooth) => (
            previous.bluetooth_address.clone(),
            previous.bluetooth_name.clone(),
        ),
        _ => (None, None),
    };

    let port_hints = dedupe_strings(
        previous_port
            .into_iter()
            .chain(options.port_path.clone())
            .chain(options.port_hints.iter().cloned())
            .chain(settings.port.clone()),
    );
    let device_hints = dedupe_strings(
        [previous_address, previous_name]
            .into_iter()
            .flatten()
            .chain(options.bluetooth_address.clone())
            .chain(options.bluetooth_name.clone())
            .chain(options.device_hints.iter().cloned())
            .chain(settings.bt_address.clone())
            .chain(settings.bt_name.clone()),
    );
    let mut channel_hints: Vec<u8> = Vec::new();
    for channel in options
        .channel_hints
        .iter()
        .copied()
        .chain(options.bluetooth_channel)
        .chain(previous.bluetooth_channel)
        .chain(settings.bt_channel)
    {
        if !channel_hints.contains(&channel) {
            channel_hints.push(channel);
        }
    }

    let defaults = settings.driver_options();
    let baud_rate = options.baud_rate.unwrap_or(settings.baud_rate);
    AttemptPlan {
        port_hints,
        baud_rate,
        device_hints,
        channel_hints,
        discovery_timeout: settings.discovery_timeout(),
        driver_options: DriverOptions {
            baud_rate,
            protocol_profile: options
                .protocol_profile
                .clone()
                .unwrap_or(defaults.protocol_profile),
            protocol: options.protocol.or(defaults.protocol),
            ..defaults
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::ObdProtocol;

    #[test]
    fn test_plan_carries_previous_serial_port_first() {
        let settings = AgentSettings {
            port: Some("/dev/ttyUSB9".into()),
            ..Default::default()
        };
        let previous = ConnectionSnapshot {
            transport: Some(TransportKind::Serial),
            port_path: Some("/dev/ttyUSB0".into()),
            ..Default::default()
        };
        let options = ConnectOptions {
            port_path: Some("/dev/ttyACM0".into()),
            port_hints: vec!["/dev/ttyUSB0".into(), "".into()],
            ..Default::default()
        };
        let plan = build_plan(&settings, &options, &previous);
        assert_eq!(
            plan.port_hints,
            vec!["/dev/ttyUSB0", "/dev/ttyACM0", "/dev/ttyUSB9"]
        );
        assert!(plan.device_hints.is_empty());
    }

    #[test]
    fn test_plan_carries_previous_bluetooth_identity() {
        let previous = ConnectionSnapshot {
            transport: Some(TransportKind::Bluetooth),
            port_path: Some("/dev/ignored".into()),
            bluetooth_address: Some("00:1D:A5:68:98:8B".into()),
            bluetooth_name: Some("OBDII".into()),
            bluetooth_channel: Some(2),
            ..Default::default()
        };
        let options = ConnectOptions {
            bluetooth_channel: Some(3),
            device_hints: vec!["vLinker".into()],
            ..Default::default()
        };
        let plan = build_plan(&AgentSettings::default(), &options, &previous);
        assert!(plan.port_hints.is_empty());
        assert_eq!(plan.device_hints, vec!["00:1D:A5:68:98:8B", "OBDII", "vLinker"]);
        assert_eq!(plan.channel_hints, vec![3, 2]);
    }

    #[test]
    fn test_plan_driver_options_prefer_call_overrides() {
        let settings = AgentSettings {
            protocol_profile: "honda".into(),
            timeout_ms: 3000,
            ..Default::default()
        };
        let options = ConnectOptions {
            baud_rate: Some(115200),
            protocol: Some(ObdProtocol::Iso9141_2),
            ..Default::default()
        };
        let plan = build_plan(&settings, &options, &ConnectionSnapshot::default());
        assert_eq!(plan.baud_rate, 115200);
        assert_eq!(plan.driver_options.baud_rate, 115200);
        assert_eq!(plan.driver_options.timeout_ms, 3000);
        assert_eq!(plan.driver_options.protocol_profile, "honda");
        assert_eq!(plan.driver_options.protocol, Some(ObdProtocol::Iso9141_2));
        assert_eq!(plan.driver_options.keep_alive_interval_ms, None);
    }
}
