//! Connection manager scenarios with a simulated adapter

use async_trait::async_trait;
use obd_connection::{
    probe_adapter, AgentSettings, AttemptPlan, ConnectOptions, ConnectionEvent, ConnectionManager,
    ConnectionSnapshot, ConnectionState, DetectedAdapter, TransportConnector, ADAPTER_NOT_FOUND,
    CONNECTION_LOST,
};
use obd_protocol::{ObdError, RuntimeEnvironment, SimulatedTransport, Transport, TransportKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Answers on one transport family with a fresh simulated adapter per attempt
struct SimConnector {
    answer_on: TransportKind,
    available: AtomicBool,
    calls: AtomicUsize,
    kinds: Mutex<Vec<TransportKind>>,
    sims: Mutex<Vec<Arc<SimulatedTransport>>>,
}

impl SimConnector {
    fn new(answer_on: TransportKind, available: bool) -> Arc<Self> {
        Arc::new(Self {
            answer_on,
            available: AtomicBool::new(available),
            calls: AtomicUsize::new(0),
            kinds: Mutex::new(Vec::new()),
            sims: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn kinds(&self) -> Vec<TransportKind> {
        self.kinds.lock().unwrap().clone()
    }

    fn sim(&self, index: usize) -> Arc<SimulatedTransport> {
        self.sims.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl TransportConnector for SimConnector {
    async fn connect(
        &self,
        kind: TransportKind,
        plan: &AttemptPlan,
    ) -> Result<Option<DetectedAdapter>, ObdError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.kinds.lock().unwrap().push(kind);
        if kind != self.answer_on || !self.available.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let sim = Arc::new(SimulatedTransport::with_label(
            RuntimeEnvironment::Development,
            format!("{}-adapter", kind),
        )?);
        self.sims.lock().unwrap().push(sim.clone());
        probe_adapter(sim, plan.driver_options.clone()).await.map(Some)
    }
}

fn settings() -> AgentSettings {
    AgentSettings {
        keepalive_ms: 0,
        ..Default::default()
    }
}

fn manager_with(settings: AgentSettings, connector: Arc<SimConnector>) -> ConnectionManager {
    ConnectionManager::new(settings, connector)
}

async fn wait_for(
    snapshots: &mut watch::Receiver<ConnectionSnapshot>,
    predicate: impl Fn(&ConnectionSnapshot) -> bool,
) -> ConnectionSnapshot {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .expect("snapshot condition never reached")
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let connector = SimConnector::new(TransportKind::Serial, true);
    let manager = manager_with(settings(), connector.clone());

    let (first, second) = tokio::join!(
        manager.connect(ConnectOptions::default()),
        manager.connect(ConnectOptions::default())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.calls(), 1);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.transport, Some(TransportKind::Simulated));
    assert_eq!(snapshot.identity.as_deref(), Some("ELM327 v2.1"));
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(snapshot.last_connected_at.is_some());
    assert_eq!(snapshot.metrics.unwrap().protocol_used.as_deref(), Some("auto"));
}

#[tokio::test]
async fn concurrent_failures_share_one_outcome() {
    let connector = SimConnector::new(TransportKind::Serial, false);
    let manager = manager_with(settings(), connector.clone());

    let (first, second) = tokio::join!(
        manager.connect(ConnectOptions::default()),
        manager.connect(ConnectOptions::default())
    );
    assert!(matches!(first, Err(ObdError::AdapterNotFound)));
    assert!(matches!(second, Err(ObdError::AdapterNotFound)));
    // one pass: serial then bluetooth
    assert_eq!(connector.kinds(), vec![TransportKind::Serial, TransportKind::Bluetooth]);
}

#[tokio::test]
async fn connect_is_idempotent_unless_forced() {
    let connector = SimConnector::new(TransportKind::Serial, true);
    let manager = manager_with(settings(), connector.clone());

    let first = manager.connect(ConnectOptions::default()).await.unwrap();
    let again = manager.ensure_connected(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(connector.calls(), 1);

    let forced = manager.connect(ConnectOptions::forced()).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &forced));
    assert_eq!(connector.calls(), 2);
    assert!(!connector.sim(0).is_open(), "previous adapter released");
    assert!(connector.sim(1).is_open());
}

#[tokio::test]
async fn failed_connect_records_adapter_not_found() {
    let connector = SimConnector::new(TransportKind::Serial, false);
    let manager = manager_with(settings(), connector.clone());

    let result = manager.connect(ConnectOptions::default()).await;
    assert!(matches!(result, Err(ObdError::AdapterNotFound)));

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.last_error.as_deref(), Some(ADAPTER_NOT_FOUND));
    assert!(snapshot.last_failure_at.is_some());
    assert_eq!(snapshot.reconnect_attempts, 1);

    let page = manager.events(0, None);
    let states: Vec<ConnectionState> = page.events.iter().map(|e| e.event.state()).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Disconnected,
            ConnectionState::Disconnected
        ]
    );
    assert_eq!(page.events[2].event.error(), Some(ADAPTER_NOT_FOUND));
    assert_eq!(page.latest_event_id, 3);
}

#[tokio::test]
async fn bluetooth_preference_orders_attempts() {
    let connector = SimConnector::new(TransportKind::Bluetooth, true);
    let manager = manager_with(
        AgentSettings {
            bluetooth: Some("1".into()),
            ..settings()
        },
        connector.clone(),
    );
    manager.connect(ConnectOptions::default()).await.unwrap();
    assert_eq!(connector.kinds(), vec![TransportKind::Bluetooth]);

    // an explicit request overrides the preference
    let connector = SimConnector::new(TransportKind::Bluetooth, true);
    let manager = manager_with(
        AgentSettings {
            bluetooth: Some("1".into()),
            ..settings()
        },
        connector.clone(),
    );
    manager
        .connect(ConnectOptions {
            transport: Some(TransportKind::Serial),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(connector.kinds(), vec![TransportKind::Serial, TransportKind::Bluetooth]);
}

#[tokio::test]
async fn disabled_bluetooth_is_never_attempted() {
    let connector = SimConnector::new(TransportKind::Bluetooth, true);
    let manager = manager_with(
        AgentSettings {
            bluetooth: Some("serial".into()),
            ..settings()
        },
        connector.clone(),
    );
    let result = manager
        .connect(ConnectOptions {
            transport: Some(TransportKind::Bluetooth),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(ObdError::AdapterNotFound)));
    assert_eq!(connector.kinds(), vec![TransportKind::Serial]);
}

#[tokio::test]
async fn with_driver_runs_against_connected_adapter() {
    let connector = SimConnector::new(TransportKind::Serial, true);
    let manager = manager_with(settings(), connector.clone());

    let rpm = manager
        .with_driver(|driver| async move { driver.read_pid(0x0C).await })
        .await
        .unwrap();
    assert_eq!(rpm, Some(1726.0));

    // the task's own error is propagated unchanged
    connector.sim(0).set_response("04", "?");
    let cleared = manager
        .with_driver(|driver| async move { driver.clear_dtc().await })
        .await;
    assert!(matches!(cleared, Err(ObdError::Command(_))));
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn with_driver_without_adapter_is_not_connected() {
    let connector = SimConnector::new(TransportKind::Serial, false);
    let manager = manager_with(settings(), connector);

    let result = manager
        .with_driver(|driver| async move { driver.read_dtc().await })
        .await;
    assert!(matches!(result, Err(ObdError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn link_loss_schedules_reconnect() {
    let connector = SimConnector::new(TransportKind::Serial, true);
    let manager = manager_with(settings(), connector.clone());
    let mut snapshots = manager.subscribe_snapshots();

    manager.connect(ConnectOptions::default()).await.unwrap();
    connector.sim(0).inject_close();

    let lost = wait_for(&mut snapshots, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(lost.last_error.as_deref(), Some(CONNECTION_LOST));
    assert!(lost.last_failure_at.is_some());
    assert!(!manager.is_connected());

    // the reconnect timer brings the adapter back
    let restored = wait_for(&mut snapshots, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(restored.reconnect_attempts, 0);
    assert_eq!(restored.last_error, None);
    assert_eq!(connector.calls(), 2);

    let errors: Vec<String> = manager
        .events(0, None)
        .events
        .iter()
        .filter_map(|e| e.event.error().map(str::to_string))
        .collect();
    assert_eq!(errors, vec![CONNECTION_LOST.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn monitor_retries_until_adapter_appears() {
    let connector = SimConnector::new(TransportKind::Serial, false);
    let manager = manager_with(
        AgentSettings {
            reconnect_interval_ms: 1000,
            reconnect_delay_ms: 600_000,
            ..settings()
        },
        connector.clone(),
    );
    let mut snapshots = manager.subscribe_snapshots();

    manager.start();
    wait_for(&mut snapshots, |s| s.last_error.as_deref() == Some(ADAPTER_NOT_FOUND)).await;

    connector.available.store(true, Ordering::SeqCst);
    let connected = wait_for(&mut snapshots, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(connected.identity.as_deref(), Some("ELM327 v2.1"));
    // serial + bluetooth for the failed pass, then serial
    assert_eq!(connector.calls(), 3);

    manager.shutdown().await;
    assert_eq!(manager.snapshot().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_releases_the_adapter() {
    let connector = SimConnector::new(TransportKind::Serial, true);
    let manager = manager_with(settings(), connector.clone());

    manager.connect(ConnectOptions::default()).await.unwrap();
    manager.disconnect().await;

    assert!(!manager.is_connected());
    assert!(!connector.sim(0).is_open());
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.last_error, None);

    // a later operation reconnects
    manager.ensure_connected(false).await.unwrap();
    assert_eq!(connector.calls(), 2);
}

#[tokio::test]
async fn subscribers_get_recent_history_then_live_events() {
    let connector = SimConnector::new(TransportKind::Serial, false);
    let manager = manager_with(settings(), connector.clone());

    // each failed pass logs connecting, disconnected and the error
    for _ in 0..4 {
        let _ = manager.connect(ConnectOptions::default()).await;
    }
    assert_eq!(manager.latest_event_id(), 12);

    let mut subscription = manager.subscribe_events();
    let mut replayed = Vec::new();
    while let Some(event) = subscription.try_recv() {
        replayed.push(event.id);
    }
    assert_eq!(replayed, (3..=12).collect::<Vec<u64>>());

    connector.available.store(true, Ordering::SeqCst);
    manager.connect(ConnectOptions::default()).await.unwrap();
    let next = subscription.recv().await.unwrap();
    assert_eq!(next.id, 13);
    assert_eq!(next.event.state(), ConnectionState::Connecting);
    let next = subscription.recv().await.unwrap();
    assert!(matches!(
        next.event,
        ConnectionEvent::State {
            state: ConnectionState::Connected,
            ..
        }
    ));

    let page = manager.events(10, Some(2));
    assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![13, 14]);
    assert_eq!(page.latest_event_id, 14);
}
