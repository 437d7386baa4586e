//! Polling Scheduler Implementation

use crate::entry::{PollStats, PollingEntry, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obd_protocol::{Elm327Driver, ObdError, Pid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Source of PID values polled by the scheduler
#[async_trait]
pub trait PidReader: Send + Sync {
    /// Read one mode 01 PID; `Ok(None)` when the payload could not be decoded
    async fn read_pid(&self, pid: u8) -> Result<Option<f64>, ObdError>;
}

#[async_trait]
impl PidReader for Elm327Driver {
    async fn read_pid(&self, pid: u8) -> Result<Option<f64>, ObdError> {
        Elm327Driver::read_pid(self, pid).await
    }
}

/// Configuration for the polling scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingOptions {
    /// Promote RPM on sharp changes
    pub enable_smart_polling: bool,
    /// Minimum RPM delta between consecutive polls that triggers promotion
    pub change_threshold: f64,
    /// How many cycles a promotion lasts
    pub promotion_cycles: u64,
    /// Cycle period
    pub tick_interval_ms: u64,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            enable_smart_polling: true,
            change_threshold: 1000.0,
            promotion_cycles: 10,
            tick_interval_ms: 1000,
        }
    }
}

/// One polled value, published to the optional sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSample {
    pub pid: u8,
    pub value: Option<f64>,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    entries: Vec<PollingEntry>,
    stats: HashMap<u8, PollStats>,
    cycle: u64,
}

struct Inner {
    reader: Arc<dyn PidReader>,
    options: PollingOptions,
    state: Mutex<State>,
    sink: Option<mpsc::Sender<PollSample>>,
}

/// Priority-tiered PID poller
pub struct PollingScheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingScheduler {
    pub fn new(reader: Arc<dyn PidReader>, options: PollingOptions) -> Self {
        Self::build(reader, options, None)
    }

    /// Also publish every polled value to `sink` (dropped when the sink is full)
    pub fn with_sink(
        reader: Arc<dyn PidReader>,
        options: PollingOptions,
        sink: mpsc::Sender<PollSample>,
    ) -> Self {
        Self::build(reader, options, Some(sink))
    }

    fn build(
        reader: Arc<dyn PidReader>,
        options: PollingOptions,
        sink: Option<mpsc::Sender<PollSample>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                reader,
                options,
                state: Mutex::new(State::default()),
                sink,
            }),
            task: Mutex::new(None),
        }
    }

    /// Register `pid`, replacing any previous registration
    pub fn add_pid(&self, pid: u8, tier: Tier) {
        let mut state = self.inner.state.lock();
        match state.entries.iter_mut().find(|e| e.pid == pid) {
            Some(entry) => *entry = PollingEntry::new(pid, tier),
            None => state.entries.push(PollingEntry::new(pid, tier)),
        }
        state.stats.entry(pid).or_default();
        debug!("[polling] PID {:02X} registered as {:?}", pid, tier);
    }

    pub fn remove_pid(&self, pid: u8) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.pid != pid);
        before != state.entries.len()
    }

    /// Change a PID's configured tier and drop any active promotion
    pub fn set_tier(&self, pid: u8, tier: Tier) -> bool {
        let mut state = self.inner.state.lock();
        match state.entries.iter_mut().find(|e| e.pid == pid) {
            Some(entry) => {
                entry.tier = tier;
                entry.clear_override();
                true
            }
            None => false,
        }
    }

    /// Sort entries by effective tier; registration order breaks ties
    pub fn reorder_by_priority(&self) {
        let mut state = self.inner.state.lock();
        let cycle = state.cycle;
        state.entries.sort_by_key(|e| e.effective_tier(cycle));
    }

    /// Run one cycle now
    pub async fn poll_cycle(&self) {
        self.inner.poll_cycle().await;
    }

    /// Start the cycle timer; no-op when already running
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        let period = Duration::from_millis(inner.options.tick_interval_ms.max(1));
        info!(
            "[polling] started, {} PIDs every {:?}",
            inner.state.lock().entries.len(),
            period
        );
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.poll_cycle().await;
            }
        }));
    }

    /// Stop the cycle timer; no-op when not running
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("[polling] stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn cycle(&self) -> u64 {
        self.inner.state.lock().cycle
    }

    /// Copies of the registered entries in polling order
    pub fn entries(&self) -> Vec<PollingEntry> {
        self.inner.state.lock().entries.clone()
    }

    /// Copies of the per-PID statistics
    pub fn stats(&self) -> HashMap<u8, PollStats> {
        self.inner.state.lock().stats.clone()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Inner {
    async fn poll_cycle(&self) {
        let (cycle, due) = {
            let mut state = self.state.lock();
            state.cycle += 1;
            let cycle = state.cycle;
            let mut due: Vec<(Tier, u8)> = state
                .entries
                .iter()
                .filter(|e| e.is_due(cycle))
                .map(|e| (e.effective_tier(cycle), e.pid))
                .collect();
            due.sort_by_key(|(tier, _)| *tier);
            (cycle, due)
        };

        for (_, pid) in due {
            let started = Instant::now();
            let result = self.reader.read_pid(pid).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(value) => {
                    self.record(pid, cycle, value, latency_ms);
                    if let Some(sink) = &self.sink {
                        let _ = sink.try_send(PollSample {
                            pid,
                            value,
                            cycle,
                            timestamp: Utc::now(),
                        });
                    }
                }
                Err(e) => {
                    self.state.lock().stats.entry(pid).or_default().record_failure();
                    warn!("[polling] PID {:02X} failed: {}", pid, e);
                }
            }
        }
    }

    fn record(&self, pid: u8, cycle: u64, value: Option<f64>, latency_ms: f64) {
        let mut state = self.state.lock();
        state.stats.entry(pid).or_default().record_success(latency_ms);

        let Some(entry) = state.entries.iter_mut().find(|e| e.pid == pid) else {
            return;
        };
        if let (true, Some(current)) = (self.options.enable_smart_polling, value) {
            if let Some(previous) = entry.last_value {
                let delta = (current - previous).abs();
                if pid == Pid::Rpm.as_hex() && delta >= self.options.change_threshold {
                    let until = cycle + self.options.promotion_cycles;
                    debug!(
                        "[polling] RPM moved {:.0}, high priority until cycle {}",
                        delta, until
                    );
                    entry.promote(Tier::High, until);
                }
            }
        }
        if value.is_some() {
            entry.last_value = value;
        }
        entry.last_polled = Some(Utc::now());
    }
}
