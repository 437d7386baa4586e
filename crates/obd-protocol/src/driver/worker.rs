//! Command queue worker
//!
//! A single task owns the transport subscription and drains the request
//! queue one command at a time: write, collect bytes up to the `>` prompt,
//! resolve. A command never starts before the previous one has resolved or
//! timed out, so responses cannot be attributed out of order. After a timeout
//! the next command waits (bounded) for the prompt the adapter still owes.

use super::metrics::DriverMetrics;
use super::DriverEvent;
use crate::error::ObdError;
use crate::transport::{Transport, TransportEvent};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// ELM327 prompt terminating every response
pub const PROMPT: char = '>';

pub(crate) type Reply = Result<String, ObdError>;

/// One queued command
pub(crate) struct CommandRequest {
    pub command: String,
    pub enqueued_at: Instant,
    pub timeout: Duration,
    pub respond_to: oneshot::Sender<Reply>,
}

/// Cloneable handle for submitting commands to the worker
#[derive(Clone)]
pub(crate) struct CommandQueue {
    tx: mpsc::UnboundedSender<CommandRequest>,
}

impl CommandQueue {
    pub(crate) async fn execute(&self, command: &str, timeout: Duration) -> Reply {
        let (respond_to, rx) = oneshot::channel();
        let request = CommandRequest {
            command: command.to_string(),
            enqueued_at: Instant::now(),
            timeout,
            respond_to,
        };
        self.tx.send(request).map_err(|_| ObdError::ConnectionLost)?;
        rx.await.map_err(|_| ObdError::ConnectionLost)?
    }
}

/// Holds the single outstanding waiter
#[derive(Default)]
pub(crate) struct ResponseSlot {
    waiter: Option<(String, oneshot::Sender<Reply>)>,
}

impl ResponseSlot {
    /// Install a waiter, rejecting any stale one still present
    pub(crate) fn install(&mut self, command: &str, tx: oneshot::Sender<Reply>) {
        if let Some((stale, stale_tx)) = self.waiter.take() {
            warn!("[elm327] replacing pending waiter for {}", stale);
            let _ = stale_tx.send(Err(ObdError::ResponseSuperseded));
        }
        self.waiter = Some((command.to_string(), tx));
    }

    /// Resolve the current waiter; false when none was installed
    pub(crate) fn resolve(&mut self, reply: Reply) -> bool {
        match self.waiter.take() {
            Some((_, tx)) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.waiter.is_some()
    }
}

/// Take one framed response out of `buffer` if the prompt has arrived.
///
/// Carriage returns and line feeds are stripped, blank lines dropped and the
/// remaining lines joined with single spaces. Anything after the prompt is
/// discarded together with the frame.
pub fn take_frame(buffer: &mut String) -> Option<String> {
    let end = buffer.find(PROMPT)?;
    let cleaned = buffer[..end]
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    buffer.clear();
    Some(cleaned)
}

enum Outcome {
    Response(String),
    Timeout,
    LinkLost(String),
}

pub(crate) struct Worker {
    transport: Arc<dyn Transport>,
    events: broadcast::Receiver<TransportEvent>,
    requests: mpsc::UnboundedReceiver<CommandRequest>,
    metrics: Arc<RwLock<DriverMetrics>>,
    driver_events: broadcast::Sender<DriverEvent>,
    connected: Arc<AtomicBool>,
    keep_alive: Arc<Mutex<Option<JoinHandle<()>>>>,
    slot: ResponseSlot,
    buffer: String,
    /// Set after a timeout: the adapter still owes a prompt, waited for up to this long
    owed_prompt: Option<Duration>,
}

pub(crate) struct WorkerShared {
    pub metrics: Arc<RwLock<DriverMetrics>>,
    pub driver_events: broadcast::Sender<DriverEvent>,
    pub connected: Arc<AtomicBool>,
    pub keep_alive: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Worker {
    /// Subscribe to `transport` and return the worker plus its queue handle
    pub(crate) fn new(transport: Arc<dyn Transport>, shared: WorkerShared) -> (Self, CommandQueue) {
        let (tx, requests) = mpsc::unbounded_channel();
        let events = transport.subscribe();
        let worker = Self {
            transport,
            events,
            requests,
            metrics: shared.metrics,
            driver_events: shared.driver_events,
            connected: shared.connected,
            keep_alive: shared.keep_alive,
            slot: ResponseSlot::default(),
            buffer: String::new(),
            owed_prompt: None,
        };
        (worker, CommandQueue { tx })
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Ok(TransportEvent::Data(bytes)) => self.absorb_idle(&bytes),
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        self.link_lost("transport closed");
                        return;
                    }
                    Ok(TransportEvent::Error(message)) => {
                        self.link_lost(&message);
                        return;
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("[elm327] transport events lagged by {}", n);
                    }
                },
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.execute(request).await {
                            return;
                        }
                    }
                    None => {
                        debug!("[elm327] queue closed, worker exiting");
                        return;
                    }
                },
            }
        }
    }

    /// Bytes outside a command: either the owed late reply or noise
    fn absorb_idle(&mut self, bytes: &[u8]) {
        if self.owed_prompt.is_none() {
            trace!("[elm327] discarding {} idle bytes", bytes.len());
            return;
        }
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        if let Some(late) = take_frame(&mut self.buffer) {
            debug!("[elm327] dropping late reply {:?}", late);
            self.owed_prompt = None;
        }
    }

    /// Drop bytes that arrived while idle (late replies to timed-out commands)
    fn drain_stale(&mut self) -> Option<String> {
        loop {
            match self.events.try_recv() {
                Ok(TransportEvent::Data(bytes)) => self.absorb_idle(&bytes),
                Ok(TransportEvent::Closed) | Err(TryRecvError::Closed) => {
                    return Some("transport closed".to_string())
                }
                Ok(TransportEvent::Error(message)) => return Some(message),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => return None,
            }
        }
    }

    /// Wait a bounded time for the prompt a timed-out command still owes, so
    /// its late reply cannot resolve the next command
    async fn settle_owed_prompt(&mut self) -> Option<String> {
        let window = self.owed_prompt?;
        let deadline = Instant::now() + window;
        while self.owed_prompt.is_some() {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(TransportEvent::Data(bytes)) => self.absorb_idle(&bytes),
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        return Some("transport closed".to_string());
                    }
                    Ok(TransportEvent::Error(message)) => return Some(message),
                    Err(RecvError::Lagged(n)) => {
                        warn!("[elm327] transport events lagged by {} while settling", n);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("[elm327] no late prompt within {:?}, continuing", window);
                    self.owed_prompt = None;
                }
            }
        }
        None
    }

    /// Run one command; returns false when the link is gone
    async fn execute(&mut self, request: CommandRequest) -> bool {
        let CommandRequest {
            command,
            enqueued_at,
            timeout,
            respond_to,
        } = request;

        let stale = match self.drain_stale() {
            Some(reason) => Some(reason),
            None => self.settle_owed_prompt().await,
        };
        if let Some(reason) = stale {
            let _ = respond_to.send(Err(ObdError::ConnectionLost));
            self.link_lost(&reason);
            return false;
        }
        self.buffer.clear();
        self.slot.install(&command, respond_to);

        trace!(
            "[elm327] -> {} (queued {:?})",
            command,
            enqueued_at.elapsed()
        );
        let started = Instant::now();
        let deadline = started + timeout;

        if let Err(e) = self.transport.write(command.as_bytes()).await {
            let error = ObdError::Transport(e);
            self.metrics
                .write()
                .record_failure(&command, started.elapsed(), &error);
            self.slot.resolve(Err(error));
            return true;
        }

        let outcome = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(TransportEvent::Data(bytes)) => {
                        self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        if let Some(response) = take_frame(&mut self.buffer) {
                            break Outcome::Response(response);
                        }
                    }
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                        break Outcome::LinkLost("transport closed".to_string());
                    }
                    Ok(TransportEvent::Error(message)) => break Outcome::LinkLost(message),
                    Err(RecvError::Lagged(n)) => {
                        warn!("[elm327] transport events lagged by {} during {}", n, command);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => break Outcome::Timeout,
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            Outcome::Response(response) => {
                trace!("[elm327] <- {} ({:?})", response, elapsed);
                self.metrics.write().record_success(&command, elapsed);
                self.slot.resolve(Ok(response));
                true
            }
            Outcome::Timeout => {
                let error = ObdError::timeout(&command, timeout.as_millis() as u64);
                warn!("[elm327] {}", error);
                self.buffer.clear();
                self.owed_prompt = Some(timeout);
                self.metrics.write().record_failure(&command, elapsed, &error);
                self.slot.resolve(Err(error));
                true
            }
            Outcome::LinkLost(reason) => {
                self.metrics
                    .write()
                    .record_failure(&command, elapsed, &ObdError::ConnectionLost);
                self.slot.resolve(Err(ObdError::ConnectionLost));
                self.link_lost(&reason);
                false
            }
        }
    }

    /// Fail everything outstanding and announce the disconnect
    fn link_lost(&mut self, reason: &str) {
        warn!("[elm327] link lost: {}", reason);
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
        self.buffer.clear();
        self.owed_prompt = None;
        self.slot.resolve(Err(ObdError::ConnectionLost));

        self.requests.close();
        let mut rejected = 0usize;
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.respond_to.send(Err(ObdError::ConnectionLost));
            rejected += 1;
        }
        if rejected > 0 {
            debug!("[elm327] rejected {} queued commands", rejected);
        }

        self.metrics.write().record_link_error(reason);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.driver_events.send(DriverEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}
