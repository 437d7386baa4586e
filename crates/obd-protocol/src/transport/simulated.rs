//! Simulated ELM327 adapter
//!
//! Answers commands from a response table. Test hooks allow overriding
//! replies, delaying or suppressing them, injecting raw bytes and forcing
//! closure or errors. Construction fails in a production environment.

use super::{
    RuntimeEnvironment, Transport, TransportAddress, TransportError, TransportEvent,
    TransportKind, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// How the simulator answers one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedReply {
    /// Reply immediately
    Text(String),
    /// Reply after a delay
    Delayed(String, Duration),
    /// Never reply
    Silent,
}

/// In-memory adapter used by tests and demos
pub struct SimulatedTransport {
    label: String,
    responses: RwLock<HashMap<String, SimulatedReply>>,
    writes: RwLock<Vec<String>>,
    open: AtomicBool,
    fail_open: AtomicBool,
    open_count: AtomicUsize,
    chunked: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl SimulatedTransport {
    /// Create a simulator; refused when `environment` is production
    pub fn new(environment: RuntimeEnvironment) -> Result<Self, TransportError> {
        Self::with_label(environment, "simulated")
    }

    pub fn with_label(
        environment: RuntimeEnvironment,
        label: impl Into<String>,
    ) -> Result<Self, TransportError> {
        if environment.is_production() {
            return Err(TransportError::Rejected(
                "simulated transport is not allowed in production".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            label: label.into(),
            responses: RwLock::new(Self::default_responses()),
            writes: RwLock::new(Vec::new()),
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            chunked: AtomicBool::new(false),
            events,
        })
    }

    fn default_responses() -> HashMap<String, SimulatedReply> {
        [
            ("ATZ", "ELM327 v2.1"),
            ("ATE0", "OK"),
            ("ATL0", "OK"),
            ("ATS0", "OK"),
            ("ATH0", "OK"),
            ("ATH1", "OK"),
            ("ATSP0", "OK"),
            ("ATSP1", "OK"),
            ("ATSP2", "OK"),
            ("ATSP3", "OK"),
            ("ATSP4", "OK"),
            ("ATSP5", "OK"),
            ("ATSP6", "OK"),
            ("ATSP7", "OK"),
            ("ATSP8", "OK"),
            ("ATSP9", "OK"),
            ("ATCAF0", "OK"),
            ("ATI", "ELM327 v2.1"),
            ("0100", "41 00 BE 3E B8 11"),
            ("0101", "41 01 83 07 65 04"),
            ("0104", "41 04 7F"),
            ("0105", "41 05 64"),
            ("010B", "41 0B 63"),
            ("010C", "41 0C 1A F8"),
            ("010D", "41 0D 50"),
            ("010F", "41 0F 46"),
            ("0111", "41 11 80"),
            ("0142", "41 42 37 DC"),
            ("03", "43 03 01 71 04 20 03 01"),
            ("04", "44"),
            ("07", "47 00"),
        ]
        .into_iter()
        .map(|(cmd, reply)| (cmd.to_string(), SimulatedReply::Text(reply.to_string())))
        .collect()
    }

    fn normalize(command: &str) -> String {
        command
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase()
    }

    /// Set the reply text for a command
    pub fn set_response(&self, command: &str, reply: &str) {
        self.set_reply(command, SimulatedReply::Text(reply.to_string()));
    }

    pub fn set_reply(&self, command: &str, reply: SimulatedReply) {
        self.responses.write().insert(Self::normalize(command), reply);
    }

    /// Never answer `command`
    pub fn set_silent(&self, command: &str) {
        self.set_reply(command, SimulatedReply::Silent);
    }

    pub fn set_delayed(&self, command: &str, reply: &str, delay: Duration) {
        self.set_reply(command, SimulatedReply::Delayed(reply.to_string(), delay));
    }

    /// Make the next `open()` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Deliver each reply as two separate data events
    pub fn set_chunked(&self, chunked: bool) {
        self.chunked.store(chunked, Ordering::SeqCst);
    }

    /// Commands written so far, normalized
    pub fn written(&self) -> Vec<String> {
        self.writes.read().clone()
    }

    /// How many times `open()` succeeded
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Push raw bytes as if the adapter sent them
    pub fn inject_data(&self, data: &[u8]) {
        let _ = self.events.send(TransportEvent::Data(data.to_vec()));
    }

    /// Simulate the remote end hanging up
    pub fn inject_close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    /// Simulate a link failure
    pub fn inject_error(&self, message: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Error(message.to_string()));
    }

    fn frame(reply: &str) -> Vec<u8> {
        format!("{}\r\r>", reply).into_bytes()
    }

    fn deliver(&self, bytes: Vec<u8>) {
        if self.chunked.load(Ordering::SeqCst) && bytes.len() > 1 {
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            let _ = self.events.send(TransportEvent::Data(head.to_vec()));
            let _ = self.events.send(TransportEvent::Data(tail.to_vec()));
        } else {
            let _ = self.events.send(TransportEvent::Data(bytes));
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{}: simulated open failure",
                self.label
            )));
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            self.open_count.fetch_add(1, Ordering::SeqCst);
            debug!("[{}] open", self.label);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("[{}] closed", self.label);
            let _ = self.events.send(TransportEvent::Closed);
        }
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let command = Self::normalize(&String::from_utf8_lossy(data));
        self.writes.write().push(command.clone());

        let reply = self
            .responses
            .read()
            .get(&command)
            .cloned()
            .unwrap_or_else(|| SimulatedReply::Text("?".to_string()));

        match reply {
            SimulatedReply::Text(text) => self.deliver(Self::frame(&text)),
            SimulatedReply::Delayed(text, delay) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(TransportEvent::Data(Self::frame(&text)));
                });
            }
            SimulatedReply::Silent => {}
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn address(&self) -> TransportAddress {
        TransportAddress::Simulated {
            label: self.label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulator() -> SimulatedTransport {
        SimulatedTransport::new(RuntimeEnvironment::Development).unwrap()
    }

    #[test]
    fn test_rejected_in_production() {
        let result = SimulatedTransport::new(RuntimeEnvironment::Production);
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_replies_with_prompt() {
        let sim = simulator();
        let mut rx = sim.subscribe();
        sim.open().await.unwrap();
        sim.write(b"010C").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Data(b"41 0C 1A F8\r\r>".to_vec())
        );
        assert_eq!(sim.written(), vec!["010C"]);
    }

    #[tokio::test]
    async fn test_unknown_command_and_overrides() {
        let sim = simulator();
        let mut rx = sim.subscribe();
        sim.open().await.unwrap();

        sim.write(b"0199").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Data(b"?\r\r>".to_vec()));

        sim.set_response("0199", "41 99 01");
        sim.write(b"0199").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Data(b"41 99 01\r\r>".to_vec())
        );
    }

    #[tokio::test]
    async fn test_write_requires_open_and_close_is_idempotent() {
        let sim = simulator();
        assert_eq!(sim.write(b"ATZ").await, Err(TransportError::NotOpen));

        let mut rx = sim.subscribe();
        sim.open().await.unwrap();
        sim.close().await.unwrap();
        sim.close().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed);
        assert!(rx.try_recv().is_err());
        assert_eq!(sim.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_reply() {
        let sim = simulator();
        let mut rx = sim.subscribe();
        sim.open().await.unwrap();
        sim.set_delayed("ATI", "ELM327 v1.5", Duration::from_millis(500));
        sim.write(b"ATI").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Data(b"ELM327 v1.5\r\r>".to_vec())
        );
    }
}
