//! Reader task and writer slot shared by the stream-backed transports

use super::{TransportError, TransportEvent, EVENT_CHANNEL_CAPACITY, LINE_TERMINATOR};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) struct StreamLink {
    label: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    open: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
}

impl StreamLink {
    pub(crate) fn new(label: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            label: label.into(),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Install a freshly opened stream and start forwarding its bytes
    pub(crate) async fn attach<R>(&self, mut reader: R, writer: BoxedWriter)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(writer);
        self.open.store(true, Ordering::SeqCst);

        let open = Arc::clone(&self.open);
        let events = self.events.clone();
        let label = self.label.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!("[{}] stream reached EOF", label);
                        open.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        let _ = events.send(TransportEvent::Data(buf[..n].to_vec()));
                    }
                    Err(e) => {
                        warn!("[{}] read failed: {}", label, e);
                        open.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.reader.lock().replace(handle) {
            old.abort();
        }
    }

    pub(crate) async fn write_line(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let result = async {
            writer.write_all(data).await?;
            writer.write_all(LINE_TERMINATOR).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    /// Stop the reader, drop the writer and announce closure once
    pub(crate) async fn shutdown(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("[{}] closed", self.label);
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_bytes_and_eof() {
        let (client, mut remote) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(client);
        let link = StreamLink::new("test");
        let mut rx = link.subscribe();
        link.attach(read_half, Box::new(write_half)).await;
        assert!(link.is_open());

        link.write_line(b"ATZ").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ATZ\r");

        remote.write_all(b"OK\r>").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Data(b"OK\r>".to_vec()));

        drop(remote);
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed);
        assert!(!link.is_open());
        assert_eq!(link.write_line(b"ATI").await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (client, _remote) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(client);
        let link = StreamLink::new("test");
        let mut rx = link.subscribe();
        link.attach(read_half, Box::new(write_half)).await;

        link.shutdown().await;
        link.shutdown().await;
        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed);
        assert!(rx.try_recv().is_err());
    }
}
