//! SSE sink capability and frame formatting.
//!
//! The stream core never talks to HTTP directly; it writes framed bytes into
//! an [`SseSink`]. The server hands it a channel-backed sink whose receiver
//! side becomes the response body, and tests substitute recording sinks.

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed by peer")]
    Closed,
}

/// Capability surface the core needs from a subscriber connection: ordered
/// byte writes and a close. Calls must not block; a slow implementation
/// stalls every subscriber of the session.
pub trait SseSink: Send + Sync {
    fn write(&self, frame: &[u8]) -> Result<(), SinkError>;
    fn close(&self);
}

/// One SSE frame: `data: <json>\n\n`. No event names, no `id:` fields, no
/// retry hints.
pub fn sse_frame(value: &serde_json::Value) -> Vec<u8> {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(json.as_bytes());
    frame.extend_from_slice(b"\n\n");
    frame
}

/// Channel-backed sink. `close` drops the sender so the receiver stream (and
/// with it the HTTP response body) terminates; writes after the receiver is
/// gone report [`SinkError::Closed`].
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SseSink for ChannelSink {
    fn write(&self, frame: &[u8]) -> Result<(), SinkError> {
        let guard = self.sender();
        let Some(tx) = guard.as_ref() else {
            return Err(SinkError::Closed);
        };
        tx.send(frame.to_vec()).map_err(|_| SinkError::Closed)
    }

    fn close(&self) {
        self.sender().take();
    }
}
