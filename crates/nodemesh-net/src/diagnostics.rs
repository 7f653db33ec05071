//! Per-node diagnostic event stream
//!
//! Every notable step (connects, handshakes, forwarding, link shutdown) is
//! logged through `tracing` and published to subscribers of the owning node.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 1024;

/// Kind of diagnostic event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Connect,
    StartListener,
    ListenerStarted,
    ListenerAccept,
    OnClientConnect,
    HandshakeSuccess,
    HandshakeFail,
    Send,
    ResponseReceived,
    Timeout,
    SendError,
    OnRequestReceived,
    OnMessageReceived,
    MismatchingResponse,
    SendResponse,
    KeepaliveReceived,
    NetTimeout,
    ForwardRequest,
    ForwardResponse,
    ForwardError,
    ApplicationError,
    ClientShutdown,
    RemoveClient,
}

/// A diagnostic event
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticEvent {
    pub kind: EventKind,
    pub detail: String,
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.detail)
    }
}

/// Diagnostics sink owned by one node and shared with its links
#[derive(Clone, Debug)]
pub struct Diagnostics {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl Diagnostics {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    /// Log and publish an event
    pub fn emit(&self, kind: EventKind, detail: impl fmt::Display) {
        let detail = detail.to_string();
        debug!(event = ?kind, "{}", detail);
        // No subscribers is fine
        let _ = self.tx.send(DiagnosticEvent { kind, detail });
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
