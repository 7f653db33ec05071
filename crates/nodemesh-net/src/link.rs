//! Peer links and request correlation
//!
//! A [`PeerLink`] is one handshaken connection to one remote node. It owns
//! the pending-request table that matches responses to the calls waiting on
//! them, and the two workers from [`crate::engine`].
//!
//! Request ids are scoped to a link: every outgoing request that expects a
//! reply is rewritten to a fresh link-local id, and the caller's id is
//! restored on the matching response.

use crate::codec::MessageCodec;
use crate::config::NodeConfig;
use crate::diagnostics::{Diagnostics, EventKind};
use crate::engine::{self, EngineEvents, EngineFailure, ReceiveTimeouts, SendTimeouts};
use crate::handshake::HandshakePolicy;
use nodemesh_core::wire;
use nodemesh_core::{Message, NodeInfo, RequestMessage, RequestResult, ResponseMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique link identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Link errors
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Cannot encode request: {0}")]
    Unencodable(#[from] nodemesh_core::Error),
}

/// Outcome of a request sent on a link
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Matching response, carrying the caller's request id
    Response(ResponseMessage),
    /// No response before the deadline
    TimedOut,
    /// Sent with a zero timeout; nothing is awaited
    NoReplyExpected,
}

/// Receives inbound requests and shutdown notices from links
pub trait LinkObserver: Send + Sync {
    /// Called on the receive path; must not block
    fn request_received(&self, origin: Arc<PeerLink>, request: RequestMessage);

    /// Called exactly once per link
    fn link_closed(&self, link: &PeerLink);
}

struct PendingRequest {
    original_id: u32,
    completion: oneshot::Sender<ResponseMessage>,
}

struct PendingTable {
    next_id: u32,
    entries: HashMap<u32, PendingRequest>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Next free id; 0 is never used
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// An established connection to one remote node
pub struct PeerLink {
    id: LinkId,
    remote: NodeInfo,
    policy: HandshakePolicy,
    config: NodeConfig,
    outbound: mpsc::UnboundedSender<Message>,
    /// Taken by `start`
    queue: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pending: Mutex<PendingTable>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    observer: Weak<dyn LinkObserver>,
    diagnostics: Diagnostics,
    this: Weak<PeerLink>,
}

impl PeerLink {
    /// Create a link for a handshaken remote. Nothing is read or written
    /// until [`PeerLink::start`].
    pub fn new(
        remote: NodeInfo,
        policy: HandshakePolicy,
        config: NodeConfig,
        observer: Weak<dyn LinkObserver>,
        diagnostics: Diagnostics,
    ) -> Arc<Self> {
        let (outbound, queue) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            id: LinkId::next(),
            remote,
            policy,
            config,
            outbound,
            queue: Mutex::new(Some(queue)),
            pending: Mutex::new(PendingTable::new()),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            observer,
            diagnostics,
            this: this.clone(),
        })
    }

    /// Spawn the send and receive workers over `stream`
    pub fn start<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(link) = self.this.upgrade() else {
            return;
        };
        let Some(queue) = self.queue.lock().take() else {
            warn!("{} already started", self.id);
            return;
        };

        let codec = MessageCodec::with_max_payload(self.config.max_payload_bytes);
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(engine::run_receiver(
            FramedRead::new(reader, codec.clone()),
            ReceiveTimeouts {
                io: self.config.io_timeout(),
                idle: self.config.idle_timeout(),
            },
            self.cancel.clone(),
            link.clone(),
        ));
        tokio::spawn(engine::run_sender(
            FramedWrite::new(writer, codec),
            queue,
            SendTimeouts {
                io: self.config.io_timeout(),
                keepalive: self.config.keepalive_interval(),
            },
            self.cancel.clone(),
            link,
        ));

        info!("{} to {} ({}) started", self.id, self.remote.name, self.remote.id);
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Remote node as learned in the handshake
    pub fn remote(&self) -> &NodeInfo {
        &self.remote
    }

    /// Keepalive policy the acceptor announced (advisory)
    pub fn policy(&self) -> HandshakePolicy {
        self.policy
    }

    pub fn is_active(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// A zero timeout sends without waiting or bookkeeping.
    pub async fn send_request(
        &self,
        request: RequestMessage,
        timeout: Duration,
    ) -> Result<Reply, LinkError> {
        self.check_payload(request.payload.len())?;
        // Encoder errors in the send worker would take the whole link down
        wire::check_request(&request)?;

        if timeout.is_zero() {
            if !self.is_active() {
                return Err(LinkError::Closed);
            }
            self.enqueue(Message::Request(request))?;
            return Ok(Reply::NoReplyExpected);
        }

        let original_id = request.request_id;
        let (completion, mut rx) = oneshot::channel();
        let local_id = {
            let mut pending = self.pending.lock();
            if !self.is_active() {
                return Err(LinkError::Closed);
            }
            let local_id = pending.allocate();
            pending.entries.insert(
                local_id,
                PendingRequest {
                    original_id,
                    completion,
                },
            );
            let mut request = request;
            request.request_id = local_id;
            if self.outbound.send(Message::Request(request)).is_err() {
                pending.entries.remove(&local_id);
                return Err(LinkError::Closed);
            }
            local_id
        };
        self.diagnostics.emit(
            EventKind::Send,
            format_args!("{} rid={} as {}", self.remote.name, original_id, local_id),
        );

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => Ok(Reply::Response(response)),
            Ok(Err(_)) => Err(LinkError::Closed),
            Err(_) => {
                let unclaimed = self.pending.lock().entries.remove(&local_id).is_some();
                if unclaimed {
                    self.diagnostics.emit(
                        EventKind::Timeout,
                        format_args!("{} rid={} after {:?}", self.remote.name, original_id, timeout),
                    );
                    return Ok(Reply::TimedOut);
                }
                // Completed or drained under the lock just before we got it
                match rx.try_recv() {
                    Ok(response) => Ok(Reply::Response(response)),
                    Err(_) => Err(LinkError::Closed),
                }
            }
        }
    }

    /// Queue a response to a request this link delivered
    pub fn send_response(&self, response: ResponseMessage) -> Result<(), LinkError> {
        let response = if self.check_payload(response.payload.len()).is_err() {
            warn!(
                "{} response rid={} exceeds payload cap, replying UnknownError",
                self.id, response.request_id
            );
            ResponseMessage::failure(response.request_id, RequestResult::UnknownError)
        } else {
            response
        };
        self.diagnostics
            .emit(EventKind::SendResponse, format_args!("{} {}", self.remote.name, response));
        self.enqueue(Message::Response(response))
    }

    /// Stop both workers, release every waiter and notify the observer.
    ///
    /// Only the first call has any effect.
    pub fn shutdown(&self, reason: impl fmt::Display) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let released = {
            let mut pending = self.pending.lock();
            let released = pending.entries.len();
            pending.entries.clear();
            released
        };

        info!("{} to {} shut down: {}", self.id, self.remote.name, reason);
        self.diagnostics.emit(
            EventKind::ClientShutdown,
            format_args!("{} {} ({} waiters released)", self.remote.name, reason, released),
        );

        if let Some(observer) = self.observer.upgrade() {
            observer.link_closed(self);
        }
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().entries.len()
    }

    fn enqueue(&self, message: Message) -> Result<(), LinkError> {
        self.outbound.send(message).map_err(|_| LinkError::Closed)
    }

    fn check_payload(&self, len: usize) -> Result<(), LinkError> {
        let max = self.config.max_payload_bytes;
        if len > max {
            return Err(LinkError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    fn complete(&self, mut response: ResponseMessage) {
        let local_id = response.request_id;
        let mut pending = self.pending.lock();
        match pending.entries.remove(&local_id) {
            Some(entry) => {
                response.request_id = entry.original_id;
                let _ = entry.completion.send(response);
                drop(pending);
                self.diagnostics.emit(
                    EventKind::ResponseReceived,
                    format_args!("{} rid={}", self.remote.name, local_id),
                );
            }
            None => {
                drop(pending);
                self.diagnostics.emit(
                    EventKind::MismatchingResponse,
                    format_args!("{} rid={}", self.remote.name, local_id),
                );
            }
        }
    }
}

impl EngineEvents for PeerLink {
    fn message_received(&self, message: Message) {
        self.diagnostics.emit(
            EventKind::OnMessageReceived,
            format_args!("{} {}", self.remote.name, message.kind()),
        );
        match message {
            Message::Request(request) => {
                self.diagnostics.emit(
                    EventKind::OnRequestReceived,
                    format_args!("{} {}", self.remote.name, request),
                );
                let origin = self.this.upgrade();
                match (self.observer.upgrade(), origin) {
                    (Some(observer), Some(origin)) => observer.request_received(origin, request),
                    _ => debug!("{} dropping request, no observer", self.id),
                }
            }
            Message::Response(response) => self.complete(response),
            Message::KeepAlive => self.keepalive_received(),
        }
    }

    fn keepalive_received(&self) {
        self.diagnostics
            .emit(EventKind::KeepaliveReceived, &self.remote.name);
    }

    fn net_timeout(&self, silent_for: Duration) {
        self.diagnostics.emit(
            EventKind::NetTimeout,
            format_args!("{} silent for {:?}", self.remote.name, silent_for),
        );
    }

    fn failed(&self, failure: EngineFailure) {
        warn!("{} to {} failed: {}", self.id, self.remote.name, failure);
        self.shutdown(failure);
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .finish()
    }
}
