//! Send and receive workers for a peer link
//!
//! Each established link runs one receive task and one send task over the two
//! halves of its stream. Neither task knows about requests or routing; they
//! report everything to an [`EngineEvents`] implementor.

use crate::codec::{CodecError, MessageCodec};
use futures_util::{SinkExt, StreamExt};
use nodemesh_core::Message;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why a worker stopped
#[derive(Debug, Error)]
pub enum EngineFailure {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(CodecError),
    #[error("Stream closed by peer")]
    Closed,
    #[error("Nothing received for {0:?}")]
    IdleTimeout(Duration),
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
}

impl From<CodecError> for EngineFailure {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => EngineFailure::Io(io),
            other => EngineFailure::Codec(other),
        }
    }
}

/// Callbacks from the workers to the owning link.
///
/// Called on the worker tasks; implementations must not block.
pub trait EngineEvents: Send + Sync + 'static {
    /// A request or response arrived
    fn message_received(&self, message: Message);

    /// A keepalive arrived
    fn keepalive_received(&self) {}

    /// An io timeout elapsed with no bytes received
    fn net_timeout(&self, _silent_for: Duration) {}

    /// A worker stopped on an error
    fn failed(&self, failure: EngineFailure);
}

/// Receive-side timing
#[derive(Clone, Copy, Debug)]
pub struct ReceiveTimeouts {
    /// Longest wait for more bytes; a message left incomplete this long
    /// fails the link
    pub io: Duration,
    /// Time since the last received byte after which the link is dead
    pub idle: Duration,
}

/// Send-side timing
#[derive(Clone, Copy, Debug)]
pub struct SendTimeouts {
    /// Bound on a single write
    pub io: Duration,
    /// Keepalive cadence, `None` disables keepalives
    pub keepalive: Option<Duration>,
}

/// Read and decode messages until the stream fails or `cancel` fires.
///
/// Any received byte counts as contact, even mid-message.
pub async fn run_receiver<R, E>(
    mut stream: FramedRead<R, MessageCodec>,
    timeouts: ReceiveTimeouts,
    cancel: CancellationToken,
    events: Arc<E>,
) where
    R: AsyncRead + Unpin,
    E: EngineEvents,
{
    let mut last_contact = Instant::now();
    // Bytes of an incomplete message held by the framer
    let mut buffered = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(timeouts.io, stream.next()) => next,
        };

        match next {
            Err(_) => {
                let held = stream.read_buffer().len();
                if held != buffered {
                    buffered = held;
                    last_contact = Instant::now();
                    continue;
                }
                if held > 0 {
                    events.failed(EngineFailure::Codec(CodecError::Stalled(held)));
                    break;
                }
                let silent_for = last_contact.elapsed();
                events.net_timeout(silent_for);
                if silent_for > timeouts.idle {
                    events.failed(EngineFailure::IdleTimeout(silent_for));
                    break;
                }
            }
            Ok(None) => {
                events.failed(EngineFailure::Closed);
                break;
            }
            Ok(Some(Err(e))) => {
                events.failed(e.into());
                break;
            }
            Ok(Some(Ok(message))) => {
                last_contact = Instant::now();
                buffered = stream.read_buffer().len();
                match message {
                    Message::KeepAlive => events.keepalive_received(),
                    other => events.message_received(other),
                }
            }
        }
    }

    trace!("Receive worker stopped");
}

/// Write queued messages in FIFO order, filling idle gaps with keepalives
pub async fn run_sender<W, E>(
    mut sink: FramedWrite<W, MessageCodec>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    timeouts: SendTimeouts,
    cancel: CancellationToken,
    events: Arc<E>,
) where
    W: AsyncWrite + Unpin,
    E: EngineEvents,
{
    let mut next_keepalive = timeouts.keepalive.map(|interval| Instant::now() + interval);

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            queued = queue.recv() => match queued {
                Some(message) => message,
                None => break,
            },
            _ = keepalive_due(next_keepalive) => Message::KeepAlive,
        };

        match timeout(timeouts.io, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                events.failed(e.into());
                break;
            }
            Err(_) => {
                events.failed(EngineFailure::WriteTimeout(timeouts.io));
                break;
            }
        }

        if let Some(interval) = timeouts.keepalive {
            next_keepalive = Some(Instant::now() + interval);
        }
    }

    trace!("Send worker stopped");
}

async fn keepalive_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
