//! Connection handshake
//!
//! Bootstraps a raw byte stream into an identified peer link. The exchange
//! strictly alternates and has no version negotiation:
//!
//! ```text
//! initiator                         acceptor
//!   data16 "device"          ->
//!                            <-     data16 "server"
//!   caps u8, id [16], name data8 ->
//!                            <-     caps u8, id [16], name data8
//!                            <-     idle interval u16, reply flag u8
//!   "ok" (2 raw bytes)       ->
//! ```
//!
//! `data16` is a little-endian u16 length followed by that many bytes,
//! `data8` a u8 length followed by that many bytes.

use nodemesh_core::{validate_name, Capabilities, NodeId, NodeInfo};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const INITIATOR_GREETING: &[u8] = b"device";
pub const ACCEPTOR_GREETING: &[u8] = b"server";
pub const CONFIRMATION: &[u8] = b"ok";

/// Bound on a data16 field
pub const MAX_DATA16_LEN: usize = 18192;

/// Idle interval the acceptor advertises, in seconds
pub const ADVERTISED_IDLE_TIMEOUT_SECS: u16 = 30;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Unexpected greeting: expected {expected:?}, got {got:?}")]
    UnexpectedGreeting { expected: &'static str, got: String },
    #[error("Bad confirmation: {0:?}")]
    BadConfirmation(Vec<u8>),
    #[error("Field too long: {0} bytes (max {MAX_DATA16_LEN})")]
    FieldTooLong(usize),
    #[error("Invalid peer name: {0}")]
    InvalidName(#[from] nodemesh_core::Error),
    #[error("Peer sent the nil node id")]
    NilNodeId,
}

/// Keepalive policy announced by the acceptor.
///
/// Recorded on the link but not applied; the engines run on the configured
/// intervals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakePolicy {
    pub idle_timeout_secs: u16,
    pub reply_to_keepalives: bool,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            idle_timeout_secs: ADVERTISED_IDLE_TIMEOUT_SECS,
            reply_to_keepalives: true,
        }
    }
}

/// Result of a successful handshake
#[derive(Clone, Debug)]
pub struct Handshake {
    /// Remote node (endpoint not yet set)
    pub remote: NodeInfo,
    pub policy: HandshakePolicy,
}

/// Run the initiating side of the handshake
pub async fn initiate<S>(
    stream: &mut S,
    local: &NodeInfo,
    limit: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, initiate_inner(stream, local))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Run the accepting side of the handshake
pub async fn accept<S>(
    stream: &mut S,
    local: &NodeInfo,
    limit: Duration,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, accept_inner(stream, local))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn initiate_inner<S>(stream: &mut S, local: &NodeInfo) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_data16(stream, INITIATOR_GREETING).await?;
    stream.flush().await?;
    expect_greeting(stream, ACCEPTOR_GREETING, "server").await?;

    write_identity(stream, local).await?;
    stream.flush().await?;
    let remote = read_identity(stream).await?;

    let idle_timeout_secs = stream.read_u16_le().await?;
    let reply_to_keepalives = stream.read_u8().await? > 0;

    stream.write_all(CONFIRMATION).await?;
    stream.flush().await?;

    Ok(Handshake {
        remote,
        policy: HandshakePolicy {
            idle_timeout_secs,
            reply_to_keepalives,
        },
    })
}

async fn accept_inner<S>(stream: &mut S, local: &NodeInfo) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    expect_greeting(stream, INITIATOR_GREETING, "device").await?;
    write_data16(stream, ACCEPTOR_GREETING).await?;
    stream.flush().await?;

    let remote = read_identity(stream).await?;
    write_identity(stream, local).await?;

    let policy = HandshakePolicy::default();
    stream.write_u16_le(policy.idle_timeout_secs).await?;
    stream.write_u8(policy.reply_to_keepalives as u8).await?;
    stream.flush().await?;

    let mut confirmation = [0u8; 2];
    stream.read_exact(&mut confirmation).await?;
    if confirmation != CONFIRMATION {
        return Err(HandshakeError::BadConfirmation(confirmation.to_vec()));
    }

    Ok(Handshake { remote, policy })
}

async fn expect_greeting<S>(
    stream: &mut S,
    expected: &[u8],
    label: &'static str,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let data = read_data16(stream).await?;
    if data != expected {
        return Err(HandshakeError::UnexpectedGreeting {
            expected: label,
            got: String::from_utf8_lossy(&data).into_owned(),
        });
    }
    Ok(())
}

async fn write_identity<S>(stream: &mut S, local: &NodeInfo) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u8(local.capabilities.bits()).await?;
    stream.write_all(local.id.as_bytes()).await?;
    write_data8(stream, local.name.as_bytes()).await
}

async fn read_identity<S>(stream: &mut S) -> Result<NodeInfo, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let capabilities = Capabilities(stream.read_u8().await?);
    let mut id = [0u8; 16];
    stream.read_exact(&mut id).await?;
    let id = NodeId(id);
    if id.is_nil() {
        return Err(HandshakeError::NilNodeId);
    }

    let len = stream.read_u8().await? as usize;
    let mut name = vec![0u8; len];
    stream.read_exact(&mut name).await?;
    let name = String::from_utf8_lossy(&name).into_owned();
    validate_name(&name)?;

    Ok(NodeInfo {
        id,
        name,
        capabilities,
        endpoint: None,
    })
}

async fn write_data16<S>(stream: &mut S, data: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    if data.len() > MAX_DATA16_LEN {
        return Err(HandshakeError::FieldTooLong(data.len()));
    }
    stream.write_u16_le(data.len() as u16).await?;
    stream.write_all(data).await?;
    Ok(())
}

async fn read_data16<S>(stream: &mut S) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16_le().await? as usize;
    if len > MAX_DATA16_LEN {
        return Err(HandshakeError::FieldTooLong(len));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}

async fn write_data8<S>(stream: &mut S, data: &[u8]) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let len = u8::try_from(data.len()).map_err(|_| HandshakeError::FieldTooLong(data.len()))?;
    stream.write_u8(len).await?;
    stream.write_all(data).await?;
    Ok(())
}
