//! Application-facing node
//!
//! A [`Node`] is one mesh participant: it accepts and opens TCP connections,
//! handshakes them into links and hands them to its [`Router`].

use crate::config::{ConfigError, NodeConfig};
use crate::diagnostics::{DiagnosticEvent, Diagnostics, EventKind};
use crate::handshake::{self, HandshakeError};
use crate::router::{RequestHandler, Router};
use nodemesh_core::{NodeInfo, RequestTarget, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Invalid node name: {0}")]
    InvalidName(#[from] nodemesh_core::Error),
}

/// A mesh node
pub struct Node {
    router: Arc<Router>,
    config: NodeConfig,
    /// Parent of every listener's accept loop
    listeners: CancellationToken,
}

impl Node {
    /// Create a node with default configuration
    pub fn new(name: impl Into<String>) -> Result<Self, NodeError> {
        Self::with_config(name, NodeConfig::default())
    }

    /// Create a node with explicit configuration
    pub fn with_config(name: impl Into<String>, config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let mut local = NodeInfo::local(name)?;
        local.capabilities = config.capabilities();

        info!("Node {} ({}) created", local.name, local.id);
        Ok(Self {
            router: Router::new(local, config.clone(), Diagnostics::new()),
            config,
            listeners: CancellationToken::new(),
        })
    }

    /// This node's identity
    pub fn info(&self) -> &NodeInfo {
        self.router.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Connect to a remote node and complete the handshake.
    ///
    /// Returns the remote node once the link is live.
    pub async fn connect(&self, host: &str, port: u16) -> Result<NodeInfo, NodeError> {
        let diagnostics = self.router.diagnostics();
        diagnostics.emit(EventKind::Connect, format_args!("{}:{}", host, port));

        let limit = self.config.handshake_timeout();
        let mut stream = timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| NodeError::ConnectTimeout(limit))??;
        stream.set_nodelay(true)?;
        let endpoint = stream.peer_addr().ok();
        diagnostics.emit(
            EventKind::OnClientConnect,
            format_args!("outgoing {}:{}", host, port),
        );

        match handshake::initiate(&mut stream, self.router.local(), self.config.handshake_timeout())
            .await
        {
            Ok(outcome) => {
                diagnostics.emit(
                    EventKind::HandshakeSuccess,
                    format_args!("{} ({})", outcome.remote.name, outcome.remote.id),
                );
                let link = self.router.attach(stream, outcome, endpoint);
                Ok(link.remote().clone())
            }
            Err(e) => {
                diagnostics.emit(EventKind::HandshakeFail, &e);
                Err(e.into())
            }
        }
    }

    /// Listen for peers on `0.0.0.0:port`.
    ///
    /// Returns the bound address; port 0 picks a free port.
    pub async fn start_listener(&self, port: u16) -> Result<SocketAddr, NodeError> {
        let diagnostics = self.router.diagnostics();
        diagnostics.emit(EventKind::StartListener, port);

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let listener = socket.listen(self.config.listen_backlog)?;
        let addr = listener.local_addr()?;

        diagnostics.emit(EventKind::ListenerStarted, addr);
        info!("Node {} listening on {}", self.info().name, addr);

        tokio::spawn(accept_loop(
            listener,
            self.router.clone(),
            self.listeners.child_token(),
        ));
        Ok(addr)
    }

    /// Send `data` to `target` and wait for the response
    pub async fn send(&self, data: Vec<u8>, target: impl Into<RequestTarget>) -> Response {
        self.router.send(data, target.into()).await
    }

    /// Install the handler for requests addressed to this node
    pub fn set_request_handler(&self, handler: impl RequestHandler) {
        self.router.set_request_handler(handler);
    }

    /// Subscribe to this node's diagnostic events
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.router.diagnostics().subscribe()
    }

    /// Remote nodes of all live links
    pub fn connected_node_info(&self) -> Vec<NodeInfo> {
        self.router.connected_node_info()
    }

    /// Stop listening and close every link
    pub fn shutdown(&self) {
        self.listeners.cancel();
        self.router.shutdown_all();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<Router>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                router.diagnostics().emit(EventKind::ListenerAccept, addr);
                tokio::spawn(accept_peer(stream, addr, router.clone()));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    info!("Listener on {:?} stopped", listener.local_addr().ok());
}

async fn accept_peer(mut stream: TcpStream, addr: SocketAddr, router: Arc<Router>) {
    let diagnostics = router.diagnostics().clone();
    diagnostics.emit(EventKind::OnClientConnect, format_args!("incoming {}", addr));

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let limit = router.config().handshake_timeout();
    match handshake::accept(&mut stream, router.local(), limit).await {
        Ok(outcome) => {
            diagnostics.emit(
                EventKind::HandshakeSuccess,
                format_args!("{} ({}) from {}", outcome.remote.name, outcome.remote.id, addr),
            );
            router.attach(stream, outcome, Some(addr));
        }
        Err(e) => {
            warn!("Handshake with {} failed: {}", addr, e);
            diagnostics.emit(EventKind::HandshakeFail, format_args!("{}: {}", addr, e));
        }
    }
}
