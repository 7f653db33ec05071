//! Node router
//!
//! Owns the live link set, picks the link for outbound requests, answers
//! requests addressed to this node through the application handler and
//! forwards everything else one hop closer to its target.

use crate::config::NodeConfig;
use crate::diagnostics::{Diagnostics, EventKind};
use crate::handshake::Handshake;
use crate::link::{LinkError, LinkId, LinkObserver, PeerLink, Reply};
use nodemesh_core::{
    NodeInfo, RequestMessage, RequestResult, RequestTarget, Response, ResponseMessage,
    ResponseStatus,
};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Application callback for requests addressed to this node.
///
/// Returning `None` sends no response. Runs on the blocking pool.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, payload: Vec<u8>) -> Option<Vec<u8>>;
}

impl<F> RequestHandler for F
where
    F: Fn(Vec<u8>) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    fn handle(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        self(payload)
    }
}

/// Routes requests between the application and the node's links
pub struct Router {
    local: NodeInfo,
    config: NodeConfig,
    /// Insertion-ordered; resolution picks the first match
    links: RwLock<Vec<Arc<PeerLink>>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    diagnostics: Diagnostics,
    next_request_id: AtomicU32,
    closed: AtomicBool,
    this: Weak<Router>,
}

impl Router {
    pub fn new(local: NodeInfo, config: NodeConfig, diagnostics: Diagnostics) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            config,
            links: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            diagnostics,
            next_request_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Install the handler for requests addressed to this node
    pub fn set_request_handler(&self, handler: impl RequestHandler) {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Register a handshaken stream as a live link and start its workers
    pub fn attach<S>(
        &self,
        stream: S,
        handshake: Handshake,
        endpoint: Option<SocketAddr>,
    ) -> Arc<PeerLink>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut remote = handshake.remote;
        remote.endpoint = endpoint;

        let observer: Weak<dyn LinkObserver> = self.this.clone();
        let link = PeerLink::new(
            remote,
            handshake.policy,
            self.config.clone(),
            observer,
            self.diagnostics.clone(),
        );

        // Registered before the workers run so no inbound message beats it
        self.links.write().push(link.clone());
        link.start(stream);

        if self.closed.load(Ordering::SeqCst) {
            link.shutdown("node shut down");
        }
        link
    }

    /// Snapshot of the remote nodes of all live links
    pub fn connected_node_info(&self) -> Vec<NodeInfo> {
        self.links
            .read()
            .iter()
            .map(|link| link.remote().clone())
            .collect()
    }

    /// Number of live links
    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    /// First live link whose remote matches `target`, skipping `exclude`
    pub fn resolve(&self, target: &RequestTarget, exclude: Option<LinkId>) -> Option<Arc<PeerLink>> {
        self.links
            .read()
            .iter()
            .filter(|link| Some(link.id()) != exclude && link.is_active())
            .find(|link| link.remote().matches(target))
            .cloned()
    }

    /// Send `data` towards `target` and wait for the outcome.
    ///
    /// Every failure is reported as a [`ResponseStatus`].
    pub async fn send(&self, data: Vec<u8>, target: RequestTarget) -> Response {
        if let RequestTarget::Name(name) = &target {
            if let Err(e) = nodemesh_core::validate_name(name) {
                self.diagnostics
                    .emit(EventKind::SendError, format_args!("bad target {:?}: {}", name, e));
                return Response::status(ResponseStatus::ResolveFailure);
            }
        }

        let Some(link) = self.select_link(&target) else {
            self.diagnostics
                .emit(EventKind::SendError, format_args!("no route to {}", target));
            return Response::status(ResponseStatus::ResolveFailure);
        };

        let request = RequestMessage::new(self.allocate_request_id(), target, data);
        debug!("Sending {} via {}", request, link.id());

        match link.send_request(request, self.config.request_timeout()).await {
            Ok(Reply::Response(response)) => Response::from(response),
            Ok(Reply::TimedOut) => Response::status(ResponseStatus::Timeout),
            Ok(Reply::NoReplyExpected) => Response::status(ResponseStatus::Success),
            Err(e @ LinkError::Unencodable(_)) => {
                self.diagnostics.emit(EventKind::SendError, format_args!("{}", e));
                Response::status(ResponseStatus::ResolveFailure)
            }
            Err(e) => {
                self.diagnostics
                    .emit(EventKind::SendError, format_args!("{}: {}", link.remote().name, e));
                Response::status(ResponseStatus::UnknownError)
            }
        }
    }

    /// Shut every live link down and refuse new ones
    pub fn shutdown_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Links call back into `link_closed`, which takes the write lock
        let links: Vec<_> = self.links.read().clone();
        for link in links {
            link.shutdown("node shut down");
        }
    }

    fn select_link(&self, target: &RequestTarget) -> Option<Arc<PeerLink>> {
        {
            let links = self.links.read();
            if links.len() == 1 {
                return links.first().cloned();
            }
        }
        self.resolve(target, None)
    }

    fn allocate_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn answer_locally(&self, origin: Arc<PeerLink>, request: RequestMessage) {
        let Some(handler) = self.handler.read().clone() else {
            debug!("No request handler installed, dropping {}", request);
            return;
        };
        let diagnostics = self.diagnostics.clone();

        tokio::spawn(async move {
            let request_id = request.request_id;
            let payload = request.payload;
            let outcome = tokio::task::spawn_blocking(move || handler.handle(payload)).await;

            let response = match outcome {
                Ok(Some(data)) => ResponseMessage::success(request_id, data),
                Ok(None) => return,
                Err(e) => {
                    diagnostics.emit(
                        EventKind::ApplicationError,
                        format_args!("rid={}: {}", request_id, e),
                    );
                    ResponseMessage::failure(request_id, RequestResult::UnknownError)
                }
            };
            if let Err(e) = origin.send_response(response) {
                debug!("Dropping response rid={}: {}", request_id, e);
            }
        });
    }

    fn forward(&self, origin: Arc<PeerLink>, request: RequestMessage) {
        let origin_id = request.request_id;

        let Some(next_hop) = self.resolve(&request.target, Some(origin.id())) else {
            self.diagnostics.emit(
                EventKind::ForwardError,
                format_args!("rid={} no route to {}", origin_id, request.target),
            );
            let response = ResponseMessage::failure(origin_id, RequestResult::ResolveError);
            if let Err(e) = origin.send_response(response) {
                debug!("Dropping resolve error rid={}: {}", origin_id, e);
            }
            return;
        };

        let diagnostics = self.diagnostics.clone();
        let timeout = self.config.request_timeout();

        tokio::spawn(async move {
            diagnostics.emit(
                EventKind::ForwardRequest,
                format_args!(
                    "rid={} {} -> {}",
                    origin_id,
                    origin.remote().name,
                    next_hop.remote().name
                ),
            );

            let response = match next_hop.send_request(request, timeout).await {
                Ok(Reply::Response(response)) => {
                    diagnostics.emit(
                        EventKind::ForwardResponse,
                        format_args!("rid={} {}", origin_id, response.result as u8),
                    );
                    response
                }
                Ok(Reply::TimedOut) => {
                    diagnostics.emit(
                        EventKind::ForwardError,
                        format_args!("rid={} timed out", origin_id),
                    );
                    ResponseMessage::failure(origin_id, RequestResult::Timeout)
                }
                Ok(Reply::NoReplyExpected) => return,
                Err(e) => {
                    diagnostics.emit(
                        EventKind::ForwardError,
                        format_args!("rid={} {}", origin_id, e),
                    );
                    ResponseMessage::failure(origin_id, RequestResult::UnknownError)
                }
            };

            if let Err(e) = origin.send_response(response) {
                debug!("Dropping forwarded response rid={}: {}", origin_id, e);
            }
        });
    }
}

impl LinkObserver for Router {
    fn request_received(&self, origin: Arc<PeerLink>, request: RequestMessage) {
        if self.local.is_addressed_by(&request.target) {
            self.answer_locally(origin, request);
        } else {
            self.forward(origin, request);
        }
    }

    fn link_closed(&self, link: &PeerLink) {
        let id = link.id();
        let removed = {
            let mut links = self.links.write();
            let before = links.len();
            links.retain(|l| l.id() != id);
            before != links.len()
        };
        if removed {
            info!("Removed {} to {}", id, link.remote().name);
            self.diagnostics
                .emit(EventKind::RemoveClient, format_args!("{} {}", link.remote().name, link.remote().id));
        } else {
            warn!("{} closed but was not registered", id);
        }
    }
}
