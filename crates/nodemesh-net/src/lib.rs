//! Networking for nodemesh nodes
//!
//! This crate provides:
//! - Message framing over byte streams
//! - The connection handshake
//! - Per-link send/receive workers with keepalive and idle detection
//! - Request/response correlation on each link
//! - Request routing and multi-hop forwarding
//! - The application-facing [`Node`]

pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod handshake;
pub mod link;
pub mod node;
pub mod router;

pub use codec::{CodecError, MessageCodec};
pub use config::{ConfigError, NodeConfig};
pub use diagnostics::{DiagnosticEvent, Diagnostics, EventKind};
pub use handshake::{Handshake, HandshakeError, HandshakePolicy};
pub use link::{LinkError, LinkId, PeerLink, Reply};
pub use node::{Node, NodeError};
pub use router::{RequestHandler, Router};
