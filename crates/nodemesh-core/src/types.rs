//! Node identity types
//!
//! A node is identified by a random 16-byte id assigned once at creation and
//! by a human-chosen ASCII name. Requests address a node by either.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Longest name that fits the request target length byte (255 is the id sentinel).
pub const MAX_NAME_LEN: usize = 254;

// =============================================================================
// IDENTITY
// =============================================================================

/// 128-bit node identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// The empty identifier ("no id given")
    pub const NIL: NodeId = NodeId([0u8; 16]);

    /// Generate a fresh random identifier (never the nil id)
    pub fn generate() -> Self {
        loop {
            let id = NodeId(rand::random());
            if !id.is_nil() {
                return id;
            }
        }
    }

    /// Is this the empty identifier
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// Capability bitset advertised during the handshake
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities(pub u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Check that a name can be sent in a handshake and in a request target
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::EmptyName);
    }
    if !name.is_ascii() {
        return Err(Error::NonAsciiName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong(name.len()));
    }
    Ok(())
}

/// Information about a node, local or remote
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node identifier
    pub id: NodeId,
    /// Node name
    pub name: String,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Remote address, set once a link is established
    pub endpoint: Option<SocketAddr>,
}

impl NodeInfo {
    /// Create info for a new local node with a freshly generated id
    pub fn local(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id: NodeId::generate(),
            name,
            capabilities: Capabilities::NONE,
            endpoint: None,
        })
    }

    /// Does a request addressed to `target` name this node as a remote peer.
    ///
    /// An id match wins; any other non-nil id never matches; otherwise the
    /// name must match exactly. An unspecified target matches nobody.
    pub fn matches(&self, target: &RequestTarget) -> bool {
        match target {
            RequestTarget::Id(id) => *id == self.id,
            RequestTarget::Name(name) => *name == self.name,
            RequestTarget::Unspecified => false,
        }
    }

    /// Is a request addressed to `target` meant for this node itself.
    ///
    /// Same as [`NodeInfo::matches`], except that an unspecified target means
    /// "whoever receives it".
    pub fn is_addressed_by(&self, target: &RequestTarget) -> bool {
        matches!(target, RequestTarget::Unspecified) || self.matches(target)
    }
}

// =============================================================================
// ADDRESSING
// =============================================================================

/// Destination of a request
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestTarget {
    /// No name and no id: the receiving node
    #[default]
    Unspecified,
    /// Exact node name
    Name(String),
    /// Exact node id (never nil)
    Id(NodeId),
}

impl RequestTarget {
    /// Address a node by name; an empty name is [`RequestTarget::Unspecified`]
    pub fn name(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            RequestTarget::Unspecified
        } else {
            RequestTarget::Name(name)
        }
    }

    /// Address a node by id; the nil id is [`RequestTarget::Unspecified`]
    pub fn id(id: NodeId) -> Self {
        if id.is_nil() {
            RequestTarget::Unspecified
        } else {
            RequestTarget::Id(id)
        }
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, RequestTarget::Unspecified)
    }
}

impl From<&str> for RequestTarget {
    fn from(name: &str) -> Self {
        RequestTarget::name(name)
    }
}

impl From<String> for RequestTarget {
    fn from(name: String) -> Self {
        RequestTarget::name(name)
    }
}

impl From<NodeId> for RequestTarget {
    fn from(id: NodeId) -> Self {
        RequestTarget::id(id)
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::Unspecified => write!(f, "-"),
            RequestTarget::Name(name) => write!(f, "{}", name),
            RequestTarget::Id(id) => write!(f, "{}", id),
        }
    }
}
