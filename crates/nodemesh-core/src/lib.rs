//! nodemesh core library
//!
//! This crate provides the identity types, message model and byte-level wire
//! encoding shared by every nodemesh node.
//!
//! # Modules
//!
//! - [`types`]: Node identity (NodeId, NodeInfo, Capabilities) and request targets
//! - [`message`]: Request / Response / KeepAlive message model
//! - [`wire`]: Byte layout of messages on the stream
//! - [`error`]: Error types

pub mod error;
pub mod message;
pub mod types;
pub mod wire;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use message::*;
pub use types::*;
