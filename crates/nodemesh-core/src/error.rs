//! Error types for nodemesh

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol errors raised while encoding or decoding messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// First byte of a message is not a known tag
    #[error("unrecognised message tag: {0}")]
    UnknownTag(u8),

    /// Response carries a result code outside the agreed enumeration
    #[error("unrecognised result code: {0}")]
    UnknownResultCode(u8),

    /// Declared payload length exceeds the configured cap
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Node name cannot be carried in a one-byte length field
    #[error("node name too long: {0} bytes (max {max})", max = crate::types::MAX_NAME_LEN)]
    NameTooLong(usize),

    /// Node names are restricted to ASCII
    #[error("node name is not ASCII")]
    NonAsciiName,

    /// Node names must not be empty
    #[error("node name is empty")]
    EmptyName,
}
