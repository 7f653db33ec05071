//! Message framing for peer links
//!
//! Adapts the byte layout in [`nodemesh_core::wire`] to a tokio codec so a
//! link can read and write whole messages over a byte stream.

use bytes::{Buf, BytesMut};
use nodemesh_core::wire::{self, DEFAULT_MAX_PAYLOAD};
use nodemesh_core::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Framing errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] nodemesh_core::Error),
    #[error("Stream ended inside a message ({0} bytes buffered)")]
    Truncated(usize),
    #[error("Read timed out inside a message ({0} bytes buffered)")]
    Stalled(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for nodemesh messages
#[derive(Clone, Debug)]
pub struct MessageCodec {
    /// Largest accepted request/response payload
    max_payload: usize,
}

impl MessageCodec {
    /// Create a new codec with the default payload cap
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Create codec with a custom payload cap
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match wire::decode(&src[..], self.max_payload)? {
            Some((message, used)) => {
                src.advance(used);
                Ok(Some(message))
            }
            None => {
                // Leave the partial message buffered until more bytes arrive
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Truncated(src.len())),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = match &item {
            Message::Request(request) => request.payload.len(),
            Message::Response(response) => response.payload.len(),
            Message::KeepAlive => 0,
        };
        if payload_len > self.max_payload {
            return Err(nodemesh_core::Error::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            }
            .into());
        }

        dst.reserve(wire::encoded_len(&item));
        wire::encode(&item, dst)?;
        Ok(())
    }
}
