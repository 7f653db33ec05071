//! Wire encoding for nodemesh messages
//!
//! Every message starts with a one-byte tag. Integers are little-endian.
//!
//! ```text
//! Request:   0 | request_id u32 | target_len u8 | target | data_len u32 | data
//! Response:  1 | request_id u32 | result u8 | data_len u32 | data
//! KeepAlive: 2
//! ```
//!
//! `target_len` is 0 for an unspecified target, the name length for a name,
//! or [`TARGET_ID_SENTINEL`] followed by a 16-byte node id.

use crate::error::{Error, Result};
use crate::message::{Message, RequestMessage, RequestResult, ResponseMessage};
use crate::types::{NodeId, RequestTarget, MAX_NAME_LEN};
use bytes::{Buf, BufMut};

pub const TAG_REQUEST: u8 = 0;
pub const TAG_RESPONSE: u8 = 1;
pub const TAG_KEEPALIVE: u8 = 2;

/// Target length value announcing a 16-byte node id
pub const TARGET_ID_SENTINEL: u8 = 255;

/// Default cap on request/response payloads (16 MB)
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Check that `message` can be encoded, without writing anything
pub fn check(message: &Message) -> Result<()> {
    match message {
        Message::Request(request) => check_request(request),
        Message::Response(response) => payload_len(&response.payload).map(|_| ()),
        Message::KeepAlive => Ok(()),
    }
}

/// Check that `request` can be encoded
pub fn check_request(request: &RequestMessage) -> Result<()> {
    check_target(&request.target)?;
    payload_len(&request.payload)?;
    Ok(())
}

/// Number of bytes `message` occupies on the wire
pub fn encoded_len(message: &Message) -> usize {
    match message {
        Message::Request(request) => {
            let target = match &request.target {
                RequestTarget::Unspecified => 0,
                RequestTarget::Name(name) => name.len(),
                RequestTarget::Id(_) => 16,
            };
            1 + 4 + 1 + target + 4 + request.payload.len()
        }
        Message::Response(response) => 1 + 4 + 1 + 4 + response.payload.len(),
        Message::KeepAlive => 1,
    }
}

/// Append the encoding of `message` to `dst`.
///
/// Nothing is written when the message cannot be encoded.
pub fn encode<B: BufMut>(message: &Message, dst: &mut B) -> Result<()> {
    check(message)?;
    match message {
        Message::Request(request) => encode_request(request, dst),
        Message::Response(response) => encode_response(response, dst),
        Message::KeepAlive => dst.put_u8(TAG_KEEPALIVE),
    }
    Ok(())
}

/// Encode `message` into a fresh buffer
pub fn to_bytes(message: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded_len(message));
    encode(message, &mut out)?;
    Ok(out)
}

fn check_target(target: &RequestTarget) -> Result<()> {
    if let RequestTarget::Name(name) = target {
        if !name.is_ascii() {
            return Err(Error::NonAsciiName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong(name.len()));
        }
    }
    Ok(())
}

fn encode_request<B: BufMut>(request: &RequestMessage, dst: &mut B) {
    dst.put_u8(TAG_REQUEST);
    dst.put_u32_le(request.request_id);
    match &request.target {
        RequestTarget::Unspecified => dst.put_u8(0),
        RequestTarget::Name(name) => {
            dst.put_u8(name.len() as u8);
            dst.put_slice(name.as_bytes());
        }
        RequestTarget::Id(id) => {
            dst.put_u8(TARGET_ID_SENTINEL);
            dst.put_slice(id.as_bytes());
        }
    }
    dst.put_u32_le(request.payload.len() as u32);
    dst.put_slice(&request.payload);
}

fn encode_response<B: BufMut>(response: &ResponseMessage, dst: &mut B) {
    dst.put_u8(TAG_RESPONSE);
    dst.put_u32_le(response.request_id);
    dst.put_u8(response.result as u8);
    dst.put_u32_le(response.payload.len() as u32);
    dst.put_slice(&response.payload);
}

fn payload_len(payload: &[u8]) -> Result<u32> {
    u32::try_from(payload.len()).map_err(|_| Error::PayloadTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })
}

/// Try to decode one message from the front of `src`.
///
/// Returns `Ok(None)` while the buffer holds only part of a message, or the
/// message together with the number of bytes it occupied. Payload lengths
/// above `max_payload` are rejected as soon as the length field is readable.
pub fn decode(src: &[u8], max_payload: usize) -> Result<Option<(Message, usize)>> {
    let mut buf = src;
    match decode_from(&mut buf, max_payload)? {
        Some(message) => Ok(Some((message, src.len() - buf.remaining()))),
        None => Ok(None),
    }
}

/// Return "need more bytes" unless `$n` bytes are buffered
macro_rules! need {
    ($buf:expr, $n:expr) => {
        if $buf.remaining() < $n {
            return Ok(None);
        }
    };
}

fn decode_from(buf: &mut &[u8], max_payload: usize) -> Result<Option<Message>> {
    need!(buf, 1);
    match buf.get_u8() {
        TAG_REQUEST => {
            need!(buf, 5);
            let request_id = buf.get_u32_le();
            let target = match buf.get_u8() {
                0 => RequestTarget::Unspecified,
                TARGET_ID_SENTINEL => {
                    need!(buf, 16);
                    let mut id = [0u8; 16];
                    buf.copy_to_slice(&mut id);
                    RequestTarget::id(NodeId(id))
                }
                len => {
                    let len = len as usize;
                    need!(buf, len);
                    if !buf[..len].is_ascii() {
                        return Err(Error::NonAsciiName);
                    }
                    // ASCII is valid UTF-8
                    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
                    buf.advance(len);
                    RequestTarget::Name(name)
                }
            };
            let Some(payload) = read_payload(buf, max_payload)? else {
                return Ok(None);
            };
            Ok(Some(Message::Request(RequestMessage {
                request_id,
                target,
                payload,
            })))
        }
        TAG_RESPONSE => {
            need!(buf, 5);
            let request_id = buf.get_u32_le();
            let result = RequestResult::try_from(buf.get_u8())?;
            let Some(payload) = read_payload(buf, max_payload)? else {
                return Ok(None);
            };
            Ok(Some(Message::Response(ResponseMessage {
                request_id,
                result,
                payload,
            })))
        }
        TAG_KEEPALIVE => Ok(Some(Message::KeepAlive)),
        other => Err(Error::UnknownTag(other)),
    }
}

fn read_payload(buf: &mut &[u8], max_payload: usize) -> Result<Option<Vec<u8>>> {
    need!(buf, 4);
    let len = buf.get_u32_le() as usize;
    if len > max_payload {
        return Err(Error::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }
    need!(buf, len);
    let payload = buf[..len].to_vec();
    buf.advance(len);
    Ok(Some(payload))
}
