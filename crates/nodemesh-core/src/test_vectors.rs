//! Byte-exact wire vectors for cross-implementation checks
//!
//! Other nodemesh implementations MUST produce and accept exactly these bytes.

use crate::message::*;
use crate::types::*;
use crate::wire::{decode, to_bytes, DEFAULT_MAX_PAYLOAD};

struct WireVector {
    name: &'static str,
    message: Message,
    hex: &'static str,
}

fn vectors() -> Vec<WireVector> {
    let mut id = [0u8; 16];
    for (i, b) in id.iter_mut().enumerate() {
        *b = i as u8 + 1;
    }

    vec![
        WireVector {
            name: "keepalive",
            message: Message::KeepAlive,
            hex: "02",
        },
        WireVector {
            name: "request_unaddressed",
            message: Message::Request(RequestMessage::new(
                1,
                RequestTarget::Unspecified,
                vec![1, 2, 3],
            )),
            hex: "00010000000003000000010203",
        },
        WireVector {
            name: "request_by_name",
            message: Message::Request(RequestMessage::new(
                0x0102_0304,
                RequestTarget::name("C"),
                vec![0xFF],
            )),
            hex: "0004030201014301000000ff",
        },
        WireVector {
            name: "request_by_id",
            message: Message::Request(RequestMessage::new(
                2,
                RequestTarget::Id(NodeId(id)),
                vec![],
            )),
            hex: "0002000000ff0102030405060708090a0b0c0d0e0f1000000000",
        },
        WireVector {
            name: "response_success",
            message: Message::Response(ResponseMessage::success(1, vec![5, 6, 7])),
            hex: "01010000000003000000050607",
        },
        WireVector {
            name: "response_timeout",
            message: Message::Response(ResponseMessage::failure(
                0xFFFF_FFFF,
                RequestResult::Timeout,
            )),
            hex: "01ffffffff0100000000",
        },
    ]
}

fn strip(hex: &str) -> String {
    hex.chars().filter(|c| !c.is_whitespace()).collect()
}

#[test]
fn test_vectors_encode() {
    for v in vectors() {
        let bytes = to_bytes(&v.message).unwrap();
        assert_eq!(hex::encode(&bytes), strip(v.hex), "vector {}", v.name);
    }
}

#[test]
fn test_vectors_decode() {
    for v in vectors() {
        let bytes = hex::decode(strip(v.hex)).unwrap();
        let (message, used) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(used, bytes.len(), "vector {}", v.name);
        assert_eq!(message, v.message, "vector {}", v.name);
    }
}
