//! Message model exchanged over a peer link

use crate::error::{Error, Result};
use crate::types::RequestTarget;
use std::fmt;

/// A message on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// Contentless liveness signal
    KeepAlive,
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::KeepAlive => "keepalive",
        }
    }
}

/// Request for a node to process a payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestMessage {
    /// Link-local request id (rewritten at every hop)
    pub request_id: u32,
    /// Destination node
    pub target: RequestTarget,
    /// Application payload
    pub payload: Vec<u8>,
}

impl RequestMessage {
    pub fn new(request_id: u32, target: RequestTarget, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            target,
            payload,
        }
    }
}

impl fmt::Display for RequestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rid={} to={} len={}",
            self.request_id,
            self.target,
            self.payload.len()
        )
    }
}

/// Outcome of a request as carried on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestResult {
    Success = 0,
    Timeout = 1,
    ResolveError = 2,
    UnknownError = 3,
}

impl TryFrom<u8> for RequestResult {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::Timeout),
            2 => Ok(Self::ResolveError),
            3 => Ok(Self::UnknownError),
            other => Err(Error::UnknownResultCode(other)),
        }
    }
}

/// Reply to a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMessage {
    /// Id of the request this answers, on this link
    pub request_id: u32,
    /// Outcome
    pub result: RequestResult,
    /// Response payload (empty unless Success)
    pub payload: Vec<u8>,
}

impl ResponseMessage {
    pub fn new(request_id: u32, result: RequestResult, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            result,
            payload,
        }
    }

    /// Successful reply carrying `payload`
    pub fn success(request_id: u32, payload: Vec<u8>) -> Self {
        Self::new(request_id, RequestResult::Success, payload)
    }

    /// Reply carrying a failure result and no payload
    pub fn failure(request_id: u32, result: RequestResult) -> Self {
        Self::new(request_id, result, Vec::new())
    }
}

impl fmt::Display for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rid={} result={:?} len={}",
            self.request_id,
            self.result,
            self.payload.len()
        )
    }
}

// =============================================================================
// APPLICATION-FACING RESULT
// =============================================================================

/// Status of an application send
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    Timeout,
    ResolveFailure,
    UnknownError,
}

impl From<RequestResult> for ResponseStatus {
    fn from(result: RequestResult) -> Self {
        match result {
            RequestResult::Success => ResponseStatus::Success,
            RequestResult::Timeout => ResponseStatus::Timeout,
            RequestResult::ResolveError => ResponseStatus::ResolveFailure,
            RequestResult::UnknownError => ResponseStatus::UnknownError,
        }
    }
}

/// Result of an application send: a status and, on success, the reply bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub data: Vec<u8>,
}

impl Response {
    pub fn new(status: ResponseStatus, data: Vec<u8>) -> Self {
        Self { status, data }
    }

    /// Response with no data
    pub fn status(status: ResponseStatus) -> Self {
        Self::new(status, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

impl From<ResponseMessage> for Response {
    fn from(message: ResponseMessage) -> Self {
        let status = ResponseStatus::from(message.result);
        match status {
            ResponseStatus::Success => Response::new(status, message.payload),
            _ => Response::status(status),
        }
    }
}
