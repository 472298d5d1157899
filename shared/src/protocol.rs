//! Wire protocol for PollTunnel HTTP exchanges.
//!
//! Every exchange is a `POST` to the tunnel path. A request body, when
//! present, carries client data and an `x-seq` header; a `200` response
//! body carries target data and its own `x-seq`. `204` asks the client to
//! poll again and `410` ends the session.

use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;

use crate::error::{Error, Result};

/// Header carrying the running sequence number of a payload
pub const SEQ_HEADER: &str = "x-seq";

/// Content type used for ordinary payload bodies
pub const PAYLOAD_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type that marks a request as a disconnect signal
pub const DISCONNECT_CONTENT_TYPE: &str = "application/x-disconnect";

/// Size of a single read from a socket (10 KiB)
pub const BUFFER_SIZE: usize = 10 * 1024;

/// Response statuses used by the tunnel
pub const STATUS_DATA: StatusCode = StatusCode::OK;
pub const STATUS_POLL_AGAIN: StatusCode = StatusCode::NO_CONTENT;
pub const STATUS_GONE: StatusCode = StatusCode::GONE;

/// A chunk of stream data tagged with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    sequence: u64,
    data: Bytes,
}

impl Payload {
    /// Create a payload. Sequence numbers start at 1.
    pub fn new(sequence: u64, data: impl Into<Bytes>) -> Result<Self> {
        if sequence == 0 {
            return Err(Error::InvalidSequence("sequence must be positive".into()));
        }
        Ok(Self {
            sequence,
            data: data.into(),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    /// Decode the payload of an HTTP message.
    ///
    /// Returns `Ok(None)` when the body is empty (a pure poll). A non-empty
    /// body must come with a valid `x-seq` header.
    pub fn decode(headers: &HeaderMap, body: Bytes) -> Result<Option<Self>> {
        if body.is_empty() {
            return Ok(None);
        }
        let sequence = sequence_of(headers)?.ok_or(Error::MissingSequence)?;
        Self::new(sequence, body).map(Some)
    }

    /// Write the payload headers onto an outgoing message.
    pub fn encode(&self, headers: &mut HeaderMap) {
        headers.insert(SEQ_HEADER, HeaderValue::from(self.sequence));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PAYLOAD_CONTENT_TYPE));
    }
}

/// Parse the `x-seq` header, if any.
pub fn sequence_of(headers: &HeaderMap) -> Result<Option<u64>> {
    let Some(value) = headers.get(SEQ_HEADER) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| Error::InvalidSequence("non-ascii header".into()))?;
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::InvalidSequence(raw.to_string()))
}

/// Whether a request is the client's voluntary termination signal
pub fn is_disconnect(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case(DISCONNECT_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Headers for a disconnect signal request.
///
/// With a `sequence`, the relay closes only once every payload numbered
/// below it has reached the target. Without one it closes immediately.
pub fn disconnect_headers(sequence: Option<u64>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(DISCONNECT_CONTENT_TYPE));
    if let Some(sequence) = sequence {
        headers.insert(SEQ_HEADER, HeaderValue::from(sequence));
    }
    headers
}
