//! Restoring sequence order across independent HTTP exchanges.
//!
//! Payloads travel over separate requests and can overtake each other.
//! Both ends of the tunnel feed them through a [`ReorderBuffer`], which
//! releases data strictly in sequence order.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::Payload;

/// Max payloads held while waiting for a missing sequence number
pub const MAX_PENDING: usize = 10;

/// Holds early payloads until the gap before them is filled.
#[derive(Debug)]
pub struct ReorderBuffer {
    last_sequence: u64,
    pending: HashMap<u64, Bytes>,
    limit: usize,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            last_sequence: 0,
            pending: HashMap::new(),
            limit,
        }
    }

    /// Sequence number of the last payload released
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept a payload and return every chunk that is now next in line,
    /// in order. An empty result means the payload was buffered (or was a
    /// duplicate). Overflowing the buffer is an error.
    pub fn accept(&mut self, payload: Payload) -> Result<Vec<Bytes>> {
        let sequence = payload.sequence();

        if sequence <= self.last_sequence || self.pending.contains_key(&sequence) {
            warn!(sequence, last = self.last_sequence, "Dropping duplicate payload");
            return Ok(Vec::new());
        }

        if sequence != self.last_sequence + 1 {
            if self.pending.len() >= self.limit {
                return Err(Error::TooManyPending(self.limit));
            }
            debug!(sequence, last = self.last_sequence, "Buffering early payload");
            self.pending.insert(sequence, payload.into_data());
            return Ok(Vec::new());
        }

        let mut ready = vec![payload.into_data()];
        self.last_sequence = sequence;
        while let Some(next) = self.pending.remove(&(self.last_sequence + 1)) {
            ready.push(next);
            self.last_sequence += 1;
        }
        Ok(ready)
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seq: u64, data: &'static str) -> Payload {
        Payload::new(seq, Bytes::from_static(data.as_bytes())).unwrap()
    }

    fn joined(chunks: Vec<Bytes>) -> String {
        chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).to_string())
            .collect()
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(joined(buffer.accept(payload(1, "a")).unwrap()), "a");
        assert_eq!(joined(buffer.accept(payload(2, "b")).unwrap()), "b");
        assert_eq!(buffer.last_sequence(), 2);
    }

    #[test]
    fn test_gap_filled_in_one_pass() {
        let mut buffer = ReorderBuffer::new();
        buffer.accept(payload(1, "a")).unwrap();

        assert!(buffer.accept(payload(3, "c")).unwrap().is_empty());
        assert!(buffer.accept(payload(4, "d")).unwrap().is_empty());
        assert_eq!(buffer.pending(), 2);

        assert_eq!(joined(buffer.accept(payload(2, "b")).unwrap()), "bcd");
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.last_sequence(), 4);
    }

    #[test]
    fn test_first_payload_must_be_one() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.accept(payload(2, "b")).unwrap().is_empty());
        assert_eq!(joined(buffer.accept(payload(1, "a")).unwrap()), "ab");
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut buffer = ReorderBuffer::new();
        buffer.accept(payload(1, "a")).unwrap();
        assert!(buffer.accept(payload(1, "a")).unwrap().is_empty());

        buffer.accept(payload(3, "c")).unwrap();
        assert!(buffer.accept(payload(3, "c")).unwrap().is_empty());
        assert_eq!(buffer.pending(), 1);
    }

    #[test]
    fn test_overflow() {
        let mut buffer = ReorderBuffer::with_limit(3);
        for seq in 2..5 {
            buffer.accept(payload(seq, "x")).unwrap();
        }
        let err = buffer.accept(payload(5, "x")).unwrap_err();
        assert!(matches!(err, Error::TooManyPending(3)));
    }
}
