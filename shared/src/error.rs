//! Error types for PollTunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Missing x-seq header on payload request")]
    MissingSequence,

    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),

    #[error("Too many requests pending (limit {0})")]
    TooManyPending(usize),

    #[error("Tunnel channel closed")]
    Closed,

    #[error("Tunnel session gone")]
    Gone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,
}
