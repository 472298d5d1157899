//! PollTunnel Shared Library
//!
//! Wire constants, the payload codec, sequence reordering and error
//! types shared by the relay and the client.

pub mod protocol;
pub mod error;
pub mod reorder;

pub use error::{Error, Result};
pub use protocol::Payload;
pub use reorder::ReorderBuffer;
