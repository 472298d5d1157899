//! HTTP long-poll tunnel client
//!
//! Listens on local ports and carries each accepted TCP connection to a
//! relay over plain HTTP requests.

pub mod client;
pub mod config;
pub mod connection;
pub mod multi;

pub use client::{TunnelClient, TunnelClientListener};
pub use connection::{HttpTunnelConnection, TunnelChannel};
