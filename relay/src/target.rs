//! Connections to the tunnel target
//!
//! The relay forwards client bytes to a single target per session. How
//! the target is reached is pluggable through [`TargetOpener`]; the
//! default opener connects a TCP socket.

use bytes::{Bytes, BytesMut};
use futures_util::future::{BoxFuture, FutureExt};
use polltunnel_shared::protocol::BUFFER_SIZE;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Any duplex byte stream usable as a target
pub trait TargetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TargetStream for T {}

type BoxedStream = Box<dyn TargetStream>;

/// Opens the connection to the real destination.
pub trait TargetOpener: Send + Sync {
    /// Open a channel whose reads give up after `read_timeout`
    fn open(&self, read_timeout: Duration) -> BoxFuture<'_, io::Result<TargetChannel>>;
}

/// Supplies the port of the target at connection time
pub trait PortProvider: Send + Sync {
    fn port(&self) -> u16;
}

/// A fixed, preconfigured port
#[derive(Debug, Clone, Copy)]
pub struct StaticPortProvider(u16);

impl StaticPortProvider {
    pub fn new(port: u16) -> Self {
        Self(port)
    }
}

impl PortProvider for StaticPortProvider {
    fn port(&self) -> u16 {
        self.0
    }
}

/// Connects a TCP socket to `host:port`
pub struct SocketTargetOpener {
    host: String,
    ports: Arc<dyn PortProvider>,
}

impl SocketTargetOpener {
    pub fn new(host: impl Into<String>, ports: Arc<dyn PortProvider>) -> Self {
        Self {
            host: host.into(),
            ports,
        }
    }

    /// Parse a `host:port` target
    pub fn from_address(address: &str) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self::new(host, Arc::new(StaticPortProvider::new(port))))
    }
}

impl TargetOpener for SocketTargetOpener {
    fn open(&self, read_timeout: Duration) -> BoxFuture<'_, io::Result<TargetChannel>> {
        async move {
            let port = self.ports.port();
            debug!("Opening target connection to {}:{}", self.host, port);
            let stream = TcpStream::connect((self.host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(TargetChannel::new(stream, read_timeout))
        }
        .boxed()
    }
}

/// A duplex channel to the target with a bounded read wait.
pub struct TargetChannel {
    stream: BoxedStream,
    read_timeout: Duration,
}

impl TargetChannel {
    pub fn new<S: TargetStream + 'static>(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: Box::new(stream),
            read_timeout,
        }
    }

    /// Split into the read side (kept by the session worker) and the
    /// write side (shared by inbound exchanges).
    pub fn split(self) -> (TargetReader, TargetWriter) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            TargetReader {
                inner: reader,
                read_timeout: self.read_timeout,
                buffer: BytesMut::with_capacity(BUFFER_SIZE),
            },
            TargetWriter { inner: writer },
        )
    }
}

pub struct TargetReader {
    inner: ReadHalf<BoxedStream>,
    read_timeout: Duration,
    buffer: BytesMut,
}

impl TargetReader {
    /// Read the next chunk of target data.
    ///
    /// Returns `Ok(None)` if nothing arrived within the read timeout and
    /// an `UnexpectedEof` error once the target has closed.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self.buffer.clear();
        self.buffer.reserve(BUFFER_SIZE);
        match timeout(self.read_timeout, self.inner.read_buf(&mut self.buffer)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Target server connection closed",
            )),
            Ok(Ok(_)) => Ok(Some(self.buffer.split().freeze())),
            Ok(Err(e)) => Err(e),
        }
    }
}

pub struct TargetWriter {
    inner: WriteHalf<BoxedStream>,
}

impl TargetWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
