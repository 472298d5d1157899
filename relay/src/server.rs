//! HTTP tunnel server
//!
//! Bridges many short HTTP exchanges onto one long-lived target
//! connection, in the style of BOSH long polling:
//!
//! ```text
//! [ CLIENT ]                      [ SERVER ]
//!     | (a) Initial empty request     |
//!     |------------------------------>|
//!     | (b) Data I                    |
//!  -->|------------------------------>|--->
//!     | Response I (a)                |
//!  <--|<------------------------------|<---
//!     | (c) Data II                   |
//!  -->|------------------------------>|--->
//!     | Response II (b)               |
//!  <--|<------------------------------|<---
//! ```
//!
//! Each inbound request is held open so that its response can carry the
//! next chunk of target data. At most two requests are held per session.

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::StatusCode;
use polltunnel_shared::protocol::{self, STATUS_DATA, STATUS_GONE, STATUS_POLL_AGAIN};
use polltunnel_shared::{Error, Payload, ReorderBuffer, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::target::{TargetOpener, TargetReader, TargetWriter};

/// Max HTTP requests held as response vehicles per session
pub const MAX_HELD_CONNECTIONS: usize = 2;

/// Timeouts governing a tunnel session
#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    /// How long a held request waits for target data before a 204
    pub long_poll_timeout: Duration,
    /// How long the worker waits for a fresh request before giving up
    pub disconnect_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.long_poll_timeout.is_zero() {
            return Err(Error::Config("long poll timeout must be positive".into()));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(Error::Config("disconnect timeout must be positive".into()));
        }
        Ok(())
    }
}

/// The response produced for one inbound exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelReply {
    /// Target data, with the response sequence number
    Data(Payload),
    /// No data before the long poll timed out
    PollAgain,
    /// The session has ended
    Gone,
}

impl TunnelReply {
    pub fn status(&self) -> StatusCode {
        match self {
            TunnelReply::Data(_) => STATUS_DATA,
            TunnelReply::PollAgain => STATUS_POLL_AGAIN,
            TunnelReply::Gone => STATUS_GONE,
        }
    }
}

/// A decoded inbound request
#[derive(Debug)]
pub enum TunnelRequest {
    /// No payload; the exchange only serves as a response vehicle
    Poll,
    Data(Payload),
    /// Voluntary termination. With a sequence number, the session closes
    /// once every payload numbered below it has been forwarded.
    Disconnect(Option<u64>),
}

impl TunnelRequest {
    /// Decode headers and body. A payload body without `x-seq` is rejected.
    pub fn from_parts(headers: &HeaderMap, body: Bytes) -> Result<Self> {
        if protocol::is_disconnect(headers) {
            return Ok(TunnelRequest::Disconnect(protocol::sequence_of(headers)?));
        }
        Ok(match Payload::decode(headers, body)? {
            Some(payload) => TunnelRequest::Data(payload),
            None => TunnelRequest::Poll,
        })
    }
}

/// An inbound exchange held until its response is known.
///
/// Responding consumes the connection, so every exchange completes once.
#[derive(Debug)]
pub struct HttpConnection {
    created_at: Instant,
    responder: oneshot::Sender<TunnelReply>,
}

impl HttpConnection {
    pub fn new() -> (Self, oneshot::Receiver<TunnelReply>) {
        let (responder, response) = oneshot::channel();
        (
            Self {
                created_at: Instant::now(),
                responder,
            },
            response,
        )
    }

    pub fn is_older_than(&self, age: Duration) -> bool {
        self.created_at.elapsed() > age
    }

    /// Whether the HTTP peer has stopped waiting for this exchange
    pub fn is_closed(&self) -> bool {
        self.responder.is_closed()
    }

    /// Complete the exchange, handing the reply back if nobody is waiting
    /// for it any more.
    pub fn try_respond(self, reply: TunnelReply) -> std::result::Result<(), TunnelReply> {
        self.responder.send(reply)
    }

    pub fn respond(self, reply: TunnelReply) {
        let status = reply.status();
        if self.try_respond(reply).is_err() {
            trace!(%status, "HTTP exchange dropped before response");
        }
    }
}

/// Accepts inbound exchanges and owns at most one live session.
pub struct TunnelServer {
    opener: Arc<dyn TargetOpener>,
    config: ServerConfig,
    session: Arc<tokio::sync::Mutex<Option<Arc<Session>>>>,
    next_session_id: AtomicU64,
}

impl TunnelServer {
    pub fn new(opener: Arc<dyn TargetOpener>) -> Self {
        Self {
            opener,
            config: ServerConfig::default(),
            session: Arc::new(tokio::sync::Mutex::new(None)),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn with_config(opener: Arc<dyn TargetOpener>, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(opener)
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether a session is currently open
    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.session.lock().await.as_ref().map(|s| s.state())
    }

    /// Handle one inbound HTTP exchange and wait until it has a response.
    ///
    /// Malformed requests are rejected before any session state is
    /// touched. Failure to reach the target answers with `Gone`.
    pub async fn handle(&self, headers: &HeaderMap, body: Bytes) -> Result<TunnelReply> {
        let request = TunnelRequest::from_parts(headers, body)?;

        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("Unable to open target connection: {}", e);
                return Ok(TunnelReply::Gone);
            }
        };

        let (connection, response) = HttpConnection::new();
        session.handle_incoming(request, connection).await;
        Ok(response.await.unwrap_or(TunnelReply::Gone))
    }

    /// Return the live session, opening the target and starting a worker
    /// if there is none.
    async fn session(&self) -> Result<Arc<Session>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let channel = self
            .opener
            .open(self.config.long_poll_timeout)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let (reader, writer) = channel.split();

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, self.config, writer));
        *slot = Some(session.clone());

        let worker = session.clone();
        let registry = self.session.clone();
        tokio::spawn(async move {
            worker.clone().run(reader).await;
            let mut slot = registry.lock().await;
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &worker)) {
                *slot = None;
            }
        });

        Ok(session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Held exchanges, guarded by a single lock
struct Pool {
    connections: VecDeque<HttpConnection>,
    closed: bool,
}

struct Forwarder {
    target: TargetWriter,
    buffer: ReorderBuffer,
}

const NO_DISCONNECT: u64 = u64::MAX;

/// One tunnel session: a target connection plus its held exchanges.
pub(crate) struct Session {
    id: u64,
    config: ServerConfig,
    pool: Mutex<Pool>,
    connection_added: Notify,
    forwarder: tokio::sync::Mutex<Forwarder>,
    /// Last request sequence written to the target
    forwarded: AtomicU64,
    /// Sequence carried by a pending disconnect, or `NO_DISCONNECT`
    disconnect_at: AtomicU64,
    response_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Session {
    fn new(id: u64, config: ServerConfig, target: TargetWriter) -> Self {
        Self {
            id,
            config,
            pool: Mutex::new(Pool {
                connections: VecDeque::with_capacity(MAX_HELD_CONNECTIONS),
                closed: false,
            }),
            connection_added: Notify::new(),
            forwarder: tokio::sync::Mutex::new(Forwarder {
                target,
                buffer: ReorderBuffer::new(),
            }),
            forwarded: AtomicU64::new(0),
            disconnect_at: AtomicU64::new(NO_DISCONNECT),
            response_seq: AtomicU64::new(0),
            shutdown: watch::channel(false).0,
        }
    }

    fn pool(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        if self.pool().closed {
            SessionState::Closed
        } else if *self.shutdown.borrow() {
            SessionState::Closing
        } else {
            SessionState::Running
        }
    }

    /// Ask the worker to stop. Teardown happens on the worker.
    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_incoming(&self, request: TunnelRequest, connection: HttpConnection) {
        {
            let mut pool = self.pool();
            if pool.closed {
                drop(pool);
                connection.respond(TunnelReply::Gone);
                return;
            }
            while pool.connections.len() >= MAX_HELD_CONNECTIONS {
                if let Some(oldest) = pool.connections.pop_front() {
                    oldest.respond(TunnelReply::PollAgain);
                }
            }
            pool.connections.push_back(connection);
        }
        self.connection_added.notify_one();

        match request {
            TunnelRequest::Poll => {}
            TunnelRequest::Disconnect(sequence) => {
                info!(session = self.id, ?sequence, "Client requested disconnect");
                self.disconnect_at
                    .store(sequence.unwrap_or(0), Ordering::SeqCst);
                self.close_if_drained();
            }
            TunnelRequest::Data(payload) => match self.forward(payload).await {
                Ok(()) => {}
                Err(Error::Closed) => {
                    debug!(session = self.id, "Session closed while forwarding");
                }
                Err(e) => {
                    warn!(
                        session = self.id,
                        last_request_seq = self.forwarded.load(Ordering::SeqCst),
                        last_response_seq = self.response_seq.load(Ordering::Relaxed),
                        "Forwarding to target failed: {}", e
                    );
                    self.close();
                }
            },
        }
    }

    /// Write a payload and whatever it unblocks to the target. Gives up as
    /// soon as the session starts closing, so a target that stops reading
    /// cannot hold up teardown.
    async fn forward(&self, payload: Payload) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut forwarder = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return Err(Error::Closed),
            forwarder = self.forwarder.lock() => forwarder,
        };

        let Forwarder { target, buffer } = &mut *forwarder;
        for chunk in buffer.accept(payload)? {
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(Error::Closed),
                written = target.write_all(&chunk) => written?,
            }
            self.forwarded.fetch_add(1, Ordering::SeqCst);
        }
        drop(forwarder);

        self.close_if_drained();
        Ok(())
    }

    /// Close once a requested disconnect has nothing left in front of it
    fn close_if_drained(&self) {
        let at = self.disconnect_at.load(Ordering::SeqCst);
        if at != NO_DISCONNECT && self.forwarded.load(Ordering::SeqCst) + 1 >= at {
            self.close();
        }
    }

    /// Worker body: relay target data until the session ends.
    async fn run(self: Arc<Self>, mut reader: TargetReader) {
        info!(session = self.id, "Tunnel session started");
        let mut shutdown = self.shutdown.subscribe();

        match self.transfer(&mut reader, &mut shutdown).await {
            Ok(()) | Err(Error::Closed) => info!(session = self.id, "Tunnel session closed"),
            Err(e) => warn!(
                session = self.id,
                last_response_seq = self.response_seq.load(Ordering::Relaxed),
                "Tunnel session failed: {}", e
            ),
        }

        self.teardown().await;
    }

    async fn transfer(
        &self,
        reader: &mut TargetReader,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let data = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Ok(()),
                read = reader.read_chunk() => read?,
            };

            if let Some(data) = data {
                let seq = self.response_seq.load(Ordering::SeqCst) + 1;
                let mut reply = TunnelReply::Data(Payload::new(seq, data)?);
                loop {
                    let connection = self.wait_for_connection(shutdown, pop_live).await?;
                    match connection.try_respond(reply) {
                        Ok(()) => break,
                        Err(unsent) => {
                            debug!(session = self.id, seq, "Response vehicle went away, retrying");
                            reply = unsent;
                        }
                    }
                }
                self.response_seq.store(seq, Ordering::SeqCst);
                debug!(session = self.id, seq, "Responded with target data");
            }

            self.close_stale_connections();
            self.wait_for_connection(shutdown, |pool| pool.front().map(|_| ()))
                .await?;
        }
    }

    /// Apply `take` to the pool, waiting up to the disconnect timeout for
    /// a request to arrive if it yields nothing.
    async fn wait_for_connection<T>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut take: impl FnMut(&mut VecDeque<HttpConnection>) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.config.disconnect_timeout;
        loop {
            let added = self.connection_added.notified();
            let found = take(&mut self.pool().connections);
            if let Some(found) = found {
                return Ok(found);
            }
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(Error::Closed),
                waited = timeout_at(deadline, added) => {
                    if waited.is_err() {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    fn close_stale_connections(&self) {
        let stale: VecDeque<HttpConnection> = {
            let mut pool = self.pool();
            let (stale, fresh) = pool
                .connections
                .drain(..)
                .partition(|c| c.is_older_than(self.config.long_poll_timeout));
            pool.connections = fresh;
            stale
        };
        for connection in stale {
            connection.respond(TunnelReply::PollAgain);
        }
    }

    async fn teardown(&self) {
        self.close();
        let remaining = {
            let mut pool = self.pool();
            pool.closed = true;
            std::mem::take(&mut pool.connections)
        };
        for connection in remaining {
            connection.respond(TunnelReply::Gone);
        }

        let mut forwarder = self.forwarder.lock().await;
        if let Err(e) = forwarder.target.shutdown().await {
            trace!(session = self.id, "Unable to close target connection: {}", e);
        }
    }
}

/// Oldest held exchange whose peer is still waiting
fn pop_live(pool: &mut VecDeque<HttpConnection>) -> Option<HttpConnection> {
    while let Some(connection) = pool.pop_front() {
        if !connection.is_closed() {
            return Some(connection);
        }
    }
    None
}
