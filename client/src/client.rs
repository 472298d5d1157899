//! Local side of the tunnel
//!
//! Binds a local port and bridges every accepted socket 1:1 onto a new
//! [`TunnelChannel`](crate::connection::TunnelChannel).

use bytes::Bytes;
use polltunnel_shared::protocol::BUFFER_SIZE;
use polltunnel_shared::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::connection::HttpTunnelConnection;

/// Callbacks for local connections being bridged
pub trait TunnelClientListener: Send + Sync {
    fn on_open(&self, _peer: SocketAddr) {}
    fn on_close(&self, _peer: SocketAddr) {}
}

/// Logs bridge lifecycle under a tunnel name
pub struct LoggingListener {
    name: String,
}

impl LoggingListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TunnelClientListener for LoggingListener {
    fn on_open(&self, peer: SocketAddr) {
        info!("[{}] Tunnel connection established from {}", self.name, peer);
    }

    fn on_close(&self, peer: SocketAddr) {
        info!("[{}] Tunnel connection from {} closed", self.name, peer);
    }
}

struct Running {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Accepts local TCP connections and tunnels each one over HTTP
pub struct TunnelClient {
    listen_addr: SocketAddr,
    connection: HttpTunnelConnection,
    listeners: Vec<Arc<dyn TunnelClientListener>>,
    running: Mutex<Option<Running>>,
}

impl TunnelClient {
    pub fn new(listen_addr: SocketAddr, connection: HttpTunnelConnection) -> Self {
        Self {
            listen_addr,
            connection,
            listeners: Vec::new(),
            running: Mutex::new(None),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn TunnelClientListener>) {
        self.listeners.push(listener);
    }

    /// Bind the local port and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Connection("tunnel client already started".into()));
        }

        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            stopped,
            self.connection.clone(),
            self.listeners.clone(),
        ));

        info!("Listening on {} for {}", local_addr, self.connection.url());
        *running = Some(Running {
            local_addr,
            stop,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting connections. Bridges already running are left alone.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop.send(());
        let mut task = running.task;
        if timeout(Duration::from_secs(2), &mut task).await.is_err() {
            task.abort();
        }
        debug!("Stopped listening on {}", running.local_addr);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut stopped: oneshot::Receiver<()>,
    connection: HttpTunnelConnection,
    listeners: Vec<Arc<dyn TunnelClientListener>>,
) {
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tokio::spawn(bridge(socket, peer, connection.clone(), listeners.clone()));
                }
                Err(e) => {
                    warn!("Unexpected error accepting tunnel connection: {}", e);
                    break;
                }
            }
        }
    }
}

/// Pump one local socket through its own tunnel channel until either
/// side closes.
async fn bridge(
    socket: TcpStream,
    peer: SocketAddr,
    connection: HttpTunnelConnection,
    listeners: Vec<Arc<dyn TunnelClientListener>>,
) {
    for listener in &listeners {
        listener.on_open(peer);
    }
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Unable to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (mut local, incoming) = socket.into_split();
    let closed = Arc::new(Notify::new());
    let signal = closed.clone();
    let channel = connection.open(incoming, move || signal.notify_one());

    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = closed.notified() => {
                debug!("Tunnel closed for {}", peer);
                break;
            }
            read = local.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Local EOF from {}", peer);
                    break;
                }
                Ok(n) => {
                    if let Err(e) = channel.write(Bytes::copy_from_slice(&buf[..n])) {
                        debug!("Tunnel write for {} failed: {}", peer, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Local read from {} failed: {}", peer, e);
                    break;
                }
            }
        }
    }

    channel.close();
    for listener in &listeners {
        listener.on_close(peer);
    }
}

/// Whether the local port can be bound right now
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
