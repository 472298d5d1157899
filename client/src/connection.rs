//! HTTP transport for a tunnel channel
//!
//! A [`TunnelChannel`] looks like a writable byte stream. Behind it a
//! poll task keeps one long poll outstanding, issuing the next only after
//! the previous one has completed. Every write goes out as its own
//! request next to that poll. Responses to either kind may carry target
//! data, which is written to the incoming sink in response sequence order.

use bytes::Bytes;
use polltunnel_shared::protocol::{self, STATUS_DATA, STATUS_GONE, STATUS_POLL_AGAIN};
use polltunnel_shared::{Error, Payload, ReorderBuffer, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Creates tunnel channels that talk to one relay URL
#[derive(Clone)]
pub struct HttpTunnelConnection {
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTunnelConnection {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;
        Self::with_client(url, client)
    }

    pub fn with_client(url: &str, client: reqwest::Client) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::Config(format!("Malformed URL '{}'", url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!("Malformed URL '{}'", url)));
        }
        Ok(Self {
            url: parsed,
            client,
            headers: HeaderMap::new(),
        })
    }

    /// Add a header sent with every tunnel request (e.g. a shared secret)
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Config(format!("invalid header name '{}'", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Config(format!("invalid value for header '{}'", name)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Open a channel. Data from the relay is written to `incoming`, and
    /// `on_close` runs once when the channel closes for any reason.
    ///
    /// A priming poll is issued immediately. Must be called from within a
    /// tokio runtime.
    pub fn open<W>(&self, incoming: W, on_close: impl FnOnce() + Send + 'static) -> TunnelChannel
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(ChannelInner {
            connection: self.clone(),
            runtime: Handle::current(),
            outbound: Mutex::new(Outbound {
                open: true,
                next_seq: 1,
            }),
            delivery: tokio::sync::Mutex::new(Delivery {
                incoming: Box::new(incoming),
                buffer: ReorderBuffer::new(),
            }),
            on_close: Mutex::new(Some(Box::new(on_close))),
        });
        inner.runtime.spawn(inner.clone().poll_loop());

        TunnelChannel { inner }
    }

    /// Issue one tunnel request and interpret the response
    async fn send_and_receive(&self, message: Option<&Message>) -> Result<Reply> {
        let mut request = self.client.post(self.url.clone()).headers(self.headers.clone());

        match message {
            Some(Message::Data(payload)) => {
                let mut headers = HeaderMap::new();
                payload.encode(&mut headers);
                debug!(seq = payload.sequence(), bytes = payload.data().len(), "Sending payload");
                request = request.headers(headers).body(payload.data().clone());
            }
            Some(Message::Disconnect(seq)) => {
                debug!(seq, "Sending disconnect");
                request = request.headers(protocol::disconnect_headers(Some(*seq)));
            }
            None => trace!("Polling"),
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let status = response.status();
        if status == STATUS_POLL_AGAIN {
            return Ok(Reply::PollAgain);
        }
        if status == STATUS_GONE {
            return Err(Error::Gone);
        }
        if status != STATUS_DATA {
            return Err(Error::Protocol(format!("unexpected status {}", status)));
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(match Payload::decode(&headers, body)? {
            Some(payload) => Reply::Data(payload),
            None => Reply::PollAgain,
        })
    }
}

enum Message {
    Data(Payload),
    /// Takes the next request sequence number so the relay applies it
    /// after every payload written before it.
    Disconnect(u64),
}

enum Reply {
    Data(Payload),
    PollAgain,
}

struct Outbound {
    open: bool,
    next_seq: u64,
}

struct Delivery {
    incoming: Box<dyn AsyncWrite + Send + Unpin>,
    buffer: ReorderBuffer,
}

struct ChannelInner {
    connection: HttpTunnelConnection,
    runtime: Handle,
    outbound: Mutex<Outbound>,
    delivery: tokio::sync::Mutex<Delivery>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ChannelInner {
    fn outbound(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_open(&self) -> bool {
        self.outbound().open
    }

    /// Mark closed and run the close callback, once. With `notify_relay`
    /// a disconnect request is sent after everything already written.
    fn close(self: &Arc<Self>, notify_relay: bool) {
        let disconnect_seq = {
            let mut outbound = self.outbound();
            if !outbound.open {
                return;
            }
            outbound.open = false;
            let seq = outbound.next_seq;
            outbound.next_seq += 1;
            seq
        };

        if notify_relay {
            let inner = self.clone();
            self.runtime.spawn(async move {
                let message = Message::Disconnect(disconnect_seq);
                if let Err(e) = inner.connection.send_and_receive(Some(&message)).await {
                    trace!("Disconnect request ended with: {}", e);
                }
            });
        }

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Keep exactly one poll outstanding until the channel closes.
    async fn poll_loop(self: Arc<Self>) {
        let outcome = loop {
            if !self.is_open() {
                break Ok(());
            }
            let reply = match self.connection.send_and_receive(None).await {
                Ok(reply) => reply,
                Err(e) => break Err(e),
            };
            if let Reply::Data(payload) = reply {
                if let Err(e) = self.deliver(payload).await {
                    break Err(e);
                }
            }
        };

        match outcome {
            Ok(()) => debug!("Tunnel channel finished"),
            Err(e) => self.report(&e),
        }
        self.close(false);
        if let Err(e) = self.delivery.lock().await.incoming.shutdown().await {
            trace!("Unable to close incoming sink: {}", e);
        }
    }

    async fn send_data(self: Arc<Self>, payload: Payload) {
        let message = Message::Data(payload);
        let result = match self.connection.send_and_receive(Some(&message)).await {
            Ok(Reply::Data(response)) => self.deliver(response).await,
            Ok(Reply::PollAgain) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.report(&e);
            self.close(false);
        }
    }

    /// Write response data to the incoming sink in sequence order
    async fn deliver(&self, payload: Payload) -> Result<()> {
        let mut delivery = self.delivery.lock().await;
        let Delivery { incoming, buffer } = &mut *delivery;
        for chunk in buffer.accept(payload)? {
            incoming.write_all(&chunk).await?;
        }
        incoming.flush().await?;
        Ok(())
    }

    fn report(&self, error: &Error) {
        match error {
            Error::Gone => info!("Tunnel session gone"),
            Error::Closed => debug!("Tunnel channel closed"),
            e => warn!("Tunnel channel failed: {}", e),
        }
    }
}

/// Writable end of a tunnel
pub struct TunnelChannel {
    inner: Arc<ChannelInner>,
}

impl TunnelChannel {
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Send `data` as the next payload. Returns as soon as the request is
    /// issued; it completes in the background.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<usize> {
        let data = data.into();
        let mut outbound = self.inner.outbound();
        if !outbound.open {
            return Err(Error::Closed);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len();
        let payload = Payload::new(outbound.next_seq, data)?;
        outbound.next_seq += 1;
        self.inner
            .runtime
            .spawn(self.inner.clone().send_data(payload));
        Ok(len)
    }

    /// Close the channel and tell the relay to drop the target connection
    /// once everything already written has arrived.
    pub fn close(&self) {
        self.inner.close(true);
    }
}

impl Drop for TunnelChannel {
    fn drop(&mut self) {
        self.inner.close(true);
    }
}
