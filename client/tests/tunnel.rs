//! Client tests against a real relay and against a scripted one.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use polltunnel::{HttpTunnelConnection, TunnelClient, TunnelClientListener};
use polltunnel_relay::filter::TunnelFilter;
use polltunnel_relay::matcher::PathMatcher;
use polltunnel_relay::server::{ServerConfig, TunnelServer};
use polltunnel_relay::target::{SocketTargetOpener, StaticPortProvider};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

/// Start a TCP target that answers each read with `respond(read)`.
async fn start_target(respond: fn(&[u8]) -> Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&respond(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn start_relay(target_port: u16) -> SocketAddr {
    let config = ServerConfig {
        long_poll_timeout: Duration::from_millis(200),
        disconnect_timeout: Duration::from_secs(5),
    };
    start_relay_with(target_port, config).await
}

async fn start_relay_with(target_port: u16, config: ServerConfig) -> SocketAddr {
    let opener = SocketTargetOpener::new("127.0.0.1", Arc::new(StaticPortProvider::new(target_port)));
    let server = TunnelServer::with_config(Arc::new(opener), config).unwrap();
    let matcher = Arc::new(PathMatcher::new("/tunnel").unwrap());
    serve(polltunnel_relay::app(TunnelFilter::new(matcher, Arc::new(server)))).await
}

fn connection(addr: SocketAddr) -> HttpTunnelConnection {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    HttpTunnelConnection::with_client(&format!("http://{}/tunnel", addr), client).unwrap()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for tunnel data")
        .unwrap();
    buf
}

#[derive(Default)]
struct CountingListener {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl TunnelClientListener for CountingListener {
    fn on_open(&self, _peer: SocketAddr) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self, _peer: SocketAddr) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_end_to_end_echo() {
    let target = start_target(|data| data.to_vec()).await;
    let relay = start_relay(target).await;

    let listener = Arc::new(CountingListener::default());
    let mut client = TunnelClient::new("127.0.0.1:0".parse().unwrap(), connection(relay));
    client.add_listener(listener.clone());
    let local = client.start().await.unwrap();

    let mut stream = TcpStream::connect(local).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut stream, 5).await, b"hello");

    // Idle for longer than the relay's long poll, then keep talking.
    tokio::time::sleep(Duration::from_millis(500)).await;
    stream.write_all(b"again").await.unwrap();
    assert_eq!(read_exactly(&mut stream, 5).await, b"again");

    drop(stream);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.opened.load(Ordering::SeqCst), 1);
    assert_eq!(listener.closed.load(Ordering::SeqCst), 1);

    client.stop().await;
}

#[tokio::test]
async fn test_round_trips_do_not_wait_for_long_poll() {
    let target = start_target(|data| data.to_vec()).await;
    let relay = start_relay_with(target, ServerConfig::default()).await;

    let client = TunnelClient::new("127.0.0.1:0".parse().unwrap(), connection(relay));
    let local = client.start().await.unwrap();
    let mut stream = TcpStream::connect(local).await.unwrap();

    for _ in 0..3 {
        let started = Instant::now();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 4).await, b"ping");
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "round trip took {:?}",
            started.elapsed()
        );
    }
    client.stop().await;
}

#[tokio::test]
async fn test_request_response_ordering() {
    let target = start_target(|data| match data {
        b"hello" => b"hi".to_vec(),
        b"1+1" => b"=2".to_vec(),
        other => other.to_vec(),
    })
    .await;
    let relay = start_relay(target).await;

    let client = TunnelClient::new("127.0.0.1:0".parse().unwrap(), connection(relay));
    let local = client.start().await.unwrap();
    let mut stream = TcpStream::connect(local).await.unwrap();

    let mut seen = Vec::new();
    stream.write_all(b"hello").await.unwrap();
    seen.extend(read_exactly(&mut stream, 2).await);
    stream.write_all(b"1+1").await.unwrap();
    seen.extend(read_exactly(&mut stream, 2).await);

    assert_eq!(seen, b"hi=2");
    client.stop().await;
}

#[derive(Default)]
struct ScriptedRelay {
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Answers ten polls with 204, the eleventh with "ready", then 410.
async fn scripted(State(relay): State<Arc<ScriptedRelay>>) -> impl IntoResponse {
    let current = relay.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    relay.max_in_flight.fetch_max(current, Ordering::SeqCst);
    let n = relay.requests.fetch_add(1, Ordering::SeqCst) + 1;

    tokio::time::sleep(Duration::from_millis(10)).await;
    relay.in_flight.fetch_sub(1, Ordering::SeqCst);

    match n {
        1..=10 => StatusCode::NO_CONTENT.into_response(),
        11 => (StatusCode::OK, [("x-seq", "1")], "ready").into_response(),
        _ => StatusCode::GONE.into_response(),
    }
}

#[tokio::test]
async fn test_polls_are_strictly_sequential() {
    let relay = Arc::new(ScriptedRelay::default());
    let addr = serve(
        Router::new()
            .route("/tunnel", post(scripted))
            .with_state(relay.clone()),
    )
    .await;

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    let (incoming, mut observer) = tokio::io::duplex(1024);
    let channel = connection(addr).open(incoming, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), observer.read_to_end(&mut received))
        .await
        .expect("channel never finished")
        .unwrap();

    assert_eq!(received, b"ready");
    assert_eq!(relay.requests.load(Ordering::SeqCst), 12);
    assert_eq!(relay.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(!channel.is_open());
    drop(channel);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let target = start_target(|data| data.to_vec()).await;
    let relay = start_relay(target).await;

    let client = TunnelClient::new("127.0.0.1:0".parse().unwrap(), connection(relay));
    let local = client.start().await.unwrap();
    let mut stream = TcpStream::connect(local).await.unwrap();
    // Let the accept loop pick the socket up before stopping.
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.stop().await;
    assert!(TcpStream::connect(local).await.is_err());

    // The bridge accepted before stop keeps working.
    stream.write_all(b"still here").await.unwrap();
    assert_eq!(read_exactly(&mut stream, 10).await, b"still here");
}

/// Holds polls, answers data requests at once with swapped response
/// sequence numbers and records everything it sees.
#[derive(Default)]
struct HoldingRelay {
    seen: Mutex<Vec<String>>,
}

async fn holding(
    State(relay): State<Arc<HoldingRelay>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let seq = headers
        .get("x-seq")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let disconnect = headers
        .get("content-type")
        .is_some_and(|v| v == "application/x-disconnect");

    if disconnect {
        relay.seen.lock().await.push(format!("disconnect {}", seq.unwrap_or_default()));
        return StatusCode::GONE.into_response();
    }
    match seq.as_deref() {
        None => {
            relay.seen.lock().await.push("poll".to_string());
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Some(seq) => {
            relay
                .seen
                .lock()
                .await
                .push(format!("data {} {}", seq, String::from_utf8_lossy(&body)));
            let (response_seq, text) = if seq == "1" { ("2", "world") } else { ("1", "hello ") };
            (StatusCode::OK, [("x-seq", response_seq)], text).into_response()
        }
    }
}

#[tokio::test]
async fn test_writes_overlap_held_poll() {
    let relay = Arc::new(HoldingRelay::default());
    let addr = serve(
        Router::new()
            .route("/tunnel", post(holding))
            .with_state(relay.clone()),
    )
    .await;

    let (incoming, mut observer) = tokio::io::duplex(1024);
    let channel = connection(addr).open(incoming, || {});
    tokio::time::sleep(Duration::from_millis(100)).await;

    channel.write("a").unwrap();
    channel.write("b").unwrap();

    // Responses arrive out of order and are delivered by sequence.
    let mut received = vec![0u8; 11];
    timeout(Duration::from_secs(2), observer.read_exact(&mut received))
        .await
        .expect("writes waited behind the held poll")
        .unwrap();
    assert_eq!(received, b"hello world");

    channel.close();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut seen = relay.seen.lock().await.clone();
    seen.sort();
    assert_eq!(seen, vec!["data 1 a", "data 2 b", "disconnect 3", "poll"]);
}
