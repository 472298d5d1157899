//! End-to-end tests of the relay over real HTTP.

use polltunnel_relay::filter::TunnelFilter;
use polltunnel_relay::matcher::{PathMatcher, RequestMatcher, SecuredMatcher};
use polltunnel_relay::server::{ServerConfig, TunnelServer};
use polltunnel_relay::target::{SocketTargetOpener, StaticPortProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Start a TCP target that echoes everything it reads.
async fn start_echo_target() -> u16 {
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
                            if socket.write_all(&buf[..n]).await.is_err() {
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

async fn start_relay(target_port: u16, matcher: Arc<dyn RequestMatcher>) -> SocketAddr {
    let opener = SocketTargetOpener::new("127.0.0.1", Arc::new(StaticPortProvider::new(target_port)));
    let config = ServerConfig {
        long_poll_timeout: Duration::from_millis(300),
        disconnect_timeout: Duration::from_secs(5),
    };
    let server = TunnelServer::with_config(Arc::new(opener), config).unwrap();
    let app = polltunnel_relay::app(TunnelFilter::new(matcher, Arc::new(server)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_payload_round_trip() {
    let target = start_echo_target().await;
    let relay = start_relay(target, Arc::new(PathMatcher::new("/tunnel").unwrap())).await;
    let url = format!("http://{}/tunnel", relay);

    let res = client()
        .post(&url)
        .header("x-seq", "1")
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    assert_eq!(res.headers().get("x-seq").unwrap(), "1");
    assert_eq!(res.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_idle_poll_gets_no_content() {
    let target = start_echo_target().await;
    let relay = start_relay(target, Arc::new(PathMatcher::new("/tunnel").unwrap())).await;

    let res = client()
        .post(format!("http://{}/tunnel", relay))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
}

#[tokio::test]
async fn test_disconnect_answers_gone() {
    let target = start_echo_target().await;
    let relay = start_relay(target, Arc::new(PathMatcher::new("/tunnel").unwrap())).await;

    let res = client()
        .post(format!("http://{}/tunnel", relay))
        .header("content-type", "application/x-disconnect")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 410);
}

#[tokio::test]
async fn test_rejects_malformed_and_non_post() {
    let target = start_echo_target().await;
    let relay = start_relay(target, Arc::new(PathMatcher::new("/tunnel").unwrap())).await;
    let url = format!("http://{}/tunnel", relay);

    let missing_seq = client().post(&url).body("data").send().await.unwrap();
    assert_eq!(missing_seq.status(), 400);

    let get = client().get(&url).send().await.unwrap();
    assert_eq!(get.status(), 405);
}

#[tokio::test]
async fn test_unmatched_requests_pass_through() {
    let target = start_echo_target().await;
    let matcher = SecuredMatcher::new("/tunnel", "X-AUTH-TOKEN", "s3cret").unwrap();
    let relay = start_relay(target, Arc::new(matcher)).await;

    let health = client()
        .get(format!("http://{}/health", relay))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let no_secret = client()
        .post(format!("http://{}/tunnel", relay))
        .send()
        .await
        .unwrap();
    assert_eq!(no_secret.status(), 404);

    let with_secret = client()
        .post(format!("http://{}/tunnel", relay))
        .header("X-AUTH-TOKEN", "s3cret")
        .header("x-seq", "1")
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(with_secret.status(), 200);
    assert_eq!(with_secret.text().await.unwrap(), "ping");
}
