//! End-to-end tests for feed-gateway: HTTP API and realtime feed over real sockets

use feed_gateway::{
    BroadcastPolicy, Broadcaster, ConnectionRegistry, CredentialStore, CycleOutcome, Gateway,
    MemoryCredentialStore, MemorySource, TokenService, User,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const SECRET: &str = "integration-secret";
const FEED: &str = "LDRIFARMDATA";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    http: SocketAddr,
    feed: SocketAddr,
    source: MemorySource,
    registry: ConnectionRegistry,
    broadcaster: Broadcaster,
    tokens: TokenService,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

struct Options {
    require_auth: bool,
    replay_latest: bool,
    close_on_expiry: bool,
    policy: BroadcastPolicy,
    send_queue: usize,
    write_timeout: Duration,
    tokens: TokenService,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            require_auth: true,
            replay_latest: false,
            close_on_expiry: false,
            policy: BroadcastPolicy::OnChange,
            send_queue: 16,
            write_timeout: Duration::from_secs(5),
            tokens: TokenService::new(SECRET).unwrap(),
        }
    }
}

async fn start(options: Options) -> TestServer {
    // Empty source: the broadcaster's immediate first cycle fails quietly,
    // so tests drive cycles themselves
    let source = MemorySource::new();
    let credentials = MemoryCredentialStore::with_cost(4);
    credentials.create("bob@test.com", "password").await.unwrap();

    let gateway = Gateway::builder()
        .source(source.clone())
        .credentials(credentials)
        .tokens(options.tokens.clone())
        .feed_id(FEED)
        .poll_interval(Duration::from_secs(3600))
        .require_auth(options.require_auth)
        .replay_latest(options.replay_latest)
        .close_on_expiry(options.close_on_expiry)
        .policy(options.policy)
        .send_queue(options.send_queue)
        .write_timeout(options.write_timeout)
        .build()
        .unwrap();

    let registry = gateway.registry().clone();
    let broadcaster = gateway.broadcaster().clone();

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let feed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = http_listener.local_addr().unwrap();
    let feed = feed_listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(gateway.serve(http_listener, feed_listener, shutdown.clone()));

    TestServer {
        http,
        feed,
        source,
        registry,
        broadcaster,
        tokens: options.tokens,
        shutdown,
        handle,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http, path)
    }

    async fn login(&self) -> String {
        let resp = reqwest::Client::new()
            .post(self.url("/login"))
            .json(&json!({"email": "bob@test.com", "password": "password"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    async fn connect(&self, token: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/?token={}", self.feed, token))
            .await
            .unwrap();
        ws
    }

    async fn wait_for_connections(&self, count: usize) {
        for _ in 0..100 {
            if self.registry.connection_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {} connections, have {}",
            count,
            self.registry.connection_count()
        );
    }
}

async fn next_binary(ws: &mut Client) -> Vec<u8> {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for payload")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Binary(data) => data.to_vec(),
        other => panic!("expected binary message, got {:?}", other),
    }
}

async fn assert_silent(ws: &mut Client) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected message: {:?}", next);
}

async fn assert_closed(ws: &mut Client) {
    let closed = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}

// ============== HTTP API ==============

#[tokio::test]
async fn test_health() {
    let server = start(Options::default()).await;

    let resp = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"message": "ok"}));

    let resp = reqwest::get(format!("http://{}/health", server.feed)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_login_then_validate() {
    let server = start(Options::default()).await;
    let token = server.login().await;

    let claims = server.tokens.validate(&token).unwrap();
    assert_eq!(claims.email(), "bob@test.com");

    let client = reqwest::Client::new();
    let resp = client
        .post(server.url("/validate"))
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<String>().await.unwrap(), "valid token");

    let resp = client
        .post(server.url("/validate"))
        .header("Authorization", "Bearer garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("malformed token"));
}

#[tokio::test]
async fn test_validate_rejections() {
    let server = start(Options::default()).await;
    let client = reqwest::Client::new();

    let resp = client.post(server.url("/validate")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "missing token");

    let token = server.login().await;
    let resp = client
        .post(server.url("/validate"))
        .header("Authorization", token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid authorization header");
}

#[tokio::test]
async fn test_validate_rejects_token_from_other_secret() {
    let server = start(Options::default()).await;
    let forged = TokenService::new("someone-else")
        .unwrap()
        .issue(&User::new("bob@test.com"))
        .unwrap();

    let resp = reqwest::Client::new()
        .post(server.url("/validate"))
        .header("Authorization", format!("Bearer {}", forged))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid token signature");
}

#[tokio::test]
async fn test_login_failures() {
    let server = start(Options::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/login"))
        .json(&json!({"email": "bob@test.com", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid credentials");

    let resp = client
        .post(server.url("/login"))
        .json(&json!({"email": "bob@test.com"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(server.url("/login"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid request");
}

#[tokio::test]
async fn test_signup() {
    let server = start(Options::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/signup"))
        .json(&json!({"email": "alice@test.com", "password": "s3cret-pass"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let token = body["token"].as_str().unwrap();
    assert_eq!(server.tokens.validate(token).unwrap().email(), "alice@test.com");

    // the new account can log in
    let resp = client
        .post(server.url("/login"))
        .json(&json!({"email": "alice@test.com", "password": "s3cret-pass"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // failures still answer 200, with an error body
    let resp = client
        .post(server.url("/signup"))
        .json(&json!({"email": "alice@test.com", "password": "again"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "error creating user");
    assert!(body.get("token").is_none());
}

#[tokio::test]
async fn test_data_endpoint() {
    let server = start(Options::default()).await;
    let token = server.login().await;
    let client = reqwest::Client::new();

    let resp = client.get(server.url("/data")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .get(server.url("/data"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    server.source.set(FEED, "name,age");
    server.broadcaster.run_cycle().await.unwrap();

    let resp = client
        .get(server.url("/data"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["id"], FEED);
    assert_eq!(body["data"], "name,age");
}

// ============== Realtime feed ==============

#[tokio::test]
async fn test_two_clients_receive_broadcast_once() {
    let server = start(Options::default()).await;
    let token = server.login().await;

    let mut first = server.connect(&token).await;
    let mut second = server.connect(&token).await;
    server.wait_for_connections(2).await;

    server.source.set(FEED, "P1");
    let report = server.broadcaster.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Broadcast);
    assert_eq!(report.delivered, 2);

    assert_eq!(next_binary(&mut first).await, b"P1");
    assert_eq!(next_binary(&mut second).await, b"P1");

    // unchanged upstream: nothing is re-delivered
    let report = server.broadcaster.run_cycle().await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Unchanged);
    assert_silent(&mut first).await;
    assert_silent(&mut second).await;

    server.source.set(FEED, "P2");
    server.broadcaster.run_cycle().await.unwrap();
    assert_eq!(next_binary(&mut first).await, b"P2");
    assert_eq!(next_binary(&mut second).await, b"P2");
}

#[tokio::test]
async fn test_upgrade_without_valid_token_is_rejected() {
    let server = start(Options::default()).await;

    for url in [
        format!("ws://{}/", server.feed),
        format!("ws://{}/?token=garbage", server.feed),
    ] {
        let err = connect_async(url).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status().as_u16(), 401)
            }
            other => panic!("expected HTTP 401, got {:?}", other),
        }
    }
    assert_eq!(server.registry.connection_count(), 0);
}

#[tokio::test]
async fn test_open_feed_admits_anonymous_clients() {
    let server = start(Options {
        require_auth: false,
        ..Options::default()
    })
    .await;

    let (mut ws, _) = connect_async(format!("ws://{}/feed", server.feed)).await.unwrap();
    server.wait_for_connections(1).await;

    server.source.set(FEED, "open");
    server.broadcaster.run_cycle().await.unwrap();
    assert_eq!(next_binary(&mut ws).await, b"open");
}

#[tokio::test]
async fn test_new_connection_gets_latest_payload() {
    let server = start(Options {
        replay_latest: true,
        ..Options::default()
    })
    .await;
    let token = server.login().await;

    server.source.set(FEED, "current");
    server.broadcaster.run_cycle().await.unwrap();

    let mut ws = server.connect(&token).await;
    assert_eq!(next_binary(&mut ws).await, b"current");
}

#[tokio::test]
async fn test_client_close_deregisters() {
    let server = start(Options::default()).await;
    let token = server.login().await;

    let mut ws = server.connect(&token).await;
    let _other = server.connect(&token).await;
    server.wait_for_connections(2).await;

    ws.close(None).await.unwrap();
    server.wait_for_connections(1).await;

    server.source.set(FEED, "after-close");
    let report = server.broadcaster.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_stats_lists_connections() {
    let server = start(Options::default()).await;
    let token = server.login().await;
    let _ws = server.connect(&token).await;
    server.wait_for_connections(1).await;

    let body: Value = reqwest::get(format!("http://{}/stats", server.feed))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["total_connections"], 1);
    assert_eq!(body["feed_id"], FEED);
    assert_eq!(body["connections"][0]["subject"], "bob@test.com");
}

#[tokio::test]
async fn test_session_closed_when_token_expires() {
    let server = start(Options {
        tokens: TokenService::with_ttl(SECRET, Duration::from_secs(2)).unwrap(),
        close_on_expiry: true,
        ..Options::default()
    })
    .await;
    let token = server.login().await;

    let mut ws = server.connect(&token).await;
    server.wait_for_connections(1).await;

    assert_closed(&mut ws).await;
    server.wait_for_connections(0).await;
}

#[tokio::test]
async fn test_stalled_client_is_dropped_after_failed_write() {
    let server = start(Options {
        policy: BroadcastPolicy::Always,
        send_queue: 1,
        write_timeout: Duration::from_millis(100),
        ..Options::default()
    })
    .await;
    let token = server.login().await;

    // never polled until the end, so the socket backs up
    let mut ws = server.connect(&token).await;
    server.wait_for_connections(1).await;

    server.source.set(FEED, vec![7u8; 15 * 1024 * 1024]);
    let mut failed = false;
    for _ in 0..10 {
        let report = server.broadcaster.run_cycle().await.unwrap();
        if report.failed == 1 {
            failed = true;
            break;
        }
    }
    assert!(failed, "writes to a stalled client never failed");
    assert_eq!(server.registry.connection_count(), 0);

    // the socket is dropped mid-payload instead of finishing the frame
    let complete = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return Some(data.len()),
                Some(Ok(_)) => {}
                None | Some(Err(_)) => return None,
            }
        }
    })
    .await
    .expect("socket was left open");
    assert_eq!(complete, None, "payload kept streaming after deregistration");
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = start(Options::default()).await;
    let token = server.login().await;

    let mut ws = server.connect(&token).await;
    server.wait_for_connections(1).await;

    server.shutdown.cancel();
    assert_closed(&mut ws).await;

    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("gateway did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(server.registry.connection_count(), 0);
}
