//! End-to-end tests over real sockets: HTTP middleware, WebSocket
//! mirroring, owner lifecycle, upload.

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use mirror_core::server::parse_user_level_rules;
use mirror_core::{AuthConfig, Server, ServerConfig, Session, SessionConfig, ShellKind};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct TestServer {
    session: Arc<Session>,
    ctx: CancellationToken,
    addr: SocketAddr,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(auth: AuthConfig, allow: &[&str], user_level: &str, owner_token: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut session_cfg = SessionConfig::new(dir.path());
        session_cfg.shell = ShellKind::Custom("/bin/sh".to_string());
        let (session, events) = Session::new(session_cfg).expect("session");

        let server = Arc::new(
            Server::new(
                ServerConfig {
                    addrs: vec!["127.0.0.1:0".to_string()],
                    allow_ips: allow.iter().map(|s| s.to_string()).collect(),
                    session: Arc::clone(&session),
                    auth,
                    alias: "it".to_string(),
                    owner_token: owner_token.to_string(),
                    user_levels: parse_user_level_rules(user_level).expect("rules"),
                },
                events,
            )
            .expect("server"),
        );

        let ctx = CancellationToken::new();
        let task = {
            let server = Arc::clone(&server);
            let ctx = ctx.clone();
            tokio::spawn(async move { server.start(ctx).await })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        let addr = loop {
            if let Some(addr) = server.bound_addrs().first().copied() {
                break addr;
            }
            assert!(Instant::now() < deadline, "server never bound");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        Self {
            session,
            ctx,
            addr,
            task,
            _dir: dir,
        }
    }

    async fn wait_for_shell(&self) -> u32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(pid) = self.session.shell_pid() {
                return pid;
            }
            assert!(Instant::now() < deadline, "shell never started");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.ctx.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}

async fn recv_binary_until(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    needle: &[u8],
    timeout: Duration,
) -> Vec<u8> {
    let mut collected = Vec::new();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            !remaining.is_zero(),
            "timed out waiting for {:?}; got {:?}",
            String::from_utf8_lossy(needle),
            String::from_utf8_lossy(&collected)
        );
        let frame = tokio::time::timeout(remaining, ws.next()).await;
        match frame {
            Ok(Some(Ok(Message::Binary(data)))) => {
                collected.extend_from_slice(&data);
                if collected.windows(needle.len()).any(|w| w == needle) {
                    return collected;
                }
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(err))) => panic!("websocket error: {err}"),
            Ok(None) => panic!("websocket closed while waiting"),
            Err(_) => continue,
        }
    }
}

#[tokio::test]
async fn basic_auth_gates_every_route() {
    let server = TestServer::start(
        AuthConfig {
            enabled: true,
            user: "u".to_string(),
            password: "p".to_string(),
        },
        &["127.0.0.1"],
        "*-0",
        "",
    )
    .await;

    let client = reqwest::Client::new();

    let resp = client.get(server.http("/")).send().await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .expect("challenge header")
        .to_str()
        .expect("header text");
    assert!(challenge.starts_with("Basic"));

    let resp = client
        .get(server.http("/"))
        .basic_auth("u", Some("p"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.text().await.expect("body");
    assert!(body.contains("alices mirror"));

    let resp = client
        .get(server.http("/"))
        .basic_auth("u", Some("wrong"))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    server.stop().await;
}

#[tokio::test]
async fn allow_list_rejects_unlisted_ips() {
    let server = TestServer::start(AuthConfig::default(), &["10.0.0.*"], "*-0", "").await;

    let resp = reqwest::get(server.http("/")).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    server.stop().await;
}

#[tokio::test]
async fn mirrors_output_and_replays_snapshot() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "*-0", "").await;
    server.wait_for_shell().await;

    let (mut first, _) = tokio_tungstenite::connect_async(server.ws("/ws"))
        .await
        .expect("connect");
    first
        .send(Message::Binary(b"echo ws_mirror_token\r".to_vec().into()))
        .await
        .expect("send input");
    recv_binary_until(&mut first, b"ws_mirror_token", Duration::from_secs(5)).await;

    // A late joiner's first binary frame is the replay snapshot and
    // already contains the earlier output.
    let (mut second, _) = tokio_tungstenite::connect_async(server.ws("/ws"))
        .await
        .expect("connect second");
    let deadline = Instant::now() + Duration::from_secs(5);
    let snapshot = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "no snapshot frame");
        match tokio::time::timeout(remaining, second.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => break data,
            Ok(Some(Ok(_))) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    let needle = b"ws_mirror_token";
    assert!(
        snapshot.windows(needle.len()).any(|w| w == needle),
        "snapshot missing prior output"
    );

    server.stop().await;
}

#[tokio::test]
async fn watch_only_clients_cannot_drive_the_shell() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "127.0.0.1-1", "").await;
    let pid_before = server.wait_for_shell().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws("/ws"))
        .await
        .expect("connect");

    ws.send(Message::Text("{\"type\":\"reset\"}".to_string().into()))
        .await
        .expect("send reset");
    ws.send(Message::Binary(b"echo watch_only_leak\r".to_vec().into()))
        .await
        .expect("send input");
    ws.send(Message::Text(
        "{\"type\":\"resize\",\"cols\":33,\"rows\":11}".to_string().into(),
    ))
    .await
    .expect("send resize");

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(
        server.session.shell_pid(),
        Some(pid_before),
        "watch-only reset must not touch the shell"
    );
    let snapshot = server.session.snapshot();
    let needle = b"watch_only_leak";
    assert!(
        !snapshot.windows(needle.len()).any(|w| w == needle),
        "watch-only input reached the shell"
    );

    server.stop().await;
}

#[tokio::test]
async fn owner_lifetime_bounds_the_server() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "*-0", "seekrit").await;
    server.wait_for_shell().await;

    // Bad or missing token never upgrades.
    let resp = reqwest::get(server.http("/ws-owner")).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    let resp = reqwest::get(server.http("/ws-owner?token=nope"))
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let (owner, _) = tokio_tungstenite::connect_async(server.ws("/ws-owner?token=seekrit"))
        .await
        .expect("owner connect");

    // One owner at a time.
    let resp = reqwest::get(server.http("/ws-owner?token=seekrit"))
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    // Owner disconnect tears the whole server down.
    drop(owner);
    let result = tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .expect("server did not stop after owner disconnect")
        .expect("join");
    assert!(result.is_ok(), "server exit: {result:?}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn upload_renames_on_collision() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "*-0", "").await;
    server.wait_for_shell().await;

    let client = reqwest::Client::new();
    let mut names = Vec::new();
    for payload in ["first body", "second body"] {
        let part = reqwest::multipart::Part::text(payload.to_string())
            .file_name("report.txt")
            .mime_str("text/plain")
            .expect("part");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = client
            .post(server.http("/upload"))
            .multipart(form)
            .send()
            .await
            .expect("upload");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.expect("json");
        let files = body["files"].as_array().expect("files array");
        assert_eq!(files.len(), 1);
        names.push(files[0]["name"].as_str().expect("name").to_string());
        let dir = body["directory"].as_str().expect("directory");
        let saved = std::path::Path::new(dir).join(files[0]["name"].as_str().unwrap());
        let contents = std::fs::read_to_string(&saved).expect("saved file");
        assert_eq!(contents, payload);
    }
    assert_eq!(names, vec!["report.txt", "report (1).txt"]);

    server.stop().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn upload_is_refused_for_watch_only() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "127.0.0.1-1", "").await;
    server.wait_for_shell().await;

    let part = reqwest::multipart::Part::text("data".to_string()).file_name("x.txt");
    let form = reqwest::multipart::Form::new().part("file", part);
    let resp = reqwest::Client::new()
        .post(server.http("/upload"))
        .multipart(form)
        .send()
        .await
        .expect("upload");
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    server.stop().await;
}

#[tokio::test]
async fn malformed_control_frames_are_ignored() {
    let server = TestServer::start(AuthConfig::default(), &["127.0.0.1"], "*-0", "").await;
    server.wait_for_shell().await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws("/ws"))
        .await
        .expect("connect");

    ws.send(Message::Text("this is not json".to_string().into()))
        .await
        .expect("send garbage");
    ws.send(Message::Text("{\"type\":\"unknown\"}".to_string().into()))
        .await
        .expect("send unknown");

    // The connection survives and keeps mirroring.
    ws.send(Message::Binary(b"echo still_alive_42\r".to_vec().into()))
        .await
        .expect("send input");
    recv_binary_until(&mut ws, b"still_alive_42", Duration::from_secs(5)).await;

    server.stop().await;
}
