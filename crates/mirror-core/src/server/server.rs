//! HTTP + WebSocket front end for the shared session.
//!
//! One task drains the session's output channel and fans chunks out to
//! every client's bounded queue (drop-on-full, so a stalled browser
//! never blocks the rest). Each connection runs a writer task plus an
//! inline reader that decodes input and control frames. A single
//! privileged owner socket bounds the server's lifetime.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::access::{
    client_ip, match_user_level, AuthConfig, IpAllowList, UserLevel, UserLevelRule,
};
use super::assets;
use super::upload;
use crate::terminal::{ProcessInfo, ResetOutcome, Session, SessionEvents};

const CLIENT_QUEUE_CAPACITY: usize = 128;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ServerConfig {
    pub addrs: Vec<String>,
    pub allow_ips: Vec<String>,
    pub session: Arc<Session>,
    pub auth: AuthConfig,
    pub alias: String,
    pub owner_token: String,
    pub user_levels: Vec<UserLevelRule>,
}

enum Outbound {
    Binary(Vec<u8>),
    Text(String),
}

struct Client {
    tx: mpsc::Sender<Outbound>,
}

pub struct ServerState {
    pub session: Arc<Session>,
    auth: AuthConfig,
    alias: String,
    owner_token: String,
    allow_list: IpAllowList,
    user_levels: Vec<UserLevelRule>,
    clients: StdMutex<HashMap<u64, Client>>,
    next_client_id: AtomicU64,
    owner_connected: StdMutex<bool>,
    warned_ips: StdMutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl ServerState {
    /// Level for a client IP; unmatched IPs get full access with one
    /// warning per IP.
    pub fn user_level_for(&self, ip: &str) -> UserLevel {
        let (level, matched) = match_user_level(&self.user_levels, ip);
        if !matched {
            let mut warned = self.warned_ips.lock().unwrap_or_else(|e| e.into_inner());
            if warned.insert(ip.to_string()) {
                warn!(ip = %ip, "no user-level rule matched, defaulting to interact");
            }
        }
        level
    }

    /// Close the session and stop the listeners. Safe to call from any
    /// path, any number of times.
    pub fn request_shutdown(&self) {
        self.session.close();
        {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.clear();
        }
        self.shutdown.cancel();
    }

    fn broadcast(&self, message: Outbound) {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for client in clients.values() {
            let cloned = match &message {
                Outbound::Binary(data) => Outbound::Binary(data.clone()),
                Outbound::Text(text) => Outbound::Text(text.clone()),
            };
            if client.tx.try_send(cloned).is_err() {
                debug!("client queue full, dropping frame");
            }
        }
    }

    fn broadcast_reset_failure(&self, survivors: &[ProcessInfo], reason: Option<&str>) {
        let mut lines = vec!["The shell could not be fully reset.".to_string()];
        if let Some(reason) = reason {
            lines.push(format!("Reason: {reason}"));
        }
        if !survivors.is_empty() {
            lines.push("The following processes could not be terminated:".to_string());
            for proc in survivors {
                let name = proc.name.trim();
                let name = if name.is_empty() { "unknown" } else { name };
                lines.push(format!("PID {} - {}", proc.pid, name));
            }
        }
        let payload = json!({
            "type": "reset-failed",
            "title": "Reset failed",
            "message": lines.join("\n"),
        });
        self.broadcast(Outbound::Text(payload.to_string()));
    }

    async fn handle_control(&self, raw: &str, level: UserLevel) {
        let Ok(control) = serde_json::from_str::<ControlMessage>(raw) else {
            return;
        };
        match control.kind.as_str() {
            "resize" => {
                if level == UserLevel::Interact {
                    let _ = self.session.resize(control.cols, control.rows);
                }
            }
            "reset" => {
                if level != UserLevel::Interact {
                    return;
                }
                match self.session.reset().await {
                    Ok(ResetOutcome::Clean) => {}
                    Ok(ResetOutcome::Failed { survivors, reason }) => {
                        self.broadcast_reset_failure(&survivors, Some(&reason));
                    }
                    Err(err) => {
                        self.broadcast_reset_failure(&[], Some(&err.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    cols: u16,
    #[serde(default)]
    rows: u16,
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    #[serde(default)]
    token: String,
}

pub struct Server {
    state: Arc<ServerState>,
    addrs: Vec<String>,
    events: StdMutex<Option<SessionEvents>>,
    bound: StdMutex<Vec<SocketAddr>>,
}

impl Server {
    pub fn new(cfg: ServerConfig, events: SessionEvents) -> Result<Self> {
        let addrs: Vec<String> = cfg
            .addrs
            .iter()
            .map(|addr| addr.trim().to_string())
            .collect();
        if addrs.is_empty() || addrs.iter().any(String::is_empty) {
            bail!("listen addresses are required");
        }
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for addr in addrs {
            if seen.insert(addr.clone()) {
                unique.push(addr);
            }
        }

        let allow_list = IpAllowList::parse(&cfg.allow_ips)?;

        let state = Arc::new(ServerState {
            session: cfg.session,
            auth: cfg.auth,
            alias: cfg.alias,
            owner_token: cfg.owner_token.trim().to_string(),
            allow_list,
            user_levels: cfg.user_levels,
            clients: StdMutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            owner_connected: StdMutex::new(false),
            warned_ips: StdMutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            state,
            addrs: unique,
            events: StdMutex::new(Some(events)),
            bound: StdMutex::new(Vec::new()),
        })
    }

    /// Addresses actually bound; available once `start` has opened its
    /// listeners (useful with port 0).
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Serve until the context is cancelled, the owner disconnects, or
    /// the session finishes. Listeners get a bounded grace period to
    /// drain.
    pub async fn start(&self, ctx: CancellationToken) -> Result<()> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("server already started")?;

        self.spawn_broadcasters(events);

        let router = self.build_router();

        let mut listeners = Vec::new();
        for addr in &self.addrs {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            if let Ok(local) = listener.local_addr() {
                info!(addr = %local, "listening");
                self.bound
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(local);
            }
            listeners.push(listener);
        }

        // Shutdown fan-in: external cancel or session teardown.
        let watch_state = Arc::clone(&self.state);
        let session_done = self.state.session.done_token();
        let watch_ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch_ctx.cancelled() => {}
                _ = session_done.cancelled() => {}
            }
            watch_state.request_shutdown();
        });

        let mut serve_tasks = Vec::new();
        for listener in listeners {
            let app = router.clone();
            let shutdown = self.state.shutdown.clone();
            let error_state = Arc::clone(&self.state);
            serve_tasks.push(tokio::spawn(async move {
                let result = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
                if let Err(err) = result {
                    warn!(error = %err, "listener failed");
                    error_state.request_shutdown();
                }
            }));
        }

        self.state.shutdown.cancelled().await;
        let drain = futures_util::future::join_all(serve_tasks);
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;
        Ok(())
    }

    fn spawn_broadcasters(&self, events: SessionEvents) {
        let SessionEvents {
            mut output,
            mut status,
        } = events;

        let output_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                output_state.broadcast(Outbound::Binary(chunk));
            }
        });

        let status_state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(message) = status.recv().await {
                let payload = json!({ "type": "status", "message": message });
                status_state.broadcast(Outbound::Text(payload.to_string()));
            }
        });
    }

    fn build_router(&self) -> Router {
        let state = Arc::clone(&self.state);

        let mut router = Router::new()
            .route("/ws", get(handle_ws))
            .route("/upload", post(upload::handle_upload));
        if !state.owner_token.is_empty() {
            router = router.route("/ws-owner", get(handle_ws_owner));
        }

        router
            .route("/", get(handle_index))
            .fallback(get(handle_asset))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                auth_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                allow_ip_middleware,
            ))
            .with_state(state)
    }
}

async fn allow_ip_middleware(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>().cloned() else {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };
    let ip = client_ip(&addr);
    if !state.allow_list.allows(&ip) {
        debug!(ip = %ip, "rejected by allow-ip list");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    next.run(req).await
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.auth.enabled {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic_auth)
        .map(|(user, pass)| user == state.auth.user && pass == state.auth.password)
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"alices mirror\"")],
            "Unauthorized",
        )
            .into_response();
    }
    next.run(req).await
}

fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

async fn handle_index(State(state): State<Arc<ServerState>>) -> Response {
    Html(assets::render_index(&state.alias)).into_response()
}

async fn handle_asset(req: Request) -> Response {
    match assets::lookup(req.uri().path()) {
        Some((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn handle_ws(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(&addr);
    let level = state.user_level_for(&ip);
    ws.on_upgrade(move |socket| handle_socket(state, socket, false, level))
}

/// Token and single-owner checks come before upgrade validation, so a
/// bad token is always a plain 401 and an occupied slot a 409.
async fn handle_ws_owner(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<OwnerQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = query.token.trim();
    if token.is_empty() || token != state.owner_token {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    {
        let mut owner = state
            .owner_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *owner {
            return (StatusCode::CONFLICT, "Owner already connected").into_response();
        }
        *owner = true;
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let mut owner = state
                .owner_connected
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *owner = false;
            return rejection.into_response();
        }
    };

    let ip = client_ip(&addr);
    let level = state.user_level_for(&ip);
    ws.on_upgrade(move |socket| handle_socket(state, socket, true, level))
}

async fn handle_socket(
    state: Arc<ServerState>,
    socket: WebSocket,
    is_owner: bool,
    level: UserLevel,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(CLIENT_QUEUE_CAPACITY);
    let id = state.next_client_id.fetch_add(1, Ordering::Relaxed);

    // Register and enqueue the replay snapshot under the registry lock so
    // no live broadcast can slip in ahead of it.
    {
        let mut clients = state.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.insert(id, Client { tx });
        let snapshot = state.session.snapshot();
        if !snapshot.is_empty() {
            if let Some(client) = clients.get(&id) {
                let _ = client.tx.try_send(Outbound::Binary(snapshot));
            }
        }
    }
    debug!(client = id, owner = is_owner, "client attached");

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let message = match outbound {
                Outbound::Binary(data) => Message::Binary(data.into()),
                Outbound::Text(text) => Message::Text(text.into()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if level == UserLevel::Interact {
                            let _ = state.session.write_input(&data).await;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        state.handle_control(&text, level).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    {
        let mut clients = state.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.remove(&id);
    }
    let _ = writer.await;
    debug!(client = id, "client detached");

    if is_owner {
        {
            let mut owner = state
                .owner_connected
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *owner = false;
        }
        info!("owner disconnected, shutting down");
        state.request_shutdown();
    }
}
