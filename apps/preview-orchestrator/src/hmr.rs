use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Query, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::AppState;
use crate::supervisor::{InstanceStatus, InstanceSupervisor};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

type ClientMap = DashMap<String, DashMap<u64, mpsc::UnboundedSender<Message>>>;

struct UpstreamHandle {
    tx: mpsc::UnboundedSender<UpstreamMessage>,
    task: JoinHandle<()>,
}

/// Bridges browser HMR sockets to per-project bundler children.
///
/// External editor clients connect to `/hmr?projectId=…` and are fanned out
/// through one managed upstream connection per project. The bundler's own
/// HMR clients are spliced raw over TCP so its protocol extensions pass
/// through untouched.
pub struct HmrSplicer {
    supervisor: InstanceSupervisor,
    clients: Arc<ClientMap>,
    upstreams: Arc<DashMap<String, UpstreamHandle>>,
    upstream_connect: tokio::sync::Mutex<()>,
    next_client_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
pub struct HmrQuery {
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
}

impl HmrSplicer {
    pub fn new(supervisor: InstanceSupervisor) -> Self {
        Self {
            supervisor,
            clients: Arc::new(DashMap::new()),
            upstreams: Arc::new(DashMap::new()),
            upstream_connect: tokio::sync::Mutex::new(()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn client_count(&self, project_id: &str) -> usize {
        self.clients
            .get(project_id)
            .map(|peers| peers.len())
            .unwrap_or(0)
    }

    /// Serve one external HMR client for `project_id`.
    pub async fn handle_external_client(&self, socket: WebSocket, project_id: String) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: everything destined for this client funnels through
        // one channel.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx.send(Message::Text("{\"type\":\"connected\"}".to_string()));
        self.clients
            .entry(project_id.clone())
            .or_default()
            .insert(client_id, tx);
        debug!(project = %project_id, client_id, "external HMR client connected");

        while let Some(frame) = receiver.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(project = %project_id, client_id, error = %err, "client socket error");
                    break;
                }
            };
            let forward = match msg {
                Message::Text(text) => Some(UpstreamMessage::Text(text)),
                Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
                Message::Close(_) => break,
                _ => None,
            };
            if let Some(msg) = forward {
                self.forward_to_child(&project_id, msg).await;
            }
        }

        // Last one out closes the upstream.
        let drop_upstream = {
            match self.clients.get(&project_id) {
                Some(peers) => {
                    peers.remove(&client_id);
                    peers.is_empty()
                }
                None => false,
            }
        };
        if drop_upstream {
            self.clients.remove(&project_id);
            if let Some((_, handle)) = self.upstreams.remove(&project_id) {
                handle.task.abort();
                info!(project = %project_id, "closed idle HMR upstream");
            }
        }
        writer.abort();
        debug!(project = %project_id, client_id, "external HMR client disconnected");
    }

    async fn forward_to_child(&self, project_id: &str, msg: UpstreamMessage) {
        if let Err(err) = self.ensure_upstream(project_id).await {
            warn!(project = %project_id, error = %err, "cannot reach bundler HMR socket");
            return;
        }
        if let Some(handle) = self.upstreams.get(project_id) {
            let _ = handle.tx.send(msg);
        }
    }

    /// Open the managed upstream once per project; concurrent callers
    /// serialise on the connect lock and re-check membership.
    async fn ensure_upstream(&self, project_id: &str) -> Result<()> {
        if self.upstreams.contains_key(project_id) {
            return Ok(());
        }
        let _guard = self.upstream_connect.lock().await;
        if self.upstreams.contains_key(project_id) {
            return Ok(());
        }

        let instance = self
            .supervisor
            .get_instance(project_id)
            .filter(|i| i.status == InstanceStatus::Running)
            .ok_or_else(|| Error::Unavailable(project_id.to_string()))?;

        let url = format!("ws://127.0.0.1:{}/", instance.port);
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|err| Error::Upstream(err.to_string()))?;
        info!(project = %project_id, port = instance.port, "opened HMR upstream");
        self.supervisor.mark_active(project_id);

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<UpstreamMessage>();
        let clients = self.clients.clone();
        let upstreams = self.upstreams.clone();
        let project = project_id.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = rx.recv() => match outbound {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(msg)) => broadcast_to_clients(&clients, &project, msg),
                        Some(Err(err)) => {
                            debug!(project = %project, error = %err, "HMR upstream error");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!(project = %project, "HMR upstream closed");
            upstreams.remove(&project);
        });

        self.upstreams.insert(
            project_id.to_string(),
            UpstreamHandle { tx, task },
        );
        Ok(())
    }

    /// Tear down all upstreams and client channels.
    pub fn shutdown(&self) {
        for entry in self.upstreams.iter() {
            entry.value().task.abort();
        }
        self.upstreams.clear();
        self.clients.clear();
    }
}

/// Relay a bundler frame to every connected client of the project.
fn broadcast_to_clients(clients: &ClientMap, project_id: &str, msg: UpstreamMessage) {
    let converted = match msg {
        UpstreamMessage::Text(text) => Message::Text(text),
        UpstreamMessage::Binary(data) => Message::Binary(data),
        _ => return,
    };
    if let Some(peers) = clients.get(project_id) {
        for peer in peers.iter() {
            let _ = peer.value().send(converted.clone());
        }
    }
}

/// Route handler for the external HMR endpoint. Plain GETs (health pokes,
/// load balancers) get an empty 200.
pub async fn external_handler(
    State(state): State<AppState>,
    Query(query): Query<HmrQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return StatusCode::OK.into_response();
    };
    let Some(project_id) = query.project_id else {
        return Error::BadRequest("projectId query parameter is required".to_string())
            .into_response();
    };
    let splicer = state.splicer.clone();
    ws.on_upgrade(move |socket| async move {
        splicer.handle_external_client(socket, project_id).await;
    })
}

/// Non-upgrade GET on a splice path.
pub async fn plain_ok() -> StatusCode {
    StatusCode::OK
}

/// Front-door middleware: WebSocket upgrades bound for a bundler are
/// spliced here, ahead of the HTTP proxy routes.
pub async fn upgrade_interceptor(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !is_websocket_upgrade(req.headers()) {
        return next.run(req).await;
    }
    let path = req.uri().path().to_string();
    if path == state.config.hmr_path {
        // External client endpoint; handled by its route.
        return next.run(req).await;
    }
    if let Some(project_id) = splice_target(&path) {
        return splice(state, req, project_id)
            .await
            .unwrap_or_else(IntoResponse::into_response);
    }
    next.run(req).await
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Resolve which project a splice upgrade is for.
///
/// `/hmr/<36-char-id>` anywhere in the path wins (covers direct, base-
/// prefixed and doubly-routed variants); otherwise any upgrade under
/// `/p/<id>/` targets that project.
pub fn splice_target(path: &str) -> Option<String> {
    static HMR_ID_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"/hmr/([A-Za-z0-9_-]{36})(?:/|$)").expect("hmr regex compiles"));
    if let Some(captures) = HMR_ID_RE.captures(path) {
        return Some(captures[1].to_string());
    }
    let rest = path.strip_prefix("/p/")?;
    let (id, _) = rest.split_once('/')?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Raw TCP splice: replay the client's upgrade against the child, relay the
/// child's 101, then pipe bytes both ways untouched. The bundler's HMR
/// protocol extensions survive because nothing here parses frames.
async fn splice(state: AppState, mut req: Request, project_id: String) -> Result<Response> {
    let instance = state
        .supervisor
        .get_instance(&project_id)
        .filter(|i| i.status == InstanceStatus::Running)
        .ok_or_else(|| Error::Unavailable(project_id.clone()))?;
    let port = instance.port;

    let key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::BadRequest("missing Sec-WebSocket-Key".to_string()))?;
    let version = req
        .headers()
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("13")
        .to_string();

    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return Err(Error::BadRequest("connection is not upgradable".to_string()));
    };

    let mut upstream = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        Err(_) => return Err(Error::UpstreamTimeout),
        Ok(Err(err)) => return Err(Error::Upstream(err.to_string())),
        Ok(Ok(stream)) => stream,
    };

    let handshake = format!(
        "GET / HTTP/1.1\r\n\
         Host: localhost:{port}\r\n\
         Origin: http://localhost:{port}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {version}\r\n\r\n"
    );
    upstream
        .write_all(handshake.as_bytes())
        .await
        .map_err(|err| Error::Upstream(err.to_string()))?;

    let (head, leftover) = read_response_head(&mut upstream).await?;
    if !head_is_switching_protocols(&head) {
        warn!(project = %project_id, head = %head.lines().next().unwrap_or(""), "child rejected upgrade");
        return Err(Error::Upstream("child rejected websocket upgrade".to_string()));
    }

    let accept = header_from_head(&head, "sec-websocket-accept")
        .unwrap_or_else(|| websocket_accept(&key));
    let protocol = header_from_head(&head, "sec-websocket-protocol");

    state.supervisor.mark_active(&project_id);
    debug!(project = %project_id, port, "splicing HMR socket");

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((to_child, to_client)) => {
                        debug!(project = %project_id, to_child, to_client, "splice closed");
                    }
                    Err(err) => {
                        debug!(project = %project_id, error = %err, "splice ended with error");
                    }
                }
            }
            Err(err) => debug!(project = %project_id, error = %err, "client upgrade failed"),
        }
    });

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header("sec-websocket-accept", accept);
    if let Some(protocol) = protocol {
        response = response.header("sec-websocket-protocol", protocol);
    }
    response
        .body(Body::empty())
        .map_err(|err| Error::Internal(err.to_string()))
}

/// Read the child's HTTP response headers; anything past the blank line is
/// frame data that must reach the client.
async fn read_response_head(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|err| Error::Upstream(err.to_string()))?;
        if n == 0 {
            return Err(Error::Upstream(
                "upstream closed during handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let leftover = buf[pos + 4..].to_vec();
            return Ok((head, leftover));
        }
        if buf.len() > 16 * 1024 {
            return Err(Error::Upstream("oversized handshake response".to_string()));
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn head_is_switching_protocols(head: &str) -> bool {
    head.lines()
        .next()
        .map(|line| line.contains(" 101 ") || line.ends_with(" 101"))
        .unwrap_or(false)
}

fn header_from_head(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (header, value) = line.split_once(':')?;
        if header.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// RFC 6455 accept key, used when the child's response omits one.
fn websocket_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_target_matches_all_routing_variants() {
        let id = "a1b2c3d4-e5f6-7890-abcd-ef0123456789";
        assert_eq!(splice_target(&format!("/hmr/{id}")).as_deref(), Some(id));
        assert_eq!(
            splice_target(&format!("/p/{id}/hmr/{id}")).as_deref(),
            Some(id)
        );
        assert_eq!(
            splice_target(&format!("/p/{id}/p/{id}/hmr/{id}")).as_deref(),
            Some(id)
        );
    }

    #[test]
    fn short_ids_fall_back_to_the_proxy_prefix() {
        // Not 36 chars: the /hmr/ rule does not bite, the /p/ prefix does.
        assert_eq!(splice_target("/p/p1/hmr/short").as_deref(), Some("p1"));
        assert_eq!(splice_target("/p/p1/").as_deref(), Some("p1"));
        assert_eq!(splice_target("/hmr/short"), None);
        assert_eq!(splice_target("/other"), None);
        assert_eq!(splice_target("/p/bare-no-slash"), None);
    }

    #[test]
    fn accept_key_matches_rfc_6455_example() {
        assert_eq!(
            websocket_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn response_head_parsing() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: abc=";
        assert!(head_is_switching_protocols(head));
        assert_eq!(
            header_from_head(head, "sec-websocket-accept").as_deref(),
            Some("abc=")
        );
        assert!(!head_is_switching_protocols("HTTP/1.1 400 Bad Request"));
    }
}
