//! WebSocket upgrade dispatch.
//!
//! Any failure here is returned as an [`UpgradeError`]; the dispatcher turns
//! it into a service error so hyper drops the connection without writing a
//! response.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::FromRequestParts;
use axum::http::{header, HeaderValue, Method, Request, Uri};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::cluster::Cluster;
use crate::resolver::query_param;
use crate::route::{RouteError, RouteTable};
use crate::shell::{validate_node_name, validate_terminal_id, ShellError};
use crate::tls::{self, TlsError};

use super::proxy::strip_kube_prefix;
use super::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRoute {
    Shell,
    KubeStream,
}

pub fn upgrade_table() -> Result<RouteTable<UpgradeRoute>, RouteError> {
    let mut t = RouteTable::new();
    t.add(Method::GET, "/shell", UpgradeRoute::Shell)?;
    t.add(Method::GET, "/api-kube/{path*}", UpgradeRoute::KubeStream)?;
    Ok(t)
}

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("no upgrade route for {0}")]
    NoRoute(String),

    #[error("no cluster for upgrade request")]
    NoCluster,

    #[error("invalid terminal id: {0}")]
    InvalidTerminal(String),

    #[error("shell token rejected for terminal {0}")]
    TokenRejected(String),

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("websocket handshake rejected: {0}")]
    Handshake(String),

    #[error("terminal {0} is bound to another cluster")]
    ForeignTerminal(String),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("upstream TLS: {0}")]
    Tls(#[from] TlsError),

    #[error("upstream websocket: {0}")]
    Upstream(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid upstream URL: {0}")]
    UpstreamUrl(String),
}

/// Whether `req` asks for a WebSocket upgrade.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub(super) async fn handle(
    state: &AppState,
    table: &RouteTable<UpgradeRoute>,
    cluster: Option<Arc<Cluster>>,
    req: Request<Body>,
) -> Result<Response, UpgradeError> {
    let route = table
        .find(req.method(), req.uri().path())
        .map(|m| *m.value)
        .ok_or_else(|| UpgradeError::NoRoute(req.uri().path().to_string()))?;
    let cluster = cluster.ok_or(UpgradeError::NoCluster)?;

    match route {
        UpgradeRoute::Shell => shell(state, cluster, req).await,
        UpgradeRoute::KubeStream => kube_stream(cluster, req).await,
    }
}

async fn shell(
    state: &AppState,
    cluster: Arc<Cluster>,
    req: Request<Body>,
) -> Result<Response, UpgradeError> {
    let (mut parts, _body) = req.into_parts();
    let query = parts.uri.query();

    let id = query_param(query, "id")
        .ok_or_else(|| UpgradeError::InvalidTerminal("missing id".into()))?
        .to_string();
    let token = query_param(query, "shellToken").unwrap_or_default();
    if !state.shells.tokens.validate(&cluster.id, &id, token) {
        return Err(UpgradeError::TokenRejected(id));
    }
    validate_terminal_id(&id).map_err(UpgradeError::InvalidTerminal)?;
    let node = query_param(query, "node")
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    if let Some(node) = &node {
        validate_node_name(node).map_err(UpgradeError::InvalidNode)?;
    }

    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|e| UpgradeError::Handshake(e.to_string()))?;

    let (process, resumed) = state
        .shells
        .open(&cluster, &id, node.as_deref())
        .await
        .map_err(|e| match e {
            ShellError::ClusterMismatch { terminal, .. } => UpgradeError::ForeignTerminal(terminal),
            e => UpgradeError::Shell(e),
        })?;
    tracing::debug!(cluster = %cluster.id, terminal = %id, resumed, "upgrading shell socket");

    let shells = Arc::clone(&state.shells);
    Ok(ws.on_upgrade(move |socket| async move {
        shells.run_session(socket, process, resumed).await;
    }))
}

/// `http(s)://server` + upstream path and query, as `ws(s)://`.
pub fn upstream_ws_url(server: &str, uri: &Uri) -> Result<String, UpgradeError> {
    let path = strip_kube_prefix(uri.path())
        .ok_or_else(|| UpgradeError::UpstreamUrl(uri.path().to_string()))?;
    let base = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(UpgradeError::UpstreamUrl(server.to_string()));
    };
    let mut url = format!("{}{}", base.trim_end_matches('/'), path);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }
    Ok(url)
}

async fn kube_stream(cluster: Arc<Cluster>, req: Request<Body>) -> Result<Response, UpgradeError> {
    let (mut parts, _body) = req.into_parts();
    let url = upstream_ws_url(&cluster.api.server, &parts.uri)?;
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &())
        .await
        .map_err(|e| UpgradeError::Handshake(e.to_string()))?;

    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = &cluster.api.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| UpgradeError::Handshake(e.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }
    if let Some(protocols) = parts.headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let connector = if url.starts_with("wss://") {
        Connector::Rustls(tls::client_config(&cluster.api)?)
    } else {
        Connector::Plain
    };
    let (upstream, response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
            .await?;

    let chosen = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    tracing::debug!(cluster = %cluster.id, %url, protocol = ?chosen, "upstream stream connected");
    let ws = match chosen {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let cluster_id = cluster.id.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        pump(socket, upstream).await;
        tracing::debug!(cluster = %cluster_id, "stream closed");
    }))
}

fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_owned().into())),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        // Each side answers its own pings.
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn from_upstream(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}

async fn pump(socket: WebSocket, upstream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
    let (mut client_tx, mut client_rx) = socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, Message::Close(_));
            if let Some(msg) = to_upstream(msg) {
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let closing = matches!(msg, UpstreamMessage::Close(_));
            if let Some(msg) = from_upstream(msg) {
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}
