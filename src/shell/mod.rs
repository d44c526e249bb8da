//! Interactive shells for clusters.
//!
//! One socket is bridged to one [`ShellProcess`]. Each process has a state:
//!
//! ```text
//! absent ──upgrade──▶ starting ──spawned──▶ attached ──socket closed──▶ detached
//!   ▲                    │                     ▲                          │
//!   │                 failed                   └─────────upgrade──────────┤
//!   └──────────────── exit / tab close ◀───────────────────────────────────┘
//! ```
//!
//! Closing a socket only detaches. The process is killed by an explicit
//! tab-close (`{"type":"close"}` or `DELETE /api/shells/{id}`) or when it
//! exits on its own.

pub mod args;
pub mod cache;
pub mod cwd;
pub mod env;
pub mod protocol;
pub mod token;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::process::{ProcessError, ProcessRegistry, ShellProcess};
use crate::pty::SpawnCommand;

use self::cache::EnvCache;
use self::env::{EnvError, ShellEnv};
use self::protocol::{ClientMessage, ServerMessage};
use self::token::ShellTokenStore;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// How long to keep forwarding output after the process has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ShellError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("terminal {terminal} belongs to cluster {owner}, not {requested}")]
    ClusterMismatch {
        terminal: String,
        owner: String,
        requested: String,
    },
}

fn check_owner(process: &ShellProcess, cluster: &Cluster) -> Result<(), ShellError> {
    if process.cluster_id == cluster.id {
        return Ok(());
    }
    Err(ShellError::ClusterMismatch {
        terminal: process.terminal_id.clone(),
        owner: process.cluster_id.clone(),
        requested: cluster.id.clone(),
    })
}

/// Validate a terminal id. 1-128 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_terminal_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("terminal id must not be empty".into());
    }
    if id.len() > 128 {
        return Err(format!("terminal id too long ({} chars, max 128)", id.len()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("terminal id contains invalid characters".into());
    }
    Ok(())
}

/// Validate a node name as an RFC 1123 subdomain.
pub fn validate_node_name(node: &str) -> Result<(), String> {
    if node.is_empty() || node.len() > 253 {
        return Err("node name must be 1-253 chars".into());
    }
    if !node
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(format!("invalid node name: {node}"));
    }
    if node.starts_with(['-', '.']) || node.ends_with(['-', '.']) {
        return Err(format!("invalid node name: {node}"));
    }
    Ok(())
}

/// Build the command for a shell: the local shell, or a debug pod on `node`.
pub fn shell_command(
    env: &ShellEnv,
    cwd: PathBuf,
    node: Option<&str>,
    kubectl: &std::path::Path,
    node_image: &str,
) -> SpawnCommand {
    match node {
        None => SpawnCommand {
            program: env.shell.clone(),
            args: env.args.clone(),
            env: env.env.clone(),
            cwd,
        },
        Some(node) => SpawnCommand {
            program: kubectl.to_string_lossy().into_owned(),
            args: vec![
                "debug".to_string(),
                format!("node/{node}"),
                "-it".to_string(),
                "--image".to_string(),
                node_image.to_string(),
                "--".to_string(),
                "chroot".to_string(),
                "/host".to_string(),
                "sh".to_string(),
                "-c".to_string(),
                "(bash || ash || sh)".to_string(),
            ],
            env: env.env.clone(),
            cwd,
        },
    }
}

/// Owns the shell registry and everything needed to start shells.
pub struct ShellService {
    pub registry: ProcessRegistry,
    pub env_cache: EnvCache,
    pub tokens: Arc<ShellTokenStore>,
    kubectl: PathBuf,
    node_image: String,
    shutdown: CancellationToken,
}

impl ShellService {
    pub fn new(
        env_cache: EnvCache,
        kubectl: PathBuf,
        node_image: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            env_cache,
            tokens: Arc::new(ShellTokenStore::new()),
            kubectl,
            node_image,
            shutdown,
        }
    }

    /// Return the terminal's process, starting it if needed.
    ///
    /// The boolean is `true` when an existing process was resumed. A
    /// terminal only ever resumes on the cluster it was started for.
    pub async fn open(
        &self,
        cluster: &Arc<Cluster>,
        terminal_id: &str,
        node: Option<&str>,
    ) -> Result<(Arc<ShellProcess>, bool), ShellError> {
        if let Some(process) = self.registry.get(terminal_id) {
            check_owner(&process, cluster)?;
            return Ok((process, true));
        }

        let env = self.env_cache.get(cluster).await?;
        let cwd = cwd::resolve_cwd(cluster.terminal_cwd.as_deref());
        let command = shell_command(&env, cwd, node, &self.kubectl, &self.node_image);
        let terminal = terminal_id.to_string();
        let cluster_id = cluster.id.clone();

        let result = self
            .registry
            .get_or_spawn(terminal_id, move || {
                ShellProcess::spawn(terminal, cluster_id, command, DEFAULT_ROWS, DEFAULT_COLS)
            })
            .await;
        if let Err(e) = &result {
            tracing::error!(terminal = %terminal_id, cluster = %cluster.id, %e, "failed to start shell");
        }
        let (process, resumed) = result?;
        check_owner(&process, cluster)?;
        Ok((process, resumed))
    }

    /// Tab close: kill and deregister.
    pub fn close(&self, terminal_id: &str) -> bool {
        self.registry.kill(terminal_id)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bridge `socket` to `process` until either side goes away.
    pub async fn run_session(&self, socket: WebSocket, process: Arc<ShellProcess>, resumed: bool) {
        bridge(socket, process, resumed, self.registry.clone(), self.shutdown.clone()).await;
    }
}

enum Ending {
    Detached,
    TabClosed,
    Exited,
    Shutdown,
}

async fn bridge(
    socket: WebSocket,
    process: Arc<ShellProcess>,
    resumed: bool,
    registry: ProcessRegistry,
    shutdown: CancellationToken,
) {
    let terminal = process.terminal_id.clone();
    let _attached = process.attach();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (replay, mut output_rx) = process.subscribe();
    let exited = process.exited();

    let connected = ServerMessage::Connected { resumed }.to_json();
    if ws_tx.send(Message::Text(connected.into())).await.is_err() {
        return;
    }
    if !replay.is_empty() && ws_tx.send(Message::Binary(replay)).await.is_err() {
        return;
    }
    tracing::info!(terminal = %terminal, resumed, "shell attached");

    let ending = loop {
        tokio::select! {
            result = output_rx.recv() => {
                match result {
                    Ok(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break Ending::Detached;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ending::Exited,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(terminal = %terminal, skipped = n, "shell output lagged");
                        continue;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if process.write(data).await.is_err() {
                            break Ending::Exited;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Stdin { data }) => {
                                if process.write(Bytes::from(data)).await.is_err() {
                                    break Ending::Exited;
                                }
                            }
                            Ok(ClientMessage::Resize { rows, cols }) => {
                                if let Err(e) = process.resize(rows, cols) {
                                    tracing::warn!(terminal = %terminal, %e, "resize failed");
                                }
                            }
                            Ok(ClientMessage::Close) => break Ending::TabClosed,
                            Err(e) => {
                                tracing::debug!(terminal = %terminal, %e, "ignoring malformed shell message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ending::Detached,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(terminal = %terminal, %e, "shell socket error");
                        break Ending::Detached;
                    }
                }
            }

            _ = exited.cancelled() => break Ending::Exited,

            _ = shutdown.cancelled() => break Ending::Shutdown,
        }
    };

    match ending {
        Ending::Detached => {
            tracing::info!(terminal = %terminal, "shell detached");
        }
        Ending::TabClosed => {
            if registry.kill_process(&process) {
                tracing::info!(terminal = %terminal, "shell closed by client");
            }
            close_socket(&mut ws_tx, "terminal closed").await;
        }
        Ending::Exited => {
            // Forward whatever the reader thread publishes after the exit.
            while let Ok(Ok(data)) = tokio::time::timeout(EXIT_DRAIN, output_rx.recv()).await {
                if ws_tx.send(Message::Binary(data)).await.is_err() {
                    return;
                }
            }
            tracing::info!(terminal = %terminal, "shell exited, closing socket");
            close_socket(&mut ws_tx, "process exited").await;
        }
        Ending::Shutdown => {
            tracing::debug!(terminal = %terminal, "shell socket received shutdown signal, closing");
            close_socket(&mut ws_tx, "server shutting down").await;
        }
    }
}

async fn close_socket<S>(ws_tx: &mut S, reason: &'static str)
where
    S: futures::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}
