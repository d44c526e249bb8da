#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kubebridge::api::{self, AppState, Dispatcher};
use kubebridge::cluster::{ClusterStore, InMemoryClusterStore};
use kubebridge::config::{ClusterConfig, Config, RetryConfig, ShellConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "test-token";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running kubebridge listener plus what the tests need to poke at it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Mint a shell token for `terminal` on `cluster`.
    pub async fn shell_token(&self, cluster: &str, terminal: &str) -> String {
        let resp = reqwest::Client::new()
            .post(self.url(&format!("/api/shell-token?id={terminal}&clusterId={cluster}")))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        json["token"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        drop(self.state.shells.registry.drain());
    }
}

pub fn cluster_config(id: &str, server: &str) -> ClusterConfig {
    ClusterConfig {
        id: id.to_string(),
        name: None,
        server: server.to_string(),
        token: Some(format!("{id}-upstream-token")),
        ca_cert: None,
        client_cert: None,
        client_key: None,
        insecure_skip_tls_verify: false,
        proxy_url: None,
        kubeconfig: None,
        proxy_kubeconfig: None,
        terminal_cwd: None,
    }
}

/// Config with fast retries and a plain `/bin/sh` for shells.
pub fn test_config(clusters: Vec<ClusterConfig>) -> Config {
    Config {
        auth_token: Some(TOKEN.to_string()),
        kubectl_path: Some("kubectl".into()),
        helm_path: Some("helm".into()),
        retry: RetryConfig {
            max_retries: 3,
            backoff_ms: 5,
        },
        shell: ShellConfig {
            shell: Some("/bin/sh".into()),
            sync_login_env: false,
            ..ShellConfig::default()
        },
        clusters,
        ..Config::default()
    }
}

pub async fn start_server(mut config: Config) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    config.data_dir = Some(dir.path().to_path_buf());

    let shutdown = CancellationToken::new();
    let store: Arc<dyn ClusterStore> = Arc::new(InMemoryClusterStore::new(config.build_clusters()));
    let state = AppState::new(&config, store, shutdown.clone()).unwrap();
    let dispatcher = Dispatcher::new(state.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, dispatcher, shutdown.clone()));

    TestServer {
        addr,
        state,
        shutdown,
        _dir: dir,
    }
}

/// Serve `app` as a fake API server; returns its base URL.
pub async fn start_upstream(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Read frames until the first text frame and parse it as JSON.
pub async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    let deadline = Duration::from_secs(10);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a text frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read binary frames until their concatenation contains `needle`.
pub async fn read_until(ws: &mut WsClient, needle: &str) -> String {
    let mut seen = String::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Binary(data)) = msg {
                seen.push_str(&String::from_utf8_lossy(&data));
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await;
    assert_eq!(result, Ok(true), "never saw {needle:?} in output: {seen:?}");
    seen
}

pub async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}
