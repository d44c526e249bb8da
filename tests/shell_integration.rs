//! End-to-end tests for browser shells: token minting, the upgrade,
//! PTY I/O, detach/resume and tab close.
#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{cluster_config, next_json, read_until, send_json, start_server, test_config, TestServer, WsClient, TOKEN};
use futures::StreamExt;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn shell_server() -> TestServer {
    start_server(test_config(vec![cluster_config("c1", "http://127.0.0.1:1")])).await
}

async fn open_shell(server: &TestServer, terminal: &str) -> WsClient {
    let token = server.shell_token("c1", terminal).await;
    let url = server.ws_url(&format!("/shell?id={terminal}&shellToken={token}&clusterId=c1"));
    let (ws, _) = connect_async(url).await.expect("shell upgrade failed");
    ws
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread")]
async fn stdin_reaches_the_shell() {
    let server = shell_server().await;
    let mut ws = open_shell(&server, "tab-1").await;

    assert_eq!(next_json(&mut ws).await, json!({"type": "connected", "resumed": false}));

    send_json(&mut ws, json!({"type": "stdin", "data": "echo kb_$((40+2))\n"})).await;
    read_until(&mut ws, "kb_42").await;

    send_json(&mut ws, json!({"type": "resize", "rows": 40, "cols": 120})).await;
    let process = server.state.shells.registry.get("tab-1").unwrap();
    wait_for(|| process.size() == (40, 120)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_resumes_and_replays_output() {
    let server = shell_server().await;
    let mut ws = open_shell(&server, "tab-2").await;
    next_json(&mut ws).await;
    send_json(&mut ws, json!({"type": "stdin", "data": "echo replay_$((1+1))\n"})).await;
    read_until(&mut ws, "replay_2").await;

    ws.close(None).await.unwrap();
    drop(ws);
    let process = server.state.shells.registry.get("tab-2").unwrap();
    wait_for(|| process.attached() == 0).await;
    assert_eq!(server.state.shells.registry.len(), 1);

    let mut ws = open_shell(&server, "tab-2").await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "connected", "resumed": true}));
    read_until(&mut ws, "replay_2").await;
    assert_eq!(server.state.shells.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_message_kills_the_shell() {
    let server = shell_server().await;
    let mut ws = open_shell(&server, "tab-3").await;
    next_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "close"})).await;
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                _ => continue,
            }
        }
        true
    })
    .await;
    assert_eq!(closed, Ok(true));
    wait_for(|| server.state.shells.registry.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_route_kills_a_detached_shell() {
    let server = shell_server().await;
    let mut ws = open_shell(&server, "tab-4").await;
    next_json(&mut ws).await;
    ws.close(None).await.unwrap();
    drop(ws);

    let client = reqwest::Client::new();
    let resp = client
        .delete(server.url("/api/shells/tab-4"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(server.state.shells.registry.is_empty());

    let resp = client
        .delete(server.url("/api/shells/tab-4"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrade_without_valid_token_is_refused() {
    let server = shell_server().await;

    let url = server.ws_url("/shell?id=tab-5&clusterId=c1");
    assert!(connect_async(url).await.is_err());

    // A wrong token burns the pending one; the right one no longer works.
    let token = server.shell_token("c1", "tab-5").await;
    let url = server.ws_url("/shell?id=tab-5&shellToken=wrong&clusterId=c1");
    assert!(connect_async(url).await.is_err());
    let url = server.ws_url(&format!("/shell?id=tab-5&shellToken={token}&clusterId=c1"));
    assert!(connect_async(url).await.is_err());

    assert!(server.state.shells.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn token_is_single_use() {
    let server = shell_server().await;
    let token = server.shell_token("c1", "tab-6").await;
    let url = server.ws_url(&format!("/shell?id=tab-6&shellToken={token}&clusterId=c1"));

    let (mut ws, _) = connect_async(url.clone()).await.unwrap();
    next_json(&mut ws).await;
    assert!(connect_async(url).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_sends_close_frames() {
    let server = shell_server().await;
    let mut ws = open_shell(&server, "tab-7").await;
    next_json(&mut ws).await;

    server.shutdown.cancel();
    let frame = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Close(frame)) = msg {
                return frame;
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(frame.unwrap().reason.as_str(), "server shutting down");
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_does_not_resume_on_another_cluster() {
    let server = start_server(test_config(vec![
        cluster_config("c1", "http://127.0.0.1:1"),
        cluster_config("c2", "http://127.0.0.1:1"),
    ]))
    .await;
    let mut ws = open_shell(&server, "tab-8").await;
    next_json(&mut ws).await;

    let token = server.shell_token("c2", "tab-8").await;
    let url = server.ws_url(&format!("/shell?id=tab-8&shellToken={token}&clusterId=c2"));
    assert!(connect_async(url).await.is_err());

    let process = server.state.shells.registry.get("tab-8").unwrap();
    assert_eq!(process.cluster_id, "c1");
    assert_eq!(server.state.shells.registry.len(), 1);

    // The owning cluster can still resume it.
    ws.close(None).await.unwrap();
    drop(ws);
    wait_for(|| process.attached() == 0).await;
    let mut ws = open_shell(&server, "tab-8").await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "connected", "resumed": true}));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_route_reports_lifecycle() {
    let server = shell_server().await;
    let client = reqwest::Client::new();
    let status = |id: &'static str| {
        let req = client.get(server.url(&format!("/api/shells/{id}"))).bearer_auth(TOKEN);
        async move {
            let resp = req.send().await.unwrap();
            assert_eq!(resp.status(), 200);
            resp.json::<serde_json::Value>().await.unwrap()
        }
    };

    assert_eq!(
        status("tab-9").await,
        json!({"id": "tab-9", "state": "absent", "cluster": null})
    );

    let mut ws = open_shell(&server, "tab-9").await;
    next_json(&mut ws).await;
    assert_eq!(
        status("tab-9").await,
        json!({"id": "tab-9", "state": "attached", "cluster": "c1"})
    );

    ws.close(None).await.unwrap();
    drop(ws);
    let process = server.state.shells.registry.get("tab-9").unwrap();
    wait_for(|| process.attached() == 0).await;
    assert_eq!(status("tab-9").await["state"], "detached");
}
