//! WebSocket streams (exec/attach/port-forward) proxied to the API server.

mod common;

use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use common::{cluster_config, start_server, start_upstream, test_config};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const PROTOCOL: &str = "v4.channel.k8s.io";

/// Greets with the Authorization header it saw, then echoes binary frames.
async fn exec(ws: WebSocketUpgrade, headers: HeaderMap) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.protocols([PROTOCOL]).on_upgrade(move |mut socket| async move {
        if socket.send(AxumMessage::Text(auth.into())).await.is_err() {
            return;
        }
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                AxumMessage::Binary(data) => {
                    if socket.send(AxumMessage::Binary(data)).await.is_err() {
                        break;
                    }
                }
                AxumMessage::Close(_) => break,
                _ => {}
            }
        }
    })
}

#[tokio::test]
async fn exec_stream_is_bridged_with_cluster_credentials() {
    let upstream = start_upstream(
        axum::Router::new().route("/api/v1/namespaces/default/pods/web/exec", get(exec)),
    )
    .await;
    let server = start_server(test_config(vec![cluster_config("c1", &upstream)])).await;

    let mut request = server
        .ws_url("/c1/api/v1/namespaces/default/pods/web/exec?command=sh&stdin=true")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", PROTOCOL.parse().unwrap());
    let (mut ws, response) = connect_async(request).await.unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], PROTOCOL);

    match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text.as_str(), "Bearer c1-upstream-token"),
        other => panic!("unexpected frame: {other:?}"),
    }

    ws.send(Message::Binary(Bytes::from_static(b"\x00ls\n"))).await.unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(&data[..], b"\x00ls\n"),
        other => panic!("unexpected frame: {other:?}"),
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn stream_to_unreachable_cluster_is_refused() {
    let server = start_server(test_config(vec![cluster_config("c1", "http://127.0.0.1:1")])).await;
    let url = server.ws_url("/c1/api/v1/namespaces/default/pods/web/exec");
    assert!(connect_async(url).await.is_err());
}
