//! The HTTP/WebSocket front door.
//!
//! Every connection is served by a [`Dispatcher`], which resolves the
//! request's cluster and then hands the request to one of three places:
//!
//! 1. WebSocket upgrades go to the upgrade router ([`upgrade`]).
//! 2. Kubernetes API paths with a cluster go to the proxy ([`proxy`]).
//! 3. Everything else goes to the internal route table ([`routes`]).

pub mod auth;
pub mod error;
mod handlers;
pub mod proxy;
pub mod routes;
pub mod upgrade;
mod web;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::{OriginalUri, Query};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::BoxError;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder};
use tower_http::trace::TraceLayer;

use crate::cluster::{Cluster, ClusterStore};
use crate::config::{Config, DEFAULT_CSP};
use crate::helm::HelmRunner;
use crate::portforward::PortForwardRegistry;
use crate::resolver::ClusterResolver;
use crate::route::{RouteError, RouteTable};
use crate::shell::cache::EnvCache;
use crate::shell::env::{EnvResolver, EnvResolverConfig};
use crate::shell::ShellService;

use self::error::ApiError;
use self::proxy::KubeProxy;
use self::routes::{Route, RouteRequest};
use self::upgrade::{UpgradeError, UpgradeRoute};

/// Limit for bodies of internal routes.
const MAX_ROUTE_BODY: usize = 1024 * 1024;

/// Response-level settings shared by all requests.
pub struct Settings {
    pub content_security_policy: HeaderValue,
    /// Bearer token for protected routes; `None` disables the check.
    pub auth_token: Option<String>,
    pub dev_asset_server: Option<String>,
    pub dev_client: reqwest::Client,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let content_security_policy = HeaderValue::from_str(&config.content_security_policy)
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "invalid content_security_policy, using the default");
                HeaderValue::from_static(DEFAULT_CSP)
            });
        let dev_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            content_security_policy,
            auth_token: config.auth_token.clone(),
            dev_asset_server: config.dev_asset_server.clone(),
            dev_client,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub resolver: ClusterResolver,
    pub proxy: Arc<KubeProxy>,
    pub shells: Arc<ShellService>,
    pub port_forwards: PortForwardRegistry,
    pub helm: HelmRunner,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn ClusterStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let data_dir = config.data_dir();
        let kubectl = config.kubectl();

        let env_resolver = EnvResolver::new(EnvResolverConfig {
            shell: config.shell.shell.clone(),
            sync_login_env: config.shell.sync_login_env,
            kubectl: kubectl.clone(),
            init_root: data_dir.join("shell-init"),
        });
        let shells = ShellService::new(
            EnvCache::new(Arc::new(env_resolver)),
            kubectl.clone(),
            config.shell.node_shell_image.clone(),
            shutdown,
        );

        Ok(Self {
            resolver: ClusterResolver::new(store),
            proxy: Arc::new(KubeProxy::new(config.retry)),
            shells: Arc::new(shells),
            port_forwards: PortForwardRegistry::new(kubectl),
            helm: HelmRunner::new(config.helm(), data_dir.join("helm")),
            settings: Arc::new(Settings::from_config(config)?),
        })
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    /// The upgrade was refused; the connection is dropped without a response.
    #[error("upgrade rejected: {0}")]
    Upgrade(#[from] UpgradeError),
}

#[derive(Clone)]
pub struct Dispatcher {
    state: AppState,
    routes: Arc<RouteTable<Route>>,
    upgrades: Arc<RouteTable<UpgradeRoute>>,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Result<Self, RouteError> {
        Ok(Self {
            state,
            routes: Arc::new(routes::route_table()?),
            upgrades: Arc::new(upgrade::upgrade_table()?),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    async fn dispatch(self, mut req: Request<Body>) -> Result<Response, DispatchError> {
        let host = request_host(&req);
        let original = req.uri().clone();
        let resolution = self.state.resolver.resolve(host.as_deref(), &original);
        req.extensions_mut().insert(OriginalUri(original));

        let cluster = resolution.map(|r| {
            if let Some(uri) = r.rewritten {
                *req.uri_mut() = uri;
            }
            r.cluster
        });

        if upgrade::is_websocket_upgrade(&req) {
            let mut response = upgrade::handle(&self.state, &self.upgrades, cluster, req)
                .await
                .map_err(|e| {
                    tracing::warn!(%e, "dropping upgrade request");
                    DispatchError::from(e)
                })?;
            self.set_csp(&mut response);
            return Ok(response);
        }

        if let Some(cluster) = &cluster {
            if proxy::is_kube_path(req.uri().path()) {
                return Ok(self.state.proxy.forward(cluster, req).await);
            }
        }

        let mut response = self.route(cluster, req).await;
        self.set_csp(&mut response);
        Ok(response)
    }

    async fn route(&self, cluster: Option<Arc<Cluster>>, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let Some(matched) = self.routes.find(&parts.method, parts.uri.path()) else {
            return ApiError::NotFound.into_response();
        };
        let route = matched.value;

        if route.protected {
            if let Err(e) =
                auth::check_bearer(&parts.headers, self.state.settings.auth_token.as_deref())
            {
                tracing::debug!(path = %parts.uri.path(), %e, "rejected unauthenticated request");
                return e.into_response();
            }
        }

        let body = match axum::body::to_bytes(body, MAX_ROUTE_BODY).await {
            Ok(body) => body,
            Err(e) => return ApiError::InvalidRequest(format!("body: {e}")).into_response(),
        };
        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|q| q.0)
            .unwrap_or_default();

        let request = RouteRequest {
            method: parts.method,
            uri: parts.uri,
            params: matched.params,
            query,
            headers: parts.headers,
            body,
            cluster,
        };
        let path = request.uri.path().to_string();
        match route.handler.call(self.state.clone(), request).await {
            Ok(response) => response.into_response(),
            Err(e) => {
                if e.status_code().is_server_error() {
                    tracing::error!(%path, %e, "request failed");
                } else {
                    tracing::debug!(%path, %e, "request rejected");
                }
                e.into_response()
            }
        }
    }

    fn set_csp(&self, response: &mut Response) {
        response.headers_mut().insert(
            header::CONTENT_SECURITY_POLICY,
            self.state.settings.content_security_policy.clone(),
        );
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

impl<B> Service<Request<B>> for Dispatcher
where
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<Response, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let req = req.map(Body::new);
            match AssertUnwindSafe(this.dispatch(req)).catch_unwind().await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("request handler panicked: {:?}", e);
                    Ok((StatusCode::INTERNAL_SERVER_ERROR, "Internal error.").into_response())
                }
            }
        })
    }
}

/// Accept connections on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher, shutdown: CancellationToken) {
    let service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .service(dispatcher);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(%e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection_with_upgrades(io, TowerToHyperService::new(service));
                    if let Err(e) = conn.await {
                        tracing::debug!(%peer, %e, "connection closed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterStore;
    use crate::config::ClusterConfig;
    use tower::ServiceExt; // for oneshot()

    const TOKEN: &str = "internal-token";

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: Some(dir.to_path_buf()),
            auth_token: Some(TOKEN.to_string()),
            kubectl_path: Some("kubectl".into()),
            helm_path: Some("helm".into()),
            clusters: vec![ClusterConfig {
                id: "c1".into(),
                name: Some("Cluster One".into()),
                server: "http://127.0.0.1:1".into(),
                token: None,
                ca_cert: None,
                client_cert: None,
                client_key: None,
                insecure_skip_tls_verify: false,
                proxy_url: None,
                kubeconfig: None,
                proxy_kubeconfig: None,
                terminal_cwd: None,
            }],
            ..Config::default()
        }
    }

    fn create_test_dispatcher() -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(InMemoryClusterStore::new(config.build_clusters()));
        let state = AppState::new(&config, store, CancellationToken::new()).unwrap();
        (Dispatcher::new(state).unwrap(), dir)
    }

    fn get(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn text(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn version_has_csp() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let response = dispatcher
            .oneshot(get("/version", "127.0.0.1:9000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_SECURITY_POLICY], DEFAULT_CSP);
        let json: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let req = Request::builder()
            .method("POST")
            .uri("/nope")
            .header(header::HOST, "localhost")
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(header::CONTENT_SECURITY_POLICY));
    }

    #[tokio::test]
    async fn protected_route_requires_token() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let response = dispatcher
            .clone()
            .oneshot(get("/api/clusters", "localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(text(response).await.starts_with("Authentication required"));

        let req = Request::builder()
            .uri("/api/clusters")
            .header(header::HOST, "localhost")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        assert_eq!(json[0]["id"], "c1");
        assert_eq!(json[0]["name"], "Cluster One");
        assert_eq!(json[0]["online"], false);
    }

    #[tokio::test]
    async fn shell_token_needs_cluster() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let req = Request::builder()
            .method("POST")
            .uri("/api/shell-token?id=tab-1")
            .header(header::HOST, "localhost:9000")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn shell_token_is_minted_for_subdomain_cluster() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let req = Request::builder()
            .method("POST")
            .uri("/api/shell-token?id=tab-1")
            .header(header::HOST, "c1.localhost:9000")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&text(response).await).unwrap();
        let token = json["token"].as_str().unwrap();
        assert!(dispatcher.state().shells.tokens.validate("c1", "tab-1", token));
    }

    #[tokio::test]
    async fn closing_unknown_shell_is_404() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let req = Request::builder()
            .method("DELETE")
            .uri("/api/shells/tab-9")
            .header(header::HOST, "localhost")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let response = dispatcher.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxy_transport_error_is_plain_500_without_csp() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let req = Request::builder()
            .method("POST")
            .uri("/c1/api/v1/namespaces")
            .header(header::HOST, "127.0.0.1:9000")
            .body(Body::from("{}"))
            .unwrap();
        let response = dispatcher.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::CONTENT_SECURITY_POLICY));
        assert!(text(response).await.starts_with("upstream request failed"));
    }

    #[tokio::test]
    async fn kube_prefix_without_cluster_is_not_proxied() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let response = dispatcher
            .oneshot(get("/api-kube/api/v1/pods", "localhost"))
            .await
            .unwrap();
        // Falls through to the static UI.
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::CONTENT_SECURITY_POLICY));
    }

    fn upgrade_request(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn upgrade_without_route_is_dropped() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let result = dispatcher
            .oneshot(upgrade_request("/nowhere", "c1.localhost"))
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::Upgrade(UpgradeError::NoRoute(_)))
        ));
    }

    #[tokio::test]
    async fn upgrade_without_cluster_is_dropped() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let result = dispatcher
            .oneshot(upgrade_request("/shell?id=t1&shellToken=x", "localhost"))
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::Upgrade(UpgradeError::NoCluster))
        ));
    }

    #[tokio::test]
    async fn shell_upgrade_with_bad_token_is_dropped() {
        let (dispatcher, _dir) = create_test_dispatcher();
        dispatcher.state().shells.tokens.create("c1", "t1").unwrap();
        let result = dispatcher
            .clone()
            .oneshot(upgrade_request("/shell?id=t1&shellToken=wrong", "c1.localhost"))
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::Upgrade(UpgradeError::TokenRejected(_)))
        ));
        // The failed attempt consumed the pending token.
        assert_eq!(dispatcher.state().shells.tokens.pending(), 0);
        assert!(dispatcher.state().shells.registry.is_empty());
    }

    #[tokio::test]
    async fn shell_upgrade_without_id_is_dropped() {
        let (dispatcher, _dir) = create_test_dispatcher();
        let result = dispatcher
            .oneshot(upgrade_request("/shell", "c1.localhost"))
            .await;
        assert!(matches!(
            result,
            Err(DispatchError::Upgrade(UpgradeError::InvalidTerminal(_)))
        ));
    }

    #[test]
    fn host_falls_back_to_authority() {
        let req = Request::builder()
            .uri("http://c1.localhost:9000/version")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("c1.localhost:9000"));
    }
}
