//! Forwarding of Kubernetes API requests to a cluster's API server.
//!
//! Requests under [`KUBE_API_PREFIX`] are stripped of the prefix, stripped of
//! client credentials, and replayed against the cluster's `server` with the
//! cluster's own bearer token and TLS material. Responses are streamed back
//! unchanged apart from hop-by-hop headers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::OriginalUri;
use axum::http::{header, HeaderMap, HeaderName, Method, Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cluster::{ApiEndpoint, Cluster};
use crate::config::RetryConfig;
use crate::resolver::query_param;

/// Path prefix under which the Kubernetes API of a cluster is exposed.
pub const KUBE_API_PREFIX: &str = "/api-kube";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const LONG_RUNNING_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Request bodies are buffered so that GETs can be replayed.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to read {path}: {source}")]
    ReadPem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("not a Kubernetes API path: {0}")]
    NotKubePath(String),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    #[error("gave up after {attempts} attempts, last answer: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Strip [`KUBE_API_PREFIX`], returning the upstream path.
pub fn strip_kube_prefix(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(KUBE_API_PREFIX)?;
    if rest.is_empty() {
        Some("/")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

pub fn is_kube_path(path: &str) -> bool {
    strip_kube_prefix(path).is_some()
}

/// Watches and log follows stay open for a long time.
pub fn is_long_running(query: Option<&str>) -> bool {
    ["watch", "follow"]
        .iter()
        .any(|key| matches!(query_param(query, key), Some("true" | "1")))
}

/// Where a single proxied request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub url: String,
    pub long_running: bool,
}

impl ProxyTarget {
    pub fn from_uri(server: &str, uri: &Uri) -> Option<Self> {
        let path = strip_kube_prefix(uri.path())?;
        let mut url = format!("{}{}", server.trim_end_matches('/'), path);
        if let Some(query) = uri.query() {
            url.push('?');
            url.push_str(query);
        }
        Some(Self {
            url,
            long_running: is_long_running(uri.query()),
        })
    }

    pub fn timeout(&self) -> Duration {
        if self.long_running {
            LONG_RUNNING_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        }
    }
}

/// Attempt counts per request fingerprint (`host + original URL`).
#[derive(Debug, Default)]
pub struct RetryCounters {
    inner: Mutex<HashMap<String, u32>>,
}

impl RetryCounters {
    /// Bump and return the attempt count for `key`.
    pub fn increment(&self, key: &str) -> u32 {
        let mut map = self.inner.lock();
        let count = map.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.inner.lock().get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers to send upstream: everything except credentials, `Host`,
/// hop-by-hop headers and the length (reqwest sets it from the body).
pub fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if *name == header::AUTHORIZATION
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || is_hop_by_hop(name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn fingerprint<B>(req: &Request<B>) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let url = req
        .extensions()
        .get::<OriginalUri>()
        .map(|original| original.0.to_string())
        .unwrap_or_else(|| req.uri().to_string());
    format!("{host}{url}")
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ProxyError> {
    std::fs::read(path).map_err(|source| ProxyError::ReadPem {
        path: path.to_path_buf(),
        source,
    })
}

fn build_client(api: &ApiEndpoint) -> Result<reqwest::Client, ProxyError> {
    let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

    if let Some(ca) = &api.ca_cert {
        let cert = reqwest::Certificate::from_pem(&read_pem(ca)?).map_err(ProxyError::Client)?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(cert), Some(key)) = (&api.client_cert, &api.client_key) {
        let mut pem = read_pem(cert)?;
        pem.push(b'\n');
        pem.extend(read_pem(key)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(ProxyError::Client)?;
        builder = builder.identity(identity);
    }
    if api.insecure_skip_tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder = match &api.proxy_url {
        Some(url) => builder.proxy(reqwest::Proxy::all(url).map_err(ProxyError::Client)?),
        None => builder.no_proxy(),
    };

    builder.build().map_err(ProxyError::Client)
}

/// Forwards requests to cluster API servers, caching one client per cluster.
pub struct KubeProxy {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    retries: RetryCounters,
    retry: RetryConfig,
}

impl KubeProxy {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            retries: RetryCounters::default(),
            retry,
        }
    }

    pub fn retry_counters(&self) -> &RetryCounters {
        &self.retries
    }

    pub(crate) fn client(&self, cluster: &Cluster) -> Result<reqwest::Client, ProxyError> {
        if let Some(client) = self.clients.lock().get(&cluster.id) {
            return Ok(client.clone());
        }
        let client = build_client(&cluster.api)?;
        self.clients
            .lock()
            .insert(cluster.id.clone(), client.clone());
        Ok(client)
    }

    /// Drop the cached client, e.g. after the cluster's credentials change.
    pub fn invalidate(&self, cluster_id: &str) {
        self.clients.lock().remove(cluster_id);
    }

    /// Proxy `req` to `cluster`. Never fails: errors become a 500 response.
    pub async fn forward(&self, cluster: &Arc<Cluster>, req: Request<Body>) -> Response<Body> {
        match self.try_forward(cluster, req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(cluster = %cluster.id, %e, "proxy request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }

    async fn try_forward(
        &self,
        cluster: &Cluster,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let fingerprint = fingerprint(&req);
        let (parts, body) = req.into_parts();
        let target = ProxyTarget::from_uri(&cluster.api.server, &parts.uri)
            .ok_or_else(|| ProxyError::NotKubePath(parts.uri.path().to_string()))?;
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;
        let client = self.client(cluster)?;
        let headers = upstream_headers(&parts.headers);
        let method = parts.method;

        loop {
            let mut request = client
                .request(method.clone(), &target.url)
                .headers(headers.clone())
                .timeout(target.timeout())
                .body(body.clone());
            if let Some(token) = &cluster.api.token {
                request = request.bearer_auth(token);
            }
            let result = request.send().await;

            let retryable = method == Method::GET
                && match &result {
                    Err(_) => true,
                    Ok(resp) => resp.status().is_server_error(),
                };
            if !retryable {
                self.retries.clear(&fingerprint);
                return match result {
                    Ok(resp) => Ok(stream_response(resp)),
                    Err(e) => Err(ProxyError::Upstream(e)),
                };
            }

            // The first send counts towards the ceiling.
            let attempt = self.retries.increment(&fingerprint);
            if attempt >= self.retry.max_retries {
                self.retries.clear(&fingerprint);
                tracing::warn!(cluster = %cluster.id, url = %target.url, attempt, "giving up on proxied GET");
                let last = match result {
                    Ok(resp) => resp.status().to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(ProxyError::RetriesExhausted {
                    attempts: attempt,
                    last,
                });
            }

            let delay = Duration::from_millis(self.retry.backoff_ms.saturating_mul(u64::from(attempt)));
            tracing::debug!(
                cluster = %cluster.id,
                url = %target.url,
                attempt,
                ?delay,
                "retrying proxied GET"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn stream_response(resp: reqwest::Response) -> Response<Body> {
    let status = resp.status();
    let mut headers = HeaderMap::with_capacity(resp.headers().len());
    for (name, value) in resp.headers() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
