//! Maps an incoming request's host and URL to a managed cluster.
//!
//! Two addressing schemes are supported:
//!
//! - Loopback hosts (`127.0.0.1`, `::1`, `localhost`): the first path segment
//!   names the cluster (`/<id>/api/v1/pods`), and the request is rewritten to
//!   the Kubernetes API prefix. If the segment is not a known cluster, the
//!   `clusterId` query parameter is consulted instead.
//! - Any other host: the first DNS label names the cluster
//!   (`<id>.localhost:port`).

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::Uri;

use crate::api::proxy::KUBE_API_PREFIX;
use crate::cluster::{Cluster, ClusterStore};

#[derive(Debug)]
pub struct Resolution {
    pub cluster: Arc<Cluster>,
    /// Set when the path-segment form matched and the URL was rewritten.
    pub rewritten: Option<Uri>,
}

#[derive(Clone)]
pub struct ClusterResolver {
    store: Arc<dyn ClusterStore>,
}

/// Strip an optional port from a `Host` header value. Handles bracketed IPv6.
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    // A bare IPv6 address has more than one colon and no port.
    if host.matches(':').count() > 1 {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

pub fn is_loopback_host(host: &str) -> bool {
    let name = strip_port(host);
    if name.eq_ignore_ascii_case("localhost") {
        return true;
    }
    name.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Look up a single query parameter by exact key.
pub fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}

impl ClusterResolver {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn resolve(&self, host: Option<&str>, uri: &Uri) -> Option<Resolution> {
        let host = host?;
        if is_loopback_host(host) {
            self.resolve_loopback(uri)
        } else {
            self.resolve_subdomain(host)
        }
    }

    fn resolve_loopback(&self, uri: &Uri) -> Option<Resolution> {
        let path = uri.path();
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let first = trimmed.split('/').next().unwrap_or("");

        if !first.is_empty() {
            if let Some(cluster) = self.store.get(first) {
                let rest = &trimmed[first.len()..];
                let mut rewritten = format!("{KUBE_API_PREFIX}{rest}");
                if let Some(query) = uri.query() {
                    rewritten.push('?');
                    rewritten.push_str(query);
                }
                return match rewritten.parse::<Uri>() {
                    Ok(rewritten) => Some(Resolution {
                        cluster,
                        rewritten: Some(rewritten),
                    }),
                    Err(e) => {
                        tracing::debug!(?e, path, "rewritten cluster path is not a valid URI");
                        None
                    }
                };
            }
        }

        let id = query_param(uri.query(), "clusterId")?;
        self.store.get(id).map(|cluster| Resolution {
            cluster,
            rewritten: None,
        })
    }

    fn resolve_subdomain(&self, host: &str) -> Option<Resolution> {
        let name = strip_port(host);
        if name.parse::<IpAddr>().is_ok() {
            return None;
        }
        let (label, rest) = name.split_once('.')?;
        if label.is_empty() || rest.is_empty() {
            return None;
        }
        self.store.get(label).map(|cluster| Resolution {
            cluster,
            rewritten: None,
        })
    }
}
