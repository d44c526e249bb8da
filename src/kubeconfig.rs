//! Kubeconfigs that point `kubectl` back at the proxy.
//!
//! Each cluster gets a single-context kubeconfig whose server is
//! `http://127.0.0.1:<port>/<cluster id>`. The resolver maps that loopback
//! path onto the cluster's API prefix, so credentials never leave the proxy.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::cluster::Cluster;

const USER_NAME: &str = "kubebridge";

#[derive(Error, Debug)]
pub enum KubeconfigError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize kubeconfig: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: [Named<'a, ClusterEntry>; 1],
    users: [Named<'a, UserRef>; 1],
    contexts: [Named<'a, ContextEntry<'a>>; 1],
    #[serde(rename = "current-context")]
    current_context: &'a str,
    preferences: UserEntry,
}

#[derive(Serialize)]
struct Named<'a, T> {
    name: &'a str,
    #[serde(flatten)]
    entry: T,
}

#[derive(Serialize)]
struct ClusterEntry {
    cluster: ServerEntry,
}

#[derive(Serialize)]
struct ServerEntry {
    server: String,
}

#[derive(Serialize)]
struct UserEntry {}

#[derive(Serialize)]
struct UserRef {
    user: UserEntry,
}

#[derive(Serialize)]
struct ContextEntry<'a> {
    context: ContextRef<'a>,
}

#[derive(Serialize)]
struct ContextRef<'a> {
    cluster: &'a str,
    user: &'a str,
}

/// Server URL that routes back through the proxy listening on `addr`.
pub fn proxy_server_url(addr: SocketAddr, cluster_id: &str) -> String {
    format!("http://127.0.0.1:{}/{}", addr.port(), cluster_id)
}

/// Render the proxy kubeconfig for `cluster`. JSON is valid YAML, so
/// `kubectl` and `helm` read it as-is.
pub fn render(cluster_id: &str, server: String) -> Result<String, KubeconfigError> {
    let config = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: [Named {
            name: cluster_id,
            entry: ClusterEntry {
                cluster: ServerEntry { server },
            },
        }],
        users: [Named {
            name: USER_NAME,
            entry: UserRef { user: UserEntry {} },
        }],
        contexts: [Named {
            name: cluster_id,
            entry: ContextEntry {
                context: ContextRef {
                    cluster: cluster_id,
                    user: USER_NAME,
                },
            },
        }],
        current_context: cluster_id,
        preferences: UserEntry {},
    };
    Ok(serde_json::to_string_pretty(&config)?)
}

/// Write `cluster`'s proxy kubeconfig for a listener bound to `addr`.
pub fn write_proxy_kubeconfig(cluster: &Cluster, addr: SocketAddr) -> Result<(), KubeconfigError> {
    let path = &cluster.proxy_kubeconfig_path;
    let contents = render(&cluster.id, proxy_server_url(addr, &cluster.id))?;
    let write = |source| KubeconfigError::Write {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write)?;
    }
    std::fs::write(path, contents).map_err(write)?;
    tracing::debug!(cluster = %cluster.id, path = %path.display(), "wrote proxy kubeconfig");
    Ok(())
}
