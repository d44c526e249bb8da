//! Managed clusters and the store that owns them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Connection details for a cluster's API server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Base URL, e.g. `https://10.0.0.1:6443`. No trailing slash.
    pub server: String,
    pub token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    /// Outbound HTTP(S) proxy used to reach the API server.
    pub proxy_url: Option<String>,
}

/// A cluster the proxy fronts.
#[derive(Debug)]
pub struct Cluster {
    pub id: String,
    pub name: Option<String>,
    pub api: ApiEndpoint,
    pub kubeconfig_path: PathBuf,
    /// Kubeconfig that points `kubectl` back at this proxy.
    pub proxy_kubeconfig_path: PathBuf,
    /// Preferred working directory for shells opened on this cluster.
    pub terminal_cwd: Option<PathBuf>,
    accessible: AtomicBool,
    online: AtomicBool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClusterSummary {
    pub id: String,
    pub name: String,
    pub server: String,
    pub online: bool,
    pub accessible: bool,
}

impl Cluster {
    pub fn new(
        id: impl Into<String>,
        api: ApiEndpoint,
        kubeconfig_path: PathBuf,
        proxy_kubeconfig_path: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            api,
            kubeconfig_path,
            proxy_kubeconfig_path,
            terminal_cwd: None,
            accessible: AtomicBool::new(false),
            online: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_terminal_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.terminal_cwd = cwd;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Acquire)
    }

    /// Only the connectivity monitor calls this.
    pub(crate) fn set_status(&self, online: bool, accessible: bool) {
        self.online.store(online, Ordering::Release);
        self.accessible.store(accessible, Ordering::Release);
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            server: self.api.server.clone(),
            online: self.is_online(),
            accessible: self.is_accessible(),
        }
    }
}

/// Lookup interface over the set of managed clusters.
pub trait ClusterStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Arc<Cluster>>;
    fn list(&self) -> Vec<Arc<Cluster>>;
}

/// A fixed set of clusters, usually built from the config file.
#[derive(Default)]
pub struct InMemoryClusterStore {
    clusters: HashMap<String, Arc<Cluster>>,
    order: Vec<String>,
}

impl InMemoryClusterStore {
    pub fn new(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let mut store = Self::default();
        for cluster in clusters {
            if store.clusters.contains_key(&cluster.id) {
                tracing::warn!(cluster = %cluster.id, "duplicate cluster id, keeping the first");
                continue;
            }
            store.order.push(cluster.id.clone());
            store.clusters.insert(cluster.id.clone(), Arc::new(cluster));
        }
        store
    }
}

impl ClusterStore for InMemoryClusterStore {
    fn get(&self, id: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(id).cloned()
    }

    fn list(&self) -> Vec<Arc<Cluster>> {
        self.order
            .iter()
            .filter_map(|id| self.clusters.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str) -> Cluster {
        Cluster::new(
            id,
            ApiEndpoint {
                server: "https://127.0.0.1:6443".into(),
                ..Default::default()
            },
            PathBuf::from("/tmp/kubeconfig"),
            PathBuf::from(format!("/tmp/{id}-proxy")),
        )
    }

    #[test]
    fn store_preserves_order_and_skips_duplicates() {
        let mut dup = cluster("a");
        dup.name = Some("duplicate".into());
        let store = InMemoryClusterStore::new([cluster("b"), cluster("a"), dup]);
        let ids: Vec<_> = store.list().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(store.get("a").unwrap().name.is_none());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn status_flags_start_false() {
        let c = cluster("a");
        assert!(!c.is_online());
        assert!(!c.is_accessible());
        c.set_status(true, false);
        let summary = c.summary();
        assert!(summary.online);
        assert!(!summary.accessible);
        assert_eq!(summary.name, "a");
    }
}
