//! Stale-while-revalidate cache of per-cluster shell environments.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::env::{EnvError, EnvSource, ShellEnv};
use crate::cluster::Cluster;

/// Per-cluster shell environments, served stale while a refresh runs.
///
/// A hit returns the cached value at once and recomputes in the background;
/// refreshes are never cancelled and the last one to finish wins. A miss
/// computes, stores and returns.
#[derive(Clone)]
pub struct EnvCache {
    source: Arc<dyn EnvSource>,
    entries: Arc<RwLock<HashMap<String, Arc<ShellEnv>>>>,
}

impl EnvCache {
    pub fn new(source: Arc<dyn EnvSource>) -> Self {
        Self {
            source,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cached value without any I/O.
    pub fn peek(&self, cluster_id: &str) -> Option<Arc<ShellEnv>> {
        self.entries.read().get(cluster_id).cloned()
    }

    pub async fn get(&self, cluster: &Arc<Cluster>) -> Result<Arc<ShellEnv>, EnvError> {
        if let Some(env) = self.peek(&cluster.id) {
            self.spawn_refresh(Arc::clone(cluster));
            return Ok(env);
        }

        let env = Arc::new(self.source.compute(Arc::clone(cluster)).await?);
        self.entries
            .write()
            .insert(cluster.id.clone(), Arc::clone(&env));
        Ok(env)
    }

    fn spawn_refresh(&self, cluster: Arc<Cluster>) {
        let source = Arc::clone(&self.source);
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            match source.compute(Arc::clone(&cluster)).await {
                Ok(env) => {
                    entries.write().insert(cluster.id.clone(), Arc::new(env));
                }
                Err(e) => {
                    tracing::warn!(cluster = %cluster.id, %e, "shell environment refresh failed");
                }
            }
        });
    }

    pub fn invalidate(&self, cluster_id: &str) {
        self.entries.write().remove(cluster_id);
    }
}
