//! Connectivity monitor: the only writer of a cluster's `online` and
//! `accessible` flags.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::api::proxy::KubeProxy;
use crate::cluster::{Cluster, ClusterStore};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// The API server answered at all.
    pub online: bool,
    /// The answer was a 2xx.
    pub accessible: bool,
}

/// Probe `GET <server>/version` and record the result on `cluster`.
pub async fn check(proxy: &KubeProxy, cluster: &Cluster) -> Status {
    let status = probe(proxy, cluster).await;
    if status.online != cluster.is_online() || status.accessible != cluster.is_accessible() {
        tracing::info!(
            cluster = %cluster.id,
            online = status.online,
            accessible = status.accessible,
            "cluster status changed"
        );
    }
    cluster.set_status(status.online, status.accessible);
    status
}

async fn probe(proxy: &KubeProxy, cluster: &Cluster) -> Status {
    let offline = Status {
        online: false,
        accessible: false,
    };
    let client = match proxy.client(cluster) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(cluster = %cluster.id, %e, "cannot build client for health check");
            return offline;
        }
    };

    let mut req = client
        .get(format!("{}/version", cluster.api.server))
        .timeout(CHECK_TIMEOUT);
    if let Some(token) = &cluster.api.token {
        req = req.bearer_auth(token);
    }
    match req.send().await {
        Ok(resp) => Status {
            online: true,
            accessible: resp.status().is_success(),
        },
        Err(e) => {
            tracing::debug!(cluster = %cluster.id, %e, "health check failed");
            offline
        }
    }
}

/// Check every cluster now and then every `interval` until `shutdown`.
pub async fn run(
    store: Arc<dyn ClusterStore>,
    proxy: Arc<KubeProxy>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let clusters = store.list();
                join_all(clusters.iter().map(|c| check(&proxy, c))).await;
            }
        }
    }
}
