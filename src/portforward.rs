//! `kubectl port-forward` children, keyed by target.
//!
//! Each forward runs `kubectl` against the cluster's proxy kubeconfig and is
//! considered started once kubectl prints its `Forwarding from` line. A
//! monitor task owns the child; it removes the entry when the child exits
//! and kills the child when the forward is stopped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;

const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum PortForwardError {
    #[error("no free local port: {0}")]
    NoFreePort(#[source] std::io::Error),

    #[error("failed to start kubectl: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("kubectl port-forward exited: {0}")]
    Exited(String),

    #[error("kubectl port-forward not ready after {0:?}")]
    Timeout(Duration),
}

/// Identity of a forward. `forwardPort` is the value, not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardKey {
    pub cluster_id: String,
    pub namespace: String,
    pub resource_type: String,
    pub resource_name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardInfo {
    #[serde(flatten)]
    pub key: ForwardKey,
    pub forward_port: u16,
    pub pid: Option<u32>,
}

struct Forward {
    id: u64,
    forward_port: u16,
    pid: Option<u32>,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Ask the OS for a free loopback port.
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

pub fn port_forward_args(kubeconfig: &Path, key: &ForwardKey, forward_port: u16) -> Vec<String> {
    vec![
        "port-forward".to_string(),
        "--kubeconfig".to_string(),
        kubeconfig.to_string_lossy().into_owned(),
        "--namespace".to_string(),
        key.namespace.clone(),
        "--address".to_string(),
        "127.0.0.1".to_string(),
        format!("{}/{}", key.resource_type, key.resource_name),
        format!("{}:{}", forward_port, key.port),
    ]
}

#[derive(Clone)]
pub struct PortForwardRegistry {
    kubectl: PathBuf,
    inner: Arc<Mutex<HashMap<ForwardKey, Forward>>>,
    next_id: Arc<AtomicU64>,
}

impl PortForwardRegistry {
    pub fn new(kubectl: PathBuf) -> Self {
        Self {
            kubectl,
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start forwarding, or return the local port of the running forward for
    /// the same key. A `forward_port` of `None` or `0` picks a free port.
    pub async fn start(
        &self,
        cluster: &Cluster,
        key: ForwardKey,
        forward_port: Option<u16>,
    ) -> Result<u16, PortForwardError> {
        if let Some(existing) = self.inner.lock().get(&key) {
            return Ok(existing.forward_port);
        }

        let forward_port = match forward_port {
            Some(port) if port != 0 => port,
            _ => free_port().map_err(PortForwardError::NoFreePort)?,
        };
        let args = port_forward_args(&cluster.proxy_kubeconfig_path, &key, forward_port);
        tracing::info!(
            cluster = %key.cluster_id,
            target = %format!("{}/{}/{}", key.namespace, key.resource_type, key.resource_name),
            port = key.port,
            forward_port,
            "starting port-forward"
        );

        let mut child = Command::new(&self.kubectl)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PortForwardError::Spawn)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill().await;
            return Err(PortForwardError::Exited("kubectl pipes unavailable".into()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(READY_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                tracing::debug!(forward_port, %line, "kubectl port-forward");
                if line.contains("Forwarding from") {
                    return Ok(true);
                }
            }
            Ok::<_, std::io::Error>(false)
        })
        .await;

        match ready {
            Ok(Ok(true)) => {}
            Ok(_) => {
                let _ = child.kill().await;
                return Err(PortForwardError::Exited(read_stderr(stderr).await));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(PortForwardError::Timeout(READY_TIMEOUT));
            }
        }

        // kubectl logs every connection; keep both pipes drained.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!(forward_port, %line, "kubectl port-forward");
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(forward_port, %line, "kubectl port-forward stderr");
            }
        });

        let mut map = self.inner.lock();
        if let Some(existing) = map.get(&key) {
            // Lost a race with a concurrent start; dropping the child kills it.
            return Ok(existing.forward_port);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        let stop = CancellationToken::new();
        let monitor = self.monitor(key.clone(), id, child, stop.clone());
        map.insert(
            key,
            Forward {
                id,
                forward_port,
                pid,
                stop,
                monitor,
            },
        );
        Ok(forward_port)
    }

    fn monitor(&self, key: ForwardKey, id: u64, mut child: Child, stop: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::info!(cluster = %key.cluster_id, port = key.port, ?status, "port-forward exited");
                }
                _ = stop.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(cluster = %key.cluster_id, port = key.port, %e, "failed to kill port-forward");
                    }
                    tracing::info!(cluster = %key.cluster_id, port = key.port, "port-forward stopped");
                }
            }
            let mut map = inner.lock();
            if map.get(&key).is_some_and(|f| f.id == id) {
                map.remove(&key);
            }
        })
    }

    /// Stop the forward for `key`. A non-zero `forward_port` must match.
    pub fn stop(&self, key: &ForwardKey, forward_port: Option<u16>) -> bool {
        let mut map = self.inner.lock();
        let matches = map.get(key).is_some_and(|f| match forward_port {
            Some(port) if port != 0 => f.forward_port == port,
            _ => true,
        });
        if !matches {
            return false;
        }
        match map.remove(key) {
            Some(forward) => {
                forward.stop.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list(&self, cluster_id: &str) -> Vec<ForwardInfo> {
        let mut forwards: Vec<ForwardInfo> = self
            .inner
            .lock()
            .iter()
            .filter(|(key, _)| key.cluster_id == cluster_id)
            .map(|(key, f)| ForwardInfo {
                key: key.clone(),
                forward_port: f.forward_port,
                pid: f.pid,
            })
            .collect();
        forwards.sort_by(|a, b| a.key.cmp(&b.key));
        forwards
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Stop every forward and wait for the children to be killed.
    pub async fn stop_all(&self) {
        let forwards: Vec<Forward> = self.inner.lock().drain().map(|(_, f)| f).collect();
        if forwards.is_empty() {
            return;
        }
        tracing::info!(count = forwards.len(), "stopping port-forwards");
        for forward in &forwards {
            forward.stop.cancel();
        }
        for forward in forwards {
            let _ = forward.monitor.await;
        }
    }
}

async fn read_stderr(stderr: tokio::process::ChildStderr) -> String {
    let mut buf = String::new();
    let mut stderr = stderr;
    let _ = tokio::time::timeout(Duration::from_secs(1), stderr.read_to_string(&mut buf)).await;
    let trimmed = buf.trim();
    if trimmed.is_empty() {
        "no output".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ApiEndpoint;

    fn key(port: u16) -> ForwardKey {
        ForwardKey {
            cluster_id: "c1".into(),
            namespace: "default".into(),
            resource_type: "pods".into(),
            resource_name: "nginx".into(),
            port,
        }
    }

    fn cluster() -> Cluster {
        Cluster::new(
            "c1",
            ApiEndpoint::default(),
            PathBuf::from("/tmp/k"),
            PathBuf::from("/tmp/c1-proxy.yaml"),
        )
    }

    #[test]
    fn args_shape() {
        assert_eq!(
            port_forward_args(Path::new("/tmp/kc"), &key(80), 8080),
            vec![
                "port-forward",
                "--kubeconfig",
                "/tmp/kc",
                "--namespace",
                "default",
                "--address",
                "127.0.0.1",
                "pods/nginx",
                "8080:80"
            ]
        );
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_is_false() {
        let registry = PortForwardRegistry::new(PathBuf::from("kubectl"));
        assert!(!registry.stop(&key(80), None));
    }

    #[tokio::test]
    async fn missing_kubectl_is_spawn_error() {
        let registry = PortForwardRegistry::new(PathBuf::from("/definitely/not/kubectl"));
        let err = registry.start(&cluster(), key(80), Some(18080)).await.unwrap_err();
        assert!(matches!(err, PortForwardError::Spawn(_)));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    fn fake_kubectl(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Prints kubectl's ready line for the last `local:remote` argument.
    #[cfg(unix)]
    const FORWARDING: &str = r#"for a; do last="$a"; done
echo "Forwarding from 127.0.0.1:${last%%:*} -> ${last##*:}""#;

    #[cfg(unix)]
    #[tokio::test]
    async fn start_list_stop() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(dir.path(), &format!("{FORWARDING}\nexec sleep 30"));
        let registry = PortForwardRegistry::new(kubectl);

        let port = registry.start(&cluster(), key(80), Some(18081)).await.unwrap();
        assert_eq!(port, 18081);

        // Same key is idempotent.
        assert_eq!(registry.start(&cluster(), key(80), None).await.unwrap(), 18081);

        let list = registry.list("c1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].forward_port, 18081);
        assert!(list[0].pid.is_some());
        assert!(registry.list("other").is_empty());

        assert!(!registry.stop(&key(80), Some(9999)));
        assert!(registry.stop(&key(80), Some(18081)));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_forward_port_picks_one() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(dir.path(), &format!("{FORWARDING}\nexec sleep 30"));
        let registry = PortForwardRegistry::new(kubectl);
        let port = registry.start(&cluster(), key(443), Some(0)).await.unwrap();
        assert_ne!(port, 0);
        registry.stop_all().await;
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(dir.path(), "echo 'error: pods \"nginx\" not found' >&2; exit 1");
        let registry = PortForwardRegistry::new(kubectl);
        let err = registry.start(&cluster(), key(80), None).await.unwrap_err();
        match err {
            PortForwardError::Exited(msg) => assert!(msg.contains("not found"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let kubectl = fake_kubectl(dir.path(), &format!("{FORWARDING}\nsleep 0.2"));
        let registry = PortForwardRegistry::new(kubectl);
        registry.start(&cluster(), key(80), Some(18082)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "forward never deregistered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
