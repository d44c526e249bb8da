use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Upper bound for a single `helm upgrade`.
const HELM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum HelmError {
    #[error("failed to write values file: {0}")]
    Values(#[source] std::io::Error),

    #[error("failed to run helm: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("helm timed out after {0:?}")]
    Timeout(Duration),

    #[error("helm exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Body of `PUT /api/v2/releases/{namespace}/{release}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpgradeRequest {
    pub chart: String,
    pub version: String,
    #[serde(default)]
    pub values: serde_json::Value,
}

impl UpgradeRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.chart.trim().is_empty() {
            return Err("chart must not be empty".into());
        }
        if self.version.trim().is_empty() {
            return Err("version must not be empty".into());
        }
        if self.values.is_null() {
            return Err("values is required".into());
        }
        Ok(())
    }
}

/// Runs helm against a cluster through its proxy kubeconfig.
#[derive(Debug, Clone)]
pub struct HelmRunner {
    helm: PathBuf,
    scratch: PathBuf,
}

impl HelmRunner {
    pub fn new(helm: PathBuf, scratch: PathBuf) -> Self {
        Self { helm, scratch }
    }

    pub fn upgrade_args(
        namespace: &str,
        release: &str,
        req: &UpgradeRequest,
        values_file: &Path,
        kubeconfig: &Path,
    ) -> Vec<String> {
        vec![
            "upgrade".into(),
            release.into(),
            req.chart.clone(),
            "--version".into(),
            req.version.clone(),
            "--namespace".into(),
            namespace.into(),
            "--values".into(),
            values_file.to_string_lossy().into_owned(),
            "--kubeconfig".into(),
            kubeconfig.to_string_lossy().into_owned(),
        ]
    }

    /// `helm upgrade`; returns helm's stdout.
    pub async fn upgrade(
        &self,
        namespace: &str,
        release: &str,
        req: &UpgradeRequest,
        kubeconfig: &Path,
    ) -> Result<String, HelmError> {
        tokio::fs::create_dir_all(&self.scratch)
            .await
            .map_err(HelmError::Values)?;
        // JSON is valid YAML, so helm reads it as a values file.
        let values_file = self
            .scratch
            .join(format!("values-{}.json", uuid::Uuid::new_v4()));
        let values = serde_json::to_vec_pretty(&req.values)
            .map_err(|e| HelmError::Values(std::io::Error::other(e)))?;
        tokio::fs::write(&values_file, values)
            .await
            .map_err(HelmError::Values)?;

        let result = self.run(namespace, release, req, &values_file, kubeconfig).await;

        if let Err(e) = tokio::fs::remove_file(&values_file).await {
            tracing::debug!(path = %values_file.display(), %e, "failed to remove values file");
        }
        result
    }

    async fn run(
        &self,
        namespace: &str,
        release: &str,
        req: &UpgradeRequest,
        values_file: &Path,
        kubeconfig: &Path,
    ) -> Result<String, HelmError> {
        let args = Self::upgrade_args(namespace, release, req, values_file, kubeconfig);
        tracing::info!(release, namespace, chart = %req.chart, version = %req.version, "helm upgrade");

        let output = tokio::process::Command::new(&self.helm)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(HELM_TIMEOUT, output)
            .await
            .map_err(|_| HelmError::Timeout(HELM_TIMEOUT))?
            .map_err(HelmError::Spawn)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(HelmError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
