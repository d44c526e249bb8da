use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::{ApiEndpoint, Cluster};

/// Default Content-Security-Policy for responses served by the proxy itself.
pub const DEFAULT_CSP: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; img-src 'self' data:; connect-src 'self' ws: wss:; frame-ancestors 'none'";

/// Default image for node shells.
pub const DEFAULT_NODE_SHELL_IMAGE: &str = "docker.io/library/alpine";

/// Top-level config, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address for the HTTP/WebSocket listener. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Directory for generated kubeconfigs and shell init files.
    pub data_dir: Option<PathBuf>,
    pub content_security_policy: String,
    /// Bearer token required by the internal API routes.
    pub auth_token: Option<String>,
    /// When set, static assets are proxied here instead of served embedded.
    pub dev_asset_server: Option<String>,
    /// Explicit kubectl binary; resolved from `PATH` when unset.
    pub kubectl_path: Option<PathBuf>,
    /// Explicit helm binary; resolved from `PATH` when unset.
    pub helm_path: Option<PathBuf>,
    pub health_interval_secs: u64,
    pub shell: ShellConfig,
    pub retry: RetryConfig,
    pub clusters: Vec<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_dir: None,
            content_security_policy: DEFAULT_CSP.to_string(),
            auth_token: None,
            dev_asset_server: None,
            kubectl_path: None,
            helm_path: None,
            health_interval_secs: 30,
            shell: ShellConfig::default(),
            retry: RetryConfig::default(),
            clusters: Vec::new(),
        }
    }
}

/// `[shell]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell program; the user's login shell when unset.
    pub shell: Option<String>,
    /// Capture the environment of a login shell instead of inheriting ours.
    pub sync_login_env: bool,
    pub node_shell_image: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: None,
            sync_login_env: cfg!(unix),
            node_shell_image: DEFAULT_NODE_SHELL_IMAGE.to_string(),
        }
    }
}

/// `[retry]` section. Applies to proxied GET requests only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total sends of a failing GET, counting the first one.
    pub max_retries: u32,
    /// Backoff step; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            backoff_ms: 250,
        }
    }
}

/// A single `[[clusters]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    pub name: Option<String>,
    /// API server URL.
    pub server: String,
    pub token: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    pub proxy_url: Option<String>,
    /// Source kubeconfig for this cluster; `~/.kube/config` when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Where to write the kubeconfig that points back at the proxy.
    pub proxy_kubeconfig: Option<PathBuf>,
    pub terminal_cwd: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn into_cluster(self, data_dir: &Path) -> Cluster {
        let kubeconfig_path = self.kubeconfig.unwrap_or_else(default_kubeconfig_path);
        let proxy_kubeconfig_path = self
            .proxy_kubeconfig
            .unwrap_or_else(|| data_dir.join("kubeconfigs").join(format!("{}-proxy.yaml", self.id)));
        Cluster::new(
            self.id,
            ApiEndpoint {
                server: self.server.trim_end_matches('/').to_string(),
                token: self.token,
                ca_cert: self.ca_cert,
                client_cert: self.client_cert,
                client_key: self.client_key,
                insecure_skip_tls_verify: self.insecure_skip_tls_verify,
                proxy_url: self.proxy_url,
            },
            kubeconfig_path,
            proxy_kubeconfig_path,
        )
        .with_name(self.name)
        .with_terminal_cwd(self.terminal_cwd)
    }
}

fn default_kubeconfig_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kube")
        .join("config")
}

/// Default config file location: `<config dir>/kubebridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kubebridge")
        .join("config.toml")
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Cluster entries may carry bearer tokens.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Data directory, falling back to `<data dir>/kubebridge`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("kubebridge")
        })
    }

    /// Locate kubectl: the configured path, else the first match on `PATH`.
    pub fn kubectl(&self) -> PathBuf {
        resolve_binary(self.kubectl_path.as_deref(), "kubectl")
    }

    pub fn helm(&self) -> PathBuf {
        resolve_binary(self.helm_path.as_deref(), "helm")
    }

    pub fn build_clusters(&self) -> Vec<Cluster> {
        let data_dir = self.data_dir();
        self.clusters
            .iter()
            .cloned()
            .map(|c| c.into_cluster(&data_dir))
            .collect()
    }
}

fn resolve_binary(configured: Option<&Path>, name: &str) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    match which::which(name) {
        Ok(path) => path,
        Err(e) => {
            tracing::debug!(binary = name, %e, "not found on PATH, using bare name");
            PathBuf::from(name)
        }
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain cluster tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
