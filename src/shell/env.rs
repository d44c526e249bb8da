//! Computes the environment a cluster's shell is launched with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use super::args::{shell_launch, Exports};
use crate::cluster::Cluster;

/// Upper bound on how long a login shell may take to print its environment.
const LOGIN_ENV_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_START: &str = "__KUBEBRIDGE_ENV_START__";
const ENV_END: &str = "__KUBEBRIDGE_ENV_END__";

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

const NO_PROXY_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("failed to write shell init files: {0}")]
    InitFiles(#[from] std::io::Error),

    #[error("environment task failed: {0}")]
    Join(String),
}

/// Program, flags and variables for a cluster's shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellEnv {
    pub shell: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Anything that can produce a [`ShellEnv`] for a cluster.
pub trait EnvSource: Send + Sync + 'static {
    fn compute(&self, cluster: Arc<Cluster>) -> BoxFuture<'static, Result<ShellEnv, EnvError>>;
}

/// Remove every variable named `kubeconfig`, in any case. Full-key match only.
pub fn clear_kubeconfig_env_vars(env: &mut BTreeMap<String, String>) {
    env.retain(|key, _| !key.eq_ignore_ascii_case("kubeconfig"));
}

/// Key actually used for `name` in `env`, matching case-insensitively.
fn existing_key(env: &BTreeMap<String, String>, name: &str) -> String {
    env.keys()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()
        .unwrap_or_else(|| name.to_string())
}

/// Put `dir` at the front of `PATH` (or `Path` on Windows).
pub fn prepend_path(env: &mut BTreeMap<String, String>, dir: &Path) {
    let key = existing_key(env, "PATH");
    let dir = dir.to_string_lossy();
    let value = match env.get(&key) {
        Some(current) if !current.is_empty() => format!("{dir}{PATH_SEPARATOR}{current}"),
        _ => dir.into_owned(),
    };
    env.insert(key, value);
}

/// Add the loopback hosts to `NO_PROXY` so `kubectl` reaches us directly.
pub fn merge_no_proxy(env: &mut BTreeMap<String, String>) {
    let key = existing_key(env, "NO_PROXY");
    let mut hosts: Vec<String> = env
        .get(&key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for host in NO_PROXY_HOSTS {
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
    env.insert(key, hosts.join(","));
}

/// Extract the `env -0` block printed between the markers.
pub fn parse_login_env(stdout: &[u8]) -> Option<BTreeMap<String, String>> {
    let text = String::from_utf8_lossy(stdout);
    let start = text.find(ENV_START)? + ENV_START.len();
    let end = start + text[start..].find(ENV_END)?;
    let block = text[start..end].trim_start_matches(['\n', '\r']);

    let env: BTreeMap<String, String> = block
        .split('\0')
        .filter_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            let k = k.trim_start_matches(['\n', '\r']);
            (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
        })
        .collect();
    (!env.is_empty()).then_some(env)
}

/// Run `shell` as an interactive login shell and capture its environment.
#[cfg(unix)]
pub async fn capture_login_env(shell: &str) -> Option<BTreeMap<String, String>> {
    let script = format!("printf '%s' '{ENV_START}'; env -0; printf '%s' '{ENV_END}'");
    let child = tokio::process::Command::new(shell)
        .arg("-ilc")
        .arg(&script)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(LOGIN_ENV_TIMEOUT, child).await {
        Ok(Ok(output)) => {
            let env = parse_login_env(&output.stdout);
            if env.is_none() {
                tracing::warn!(shell, "login shell printed no environment");
            }
            env
        }
        Ok(Err(e)) => {
            tracing::warn!(shell, %e, "failed to run login shell");
            None
        }
        Err(_) => {
            tracing::warn!(shell, "login shell timed out printing its environment");
            None
        }
    }
}

#[cfg(not(unix))]
pub async fn capture_login_env(_shell: &str) -> Option<BTreeMap<String, String>> {
    None
}

#[cfg(unix)]
fn shell_from_passwd() -> Option<String> {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()?;
    let prefix = format!("{user}:");
    let contents = std::fs::read_to_string("/etc/passwd").ok()?;
    let line = contents.lines().find(|l| l.starts_with(&prefix))?;
    let shell = line.rsplit(':').next()?.trim();
    (!shell.is_empty() && Path::new(shell).is_file()).then(|| shell.to_string())
}

/// The user's preferred shell.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        return std::env::var("COMSPEC")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "powershell.exe".to_string());
    }

    #[cfg(not(windows))]
    {
        if let Ok(shell) = std::env::var("SHELL") {
            let trimmed = shell.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
        if let Some(shell) = shell_from_passwd() {
            return shell;
        }
        if cfg!(target_os = "macos") {
            return "/bin/zsh".to_string();
        }
        if Path::new("/bin/bash").is_file() {
            "/bin/bash".to_string()
        } else {
            "/bin/sh".to_string()
        }
    }
}

/// Settings for [`EnvResolver`].
#[derive(Debug, Clone)]
pub struct EnvResolverConfig {
    /// Shell override; [`default_shell`] when unset.
    pub shell: Option<String>,
    pub sync_login_env: bool,
    pub kubectl: PathBuf,
    /// Root for generated shell init files.
    pub init_root: PathBuf,
}

/// The production [`EnvSource`].
#[derive(Debug, Clone)]
pub struct EnvResolver {
    config: Arc<EnvResolverConfig>,
}

impl EnvResolver {
    pub fn new(config: EnvResolverConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn shell(&self) -> String {
        self.config.shell.clone().unwrap_or_else(default_shell)
    }

    async fn base_env(&self, shell: &str) -> BTreeMap<String, String> {
        if self.config.sync_login_env {
            if let Some(env) = capture_login_env(shell).await {
                return env;
            }
        }
        std::env::vars().collect()
    }

    /// Apply the cluster-specific variables on top of `base`.
    pub fn apply(&self, mut env: BTreeMap<String, String>, shell: &str, cluster: &Cluster) -> BTreeMap<String, String> {
        clear_kubeconfig_env_vars(&mut env);
        if let Some(dir) = self.config.kubectl.parent().filter(|d| !d.as_os_str().is_empty()) {
            prepend_path(&mut env, dir);
        }
        env.insert(
            "KUBECONFIG".into(),
            cluster.proxy_kubeconfig_path.to_string_lossy().into_owned(),
        );
        merge_no_proxy(&mut env);
        env.insert("TERM".into(), "xterm-256color".into());
        env.insert("TERM_PROGRAM".into(), "kubebridge".into());
        env.insert("TERM_PROGRAM_VERSION".into(), env!("CARGO_PKG_VERSION").into());
        env.insert("PTYSHELL".into(), shell.to_string());
        if cfg!(windows) {
            let key = existing_key(&env, "WSLENV");
            let value = match env.get(&key) {
                Some(v) if !v.is_empty() => format!("{v}:KUBECONFIG/up"),
                _ => "KUBECONFIG/up".to_string(),
            };
            env.insert(key, value);
        }
        env
    }

    pub async fn resolve(&self, cluster: &Cluster) -> Result<ShellEnv, EnvError> {
        let shell = self.shell();
        let base = self.base_env(&shell).await;
        let mut env = self.apply(base, &shell, cluster);

        let exports = Exports {
            path: env.get(&existing_key(&env, "PATH")).cloned().unwrap_or_default(),
            kubeconfig: cluster.proxy_kubeconfig_path.to_string_lossy().into_owned(),
        };
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let user_zdotdir = env.get("ZDOTDIR").map(PathBuf::from);
        let init_dir = self.config.init_root.join(&cluster.id);
        let shell_for_task = shell.clone();
        let launch = tokio::task::spawn_blocking(move || {
            shell_launch(&shell_for_task, &exports, &init_dir, &home, user_zdotdir.as_deref())
        })
        .await
        .map_err(|e| EnvError::Join(e.to_string()))??;

        env.extend(launch.env);
        Ok(ShellEnv {
            shell,
            args: launch.args,
            env,
        })
    }
}

impl EnvSource for EnvResolver {
    fn compute(&self, cluster: Arc<Cluster>) -> BoxFuture<'static, Result<ShellEnv, EnvError>> {
        let resolver = self.clone();
        Box::pin(async move { resolver.resolve(&cluster).await })
    }
}
