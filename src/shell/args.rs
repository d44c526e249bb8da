//! Per-shell launch flags that re-apply our `PATH` and `KUBECONFIG` after the
//! user's own startup files have run.

use std::path::{Path, PathBuf};

/// Flags and extra environment for launching a particular shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellLaunch {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Values the shell must end up with regardless of rc files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exports {
    pub path: String,
    pub kubeconfig: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Cmd,
    Other,
}

impl ShellKind {
    /// Classify by executable basename, ignoring case and a `.exe` suffix.
    pub fn detect(shell: &str) -> Self {
        let base = shell
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(shell)
            .to_ascii_lowercase();
        let base = base.strip_suffix(".exe").unwrap_or(&base);
        match base {
            "bash" => Self::Bash,
            "zsh" => Self::Zsh,
            "fish" => Self::Fish,
            "pwsh" | "powershell" => Self::PowerShell,
            "cmd" => Self::Cmd,
            _ => Self::Other,
        }
    }
}

pub(crate) fn sh_single_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn ps_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn posix_exports(exports: &Exports) -> String {
    format!(
        "export PATH={}\nexport KUBECONFIG={}\n",
        sh_single_quote(&exports.path),
        sh_single_quote(&exports.kubeconfig)
    )
}

fn source_if_exists(path: &Path) -> String {
    let q = sh_single_quote(&path.to_string_lossy());
    format!("if [ -f {q} ]; then . {q}; fi\n")
}

fn write_bash_rc(init_dir: &Path, exports: &Exports, home: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(init_dir)?;
    let rc = init_dir.join("bashrc");
    let mut contents = source_if_exists(&home.join(".bashrc"));
    contents.push_str(&posix_exports(exports));
    std::fs::write(&rc, contents)?;
    Ok(rc)
}

/// zsh reads every startup file from `$ZDOTDIR`, so each one forwards to the
/// user's original and `.zshrc` re-exports at the end.
fn write_zsh_dotdir(
    init_dir: &Path,
    exports: &Exports,
    user_zdotdir: &Path,
) -> std::io::Result<PathBuf> {
    let dir = init_dir.join("zsh");
    std::fs::create_dir_all(&dir)?;
    let orig = sh_single_quote(&user_zdotdir.to_string_lossy());

    let wrap = |name: &str, restore: bool| {
        let mut out = String::from("__kb_zdotdir=\"$ZDOTDIR\"\n");
        out.push_str(&format!("export ZDOTDIR={orig}\n"));
        out.push_str(&source_if_exists(&user_zdotdir.join(name)));
        if restore {
            out.push_str("export ZDOTDIR=\"$__kb_zdotdir\"\n");
        }
        out.push_str("unset __kb_zdotdir\n");
        out
    };

    std::fs::write(dir.join(".zshenv"), wrap(".zshenv", true))?;
    std::fs::write(dir.join(".zprofile"), wrap(".zprofile", true))?;
    let mut zshrc = wrap(".zshrc", false);
    zshrc.push_str(&posix_exports(exports));
    std::fs::write(dir.join(".zshrc"), zshrc)?;
    Ok(dir)
}

/// Build the launch flags for `shell`, writing any init files under
/// `init_dir`.
pub fn shell_launch(
    shell: &str,
    exports: &Exports,
    init_dir: &Path,
    home: &Path,
    user_zdotdir: Option<&Path>,
) -> std::io::Result<ShellLaunch> {
    let launch = match ShellKind::detect(shell) {
        ShellKind::Bash => {
            let rc = write_bash_rc(init_dir, exports, home)?;
            ShellLaunch {
                args: vec!["--init-file".into(), rc.to_string_lossy().into_owned()],
                env: Vec::new(),
            }
        }
        ShellKind::Zsh => {
            let dir = write_zsh_dotdir(init_dir, exports, user_zdotdir.unwrap_or(home))?;
            ShellLaunch {
                args: vec!["--login".into()],
                env: vec![("ZDOTDIR".into(), dir.to_string_lossy().into_owned())],
            }
        }
        ShellKind::Fish => {
            let parts: Vec<String> = exports
                .path
                .split(':')
                .filter(|p| !p.is_empty())
                .map(sh_single_quote)
                .collect();
            ShellLaunch {
                args: vec![
                    "--login".into(),
                    "--init-command".into(),
                    format!(
                        "set -gx PATH {}; set -gx KUBECONFIG {}",
                        parts.join(" "),
                        sh_single_quote(&exports.kubeconfig)
                    ),
                ],
                env: Vec::new(),
            }
        }
        ShellKind::PowerShell => ShellLaunch {
            args: vec![
                "-NoExit".into(),
                "-Command".into(),
                format!(
                    "$Env:PATH = {}; $Env:KUBECONFIG = {}",
                    ps_single_quote(&exports.path),
                    ps_single_quote(&exports.kubeconfig)
                ),
            ],
            env: Vec::new(),
        },
        ShellKind::Cmd => ShellLaunch {
            args: vec!["/K".into(), format!("set PATH={}", exports.path)],
            env: Vec::new(),
        },
        ShellKind::Other => ShellLaunch::default(),
    };
    Ok(launch)
}
