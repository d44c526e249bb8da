use std::path::{Path, PathBuf};

/// Pick the shell's working directory.
///
/// Tries, in order: the cluster's configured directory, the home directory,
/// `$HOME`, `$USERPROFILE`, the filesystem root. The first that exists and is
/// a directory wins; `.` if none do.
pub fn resolve_cwd(preferred: Option<&Path>) -> PathBuf {
    let candidates = [
        preferred.map(Path::to_path_buf),
        dirs::home_dir(),
        std::env::var_os("HOME").map(PathBuf::from),
        std::env::var_os("USERPROFILE").map(PathBuf::from),
        Some(root_dir()),
    ];
    first_existing_dir(candidates.into_iter().flatten())
}

fn root_dir() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("C:\\")
    } else {
        PathBuf::from("/")
    }
}

pub fn first_existing_dir(candidates: impl IntoIterator<Item = PathBuf>) -> PathBuf {
    candidates
        .into_iter()
        .find(|p| !p.as_os_str().is_empty() && p.is_dir())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_directory_wins() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_cwd(Some(dir.path())), dir.path());
    }

    #[test]
    fn missing_or_file_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let picked = first_existing_dir([
            dir.path().join("missing"),
            file,
            PathBuf::new(),
            dir.path().to_path_buf(),
        ]);
        assert_eq!(picked, dir.path());
    }

    #[test]
    fn falls_back_to_dot() {
        assert_eq!(
            first_existing_dir([PathBuf::from("/definitely/not/here")]),
            PathBuf::from(".")
        );
    }

    #[test]
    fn missing_preferred_still_resolves_somewhere() {
        let picked = resolve_cwd(Some(Path::new("/definitely/not/here")));
        assert!(picked.is_dir());
    }
}
