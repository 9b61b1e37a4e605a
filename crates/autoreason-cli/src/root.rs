use autoreason_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// `--root` / `AUTOREASON_ROOT` wins; otherwise the nearest ancestor of the
/// working directory holding `.autoreason/`, falling back to the working
/// directory itself.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_marked_ancestor(&cwd).unwrap_or(cwd)
}

fn find_marked_ancestor(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(paths::AUTOREASON_DIR).is_dir())
        .map(Path::to_path_buf)
}
