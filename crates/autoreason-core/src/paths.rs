use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const AUTOREASON_DIR: &str = ".autoreason";
pub const CONFIG_FILE: &str = ".autoreason/config.yaml";
pub const DB_FILE: &str = ".autoreason/autoreason.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn autoreason_dir(root: &Path) -> PathBuf {
    root.join(AUTOREASON_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}
