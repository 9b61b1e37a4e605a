pub mod assignments;
pub mod config;
pub mod cursors;
pub mod equipment;
pub mod filter;
pub mod init;
pub mod instance;
pub mod reason;
pub mod revisions;
pub mod run;

use anyhow::Context;
use autoreason_core::{db::ReasonDb, paths, AutoReasonError};
use std::path::Path;

/// Open the store of an initialized project.
pub fn open_db(root: &Path) -> anyhow::Result<ReasonDb> {
    if !paths::config_path(root).exists() {
        return Err(AutoReasonError::NotInitialized.into());
    }
    let path = paths::db_path(root);
    ReasonDb::open(&path).with_context(|| format!("failed to open {}", path.display()))
}
