use anyhow::Context;
use autoreason_core::{config::Config, db::ReasonDb, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing autoreason in: {}", root.display());

    let config_path = paths::config_path(root);
    let yaml = Config::default().to_yaml()?;
    if io::write_if_missing(&config_path, yaml.as_bytes())
        .with_context(|| format!("failed to write {}", config_path.display()))?
    {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let db_path = paths::db_path(root);
    let existed = db_path.exists();
    ReasonDb::open(&db_path).with_context(|| format!("failed to create {}", db_path.display()))?;
    if existed {
        println!("  exists:  {}", paths::DB_FILE);
    } else {
        println!("  created: {}", paths::DB_FILE);
    }
    Ok(())
}
