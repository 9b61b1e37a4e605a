use crate::output::{fmt_time, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let revisions = db.list_revisions()?;
    if json {
        return print_json(&revisions);
    }
    if revisions.is_empty() {
        println!("No revisions.");
        return Ok(());
    }
    let rows = revisions
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.application.clone(),
                r.service_id.to_string(),
                fmt_time(r.created_at),
                r.modifications.len().to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "APPLICATION", "SERVICE", "CREATED", "MODIFICATIONS"], rows);
    Ok(())
}
