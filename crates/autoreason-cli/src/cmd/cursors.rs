use crate::output::{fmt_time, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let cursors = db.list_cursors()?;
    if json {
        return print_json(&cursors);
    }
    if cursors.is_empty() {
        println!("No cursors.");
        return Ok(());
    }
    let rows = cursors
        .iter()
        .map(|c| {
            vec![
                c.equipment_id.to_string(),
                c.key.clone(),
                fmt_time(c.at),
                fmt_time(c.updated_at),
            ]
        })
        .collect();
    print_table(&["EQUIPMENT", "KEY", "AT", "UPDATED"], rows);
    Ok(())
}
