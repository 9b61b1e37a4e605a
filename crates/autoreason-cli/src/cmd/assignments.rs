use crate::output::{fmt_opt, fmt_time, print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, equipment: Option<u64>, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let assignments = db.list_assignments(equipment)?;
    if json {
        return print_json(&assignments);
    }
    if assignments.is_empty() {
        println!("No assignments.");
        return Ok(());
    }
    let rows = assignments
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.equipment_id.to_string(),
                fmt_time(a.range.begin),
                fmt_opt(a.range.end.map(fmt_time)),
                a.reason_id.to_string(),
                a.score.to_string(),
                fmt_opt(a.dynamic.as_deref()),
                fmt_opt(a.revision_id),
            ]
        })
        .collect();
    print_table(
        &["ID", "EQUIPMENT", "BEGIN", "END", "REASON", "SCORE", "DYNAMIC", "REVISION"],
        rows,
    );
    Ok(())
}
