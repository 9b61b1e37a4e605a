use crate::output::{fmt_opt, print_json, print_table};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ReasonSubcommand {
    /// Register a reason
    Add {
        /// Short code (e.g. BRK)
        code: String,
        /// Display label
        #[arg(required = true)]
        display: Vec<String>,
        /// Default score of assignments using this reason
        #[arg(long, default_value_t = 50.0)]
        score: f64,
    },
    /// List reasons
    List,
}

pub fn run(root: &Path, subcmd: ReasonSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ReasonSubcommand::Add {
            code,
            display,
            score,
        } => add(root, &code, &display.join(" "), score, json),
        ReasonSubcommand::List => list(root, json),
    }
}

fn add(root: &Path, code: &str, display: &str, score: f64, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let reason = db.insert_reason(code, display, score)?;
    if json {
        return print_json(&reason);
    }
    println!("Added reason {} '{}' ({}).", reason.id, reason.display, reason.code);
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let reasons = db.list_reasons()?;
    if json {
        return print_json(&reasons);
    }
    if reasons.is_empty() {
        println!("No reasons.");
        return Ok(());
    }
    let rows = reasons
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.code.clone(),
                r.display.clone(),
                r.default_score.to_string(),
                fmt_opt(r.translation_key.as_deref()),
            ]
        })
        .collect();
    print_table(&["ID", "CODE", "DISPLAY", "SCORE", "TRANSLATION KEY"], rows);
    Ok(())
}
