use crate::output::{fmt_opt, print_json, print_table};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum EquipmentSubcommand {
    /// Register an equipment
    Add {
        name: String,
        /// Category matched by machine filters (e.g. press)
        #[arg(long)]
        category: Option<String>,
        /// Module with its own cursor; repeat for several
        #[arg(long = "module", value_name = "NAME")]
        modules: Vec<String>,
    },
    /// List equipment
    List,
}

pub fn run(root: &Path, subcmd: EquipmentSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        EquipmentSubcommand::Add {
            name,
            category,
            modules,
        } => add(root, &name, category.as_deref(), &modules, json),
        EquipmentSubcommand::List => list(root, json),
    }
}

fn add(
    root: &Path,
    name: &str,
    category: Option<&str>,
    modules: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let equipment = db.insert_equipment(name, category, modules)?;
    if json {
        return print_json(&equipment);
    }
    println!("Added equipment {} '{}'.", equipment.id, equipment.name);
    for module in &equipment.modules {
        println!("  module {} '{}'", module.id, module.name);
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let equipment = db.list_equipment()?;
    if json {
        return print_json(&equipment);
    }
    if equipment.is_empty() {
        println!("No equipment.");
        return Ok(());
    }
    let rows = equipment
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.name.clone(),
                fmt_opt(e.category.as_deref()),
                e.modules
                    .iter()
                    .map(|m| format!("{}:{}", m.id, m.name))
                    .collect::<Vec<_>>()
                    .join(","),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "CATEGORY", "MODULES"], rows);
    Ok(())
}
