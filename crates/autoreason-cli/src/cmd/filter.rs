use crate::output::{print_json, print_table};
use autoreason_core::filter::{FilterInitialSet, FilterItem, FilterRule, FilterTarget, MachineFilter};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum FilterSubcommand {
    /// Create a machine filter
    Add {
        name: String,
        /// Starting set: all or none
        #[arg(long, default_value = "all")]
        initial: String,
        /// Item `add|remove:equipment|category:VALUE`, applied in order
        #[arg(long = "item", value_name = "ITEM")]
        items: Vec<String>,
    },
    /// List machine filters
    List,
}

pub fn run(root: &Path, subcmd: FilterSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        FilterSubcommand::Add {
            name,
            initial,
            items,
        } => add(root, &name, &initial, &items, json),
        FilterSubcommand::List => list(root, json),
    }
}

fn add(root: &Path, name: &str, initial: &str, items: &[String], json: bool) -> anyhow::Result<()> {
    let initial = match initial {
        "all" => FilterInitialSet::All,
        "none" => FilterInitialSet::None,
        other => anyhow::bail!("unknown initial set '{other}'; valid: all, none"),
    };
    let items = items
        .iter()
        .map(|s| parse_item(s))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let db = super::open_db(root)?;
    let filter = db.insert_machine_filter(MachineFilter {
        id: 0,
        name: name.to_string(),
        initial,
        items,
    })?;
    if json {
        return print_json(&filter);
    }
    println!("Added machine filter {} '{}'.", filter.id, filter.name);
    Ok(())
}

fn parse_item(s: &str) -> anyhow::Result<FilterItem> {
    let mut parts = s.splitn(3, ':');
    let (Some(rule), Some(kind), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!("invalid filter item '{s}'; expected add|remove:equipment|category:VALUE");
    };
    let rule = match rule {
        "add" => FilterRule::Add,
        "remove" => FilterRule::Remove,
        other => anyhow::bail!("unknown filter rule '{other}'; valid: add, remove"),
    };
    let target = match kind {
        "equipment" => FilterTarget::Equipment(
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid equipment id '{value}'"))?,
        ),
        "category" => FilterTarget::Category(value.to_string()),
        other => anyhow::bail!("unknown filter target '{other}'; valid: equipment, category"),
    };
    Ok(FilterItem { rule, target })
}

fn describe(item: &FilterItem) -> String {
    let rule = match item.rule {
        FilterRule::Add => "+",
        FilterRule::Remove => "-",
    };
    match &item.target {
        FilterTarget::Equipment(id) => format!("{rule}equipment:{id}"),
        FilterTarget::Category(name) => format!("{rule}category:{name}"),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let db = super::open_db(root)?;
    let filters = db.list_machine_filters()?;
    if json {
        return print_json(&filters);
    }
    if filters.is_empty() {
        println!("No machine filters.");
        return Ok(());
    }
    let rows = filters
        .iter()
        .map(|f| {
            vec![
                f.id.to_string(),
                f.name.clone(),
                match f.initial {
                    FilterInitialSet::All => "all".to_string(),
                    FilterInitialSet::None => "none".to_string(),
                },
                f.items.iter().map(describe).collect::<Vec<_>>().join(" "),
            ]
        })
        .collect();
    print_table(&["ID", "NAME", "INITIAL", "ITEMS"], rows);
    Ok(())
}
