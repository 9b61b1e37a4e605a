use crate::output::{fmt_opt, print_json, print_table};
use anyhow::Context;
use autoreason_core::config::{Config, DefaultReason, InstanceConfig};
use autoreason_core::rules;
use autoreason_core::AutoReasonError;
use clap::Subcommand;
use serde_yaml::{Mapping, Value};
use std::path::Path;

#[derive(Subcommand)]
pub enum InstanceSubcommand {
    /// Add an engine instance to the config
    Add {
        /// Rule plugin (e.g. daily-window)
        plugin: String,
        /// Distinguishes several instances of one plugin
        #[arg(long)]
        instance_id: Option<String>,
        /// Reason assigned by this instance
        #[arg(long)]
        reason_id: Option<u64>,
        /// Translation key of the reason created when no reason id is given
        #[arg(long, requires = "translation_value")]
        translation_key: Option<String>,
        /// Label of the reason created when no reason id is given
        #[arg(long, requires = "translation_key")]
        translation_value: Option<String>,
        /// Score of the assignments written by this instance
        #[arg(long)]
        score: Option<f64>,
        /// Score of manual assignments this instance must not override
        #[arg(long)]
        manual_score: Option<f64>,
        /// Machine filter selecting the equipment
        #[arg(long)]
        filter: Option<u64>,
        /// Rule setting `key=value`; repeat for several
        #[arg(long = "set", value_name = "KEY=VALUE")]
        settings: Vec<String>,
    },
    /// List configured instances
    List,
}

pub fn run(root: &Path, subcmd: InstanceSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        InstanceSubcommand::Add {
            plugin,
            instance_id,
            reason_id,
            translation_key,
            translation_value,
            score,
            manual_score,
            filter,
            settings,
        } => {
            let mut instance = InstanceConfig::new(plugin);
            instance.instance_id = instance_id;
            instance.reason_id = reason_id;
            instance.default_reason = translation_key.zip(translation_value).map(
                |(translation_key, translation_value)| DefaultReason {
                    translation_key,
                    translation_value,
                },
            );
            instance.reason_score = score;
            instance.manual_score = manual_score;
            instance.machine_filter_id = filter;
            instance.rule = parse_settings(&settings)?;
            add(root, instance, json)
        }
        InstanceSubcommand::List => list(root, json),
    }
}

fn add(root: &Path, instance: InstanceConfig, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load(root).context("failed to load config")?;
    let name = instance.name();
    if config.instances.iter().any(|i| i.name() == name) {
        anyhow::bail!("instance '{name}' already exists");
    }
    if instance.reason_id.is_none() && instance.default_reason.is_none() {
        anyhow::bail!("instance '{name}' needs --reason-id or --translation-key/--translation-value");
    }
    rules::build_rule(&instance).with_context(|| format!("invalid instance '{name}'"))?;

    let db = super::open_db(root)?;
    if let Some(id) = instance.reason_id {
        // a missing reason is tolerated when a default reason can replace it
        if db.find_reason(id)?.is_none() && instance.default_reason.is_none() {
            return Err(AutoReasonError::ReasonNotFound(id).into());
        }
    }
    if let Some(id) = instance.machine_filter_id {
        db.find_machine_filter(id)?
            .ok_or(AutoReasonError::FilterNotFound(id))?;
    }

    config.instances.push(instance.clone());
    config.save(root).context("failed to save config")?;

    if json {
        return print_json(&instance);
    }
    println!("Added instance '{name}'.");
    Ok(())
}

/// Turn `key=value` pairs into the rule settings mapping. Values are read
/// as YAML scalars so numbers and booleans keep their type.
fn parse_settings(pairs: &[String]) -> anyhow::Result<Value> {
    if pairs.is_empty() {
        return Ok(Value::Null);
    }
    let mut map = Mapping::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid setting '{pair}'; expected KEY=VALUE"))?;
        let value = match serde_yaml::from_str::<Value>(raw) {
            Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => v,
            _ => Value::String(raw.to_string()),
        };
        map.insert(Value::String(key.trim().to_string()), value);
    }
    Ok(Value::Mapping(map))
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config.instances);
    }
    if config.instances.is_empty() {
        println!("No instances.");
        return Ok(());
    }
    let rows = config
        .instances
        .iter()
        .map(|i| {
            vec![
                i.name(),
                fmt_opt(i.reason_id),
                fmt_opt(i.default_reason.as_ref().map(|d| d.translation_key.as_str())),
                fmt_opt(i.reason_score),
                fmt_opt(i.manual_score),
                fmt_opt(i.machine_filter_id),
            ]
        })
        .collect();
    print_table(
        &["INSTANCE", "REASON", "DEFAULT REASON", "SCORE", "MANUAL", "FILTER"],
        rows,
    );
    Ok(())
}
