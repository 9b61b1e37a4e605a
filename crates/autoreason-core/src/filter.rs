//! Machine filters restrict which equipment an engine instance applies to.
//!
//! A filter starts from its `initial` set (all or no equipment) and applies
//! its items in order; later items win.

use serde::{Deserialize, Serialize};

use crate::types::Equipment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterInitialSet {
    All,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterRule {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterTarget {
    Equipment(u64),
    Category(String),
}

impl FilterTarget {
    fn matches(&self, equipment: &Equipment) -> bool {
        match self {
            FilterTarget::Equipment(id) => equipment.id == *id,
            FilterTarget::Category(name) => equipment
                .category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterItem {
    pub rule: FilterRule,
    pub target: FilterTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFilter {
    pub id: u64,
    pub name: String,
    pub initial: FilterInitialSet,
    #[serde(default)]
    pub items: Vec<FilterItem>,
}

impl MachineFilter {
    pub fn matches(&self, equipment: &Equipment) -> bool {
        let mut included = matches!(self.initial, FilterInitialSet::All);
        for item in &self.items {
            if item.target.matches(equipment) {
                included = matches!(item.rule, FilterRule::Add);
            }
        }
        included
    }
}
