//! Processing watermarks.
//!
//! A cursor bounds how far an instance has reasoned about an equipment's
//! history. Reads come from the store, falling back to `now - lookback`
//! held in memory only. The in-memory value may run ahead of the stored one
//! while a cycle is being evaluated; it is only persisted by a committed
//! state action.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::db::ReasonDb;
use crate::error::{AutoReasonError, Result};

/// Sub-key of the main date/time cursor.
pub const DATE_TIME_KEY: &str = "DateTime";

// ---------------------------------------------------------------------------
// CursorKeys
// ---------------------------------------------------------------------------

/// Builds store keys `<plugin>[.<instance>].<sub_key>[.<module>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorKeys {
    plugin_key: String,
    instance_id: Option<String>,
}

impl CursorKeys {
    pub fn new(plugin_key: impl Into<String>, instance_id: Option<&str>) -> Self {
        Self {
            plugin_key: plugin_key.into(),
            instance_id: instance_id.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    pub fn key(&self, sub_key: &str) -> String {
        match &self.instance_id {
            Some(instance) => format!("{}.{}.{}", self.plugin_key, instance, sub_key),
            None => format!("{}.{}", self.plugin_key, sub_key),
        }
    }

    pub fn module_key(&self, module_id: u64, sub_key: &str) -> String {
        format!("{}.{}", self.key(sub_key), module_id)
    }
}

/// Which cursor of an instance a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorTarget {
    Main,
    Module(u64),
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Cursors {
    equipment_id: u64,
    keys: CursorKeys,
    lookback: Duration,
    current: HashMap<CursorTarget, DateTime<Utc>>,
    /// Values at the start of the running cycle; what a reset restores.
    baseline: HashMap<CursorTarget, DateTime<Utc>>,
}

impl Cursors {
    /// Load the main cursor, seeding it with `now - lookback` when nothing is
    /// stored. The seed is not persisted.
    pub fn load(
        db: &ReasonDb,
        equipment_id: u64,
        keys: CursorKeys,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut cursors = Self {
            equipment_id,
            keys,
            lookback,
            current: HashMap::new(),
            baseline: HashMap::new(),
        };
        let main = cursors.read(db, CursorTarget::Main, now)?;
        cursors.current.insert(CursorTarget::Main, main);
        cursors.baseline.insert(CursorTarget::Main, main);
        Ok(cursors)
    }

    fn read(&self, db: &ReasonDb, target: CursorTarget, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let key = self.store_key(target);
        match db.get_cursor(self.equipment_id, &key)? {
            Some(at) => Ok(at),
            None => {
                let seeded = now.checked_sub_signed(self.lookback).ok_or_else(|| {
                    AutoReasonError::InvalidConfig(format!(
                        "lookback of {}s reaches before the earliest representable time",
                        self.lookback.num_seconds()
                    ))
                })?;
                tracing::info!(
                    equipment = self.equipment_id,
                    key = %key,
                    seeded = %seeded,
                    "first run, seeding cursor from lookback period"
                );
                Ok(seeded)
            }
        }
    }

    pub fn equipment_id(&self) -> u64 {
        self.equipment_id
    }

    pub fn keys(&self) -> &CursorKeys {
        &self.keys
    }

    pub fn store_key(&self, target: CursorTarget) -> String {
        match target {
            CursorTarget::Main => self.keys.key(DATE_TIME_KEY),
            CursorTarget::Module(id) => self.keys.module_key(id, DATE_TIME_KEY),
        }
    }

    /// Current in-memory value of the main cursor.
    pub fn main(&self) -> DateTime<Utc> {
        self.current
            .get(&CursorTarget::Main)
            .copied()
            .unwrap_or_else(|| {
                let now = Utc::now();
                now.checked_sub_signed(self.lookback).unwrap_or(now)
            })
    }

    /// Current value of a module cursor, read from the store on first use.
    pub fn module(&mut self, db: &ReasonDb, module_id: u64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let target = CursorTarget::Module(module_id);
        if let Some(at) = self.current.get(&target) {
            return Ok(*at);
        }
        let at = self.read(db, target, now)?;
        self.current.insert(target, at);
        self.baseline.insert(target, at);
        Ok(at)
    }

    pub fn get(&self, target: CursorTarget) -> Option<DateTime<Utc>> {
        self.current.get(&target).copied()
    }

    pub(crate) fn baseline(&self, target: CursorTarget) -> Option<DateTime<Utc>> {
        self.baseline.get(&target).copied()
    }

    pub(crate) fn set(&mut self, target: CursorTarget, at: DateTime<Utc>) {
        self.current.insert(target, at);
    }

    /// Snapshot the current values as the restore point of the next cycle.
    pub(crate) fn begin_cycle(&mut self) {
        self.baseline = self.current.clone();
    }
}
