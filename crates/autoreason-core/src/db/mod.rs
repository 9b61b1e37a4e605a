//! Persistent storage for the reason-assignment engine using redb.
//!
//! # Table design
//!
//! Entities are JSON-encoded. Most tables are keyed by a `u64` id drawn from
//! the `sequences` table. Reason assignments use a 24-byte composite key:
//! ```text
//! [ equipment_id: u64 BE | begin_ms: u64 BE | modification_id: u64 BE ]
//! ```
//! so that one equipment's assignments form a contiguous range in begin-time
//! order. Cursors use the string key `"<equipment_id:020>/<cursor key>"`.
//!
//! Reads go through short-lived read transactions. Every write goes through a
//! [`DbTransaction`]; dropping one without calling `commit()` discards all of
//! its writes.

mod transaction;

pub use transaction::DbTransaction;

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AutoReasonError, Result};
use crate::filter::MachineFilter;
use crate::types::{Equipment, Reason, ReasonAssignment, Revision, RevisionId, TimeRange};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

pub(crate) const EQUIPMENT: TableDefinition<u64, &[u8]> = TableDefinition::new("equipment");
pub(crate) const REASONS: TableDefinition<u64, &[u8]> = TableDefinition::new("reasons");
pub(crate) const MACHINE_FILTERS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("machine_filters");
pub(crate) const SERVICES: TableDefinition<u64, &[u8]> = TableDefinition::new("services");
pub(crate) const REVISIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("revisions");
pub(crate) const ASSIGNMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("assignments");
pub(crate) const CURSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("cursors");
pub(crate) const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

pub(crate) fn assignment_key(equipment_id: u64, begin: DateTime<Utc>, id: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&equipment_id.to_be_bytes());
    key[8..16].copy_from_slice(&millis(begin).to_be_bytes());
    key[16..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Inclusive key bounds covering every assignment of `equipment_id` whose
/// begin millisecond is at or before that of `until` (or all of them when
/// `until` is None). Keys are truncated to milliseconds, so callers filter
/// the sub-millisecond remainder themselves.
fn assignment_bounds(equipment_id: u64, until: Option<DateTime<Utc>>) -> ([u8; 24], [u8; 24]) {
    let mut lower = [0u8; 24];
    lower[..8].copy_from_slice(&equipment_id.to_be_bytes());
    let mut upper = [0xffu8; 24];
    upper[..8].copy_from_slice(&equipment_id.to_be_bytes());
    if let Some(until) = until {
        upper[8..16].copy_from_slice(&millis(until).to_be_bytes());
    }
    (lower, upper)
}

pub(crate) fn cursor_table_key(equipment_id: u64, key: &str) -> String {
    format!("{equipment_id:020}/{key}")
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// IsolationLevel
// ---------------------------------------------------------------------------

/// Isolation requested when a write transaction is opened.
///
/// redb serializes write transactions, so every level is honored at least as
/// strongly as requested; the level is recorded for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CursorRecord
// ---------------------------------------------------------------------------

/// A persisted processing watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub equipment_id: u64,
    pub key: String,
    pub at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ReasonDb
// ---------------------------------------------------------------------------

/// Persistent store for equipment, reasons, assignments, cursors and audit
/// records.
pub struct ReasonDb {
    db: Database,
}

impl ReasonDb {
    /// Open or create the redb database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(AutoReasonError::db)?;
        let wt = db.begin_write().map_err(AutoReasonError::db)?;
        wt.open_table(EQUIPMENT).map_err(AutoReasonError::db)?;
        wt.open_table(REASONS).map_err(AutoReasonError::db)?;
        wt.open_table(MACHINE_FILTERS).map_err(AutoReasonError::db)?;
        wt.open_table(SERVICES).map_err(AutoReasonError::db)?;
        wt.open_table(REVISIONS).map_err(AutoReasonError::db)?;
        wt.open_table(ASSIGNMENTS).map_err(AutoReasonError::db)?;
        wt.open_table(CURSORS).map_err(AutoReasonError::db)?;
        wt.open_table(SEQUENCES).map_err(AutoReasonError::db)?;
        wt.commit().map_err(AutoReasonError::db)?;
        Ok(Self { db })
    }

    /// Open a write transaction. `name` identifies it in the logs.
    pub fn begin_transaction(&self, name: &str, isolation: IsolationLevel) -> Result<DbTransaction> {
        tracing::trace!(transaction = name, %isolation, "begin transaction");
        let wt = self.db.begin_write().map_err(AutoReasonError::db)?;
        Ok(DbTransaction::new(wt, name, isolation))
    }

    // -----------------------------------------------------------------------
    // Configuration writes (one transaction each)
    // -----------------------------------------------------------------------

    pub fn insert_equipment(
        &self,
        name: &str,
        category: Option<&str>,
        module_names: &[String],
    ) -> Result<Equipment> {
        let tx = self.begin_transaction("Config.InsertEquipment", IsolationLevel::Serializable)?;
        let equipment = tx.insert_equipment(name, category, module_names)?;
        tx.commit()?;
        Ok(equipment)
    }

    pub fn insert_reason(&self, code: &str, display: &str, default_score: f64) -> Result<Reason> {
        let tx = self.begin_transaction("Config.InsertReason", IsolationLevel::Serializable)?;
        let reason = tx.insert_reason(code, display, None, default_score)?;
        tx.commit()?;
        Ok(reason)
    }

    /// Return the reason registered under `translation_key`, creating it with
    /// `display` as its label when it does not exist yet.
    pub fn get_or_create_reason(
        &self,
        translation_key: &str,
        display: &str,
        default_score: f64,
    ) -> Result<Reason> {
        if let Some(existing) = self.find_reason_by_translation_key(translation_key)? {
            return Ok(existing);
        }
        let tx = self.begin_transaction("Config.AddReason", IsolationLevel::Serializable)?;
        // Re-check inside the write transaction: another writer may have won.
        let reason = match tx.find_reason_by_translation_key(translation_key)? {
            Some(existing) => existing,
            None => {
                tracing::info!(translation_key, "creating default reason");
                tx.insert_reason(translation_key, display, Some(translation_key), default_score)?
            }
        };
        tx.commit()?;
        Ok(reason)
    }

    pub fn insert_machine_filter(&self, filter: MachineFilter) -> Result<MachineFilter> {
        let tx = self.begin_transaction("Config.InsertMachineFilter", IsolationLevel::Serializable)?;
        let filter = tx.insert_machine_filter(filter)?;
        tx.commit()?;
        Ok(filter)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    fn get_by_id<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, u64, &'static [u8]>,
        id: u64,
    ) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(def).map_err(AutoReasonError::db)?;
        let guard = table.get(id).map_err(AutoReasonError::db)?;
        guard.map(|g| decode(g.value())).transpose()
    }

    fn list_by_id<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, u64, &'static [u8]>,
    ) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(def).map_err(AutoReasonError::db)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(AutoReasonError::db)? {
            let (_, v) = entry.map_err(AutoReasonError::db)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    pub fn find_equipment(&self, id: u64) -> Result<Option<Equipment>> {
        self.get_by_id(EQUIPMENT, id)
    }

    pub fn list_equipment(&self) -> Result<Vec<Equipment>> {
        self.list_by_id(EQUIPMENT)
    }

    pub fn find_reason(&self, id: u64) -> Result<Option<Reason>> {
        self.get_by_id(REASONS, id)
    }

    pub fn list_reasons(&self) -> Result<Vec<Reason>> {
        self.list_by_id(REASONS)
    }

    pub fn find_reason_by_translation_key(&self, translation_key: &str) -> Result<Option<Reason>> {
        Ok(self
            .list_reasons()?
            .into_iter()
            .find(|r| r.translation_key.as_deref() == Some(translation_key)))
    }

    pub fn find_machine_filter(&self, id: u64) -> Result<Option<MachineFilter>> {
        self.get_by_id(MACHINE_FILTERS, id)
    }

    pub fn list_machine_filters(&self) -> Result<Vec<MachineFilter>> {
        self.list_by_id(MACHINE_FILTERS)
    }

    pub fn find_revision(&self, id: RevisionId) -> Result<Option<Revision>> {
        self.get_by_id(REVISIONS, id.0)
    }

    pub fn list_revisions(&self) -> Result<Vec<Revision>> {
        self.list_by_id(REVISIONS)
    }

    /// Persisted cursor value for `key` on `equipment_id`, if any.
    pub fn get_cursor(&self, equipment_id: u64, key: &str) -> Result<Option<DateTime<Utc>>> {
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(CURSORS).map_err(AutoReasonError::db)?;
        let table_key = cursor_table_key(equipment_id, key);
        let guard = table
            .get(table_key.as_str())
            .map_err(AutoReasonError::db)?;
        let record: Option<CursorRecord> = guard.map(|g| decode(g.value())).transpose()?;
        Ok(record.map(|r| r.at))
    }

    /// All persisted cursors, ordered by equipment then key.
    pub fn list_cursors(&self) -> Result<Vec<CursorRecord>> {
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(CURSORS).map_err(AutoReasonError::db)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(AutoReasonError::db)? {
            let (_, v) = entry.map_err(AutoReasonError::db)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }

    /// Assignments of `equipment_id` overlapping `range`, in begin order.
    pub fn find_assignments(
        &self,
        equipment_id: u64,
        range: &TimeRange,
    ) -> Result<Vec<ReasonAssignment>> {
        let (lower, upper) = assignment_bounds(equipment_id, range.end);
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(ASSIGNMENTS).map_err(AutoReasonError::db)?;
        let mut result = Vec::new();
        for entry in table
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(AutoReasonError::db)?
        {
            let (_, v) = entry.map_err(AutoReasonError::db)?;
            let assignment: ReasonAssignment = decode(v.value())?;
            if assignment.range.overlaps(range) {
                result.push(assignment);
            }
        }
        Ok(result)
    }

    /// Every assignment, optionally restricted to one equipment, in
    /// (equipment, begin) order.
    pub fn list_assignments(&self, equipment_id: Option<u64>) -> Result<Vec<ReasonAssignment>> {
        let (lower, upper) = match equipment_id {
            Some(id) => assignment_bounds(id, None),
            None => ([0u8; 24], [0xffu8; 24]),
        };
        let rt = self.db.begin_read().map_err(AutoReasonError::db)?;
        let table = rt.open_table(ASSIGNMENTS).map_err(AutoReasonError::db)?;
        let mut result = Vec::new();
        let iter = table
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(AutoReasonError::db)?;
        for entry in iter {
            let (_, v) = entry.map_err(AutoReasonError::db)?;
            result.push(decode(v.value())?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::filter::{FilterInitialSet, FilterItem, FilterRule, FilterTarget};
    use crate::types::NewReasonAssignment;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    pub(crate) fn open_tmp() -> (TempDir, ReasonDb) {
        let dir = TempDir::new().unwrap();
        let db = ReasonDb::open(&dir.path().join("test.redb")).unwrap();
        (dir, db)
    }

    fn t(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    fn insert(db: &ReasonDb, equipment_id: u64, begin: i64, end: i64) -> ReasonAssignment {
        let tx = db
            .begin_transaction("test", IsolationLevel::ReadCommitted)
            .unwrap();
        let a = tx
            .insert_reason_assignment(NewReasonAssignment {
                equipment_id,
                range: TimeRange::new(t(begin), t(end)).unwrap(),
                reason_id: 1,
                score: 50.0,
                details: None,
                dynamic: None,
                overwrite_required: false,
                option: None,
            })
            .unwrap();
        tx.commit().unwrap();
        a
    }

    #[test]
    fn equipment_ids_are_assigned_sequentially() {
        let (_dir, db) = open_tmp();
        let a = db
            .insert_equipment("mill-1", Some("mill"), &["spindle".into(), "table".into()])
            .unwrap();
        let b = db.insert_equipment("lathe-1", None, &[]).unwrap();
        assert_eq!(a.id + 1, b.id);
        assert_eq!(a.modules.len(), 2);
        assert_ne!(a.modules[0].id, a.modules[1].id);
        assert_eq!(db.find_equipment(a.id).unwrap(), Some(a));
        assert_eq!(db.list_equipment().unwrap().len(), 2);
    }

    #[test]
    fn get_or_create_reason_is_idempotent() {
        let (_dir, db) = open_tmp();
        let first = db
            .get_or_create_reason("ReasonBreak", "Break", 60.0)
            .unwrap();
        let second = db
            .get_or_create_reason("ReasonBreak", "Other label", 10.0)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(db.list_reasons().unwrap().len(), 1);
        assert_eq!(first.translation_key.as_deref(), Some("ReasonBreak"));
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let (_dir, db) = open_tmp();
        {
            let tx = db
                .begin_transaction("aborted", IsolationLevel::ReadCommitted)
                .unwrap();
            tx.save_cursor(1, "k", t(3)).unwrap();
        }
        assert_eq!(db.get_cursor(1, "k").unwrap(), None);

        let tx = db
            .begin_transaction("committed", IsolationLevel::ReadCommitted)
            .unwrap();
        tx.save_cursor(1, "k", t(3)).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.get_cursor(1, "k").unwrap(), Some(t(3)));
    }

    #[test]
    fn cursors_are_scoped_by_equipment() {
        let (_dir, db) = open_tmp();
        let tx = db
            .begin_transaction("t", IsolationLevel::ReadCommitted)
            .unwrap();
        tx.save_cursor(1, "plugin.DateTime", t(1)).unwrap();
        tx.save_cursor(2, "plugin.DateTime", t(2)).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.get_cursor(1, "plugin.DateTime").unwrap(), Some(t(1)));
        assert_eq!(db.get_cursor(2, "plugin.DateTime").unwrap(), Some(t(2)));
        let all = db.list_cursors().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].equipment_id, 1);
    }

    #[test]
    fn find_assignments_returns_overlapping_in_begin_order() {
        let (_dir, db) = open_tmp();
        insert(&db, 1, 5, 6);
        insert(&db, 1, 1, 3);
        insert(&db, 1, 8, 9);
        insert(&db, 2, 1, 9);

        let found = db
            .find_assignments(1, &TimeRange::new(t(2), t(6)).unwrap())
            .unwrap();
        let begins: Vec<_> = found.iter().map(|a| a.range.begin).collect();
        assert_eq!(begins, vec![t(1), t(5)]);

        assert_eq!(db.list_assignments(Some(1)).unwrap().len(), 3);
        assert_eq!(db.list_assignments(None).unwrap().len(), 4);
    }

    #[test]
    fn find_assignments_with_open_range() {
        let (_dir, db) = open_tmp();
        insert(&db, 1, 1, 3);
        insert(&db, 1, 5, 6);
        let found = db.find_assignments(1, &TimeRange::open(t(2))).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn find_assignments_sees_begin_in_the_last_millisecond() {
        let (_dir, db) = open_tmp();
        let begin = t(1) + Duration::microseconds(500);
        let tx = db
            .begin_transaction("test", IsolationLevel::ReadCommitted)
            .unwrap();
        tx.insert_reason_assignment(NewReasonAssignment {
            equipment_id: 1,
            range: TimeRange::new(begin, t(2)).unwrap(),
            reason_id: 1,
            score: 50.0,
            details: None,
            dynamic: None,
            overwrite_required: false,
            option: None,
        })
        .unwrap();
        tx.commit().unwrap();

        // same millisecond as the range end, still before it
        let range = TimeRange::new(t(0), t(1) + Duration::microseconds(800)).unwrap();
        let found = db.find_assignments(1, &range).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].range.begin, begin);

        // same millisecond but at or after the end: no overlap
        let before = TimeRange::new(t(0), t(1) + Duration::microseconds(500)).unwrap();
        assert!(db.find_assignments(1, &before).unwrap().is_empty());
    }

    #[test]
    fn machine_filter_roundtrip() {
        let (_dir, db) = open_tmp();
        let filter = db
            .insert_machine_filter(MachineFilter {
                id: 0,
                name: "lathes".into(),
                initial: FilterInitialSet::None,
                items: vec![FilterItem {
                    rule: FilterRule::Add,
                    target: FilterTarget::Category("lathe".into()),
                }],
            })
            .unwrap();
        assert_ne!(filter.id, 0);
        assert_eq!(db.find_machine_filter(filter.id).unwrap(), Some(filter));
        assert_eq!(db.list_machine_filters().unwrap().len(), 1);
    }
}
