use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AutoReasonError, Result};

// ---------------------------------------------------------------------------
// Equipment / Module
// ---------------------------------------------------------------------------

/// A monitored asset reasons are assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: u64,
    pub name: String,
    /// Free-form category used by machine filters (e.g. "lathe").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Module>,
}

impl Equipment {
    pub fn module(&self, id: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == id)
    }
}

/// A sub-component of an equipment with its own processing cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: u64,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Reason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reason {
    pub id: u64,
    /// Short code shown to operators.
    pub code: String,
    /// Display label.
    pub display: String,
    /// Set for reasons created from an instance's default translation key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_key: Option<String>,
    pub default_score: f64,
}

// ---------------------------------------------------------------------------
// TimeRange
// ---------------------------------------------------------------------------

/// Half-open UTC range `[begin, end)`. A missing end means the range is
/// still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < begin {
            return Err(AutoReasonError::InvalidRange(format!(
                "end {end} is before begin {begin}"
            )));
        }
        Ok(Self {
            begin,
            end: Some(end),
        })
    }

    pub fn open(begin: DateTime<Utc>) -> Self {
        Self { begin, end: None }
    }

    pub fn is_empty(&self) -> bool {
        self.end == Some(self.begin)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.begin <= at && self.end.map_or(true, |end| at < end)
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        let starts_before_other_ends = other.end.map_or(true, |end| self.begin < end);
        let ends_after_other_starts = self.end.map_or(true, |end| other.begin < end);
        starts_before_other_ends && ends_after_other_starts
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.begin.to_rfc3339(), end.to_rfc3339()),
            None => write!(f, "[{}, )", self.begin.to_rfc3339()),
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Handle returned by the persistence layer for every inserted reason
/// assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModificationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineModeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationStateId(pub u64);

impl fmt::Display for ModificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ReasonAssignment
// ---------------------------------------------------------------------------

/// Processing options attached to a reason assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationOption {
    /// The dynamically resolved end may be earlier than the nominal end.
    DynamicEndBeforeRealEnd,
}

impl AssociationOption {
    pub fn as_str(self) -> &'static str {
        match self {
            AssociationOption::DynamicEndBeforeRealEnd => "dynamic_end_before_real_end",
        }
    }
}

impl fmt::Display for AssociationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input of an assignment insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReasonAssignment {
    pub equipment_id: u64,
    pub range: TimeRange,
    pub reason_id: u64,
    pub score: f64,
    pub details: Option<String>,
    pub dynamic: Option<String>,
    pub overwrite_required: bool,
    pub option: Option<AssociationOption>,
}

/// A durable reason assignment. Never mutated once inserted, except for the
/// revision link set inside the inserting transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasonAssignment {
    pub id: ModificationId,
    pub equipment_id: u64,
    pub range: TimeRange,
    pub reason_id: u64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Name of the downstream rule resolving the real end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<String>,
    #[serde(default)]
    pub overwrite_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option: Option<AssociationOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<RevisionId>,
    pub created_at: DateTime<Utc>,
}

impl ReasonAssignment {
    pub(crate) fn from_new(id: ModificationId, new: NewReasonAssignment) -> Self {
        Self {
            id,
            equipment_id: new.equipment_id,
            range: new.range,
            reason_id: new.reason_id,
            score: new.score,
            details: new.details,
            dynamic: new.dynamic,
            overwrite_required: new.overwrite_required,
            option: new.option,
            revision_id: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service / Revision
// ---------------------------------------------------------------------------

/// Identity under which audit records are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: u64,
    pub name: String,
    pub computer: String,
    pub program: String,
}

/// Audit record grouping the reason assignments of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub service_id: u64,
    pub application: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub modifications: Vec<ModificationId>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
