//! Reason assignment inserts.
//!
//! Both entry points only ever run inside a reason action's `run`, that is
//! inside the commit transaction of a cycle.

use crate::db::DbTransaction;
use crate::error::Result;
use crate::types::{AssociationOption, ModificationId, NewReasonAssignment, RevisionId, TimeRange};

/// A reason decision waiting to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasonApplication {
    pub equipment_id: u64,
    pub reason_id: u64,
    pub score: f64,
    pub range: TimeRange,
    /// Name of the downstream rule that resolves the real end.
    pub dynamic: Option<String>,
    pub details: Option<String>,
    pub overwrite_required: bool,
}

impl ReasonApplication {
    fn to_new(&self, option: Option<AssociationOption>) -> NewReasonAssignment {
        NewReasonAssignment {
            equipment_id: self.equipment_id,
            range: self.range,
            reason_id: self.reason_id,
            score: self.score,
            details: self.details.clone(),
            dynamic: self.dynamic.clone(),
            overwrite_required: self.overwrite_required,
            option,
        }
    }
}

/// Insert the assignment and attach it to `revision` when one is open.
pub fn apply_reason(
    tx: &DbTransaction,
    revision: Option<RevisionId>,
    application: &ReasonApplication,
) -> Result<ModificationId> {
    insert(tx, revision, application, None)
}

/// Like [`apply_reason`], but lets the resolved end come before the nominal
/// end of the range.
pub fn apply_reason_dynamic_end_before_real_end(
    tx: &DbTransaction,
    revision: Option<RevisionId>,
    application: &ReasonApplication,
) -> Result<ModificationId> {
    insert(
        tx,
        revision,
        application,
        Some(AssociationOption::DynamicEndBeforeRealEnd),
    )
}

fn insert(
    tx: &DbTransaction,
    revision: Option<RevisionId>,
    application: &ReasonApplication,
    option: Option<AssociationOption>,
) -> Result<ModificationId> {
    let assignment = tx.insert_reason_assignment(application.to_new(option))?;
    tracing::debug!(
        equipment = application.equipment_id,
        reason = application.reason_id,
        score = application.score,
        range = %application.range,
        modification = %assignment.id,
        "reason applied"
    );
    if let Some(revision) = revision {
        tx.add_modification(revision, &assignment)?;
    }
    Ok(assignment.id)
}
