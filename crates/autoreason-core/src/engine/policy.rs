use crate::types::{MachineModeId, ObservationStateId, ReasonAssignment};

/// Scoring contract of one engine instance against existing assignments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverridePolicy {
    pub reason_id: u64,
    pub score: f64,
}

impl OverridePolicy {
    pub fn new(reason_id: u64, score: f64) -> Self {
        Self { reason_id, score }
    }

    /// Whether an assignment of this instance would supersede `existing`.
    /// Equal scores never override.
    pub fn can_override(&self, existing: &ReasonAssignment) -> bool {
        self.can_override_score(existing.score)
    }

    pub fn can_override_score(&self, existing_score: f64) -> bool {
        existing_score < self.score
    }

    /// Whether an existing assignment could have come from this instance.
    ///
    /// Conservative: only a differing known reason or a differing score rule
    /// it out. Machine mode and observation state are accepted for rules that
    /// want to refine the answer; the default contract ignores them.
    pub fn is_valid_match(
        &self,
        _mode: Option<MachineModeId>,
        _observation_state: Option<ObservationStateId>,
        reason_id: Option<u64>,
        score: f64,
    ) -> bool {
        if reason_id.is_some_and(|id| id != self.reason_id) {
            return false;
        }
        score == self.score
    }

    /// [`OverridePolicy::is_valid_match`] applied to a stored assignment.
    pub fn matches_assignment(&self, assignment: &ReasonAssignment) -> bool {
        self.is_valid_match(None, None, Some(assignment.reason_id), assignment.score)
    }
}
