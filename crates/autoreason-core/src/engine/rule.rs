use crate::error::Result;
use crate::types::{Equipment, MachineModeId, ObservationStateId, ReasonAssignment};

use super::context::CycleContext;
use super::policy::OverridePolicy;

/// Decision logic of one rule plugin.
///
/// `check` inspects history through the context and queues actions; it must
/// never write to the store itself.
pub trait Rule: Send {
    fn plugin_key(&self) -> &str;

    /// Extra activation checks for `equipment`. Returning `false` leaves the
    /// instance inactive.
    fn initialize(&mut self, _equipment: &Equipment) -> Result<bool> {
        Ok(true)
    }

    fn check(&mut self, cx: &mut CycleContext<'_>) -> Result<()>;

    fn can_override(&self, policy: &OverridePolicy, existing: &ReasonAssignment) -> bool {
        policy.can_override(existing)
    }

    fn is_valid_match(
        &self,
        policy: &OverridePolicy,
        mode: Option<MachineModeId>,
        observation_state: Option<ObservationStateId>,
        reason_id: Option<u64>,
        score: f64,
    ) -> bool {
        policy.is_valid_match(mode, observation_state, reason_id, score)
    }
}
