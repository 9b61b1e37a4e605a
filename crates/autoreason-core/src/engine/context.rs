use chrono::{DateTime, Utc};

use crate::db::ReasonDb;
use crate::error::Result;
use crate::types::{Equipment, Reason, ReasonAssignment, TimeRange};

use super::action::{ActionQueue, ApplyReasonAction, ReasonAction, StateAction, UpdateCursorAction};
use super::applier::ReasonApplication;
use super::cursor::{CursorTarget, Cursors};
use super::liveness::Liveness;
use super::policy::OverridePolicy;

/// Everything a rule sees while it checks one equipment.
///
/// Durable writes are only ever queued from here; they happen in the commit
/// that follows the check.
pub struct CycleContext<'a> {
    pub(crate) instance: &'a str,
    pub(crate) db: &'a ReasonDb,
    pub(crate) equipment: &'a Equipment,
    pub(crate) reason: &'a Reason,
    pub(crate) policy: OverridePolicy,
    pub(crate) manual_score: Option<f64>,
    pub(crate) cursors: &'a mut Cursors,
    pub(crate) queue: &'a mut ActionQueue,
    pub(crate) liveness: &'a dyn Liveness,
    pub(crate) now: DateTime<Utc>,
}

impl<'a> CycleContext<'a> {
    pub fn instance(&self) -> &str {
        self.instance
    }

    pub fn equipment(&self) -> &Equipment {
        self.equipment
    }

    pub fn reason(&self) -> &Reason {
        self.reason
    }

    pub fn score(&self) -> f64 {
        self.policy.score
    }

    pub fn manual_score(&self) -> Option<f64> {
        self.manual_score
    }

    /// Scoring contract of the instance. Override decisions go through the
    /// rule's own [`Rule::can_override`] / [`Rule::is_valid_match`], which
    /// receive this policy, so the engine and the check agree.
    ///
    /// [`Rule::can_override`]: super::rule::Rule::can_override
    /// [`Rule::is_valid_match`]: super::rule::Rule::is_valid_match
    pub fn policy(&self) -> &OverridePolicy {
        &self.policy
    }

    /// Evaluation time of the cycle.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Main cursor, including moves queued earlier in this check.
    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursors.main()
    }

    pub fn module_cursor(&mut self, module_id: u64) -> Result<DateTime<Utc>> {
        if self.equipment.module(module_id).is_none() {
            return Err(crate::error::AutoReasonError::ModuleNotFound {
                equipment: self.equipment.id,
                module: module_id,
            });
        }
        self.cursors.module(self.db, module_id, self.now)
    }

    /// Committed assignments of this equipment overlapping `range`.
    pub fn find_assignments(&self, range: &TimeRange) -> Result<Vec<ReasonAssignment>> {
        self.db.find_assignments(self.equipment.id, range)
    }

    // -----------------------------------------------------------------------
    // Queueing
    // -----------------------------------------------------------------------

    pub fn add_state_action(&mut self, action: Box<dyn StateAction>) {
        self.queue.push_state(action);
    }

    pub fn add_reason_action(&mut self, action: Box<dyn ReasonAction>) {
        self.queue.push_reason(action);
    }

    /// Move the main cursor to `at` now and persist it on commit.
    pub fn update_cursor(&mut self, at: DateTime<Utc>) {
        let action = UpdateCursorAction::queue(self.cursors, CursorTarget::Main, at);
        self.queue.push_state(Box::new(action));
    }

    pub fn update_module_cursor(&mut self, module_id: u64, at: DateTime<Utc>) -> Result<()> {
        // load first so a reset has a baseline to return to
        self.module_cursor(module_id)?;
        let action = UpdateCursorAction::queue(self.cursors, CursorTarget::Module(module_id), at);
        self.queue.push_state(Box::new(action));
        Ok(())
    }

    /// An application of this instance's reason and score over `range`.
    pub fn reason_application(&self, range: TimeRange) -> ReasonApplication {
        ReasonApplication {
            equipment_id: self.equipment.id,
            reason_id: self.reason.id,
            score: self.policy.score,
            range,
            dynamic: None,
            details: None,
            overwrite_required: false,
        }
    }

    pub fn apply_reason(&mut self, application: ReasonApplication) {
        self.queue
            .push_reason(Box::new(ApplyReasonAction::new(application)));
    }

    pub fn apply_reason_dynamic_end_before_real_end(&mut self, application: ReasonApplication) {
        self.queue.push_reason(Box::new(
            ApplyReasonAction::dynamic_end_before_real_end(application),
        ));
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    pub fn set_active(&self) {
        self.liveness.set_active();
    }

    pub fn pause_check(&self) {
        self.liveness.pause_check();
    }

    pub fn resume_check(&self) {
        self.liveness.resume_check();
    }
}
