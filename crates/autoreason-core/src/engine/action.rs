//! Delayed actions queued during a check and applied during commit.

use chrono::{DateTime, Utc};

use crate::db::DbTransaction;
use crate::error::Result;
use crate::types::RevisionId;

use super::applier::{self, ReasonApplication};
use super::cursor::{CursorTarget, Cursors};

/// Internal mutation with an in-memory undo.
///
/// Any optimistic effect happens when the action is constructed; `reset`
/// undoes it, `run` makes it durable.
pub trait StateAction: Send {
    fn name(&self) -> &str;
    fn run(&self, tx: &DbTransaction, cursors: &mut Cursors) -> Result<()>;
    fn reset(&self, cursors: &mut Cursors) -> Result<()>;
}

/// Durable reason assignment insert. Abandoned, never undone.
pub trait ReasonAction: Send {
    fn name(&self) -> &str;
    fn run(&self, tx: &DbTransaction, revision: Option<RevisionId>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ActionQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ActionQueue {
    state: Vec<Box<dyn StateAction>>,
    reason: Vec<Box<dyn ReasonAction>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_state(&mut self, action: Box<dyn StateAction>) {
        tracing::trace!(action = action.name(), "state action queued");
        self.state.push(action);
    }

    pub fn push_reason(&mut self, action: Box<dyn ReasonAction>) {
        tracing::trace!(action = action.name(), "reason action queued");
        self.reason.push(action);
    }

    pub fn state_actions(&self) -> &[Box<dyn StateAction>] {
        &self.state
    }

    pub fn reason_actions(&self) -> &[Box<dyn ReasonAction>] {
        &self.reason
    }

    pub fn has_reason_actions(&self) -> bool {
        !self.reason.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty() && self.reason.is_empty()
    }

    pub fn clear(&mut self) {
        self.state.clear();
        self.reason.clear();
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("state", &self.state.iter().map(|a| a.name()).collect::<Vec<_>>())
            .field("reason", &self.reason.iter().map(|a| a.name()).collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

/// Persists a cursor value already set in memory.
#[derive(Debug, Clone)]
pub struct UpdateCursorAction {
    name: String,
    target: CursorTarget,
    at: DateTime<Utc>,
    /// Value restored by `reset`: the cursor as it was when the cycle began.
    previous: DateTime<Utc>,
}

impl UpdateCursorAction {
    /// Build the action and move the in-memory cursor to `at`.
    pub fn queue(cursors: &mut Cursors, target: CursorTarget, at: DateTime<Utc>) -> Self {
        let previous = cursors
            .baseline(target)
            .or_else(|| cursors.get(target))
            .unwrap_or(at);
        cursors.set(target, at);
        let name = match target {
            CursorTarget::Main => "UpdateCursor".to_string(),
            CursorTarget::Module(id) => format!("UpdateCursor[module {id}]"),
        };
        Self {
            name,
            target,
            at,
            previous,
        }
    }

    pub fn target(&self) -> CursorTarget {
        self.target
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl StateAction for UpdateCursorAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, tx: &DbTransaction, cursors: &mut Cursors) -> Result<()> {
        let key = cursors.store_key(self.target);
        tx.save_cursor(cursors.equipment_id(), &key, self.at)
    }

    fn reset(&self, cursors: &mut Cursors) -> Result<()> {
        cursors.set(self.target, self.previous);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ApplyReasonAction {
    application: ReasonApplication,
    early_end: bool,
}

impl ApplyReasonAction {
    pub fn new(application: ReasonApplication) -> Self {
        Self {
            application,
            early_end: false,
        }
    }

    /// Variant whose assignment carries the dynamic-end-before-real-end option.
    pub fn dynamic_end_before_real_end(application: ReasonApplication) -> Self {
        Self {
            application,
            early_end: true,
        }
    }

    pub fn application(&self) -> &ReasonApplication {
        &self.application
    }
}

impl ReasonAction for ApplyReasonAction {
    fn name(&self) -> &str {
        if self.early_end {
            "ApplyReasonDynamicEndBeforeRealEnd"
        } else {
            "ApplyReason"
        }
    }

    fn run(&self, tx: &DbTransaction, revision: Option<RevisionId>) -> Result<()> {
        if self.early_end {
            applier::apply_reason_dynamic_end_before_real_end(tx, revision, &self.application)?;
        } else {
            applier::apply_reason(tx, revision, &self.application)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_tmp;
    use crate::db::IsolationLevel;
    use crate::engine::cursor::CursorKeys;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn update_cursor_is_optimistic_and_resets_to_cycle_start() {
        let (_dir, db) = open_tmp();
        let mut cursors =
            Cursors::load(&db, 1, CursorKeys::new("p", None), Duration::days(3), now()).unwrap();
        let start = cursors.main();

        let first = UpdateCursorAction::queue(&mut cursors, CursorTarget::Main, now() - Duration::days(1));
        let second = UpdateCursorAction::queue(&mut cursors, CursorTarget::Main, now());
        assert_eq!(cursors.main(), now());

        // reset order does not matter, both restore the cycle start
        second.reset(&mut cursors).unwrap();
        first.reset(&mut cursors).unwrap();
        assert_eq!(cursors.main(), start);
        assert_eq!(db.get_cursor(1, "p.DateTime").unwrap(), None);
    }

    #[test]
    fn update_cursor_run_persists_the_value() {
        let (_dir, db) = open_tmp();
        let mut cursors =
            Cursors::load(&db, 1, CursorKeys::new("p", Some("a")), Duration::days(3), now()).unwrap();
        cursors.module(&db, 5, now()).unwrap();
        let action = UpdateCursorAction::queue(&mut cursors, CursorTarget::Module(5), now());

        let tx = db
            .begin_transaction("t", IsolationLevel::ReadCommitted)
            .unwrap();
        action.run(&tx, &mut cursors).unwrap();
        tx.commit().unwrap();

        assert_eq!(db.get_cursor(1, "p.a.DateTime.5").unwrap(), Some(now()));
        assert_eq!(db.get_cursor(1, "p.a.DateTime").unwrap(), None);
    }

    #[test]
    fn queue_clear_empties_both_lists() {
        let (_dir, db) = open_tmp();
        let mut cursors =
            Cursors::load(&db, 1, CursorKeys::new("p", None), Duration::days(3), now()).unwrap();
        let mut queue = ActionQueue::new();
        queue.push_state(Box::new(UpdateCursorAction::queue(
            &mut cursors,
            CursorTarget::Main,
            now(),
        )));
        queue.push_reason(Box::new(ApplyReasonAction::new(ReasonApplication {
            equipment_id: 1,
            reason_id: 1,
            score: 1.0,
            range: crate::types::TimeRange::open(now()),
            dynamic: None,
            details: None,
            overwrite_required: false,
        })));
        assert!(queue.has_reason_actions());
        assert_eq!(queue.state_actions()[0].name(), "UpdateCursor");
        assert_eq!(queue.reason_actions()[0].name(), "ApplyReason");
        queue.clear();
        assert!(queue.is_empty());
    }
}
