//! One engine instance bound to one equipment, and its run cycle.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::{Config, InstanceConfig};
use crate::db::{IsolationLevel, ReasonDb};
use crate::error::{AutoReasonError, Result};
use crate::types::{Equipment, MachineModeId, ObservationStateId, Reason, ReasonAssignment, RevisionId};

use super::action::ActionQueue;
use super::audit::AuditRecordManager;
use super::context::CycleContext;
use super::cursor::{CursorKeys, Cursors};
use super::liveness::{Liveness, SharedLiveness};
use super::policy::OverridePolicy;
use super::rule::Rule;

const COMMIT_TRANSACTION: &str = "AutoReason.ProcessPendingActions";

/// Score given to a default reason created for an instance without an
/// explicit `reason_score`.
const DEFAULT_REASON_SCORE: f64 = 50.0;

// ---------------------------------------------------------------------------
// EngineState / CycleOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    /// Initialization declined the instance. Terminal.
    Inactive,
    Idle,
    Evaluating,
    Committing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The check queued nothing.
    Empty,
    Committed {
        state_actions: usize,
        reason_actions: usize,
        revision: Option<RevisionId>,
    },
    /// The commit failed. No write of the cycle reached the store.
    RolledBack {
        action: String,
        error: String,
        /// Whether state actions were reset.
        reset: bool,
    },
}

// ---------------------------------------------------------------------------
// EngineSettings
// ---------------------------------------------------------------------------

/// Settings shared by every engine of a process.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lookback: Duration,
    pub use_revision: bool,
    pub application: String,
    pub computer: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config, computer: impl Into<String>) -> Result<Self> {
        Ok(Self {
            lookback: config.first_run_period()?,
            use_revision: config.use_revision,
            application: config.application.clone(),
            computer: computer.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct ActiveInstance {
    equipment: Equipment,
    reason: Reason,
    policy: OverridePolicy,
    cursors: Cursors,
    liveness: SharedLiveness,
}

pub struct Engine {
    name: String,
    db: Arc<ReasonDb>,
    config: InstanceConfig,
    settings: EngineSettings,
    rule: Box<dyn Rule>,
    clock: Arc<dyn Clock>,
    state: EngineState,
    active: Option<ActiveInstance>,
    queue: ActionQueue,
    audit: AuditRecordManager,
}

impl Engine {
    pub fn new(
        db: Arc<ReasonDb>,
        config: InstanceConfig,
        settings: EngineSettings,
        rule: Box<dyn Rule>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let audit = AuditRecordManager::new(
            settings.use_revision,
            settings.application.clone(),
            settings.computer.clone(),
        );
        Self {
            name: config.name(),
            db,
            config,
            settings,
            rule,
            clock,
            state: EngineState::Uninitialized,
            active: None,
            queue: ActionQueue::new(),
            audit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn equipment(&self) -> Option<&Equipment> {
        self.active.as_ref().map(|a| &a.equipment)
    }

    pub fn reason(&self) -> Option<&Reason> {
        self.active.as_ref().map(|a| &a.reason)
    }

    pub fn cursors(&self) -> Option<&Cursors> {
        self.active.as_ref().map(|a| &a.cursors)
    }

    /// Queued (state, reason) action counts. Both are zero between cycles.
    pub fn pending_actions(&self) -> (usize, usize) {
        (
            self.queue.state_actions().len(),
            self.queue.reason_actions().len(),
        )
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    /// Bind the instance to `equipment`. `Ok(false)` leaves it inactive.
    pub fn initialize(&mut self, equipment: &Equipment, liveness: SharedLiveness) -> Result<bool> {
        self.active = None;
        self.queue.clear();
        self.audit.clear();

        let Some(reason) = self.resolve_reason()? else {
            tracing::warn!(instance = %self.name, equipment = equipment.id, "no reason could be resolved");
            return Ok(self.deactivate());
        };

        if let Some(filter_id) = self.config.machine_filter_id {
            match self.db.find_machine_filter(filter_id)? {
                Some(filter) if filter.matches(equipment) => {}
                Some(_) => {
                    tracing::debug!(
                        instance = %self.name,
                        equipment = equipment.id,
                        filter = filter_id,
                        "equipment not in machine filter"
                    );
                    return Ok(self.deactivate());
                }
                None => {
                    tracing::warn!(instance = %self.name, filter = filter_id, "machine filter not found");
                    return Ok(self.deactivate());
                }
            }
        }

        if !self.rule.initialize(equipment)? {
            tracing::debug!(instance = %self.name, equipment = equipment.id, "rule declined equipment");
            return Ok(self.deactivate());
        }

        let score = self.config.reason_score.unwrap_or(reason.default_score);
        let keys = CursorKeys::new(self.rule.plugin_key(), self.config.instance_id.as_deref());
        let cursors = Cursors::load(
            &self.db,
            equipment.id,
            keys,
            self.settings.lookback,
            self.clock.now(),
        )?;

        tracing::info!(
            instance = %self.name,
            equipment = equipment.id,
            reason = reason.id,
            score,
            cursor = %cursors.main(),
            "engine initialized"
        );
        self.active = Some(ActiveInstance {
            equipment: equipment.clone(),
            policy: OverridePolicy::new(reason.id, score),
            reason,
            cursors,
            liveness,
        });
        self.state = EngineState::Idle;
        Ok(true)
    }

    fn deactivate(&mut self) -> bool {
        self.state = EngineState::Inactive;
        false
    }

    /// The explicit reason when it exists, else the default reason created
    /// on demand from its translation key.
    fn resolve_reason(&self) -> Result<Option<Reason>> {
        if let Some(id) = self.config.reason_id {
            match self.db.find_reason(id)? {
                Some(reason) => return Ok(Some(reason)),
                None => tracing::warn!(instance = %self.name, reason = id, "configured reason not found"),
            }
        }
        match &self.config.default_reason {
            Some(default) => {
                let score = self.config.reason_score.unwrap_or(DEFAULT_REASON_SCORE);
                let reason = self.db.get_or_create_reason(
                    &default.translation_key,
                    &default.translation_value,
                    score,
                )?;
                Ok(Some(reason))
            }
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Policy
    // -----------------------------------------------------------------------

    pub fn can_override(&self, existing: &ReasonAssignment) -> Result<bool> {
        let active = self.require_active()?;
        Ok(self.rule.can_override(&active.policy, existing))
    }

    pub fn is_valid_match(
        &self,
        mode: Option<MachineModeId>,
        observation_state: Option<ObservationStateId>,
        reason_id: Option<u64>,
        score: f64,
    ) -> Result<bool> {
        let active = self.require_active()?;
        Ok(self
            .rule
            .is_valid_match(&active.policy, mode, observation_state, reason_id, score))
    }

    fn require_active(&self) -> Result<&ActiveInstance> {
        self.active
            .as_ref()
            .ok_or_else(|| AutoReasonError::NotActive(self.name.clone()))
    }

    // -----------------------------------------------------------------------
    // Run cycle
    // -----------------------------------------------------------------------

    /// Run one check and commit what it queued.
    ///
    /// Commit failures are reported as [`CycleOutcome::RolledBack`]. An
    /// error is returned when the check fails or when a reset fails; the
    /// latter is fatal and leaves the engine uninitialized.
    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        let result = self.cycle();
        self.queue.clear();
        match &result {
            Err(e) if e.is_fatal() => {
                tracing::error!(instance = %self.name, error = %e, "engine left in an indeterminate state");
                self.active = None;
                self.state = EngineState::Uninitialized;
            }
            _ if self.active.is_some() => self.state = EngineState::Idle,
            _ => {}
        }
        result
    }

    fn cycle(&mut self) -> Result<CycleOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Err(AutoReasonError::NotActive(self.name.clone()));
        };

        self.audit.clear();
        active.cursors.begin_cycle();
        self.state = EngineState::Evaluating;

        let check = {
            let mut cx = CycleContext {
                instance: &self.name,
                db: &self.db,
                equipment: &active.equipment,
                reason: &active.reason,
                policy: active.policy,
                manual_score: self.config.manual_score,
                cursors: &mut active.cursors,
                queue: &mut self.queue,
                liveness: active.liveness.as_ref(),
                now: self.clock.now(),
            };
            self.rule.check(&mut cx)
        };
        if let Err(e) = check {
            tracing::error!(instance = %self.name, error = %e, "check failed");
            reset_state_actions(&self.name, &self.queue, &mut active.cursors)?;
            return Err(AutoReasonError::Check {
                instance: self.name.clone(),
                message: e.to_string(),
            });
        }

        if self.queue.is_empty() {
            tracing::trace!(instance = %self.name, "nothing to commit");
            return Ok(CycleOutcome::Empty);
        }

        self.state = EngineState::Committing;
        let revision = if self.queue.has_reason_actions() {
            match self.audit.get_or_create(&self.db) {
                Ok(revision) => revision,
                Err(e) => {
                    tracing::error!(instance = %self.name, error = %e, "revision creation failed");
                    reset_state_actions(&self.name, &self.queue, &mut active.cursors)?;
                    return Ok(CycleOutcome::RolledBack {
                        action: "CreateRevision".to_string(),
                        error: e.to_string(),
                        reset: true,
                    });
                }
            }
        } else {
            None
        };

        process_pending_actions(
            &self.name,
            &self.db,
            &self.queue,
            &mut active.cursors,
            active.liveness.as_ref(),
            revision,
        )
    }
}

// ---------------------------------------------------------------------------
// Commit protocol
// ---------------------------------------------------------------------------

fn process_pending_actions(
    instance: &str,
    db: &ReasonDb,
    queue: &ActionQueue,
    cursors: &mut Cursors,
    liveness: &dyn Liveness,
    revision: Option<RevisionId>,
) -> Result<CycleOutcome> {
    match run_actions(db, queue, cursors, liveness, revision) {
        Ok(()) => {
            tracing::debug!(
                instance,
                state_actions = queue.state_actions().len(),
                reason_actions = queue.reason_actions().len(),
                "actions committed"
            );
            Ok(CycleOutcome::Committed {
                state_actions: queue.state_actions().len(),
                reason_actions: queue.reason_actions().len(),
                revision,
            })
        }
        Err((action, e)) => {
            tracing::error!(instance, action = %action, error = %e, "commit failed");
            let reset = queue.has_reason_actions();
            if reset {
                reset_state_actions(instance, queue, cursors)?;
            }
            Ok(CycleOutcome::RolledBack {
                action,
                error: e.to_string(),
                reset,
            })
        }
    }
}

/// Apply every queued action in one transaction. On error the transaction
/// is dropped uncommitted and the failing step is returned.
fn run_actions(
    db: &ReasonDb,
    queue: &ActionQueue,
    cursors: &mut Cursors,
    liveness: &dyn Liveness,
    revision: Option<RevisionId>,
) -> std::result::Result<(), (String, AutoReasonError)> {
    let tx = db
        .begin_transaction(COMMIT_TRANSACTION, IsolationLevel::ReadCommitted)
        .map_err(|e| ("BeginTransaction".to_string(), e))?;
    for action in queue.state_actions() {
        liveness.set_active();
        action
            .run(&tx, cursors)
            .map_err(|e| (action.name().to_string(), e))?;
    }
    for action in queue.reason_actions() {
        liveness.set_active();
        action
            .run(&tx, revision)
            .map_err(|e| (action.name().to_string(), e))?;
    }
    tx.commit().map_err(|e| ("Commit".to_string(), e))
}

fn reset_state_actions(instance: &str, queue: &ActionQueue, cursors: &mut Cursors) -> Result<()> {
    for action in queue.state_actions() {
        if let Err(e) = action.reset(cursors) {
            tracing::error!(instance, action = action.name(), error = %e, "reset failed");
            return Err(AutoReasonError::ResetFailed {
                instance: instance.to_string(),
                action: action.name().to_string(),
                message: e.to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DefaultReason;
    use crate::db::tests::open_tmp;
    use crate::db::DbTransaction;
    use crate::engine::action::{ReasonAction, StateAction};
    use crate::engine::cursor::CursorTarget;
    use crate::engine::liveness::{NoopLiveness, NotRespondingMonitor, Watchdog};
    use crate::filter::{FilterInitialSet, FilterItem, FilterRule, FilterTarget, MachineFilter};
    use crate::types::TimeRange;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn settings(use_revision: bool) -> EngineSettings {
        EngineSettings {
            lookback: Duration::days(3),
            use_revision,
            application: "autoreason".to_string(),
            computer: "test-host".to_string(),
        }
    }

    /// Rule driven by a closure.
    struct ScriptRule<F>(F);

    impl<F> Rule for ScriptRule<F>
    where
        F: FnMut(&mut CycleContext<'_>) -> Result<()> + Send,
    {
        fn plugin_key(&self) -> &str {
            "Script"
        }

        fn check(&mut self, cx: &mut CycleContext<'_>) -> Result<()> {
            (self.0)(cx)
        }
    }

    /// Covers `[cursor, now)` unless an existing assignment cannot be
    /// overridden, then moves the cursor to now.
    fn cover_rule() -> ScriptRule<impl FnMut(&mut CycleContext<'_>) -> Result<()> + Send> {
        ScriptRule(|cx: &mut CycleContext<'_>| -> Result<()> {
            let range = TimeRange::new(cx.cursor(), cx.now())?;
            if range.is_empty() {
                return Ok(());
            }
            let existing = cx.find_assignments(&range)?;
            if existing.iter().all(|a| cx.policy().can_override(a)) {
                let application = cx.reason_application(range);
                cx.apply_reason(application);
            }
            let now = cx.now();
            cx.update_cursor(now);
            Ok(())
        })
    }

    struct RecordingState {
        name: String,
        log: Log,
        fail_reset: bool,
    }

    impl StateAction for RecordingState {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&self, _tx: &DbTransaction, _cursors: &mut Cursors) -> Result<()> {
            self.log.lock().unwrap().push(format!("run {}", self.name));
            Ok(())
        }

        fn reset(&self, _cursors: &mut Cursors) -> Result<()> {
            self.log.lock().unwrap().push(format!("reset {}", self.name));
            if self.fail_reset {
                return Err(AutoReasonError::Db("reset exploded".to_string()));
            }
            Ok(())
        }
    }

    struct FailingReason;

    impl ReasonAction for FailingReason {
        fn name(&self) -> &str {
            "FailingReason"
        }

        fn run(&self, _tx: &DbTransaction, _revision: Option<RevisionId>) -> Result<()> {
            Err(AutoReasonError::Action {
                action: "FailingReason".to_string(),
                message: "unique constraint violated".to_string(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: Arc<ReasonDb>,
        clock: Arc<ManualClock>,
        equipment: Equipment,
        reason: Reason,
    }

    fn fixture() -> Fixture {
        let (dir, db) = open_tmp();
        let equipment = db.insert_equipment("press-1", Some("press"), &[]).unwrap();
        let reason = db.insert_reason("BRK", "Break", 10.0).unwrap();
        Fixture {
            _dir: dir,
            db: Arc::new(db),
            clock: Arc::new(ManualClock::new(start())),
            equipment,
            reason,
        }
    }

    fn instance(reason_id: u64, score: f64) -> InstanceConfig {
        let mut config = InstanceConfig::new("script");
        config.reason_id = Some(reason_id);
        config.reason_score = Some(score);
        config
    }

    impl Fixture {
        fn engine(&self, config: InstanceConfig, use_revision: bool, rule: impl Rule + 'static) -> Engine {
            let mut engine = Engine::new(
                self.db.clone(),
                config,
                settings(use_revision),
                Box::new(rule),
                self.clock.clone(),
            );
            assert!(engine
                .initialize(&self.equipment, Arc::new(NoopLiveness))
                .unwrap());
            engine
        }
    }

    // -- initialization -----------------------------------------------------

    #[test]
    fn initialize_without_any_reason_is_inactive() {
        let f = fixture();
        let mut config = InstanceConfig::new("script");
        config.reason_id = Some(999);
        let mut engine = Engine::new(
            f.db.clone(),
            config,
            settings(false),
            Box::new(cover_rule()),
            f.clock.clone(),
        );
        assert!(!engine
            .initialize(&f.equipment, Arc::new(NoopLiveness))
            .unwrap());
        assert_eq!(engine.state(), EngineState::Inactive);
        assert!(matches!(engine.run_once(), Err(AutoReasonError::NotActive(_))));
    }

    #[test]
    fn initialize_creates_default_reason_once() {
        let f = fixture();
        let mut config = InstanceConfig::new("script");
        config.default_reason = Some(DefaultReason {
            translation_key: "reason.lunch".to_string(),
            translation_value: "Lunch".to_string(),
        });
        for _ in 0..2 {
            let mut engine = Engine::new(
                f.db.clone(),
                config.clone(),
                settings(false),
                Box::new(cover_rule()),
                f.clock.clone(),
            );
            assert!(engine
                .initialize(&f.equipment, Arc::new(NoopLiveness))
                .unwrap());
            assert_eq!(engine.reason().unwrap().display, "Lunch");
        }
        let lunch: Vec<_> = f
            .db
            .list_reasons()
            .unwrap()
            .into_iter()
            .filter(|r| r.translation_key.as_deref() == Some("reason.lunch"))
            .collect();
        assert_eq!(lunch.len(), 1);
    }

    #[test]
    fn initialize_honors_machine_filter() {
        let f = fixture();
        let excluding = f
            .db
            .insert_machine_filter(MachineFilter {
                id: 0,
                name: "no presses".to_string(),
                initial: FilterInitialSet::All,
                items: vec![FilterItem {
                    rule: FilterRule::Remove,
                    target: FilterTarget::Category("press".to_string()),
                }],
            })
            .unwrap();

        for (filter_id, expected) in [(excluding.id, false), (4242, false)] {
            let mut config = instance(f.reason.id, 80.0);
            config.machine_filter_id = Some(filter_id);
            let mut engine = Engine::new(
                f.db.clone(),
                config,
                settings(false),
                Box::new(cover_rule()),
                f.clock.clone(),
            );
            assert_eq!(
                engine
                    .initialize(&f.equipment, Arc::new(NoopLiveness))
                    .unwrap(),
                expected
            );
        }
    }

    #[test]
    fn score_falls_back_to_reason_default() {
        let f = fixture();
        let mut config = instance(f.reason.id, 0.0);
        config.reason_score = None;
        let engine = f.engine(config, false, cover_rule());
        let existing = ReasonAssignment {
            id: crate::types::ModificationId(1),
            equipment_id: f.equipment.id,
            range: TimeRange::open(start()),
            reason_id: f.reason.id,
            score: 5.0,
            details: None,
            dynamic: None,
            overwrite_required: false,
            option: None,
            revision_id: None,
            created_at: start(),
        };
        assert!(engine.can_override(&existing).unwrap());
        assert!(engine
            .is_valid_match(None, None, Some(f.reason.id), 10.0)
            .unwrap());
    }

    // -- scenarios ----------------------------------------------------------

    #[test]
    fn fresh_instance_covers_lookback_and_persists_cursor() {
        let f = fixture();
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, cover_rule());
        assert_eq!(engine.cursors().unwrap().main(), start() - Duration::days(3));

        let outcome = engine.run_once().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Committed {
                state_actions: 1,
                reason_actions: 1,
                revision: None
            }
        );

        let assignments = f.db.list_assignments(Some(f.equipment.id)).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(
            assignments[0].range,
            TimeRange::new(start() - Duration::days(3), start()).unwrap()
        );
        assert_eq!(assignments[0].score, 80.0);
        assert_eq!(
            f.db.get_cursor(f.equipment.id, "Script.DateTime").unwrap(),
            Some(start())
        );
        assert_eq!(engine.pending_actions(), (0, 0));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn failed_commit_resets_cursor_and_next_cycle_recovers() {
        let f = fixture();
        let fail = Arc::new(Mutex::new(true));
        let fail_flag = fail.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            let range = TimeRange::new(cx.cursor(), cx.now())?;
            let application = cx.reason_application(range);
            cx.apply_reason(application);
            if *fail_flag.lock().unwrap() {
                cx.add_reason_action(Box::new(FailingReason));
            }
            let now = cx.now();
            cx.update_cursor(now);
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, rule);

        let outcome = engine.run_once().unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::RolledBack { ref action, reset: true, .. } if action == "FailingReason"
        ));
        assert_eq!(engine.cursors().unwrap().main(), start() - Duration::days(3));
        assert_eq!(f.db.get_cursor(f.equipment.id, "Script.DateTime").unwrap(), None);
        assert!(f.db.list_assignments(None).unwrap().is_empty());
        assert_eq!(engine.pending_actions(), (0, 0));

        *fail.lock().unwrap() = false;
        engine.run_once().unwrap();
        let assignments = f.db.list_assignments(None).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].range.begin, start() - Duration::days(3));
    }

    #[test]
    fn higher_score_overrides_and_lower_score_backs_off() {
        let f = fixture();
        let tx = f
            .db
            .begin_transaction("seed", IsolationLevel::ReadCommitted)
            .unwrap();
        tx.insert_reason_assignment(crate::types::NewReasonAssignment {
            equipment_id: f.equipment.id,
            range: TimeRange::new(start() - Duration::days(3), start()).unwrap(),
            reason_id: f.reason.id,
            score: 60.0,
            details: None,
            dynamic: None,
            overwrite_required: false,
            option: None,
        })
        .unwrap();
        tx.commit().unwrap();

        let other = f.db.insert_reason("SET", "Setup", 10.0).unwrap();
        let mut a = f.engine(instance(other.id, 80.0), false, cover_rule());
        a.run_once().unwrap();
        assert_eq!(f.db.list_assignments(None).unwrap().len(), 2);

        let mut config_b = instance(f.reason.id, 60.0);
        config_b.instance_id = Some("b".to_string());
        let mut b = f.engine(config_b, false, cover_rule());
        let outcome = b.run_once().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Committed {
                state_actions: 1,
                reason_actions: 0,
                revision: None
            }
        );
        assert_eq!(f.db.list_assignments(None).unwrap().len(), 2);
    }

    #[test]
    fn tracking_disabled_never_creates_revisions() {
        let f = fixture();
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, cover_rule());
        for _ in 0..10 {
            f.clock.advance(Duration::minutes(5));
            engine.run_once().unwrap();
        }
        assert_eq!(f.db.list_assignments(None).unwrap().len(), 10);
        assert!(f.db.list_revisions().unwrap().is_empty());
    }

    // -- properties ---------------------------------------------------------

    #[test]
    fn tracking_enabled_groups_cycle_in_one_revision() {
        let f = fixture();
        let rule = ScriptRule(|cx: &mut CycleContext<'_>| -> Result<()> {
            let begin = cx.cursor();
            for hour in 0..3 {
                let from = begin + Duration::hours(hour);
                let range = TimeRange::new(from, from + Duration::hours(1))?;
                let application = cx.reason_application(range);
                cx.apply_reason(application);
            }
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), true, rule);
        let outcome = engine.run_once().unwrap();
        let CycleOutcome::Committed { revision: Some(revision), .. } = outcome else {
            panic!("expected a committed revision, got {outcome:?}");
        };
        let stored = f.db.find_revision(revision).unwrap().unwrap();
        assert_eq!(stored.modifications.len(), 3);
        assert!(f
            .db
            .list_assignments(None)
            .unwrap()
            .iter()
            .all(|a| a.revision_id == Some(revision)));
    }

    #[test]
    fn cursor_only_cycle_creates_no_revision() {
        let f = fixture();
        let rule = ScriptRule(|cx: &mut CycleContext<'_>| -> Result<()> {
            let now = cx.now();
            cx.update_cursor(now);
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), true, rule);
        engine.run_once().unwrap();
        assert!(f.db.list_revisions().unwrap().is_empty());

        let mut idle = f.engine(
            instance(f.reason.id, 80.0),
            true,
            ScriptRule(|_: &mut CycleContext<'_>| -> Result<()> { Ok(()) }),
        );
        assert_eq!(idle.run_once().unwrap(), CycleOutcome::Empty);
        assert!(f.db.list_revisions().unwrap().is_empty());
    }

    #[test]
    fn failed_commit_resets_each_state_action_once_in_order() {
        let f = fixture();
        let log: Log = Arc::default();
        let rule_log = log.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            for name in ["a", "b", "c"] {
                cx.add_state_action(Box::new(RecordingState {
                    name: name.to_string(),
                    log: rule_log.clone(),
                    fail_reset: false,
                }));
            }
            cx.add_reason_action(Box::new(FailingReason));
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, rule);
        engine.run_once().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["run a", "run b", "run c", "reset a", "reset b", "reset c"]
        );
        assert_eq!(engine.pending_actions(), (0, 0));
    }

    #[test]
    fn failed_commit_without_reason_actions_does_not_reset() {
        struct FailingState(Log);

        impl StateAction for FailingState {
            fn name(&self) -> &str {
                "FailingState"
            }

            fn run(&self, _tx: &DbTransaction, _cursors: &mut Cursors) -> Result<()> {
                Err(AutoReasonError::Db("disk full".to_string()))
            }

            fn reset(&self, _cursors: &mut Cursors) -> Result<()> {
                self.0.lock().unwrap().push("reset".to_string());
                Ok(())
            }
        }

        let f = fixture();
        let log: Log = Arc::default();
        let rule_log = log.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            cx.add_state_action(Box::new(FailingState(rule_log.clone())));
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, rule);
        let outcome = engine.run_once().unwrap();
        assert!(matches!(outcome, CycleOutcome::RolledBack { reset: false, .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_reset_is_fatal_and_uninitializes_engine() {
        let f = fixture();
        let log: Log = Arc::default();
        let rule_log = log.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            cx.add_state_action(Box::new(RecordingState {
                name: "broken".to_string(),
                log: rule_log.clone(),
                fail_reset: true,
            }));
            cx.add_reason_action(Box::new(FailingReason));
            Ok(())
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, rule);
        let err = engine.run_once().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AutoReasonError::ResetFailed { ref action, .. } if action == "broken"));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert_eq!(engine.pending_actions(), (0, 0));
    }

    #[test]
    fn failing_check_discards_queued_actions() {
        let f = fixture();
        let rule = ScriptRule(|cx: &mut CycleContext<'_>| -> Result<()> {
            let now = cx.now();
            cx.update_cursor(now);
            Err(AutoReasonError::InvalidConfig("bad window".to_string()))
        });
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, rule);
        let err = engine.run_once().unwrap_err();
        assert!(matches!(err, AutoReasonError::Check { .. }));
        assert!(!err.is_fatal());
        assert_eq!(engine.pending_actions(), (0, 0));
        assert_eq!(engine.cursors().unwrap().main(), start() - Duration::days(3));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn consecutive_cycles_do_not_duplicate() {
        let f = fixture();
        let mut engine = f.engine(instance(f.reason.id, 80.0), false, cover_rule());
        engine.run_once().unwrap();
        assert_eq!(engine.run_once().unwrap(), CycleOutcome::Empty);
        assert_eq!(f.db.list_assignments(None).unwrap().len(), 1);
    }

    #[test]
    fn liveness_is_signaled_before_each_action() {
        #[derive(Default)]
        struct Counter(Mutex<usize>);

        impl Liveness for Counter {
            fn set_active(&self) {
                *self.0.lock().unwrap() += 1;
            }
            fn pause_check(&self) {}
            fn resume_check(&self) {}
        }

        let f = fixture();
        let counter = Arc::new(Counter::default());
        let mut engine = Engine::new(
            f.db.clone(),
            instance(f.reason.id, 80.0),
            settings(false),
            Box::new(cover_rule()),
            f.clock.clone(),
        );
        assert!(engine.initialize(&f.equipment, counter.clone()).unwrap());
        engine.run_once().unwrap();
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }

    #[test]
    fn failed_commit_resets_module_cursor() {
        let f = fixture();
        let mill = f.db.insert_equipment("mill-1", None, &["spindle".into()]).unwrap();
        let module_id = mill.modules[0].id;
        let fail = Arc::new(Mutex::new(true));
        let fail_flag = fail.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            let now = cx.now();
            cx.update_module_cursor(module_id, now)?;
            let range = TimeRange::new(cx.module_cursor(module_id)? - Duration::hours(1), now)?;
            let application = cx.reason_application(range);
            cx.apply_reason(application);
            if *fail_flag.lock().unwrap() {
                cx.add_reason_action(Box::new(FailingReason));
            }
            Ok(())
        });
        let mut engine = Engine::new(
            f.db.clone(),
            instance(f.reason.id, 80.0),
            settings(false),
            Box::new(rule),
            f.clock.clone(),
        );
        assert!(engine.initialize(&mill, Arc::new(NoopLiveness)).unwrap());
        let key = format!("Script.DateTime.{module_id}");

        let outcome = engine.run_once().unwrap();
        assert!(matches!(outcome, CycleOutcome::RolledBack { reset: true, .. }));
        assert_eq!(
            engine.cursors().unwrap().get(CursorTarget::Module(module_id)),
            Some(start() - Duration::days(3))
        );
        assert_eq!(f.db.get_cursor(mill.id, &key).unwrap(), None);

        *fail.lock().unwrap() = false;
        let outcome = engine.run_once().unwrap();
        assert!(matches!(outcome, CycleOutcome::Committed { reason_actions: 1, .. }));
        assert_eq!(f.db.get_cursor(mill.id, &key).unwrap(), Some(start()));
        assert_eq!(
            engine.cursors().unwrap().get(CursorTarget::Module(module_id)),
            Some(start())
        );
    }

    #[test]
    fn rule_override_hooks_decide_over_the_policy() {
        /// Never overrides anything and never accepts a match.
        struct Yielding;

        impl Rule for Yielding {
            fn plugin_key(&self) -> &str {
                "Yielding"
            }

            fn check(&mut self, cx: &mut CycleContext<'_>) -> Result<()> {
                let range = TimeRange::new(cx.cursor(), cx.now())?;
                let existing = cx.find_assignments(&range)?;
                if existing.iter().all(|a| self.can_override(cx.policy(), a)) {
                    let application = cx.reason_application(range);
                    cx.apply_reason(application);
                }
                let now = cx.now();
                cx.update_cursor(now);
                Ok(())
            }

            fn can_override(&self, _policy: &OverridePolicy, _existing: &ReasonAssignment) -> bool {
                false
            }

            fn is_valid_match(
                &self,
                _policy: &OverridePolicy,
                _mode: Option<MachineModeId>,
                _observation_state: Option<ObservationStateId>,
                _reason_id: Option<u64>,
                _score: f64,
            ) -> bool {
                false
            }
        }

        let f = fixture();
        let other = f.db.insert_reason("SET", "Setup", 10.0).unwrap();
        let tx = f
            .db
            .begin_transaction("seed", IsolationLevel::ReadCommitted)
            .unwrap();
        let weak = tx
            .insert_reason_assignment(crate::types::NewReasonAssignment {
                equipment_id: f.equipment.id,
                range: TimeRange::new(start() - Duration::days(1), start()).unwrap(),
                reason_id: other.id,
                score: 10.0,
                details: None,
                dynamic: None,
                overwrite_required: false,
                option: None,
            })
            .unwrap();
        tx.commit().unwrap();

        let mut engine = f.engine(instance(f.reason.id, 80.0), false, Yielding);
        assert!(OverridePolicy::new(f.reason.id, 80.0).can_override(&weak));
        assert!(!engine.can_override(&weak).unwrap());
        assert!(!engine
            .is_valid_match(None, None, Some(f.reason.id), 80.0)
            .unwrap());

        let outcome = engine.run_once().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Committed {
                state_actions: 1,
                reason_actions: 0,
                revision: None
            }
        );
        assert_eq!(f.db.list_assignments(None).unwrap(), vec![weak]);
    }

    #[test]
    fn blocking_check_trips_the_not_responding_monitor() {
        let f = fixture();
        let paused = Arc::new(Mutex::new(false));
        let paused_flag = paused.clone();
        let rule = ScriptRule(move |cx: &mut CycleContext<'_>| -> Result<()> {
            let pause = *paused_flag.lock().unwrap();
            if pause {
                cx.pause_check();
            }
            std::thread::sleep(std::time::Duration::from_millis(400));
            if pause {
                cx.resume_check();
            }
            Ok(())
        });
        let watchdog = Arc::new(Watchdog::new());
        let mut engine = Engine::new(
            f.db.clone(),
            instance(f.reason.id, 80.0),
            settings(false),
            Box::new(rule),
            f.clock.clone(),
        );
        assert!(engine.initialize(&f.equipment, watchdog.clone()).unwrap());

        let spawn = || {
            NotRespondingMonitor::spawn(
                watchdog.clone(),
                Duration::milliseconds(100),
                std::time::Duration::from_millis(10),
                || {},
            )
            .unwrap()
        };

        watchdog.set_active();
        let monitor = spawn();
        assert_eq!(engine.run_once().unwrap(), CycleOutcome::Empty);
        assert!(monitor.tripped());
        monitor.stop();

        // a check that pauses detection around the long call is not flagged
        *paused.lock().unwrap() = true;
        watchdog.set_active();
        let monitor = spawn();
        engine.run_once().unwrap();
        assert!(!monitor.tripped());
        monitor.stop();
    }
}
