//! The reason-assignment engine: one [`Engine`] per (equipment, instance).
//!
//! A cycle runs the instance's [`Rule`] against a [`CycleContext`], which
//! only queues work. The queued actions are then applied in a single
//! transaction; on failure nothing is written and optimistic cursor moves
//! are undone.

pub mod action;
pub mod applier;
pub mod audit;
pub mod context;
pub mod cursor;
pub mod cycle;
pub mod liveness;
pub mod policy;
pub mod rule;

pub use action::{ActionQueue, ApplyReasonAction, ReasonAction, StateAction, UpdateCursorAction};
pub use applier::{apply_reason, apply_reason_dynamic_end_before_real_end, ReasonApplication};
pub use audit::AuditRecordManager;
pub use context::CycleContext;
pub use cursor::{CursorKeys, CursorTarget, Cursors, DATE_TIME_KEY};
pub use cycle::{CycleOutcome, Engine, EngineSettings, EngineState};
pub use liveness::{Liveness, NoopLiveness, NotRespondingMonitor, SharedLiveness, Watchdog};
pub use policy::OverridePolicy;
pub use rule::Rule;
