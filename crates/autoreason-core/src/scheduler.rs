//! Drives every (equipment, instance) engine of a store.
//!
//! Engines run one after the other within a pass, so instances bound to the
//! same equipment never overlap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::Config;
use crate::db::ReasonDb;
use crate::engine::{
    CycleOutcome, Engine, EngineSettings, EngineState, Liveness, NotRespondingMonitor,
    SharedLiveness, Watchdog,
};
use crate::error::{AutoReasonError, Result};
use crate::types::Equipment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Not initialized yet, or initialization failed and will be retried.
    Pending,
    Active,
    /// Declined by initialization.
    Inactive,
    /// A reset failed; re-initialized on the next pass.
    Broken,
}

struct Slot {
    equipment: Equipment,
    engine: Engine,
    status: SlotStatus,
}

/// Counts of one pass over every engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub committed: usize,
    pub empty: usize,
    pub rolled_back: usize,
    /// Check or initialization errors; the engine stays usable.
    pub failed: usize,
    pub broken: usize,
    pub skipped: usize,
}

impl PassReport {
    pub fn merge(&mut self, other: &PassReport) {
        self.committed += other.committed;
        self.empty += other.empty;
        self.rolled_back += other.rolled_back;
        self.failed += other.failed;
        self.broken += other.broken;
        self.skipped += other.skipped;
    }
}

/// Current status of one engine, for display.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSummary {
    pub equipment_id: u64,
    pub equipment: String,
    pub instance: String,
    pub status: SlotStatus,
    pub state: EngineState,
}

pub struct Scheduler {
    slots: Vec<Slot>,
    watchdog: Arc<Watchdog>,
    config: Config,
}

impl Scheduler {
    /// One engine per equipment and configured instance. `equipment_id`
    /// restricts the scheduler to a single equipment.
    pub fn new(
        db: Arc<ReasonDb>,
        config: Config,
        computer: &str,
        clock: Arc<dyn Clock>,
        equipment_id: Option<u64>,
    ) -> Result<Self> {
        let equipment = match equipment_id {
            Some(id) => vec![db
                .find_equipment(id)?
                .ok_or(AutoReasonError::EquipmentNotFound(id))?],
            None => db.list_equipment()?,
        };
        let settings = EngineSettings::from_config(&config, computer)?;

        let mut slots = Vec::with_capacity(equipment.len() * config.instances.len());
        for eq in &equipment {
            for instance in &config.instances {
                let rule = crate::rules::build_rule(instance)?;
                slots.push(Slot {
                    equipment: eq.clone(),
                    engine: Engine::new(
                        db.clone(),
                        instance.clone(),
                        settings.clone(),
                        rule,
                        clock.clone(),
                    ),
                    status: SlotStatus::Pending,
                });
            }
        }
        tracing::debug!(engines = slots.len(), "scheduler built");

        Ok(Self {
            slots,
            watchdog: Arc::new(Watchdog::new()),
            config,
        })
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        self.watchdog.clone()
    }

    /// False when the running pass has been silent for longer than the
    /// configured timeout.
    pub fn is_responding(&self, now: DateTime<Utc>) -> bool {
        self.watchdog
            .is_responding(self.config.not_responding_timeout(), now)
    }

    /// Poll the watchdog every `poll` from a background thread while passes
    /// run. `on_trip` is called once the configured timeout elapses without
    /// activity outside a paused section.
    pub fn spawn_monitor<F>(&self, poll: std::time::Duration, on_trip: F) -> Result<NotRespondingMonitor>
    where
        F: Fn() + Send + 'static,
    {
        let monitor = NotRespondingMonitor::spawn(
            self.watchdog.clone(),
            self.config.not_responding_timeout(),
            poll,
            on_trip,
        )?;
        Ok(monitor)
    }

    pub fn frequency(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.frequency_secs)
    }

    pub fn summaries(&self) -> Vec<SlotSummary> {
        self.slots
            .iter()
            .map(|slot| SlotSummary {
                equipment_id: slot.equipment.id,
                equipment: slot.equipment.name.clone(),
                instance: slot.engine.name().to_string(),
                status: slot.status,
                state: slot.engine.state(),
            })
            .collect()
    }

    /// Run one cycle of every active engine, initializing pending and broken
    /// ones first.
    pub fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport::default();
        let liveness: SharedLiveness = self.watchdog.clone();

        for slot in &mut self.slots {
            self.watchdog.set_active();

            if matches!(slot.status, SlotStatus::Pending | SlotStatus::Broken) {
                match slot.engine.initialize(&slot.equipment, liveness.clone()) {
                    Ok(true) => slot.status = SlotStatus::Active,
                    Ok(false) => slot.status = SlotStatus::Inactive,
                    Err(e) => {
                        tracing::error!(
                            instance = slot.engine.name(),
                            equipment = slot.equipment.id,
                            error = %e,
                            "initialization failed"
                        );
                        report.failed += 1;
                        continue;
                    }
                }
            }

            if slot.status != SlotStatus::Active {
                report.skipped += 1;
                continue;
            }

            match slot.engine.run_once() {
                Ok(CycleOutcome::Committed { .. }) => report.committed += 1,
                Ok(CycleOutcome::Empty) => report.empty += 1,
                Ok(CycleOutcome::RolledBack { .. }) => report.rolled_back += 1,
                Err(e) if e.is_fatal() => {
                    tracing::error!(
                        instance = slot.engine.name(),
                        equipment = slot.equipment.id,
                        error = %e,
                        "engine broken, will re-initialize"
                    );
                    slot.status = SlotStatus::Broken;
                    report.broken += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        instance = slot.engine.name(),
                        equipment = slot.equipment.id,
                        error = %e,
                        "cycle failed"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            committed = report.committed,
            empty = report.empty,
            rolled_back = report.rolled_back,
            failed = report.failed,
            broken = report.broken,
            skipped = report.skipped,
            "pass complete"
        );
        report
    }
}
