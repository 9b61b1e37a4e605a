//! `daily-window`: assigns the instance's reason to a fixed daily period,
//! such as a scheduled break.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Deserialize;

use crate::engine::{CycleContext, Rule};
use crate::error::{AutoReasonError, Result};
use crate::types::TimeRange;

pub const PLUGIN: &str = "daily-window";
pub const PLUGIN_KEY: &str = "AutoReasonDailyWindow";

#[derive(Debug, Clone, Deserialize)]
struct Settings {
    /// Window start, `HH:MM` in UTC.
    start: String,
    duration_secs: i64,
    #[serde(default)]
    dynamic: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    overwrite_required: bool,
    /// Let the resolved end come before the window end.
    #[serde(default)]
    early_end: bool,
}

#[derive(Debug, Clone)]
pub struct DailyWindow {
    start: NaiveTime,
    duration: Duration,
    dynamic: Option<String>,
    details: Option<String>,
    overwrite_required: bool,
    early_end: bool,
}

impl DailyWindow {
    pub fn new(start: NaiveTime, duration: Duration) -> Self {
        Self {
            start,
            duration,
            dynamic: None,
            details: None,
            overwrite_required: false,
            early_end: false,
        }
    }

    pub fn from_settings(value: &serde_yaml::Value) -> Result<Self> {
        let settings: Settings = serde_yaml::from_value(value.clone())
            .map_err(|e| AutoReasonError::InvalidConfig(format!("{PLUGIN}: {e}")))?;
        let start = NaiveTime::parse_from_str(&settings.start, "%H:%M").map_err(|e| {
            AutoReasonError::InvalidConfig(format!(
                "{PLUGIN}: start '{}' is not HH:MM: {e}",
                settings.start
            ))
        })?;
        let duration = Duration::try_seconds(settings.duration_secs)
            .filter(|d| *d <= Duration::days(1))
            .ok_or_else(|| {
                AutoReasonError::InvalidConfig(format!(
                    "{PLUGIN}: duration_secs {} is out of range, at most one day",
                    settings.duration_secs
                ))
            })?;
        Ok(Self {
            start,
            duration,
            dynamic: settings.dynamic,
            details: settings.details,
            overwrite_required: settings.overwrite_required,
            early_end: settings.early_end,
        })
    }

    pub(crate) fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.duration <= Duration::zero() {
            problems.push(format!(
                "duration_secs must be positive, got {}",
                self.duration.num_seconds()
            ));
        }
        problems
    }

    /// Window occurrences that end after `from` and begin before `until`.
    fn occurrences(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Vec<TimeRange> {
        let mut windows = Vec::new();
        let Some(first) = from.checked_sub_signed(self.duration) else {
            return windows;
        };
        let mut day = first.date_naive();
        loop {
            let begin = day.and_time(self.start).and_utc();
            if begin >= until {
                break;
            }
            let Some(end) = begin.checked_add_signed(self.duration) else {
                break;
            };
            if end > from {
                windows.push(TimeRange {
                    begin,
                    end: Some(end),
                });
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        windows
    }
}

impl Rule for DailyWindow {
    fn plugin_key(&self) -> &str {
        PLUGIN_KEY
    }

    fn check(&mut self, cx: &mut CycleContext<'_>) -> Result<()> {
        if self.duration <= Duration::zero() {
            return Ok(());
        }
        let cursor = cx.cursor();
        let now = cx.now();
        if cursor >= now {
            return Ok(());
        }

        let mut advance_to = now;
        for window in self.occurrences(cursor, now) {
            let end = window.end.unwrap_or(now);
            if end > now {
                // still running, come back once it is over
                advance_to = window.begin.max(cursor);
                break;
            }
            cx.set_active();
            let range = TimeRange::new(window.begin.max(cursor), end)?;
            if self.already_decided(cx, &range)? {
                continue;
            }
            let mut application = cx.reason_application(range);
            application.dynamic = self.dynamic.clone();
            application.details = self.details.clone();
            application.overwrite_required = self.overwrite_required;
            if self.early_end {
                cx.apply_reason_dynamic_end_before_real_end(application);
            } else {
                cx.apply_reason(application);
            }
        }

        if advance_to > cursor {
            cx.update_cursor(advance_to);
        }
        Ok(())
    }
}

impl DailyWindow {
    /// True when an existing assignment over `range` is this instance's own
    /// or must not be overridden.
    fn already_decided(&self, cx: &CycleContext<'_>, range: &TimeRange) -> Result<bool> {
        for existing in cx.find_assignments(range)? {
            let reason_id = Some(existing.reason_id);
            if self.is_valid_match(cx.policy(), None, None, reason_id, existing.score) {
                tracing::debug!(
                    instance = cx.instance(),
                    modification = %existing.id,
                    range = %range,
                    "window already assigned"
                );
                return Ok(true);
            }
            if cx.manual_score().is_some_and(|manual| existing.score >= manual) {
                return Ok(true);
            }
            if !self.can_override(cx.policy(), &existing) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
