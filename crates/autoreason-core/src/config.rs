use crate::error::{AutoReasonError, Result};
use crate::paths;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// InstanceConfig
// ---------------------------------------------------------------------------

/// Reason created on demand when an instance has no explicit reason id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultReason {
    pub translation_key: String,
    pub translation_value: String,
}

/// One configured engine instance. Bound to every equipment its machine
/// filter accepts (every equipment when no filter is set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Rule plugin name, e.g. `daily-window`.
    pub plugin: String,
    /// Distinguishes several instances of one plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_reason: Option<DefaultReason>,
    /// Score of the assignments this instance writes. Falls back to the
    /// reason's default score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_score: Option<f64>,
    /// Score of manual assignments this instance must not override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_filter_id: Option<u64>,
    /// Plugin-specific settings.
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub rule: serde_yaml::Value,
}

impl InstanceConfig {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            instance_id: None,
            reason_id: None,
            default_reason: None,
            reason_score: None,
            manual_score: None,
            machine_filter_id: None,
            rule: serde_yaml::Value::Null,
        }
    }

    /// `plugin` or `plugin.instance_id`, used in logs and cursor keys.
    pub fn name(&self) -> String {
        match self.instance_id.as_deref() {
            Some(id) if !id.is_empty() => format!("{}.{}", self.plugin, id),
            _ => self.plugin.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Application name recorded in revisions.
    #[serde(default = "default_application")]
    pub application: String,
    /// Lookback used to seed a cursor on first run.
    #[serde(default = "default_first_run_period")]
    pub first_run_period_secs: i64,
    /// Group the assignments of each cycle in a revision.
    #[serde(default)]
    pub use_revision: bool,
    /// Period between two scheduler passes.
    #[serde(default = "default_frequency")]
    pub frequency_secs: u64,
    /// Silence after which a running cycle is reported as not responding.
    #[serde(default = "default_not_responding_timeout")]
    pub not_responding_timeout_secs: u64,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_version() -> u32 {
    1
}

fn default_application() -> String {
    "autoreason".to_string()
}

/// Upper bound of the lookback: ten years.
pub const MAX_FIRST_RUN_PERIOD_SECS: i64 = 10 * 365 * 24 * 3600;

fn default_first_run_period() -> i64 {
    3 * 24 * 3600
}

fn default_frequency() -> u64 {
    2
}

fn default_not_responding_timeout() -> u64 {
    7 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            application: default_application(),
            first_run_period_secs: default_first_run_period(),
            use_revision: false,
            frequency_secs: default_frequency(),
            not_responding_timeout_secs: default_not_responding_timeout(),
            instances: Vec::new(),
        }
    }
}

impl Config {
    /// Lookback used to seed a missing cursor. Errors when the value is not
    /// positive or exceeds [`MAX_FIRST_RUN_PERIOD_SECS`].
    pub fn first_run_period(&self) -> Result<Duration> {
        let secs = self.first_run_period_secs;
        if secs <= 0 || secs > MAX_FIRST_RUN_PERIOD_SECS {
            return Err(AutoReasonError::InvalidConfig(format!(
                "first_run_period_secs must be in 1..={MAX_FIRST_RUN_PERIOD_SECS}, got {secs}"
            )));
        }
        Duration::try_seconds(secs).ok_or_else(|| {
            AutoReasonError::InvalidConfig(format!("first_run_period_secs out of range: {secs}"))
        })
    }

    /// Saturates at the largest representable duration.
    pub fn not_responding_timeout(&self) -> Duration {
        i64::try_from(self.not_responding_timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(AutoReasonError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        crate::io::atomic_write(&path, self.to_yaml()?.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if let Err(e) = self.first_run_period() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            });
        }

        if self.not_responding_timeout_secs <= self.frequency_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "not_responding_timeout_secs ({}) should exceed frequency_secs ({})",
                    self.not_responding_timeout_secs, self.frequency_secs
                ),
            });
        }

        let mut seen = HashSet::new();
        for instance in &self.instances {
            let name = instance.name();
            if !seen.insert(name.clone()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate instance '{name}'"),
                });
            }

            if instance.reason_id.is_none() && instance.default_reason.is_none() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "instance '{name}' has neither reason_id nor default_reason"
                    ),
                });
            }

            if let Some(default) = &instance.default_reason {
                if default.translation_key.trim().is_empty() {
                    warnings.push(ConfigWarning {
                        level: WarnLevel::Warning,
                        message: format!(
                            "instance '{name}' has an empty default_reason.translation_key"
                        ),
                    });
                }
            }

            match crate::rules::validate_settings(&instance.plugin, &instance.rule) {
                Ok(problems) => {
                    for problem in problems {
                        warnings.push(ConfigWarning {
                            level: WarnLevel::Warning,
                            message: format!("instance '{name}': {problem}"),
                        });
                    }
                }
                Err(e) => warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("instance '{name}': {e}"),
                }),
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
