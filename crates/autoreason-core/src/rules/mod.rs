//! Built-in rule plugins.

pub mod daily_window;

use crate::config::InstanceConfig;
use crate::engine::Rule;
use crate::error::{AutoReasonError, Result};

pub use daily_window::DailyWindow;

/// Plugin names accepted in `instances[].plugin`.
pub const PLUGINS: &[&str] = &[daily_window::PLUGIN];

/// Build the rule named by `instance.plugin` from its settings.
pub fn build_rule(instance: &InstanceConfig) -> Result<Box<dyn Rule>> {
    match instance.plugin.as_str() {
        daily_window::PLUGIN => Ok(Box::new(DailyWindow::from_settings(&instance.rule)?)),
        other => Err(AutoReasonError::UnknownPlugin(other.to_string())),
    }
}

/// Problems in the settings of `plugin` that do not prevent it from
/// loading. An error means the rule cannot be built at all.
pub fn validate_settings(plugin: &str, settings: &serde_yaml::Value) -> Result<Vec<String>> {
    match plugin {
        daily_window::PLUGIN => Ok(DailyWindow::from_settings(settings)?.problems()),
        other => Err(AutoReasonError::UnknownPlugin(other.to_string())),
    }
}
