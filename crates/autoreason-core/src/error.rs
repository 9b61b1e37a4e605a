use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutoReasonError {
    #[error("not initialized: run 'autoreason init'")]
    NotInitialized,

    #[error("database error: {0}")]
    Db(String),

    #[error("reason not found: {0}")]
    ReasonNotFound(u64),

    #[error("equipment not found: {0}")]
    EquipmentNotFound(u64),

    #[error("machine filter not found: {0}")]
    FilterNotFound(u64),

    #[error("module {module} not found on equipment {equipment}")]
    ModuleNotFound { equipment: u64, module: u64 },

    #[error("invalid time range: {0}")]
    InvalidRange(String),

    #[error("action '{action}' failed: {message}")]
    Action { action: String, message: String },

    #[error("check of instance '{instance}' failed: {message}")]
    Check { instance: String, message: String },

    #[error("reset of action '{action}' in instance '{instance}' failed: {message}")]
    ResetFailed {
        instance: String,
        action: String,
        message: String,
    },

    #[error("engine instance '{0}' is not active")]
    NotActive(String),

    #[error("unknown rule plugin: {0}")]
    UnknownPlugin(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AutoReasonError {
    /// Whether the engine instance that raised this error is left in an
    /// indeterminate state and must be re-initialized before it runs again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResetFailed { .. })
    }

    pub(crate) fn db(e: impl std::fmt::Display) -> Self {
        Self::Db(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AutoReasonError>;
