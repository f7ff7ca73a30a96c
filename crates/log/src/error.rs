//! Logger setup errors

/// Result alias for logger setup
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while building or reconfiguring the logger
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Filter directive could not be parsed
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// Unknown output format name
    #[error("Unknown log format: {0}")]
    Format(String),

    /// Reloading the active filter failed
    #[error("Failed to reload log filter: {0}")]
    Reload(String),

    /// A global subscriber was already installed
    #[error("Failed to install logger: {0}")]
    Init(String),
}
