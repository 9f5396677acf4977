//! Error handling module for the wizard engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the engine should use these types for consistency.
//!
//! The taxonomy matters more than the payload: configuration errors are
//! recoverable (the loader degrades to demo mode), stage-script errors are
//! fatal to the run, and developer errors are logged loudly but never abort a
//! running installation.

use thiserror::Error;

/// Main error type for the wizard engine
#[derive(Error, Debug)]
pub enum WizardError {
    /// IO errors (file operations, pty, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse errors from the config file
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Stage script execution errors (spawn failure, non-zero exit)
    #[error("Stage script failed: {0}")]
    Script(String),

    /// Navigation errors (unknown page, transition from terminal state)
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// State errors (mutex poisoning, invalid pipeline state)
    #[error("State error: {0}")]
    State(String),

    /// Developer/logic errors (cosmetic internal bugs, logged but non-fatal)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for wizard operations
pub type Result<T> = std::result::Result<T, WizardError>;

// Convenient error constructors
impl WizardError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stage script error
    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script(msg.into())
    }

    /// Create a navigation error
    pub fn navigation(msg: impl Into<String>) -> Self {
        Self::Navigation(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create an internal (developer) error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
