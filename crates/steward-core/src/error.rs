//! Unified error types for Steward

use thiserror::Error;

/// Unified error type for all Steward operations
#[derive(Error, Debug)]
pub enum StewardError {
    // Git / checkpoint errors
    #[error("Git command failed: {0}")]
    GitCommand(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Manifest errors
    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Manifest corrupted: {0}")]
    ManifestCorruption(String),

    // Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing agent credentials: {0}")]
    MissingCredentials(String),

    // Agent session errors
    #[error("Agent session error: {0}")]
    Session(String),

    // Process coordination errors
    #[error("Another instance is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("Registry error: {0}")]
    Registry(String),

    // Notification bridge errors
    #[error("Bridge error: {0}")]
    Bridge(String),

    // Pipeline errors
    #[error("Phase error: {0}")]
    Phase(String),

    #[error("Drift check error: {0}")]
    Drift(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using StewardError
pub type Result<T> = std::result::Result<T, StewardError>;
