//! Error handling module for backmey
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Library code returns [`Result`]; the binary maps each variant to an exit code
//! so the surrounding shell can tell failures apart.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for backmey
#[derive(Error, Debug)]
pub enum BackmeyError {
    /// A component or include path does not exist (warn and continue)
    #[error("Path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// A restore target exists and differs from the archived content
    #[error("Conflict: {count} existing file(s) differ from the archive (first: {first}); rerun with --yes to overwrite or --skip-conflicts to keep them")]
    Conflict { count: usize, first: String },

    /// Missing tool, missing passphrase or wrong passphrase
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Package could not be resolved on any manager
    #[error("Package resolution failed: {0}")]
    PackageResolution(String),

    /// Manifest unreadable or archive truncated
    #[error("Archive corrupt: {0}")]
    ArchiveCorrupt(String),

    /// Archive, profile, version or template not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO errors (file operations, pipes, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (user input, names, flags)
    #[error("Validation error: {0}")]
    Validation(String),

    /// System errors (commands, processes)
    #[error("System error: {0}")]
    System(String),
}

/// Result type alias for backmey operations
pub type Result<T> = std::result::Result<T, BackmeyError>;

// Convenient error constructors
impl BackmeyError {
    /// Create an encryption error
    pub fn encryption(msg: impl Into<String>) -> Self {
        Self::Encryption(msg.into())
    }

    /// Create an archive corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::ArchiveCorrupt(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a system error
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Process exit code for this error.
    ///
    /// 2 is left to clap for usage errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::PathNotFound(_) => 3,
            Self::Conflict { .. } => 4,
            Self::Encryption(_) => 5,
            Self::ArchiveCorrupt(_) => 6,
            _ => 1,
        }
    }
}
