//! Hypervisor-specific error types
//!
//! Saturation and timeouts are ordinary outcomes (`Admission`, `RequestOutcome`)
//! and never show up here.

use shared::SharedError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Backend launch failed: {reason}")]
    LaunchFailed { reason: String },

    #[error("No port available: {attempts} attempts starting at {preferred}")]
    NoPortAvailable { preferred: u16, attempts: u16 },

    #[error("Replacing {path} failed: {reason}")]
    ReplaceFailed { path: String, reason: String },

    #[error("Verification of {path} failed: {reason}")]
    VerifyFailed { path: String, reason: String },

    #[error("Invalid update request: {reason}")]
    InvalidUpdate { reason: String },

    #[error("Could not terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },

    #[error("Another operation is in progress: {operation}")]
    OperationInProgress { operation: String },

    #[error("Backend is not running")]
    NotRunning,

    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Control loop is no longer running")]
    ControlLoopClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Shared component error: {0}")]
    Shared(#[from] SharedError),
}

impl HypervisorError {
    pub fn config(message: impl Into<String>) -> Self {
        HypervisorError::Configuration { message: message.into() }
    }

    pub fn launch(reason: impl Into<String>) -> Self {
        HypervisorError::LaunchFailed { reason: reason.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        HypervisorError::Backend { message: message.into() }
    }

    pub fn in_progress(operation: impl Into<String>) -> Self {
        HypervisorError::OperationInProgress { operation: operation.into() }
    }
}

pub type HypervisorResult<T> = Result<T, HypervisorError>;
