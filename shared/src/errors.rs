//! Shared error types for the model station

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },

    #[error("Invalid version string: {input}")]
    InvalidVersion { input: String },

    #[error("Unknown platform family: {input}")]
    UnknownPlatform { input: String },

    #[error("Invalid request id: {input}")]
    InvalidRequestId { input: String },

    #[error("Serialization failed: {message}")]
    SerializationError { message: String },
}

pub type SharedResult<T> = Result<T, SharedError>;
