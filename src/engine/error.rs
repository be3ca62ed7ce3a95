//! Engine errors
//!
//! Every failure inside the broker is an `EngineError`. The command layer turns
//! them into `{ success: false, error, errorKind }` responses, so nothing here should ever
//! escape as a panic.

use serde::Serialize;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification of an error, sent to callers as `errorKind` so they
/// can react to a whole family of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Staging,
    Query,
    NotConnected,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    #[error("Operation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("SSH error: {message}")]
    SshError { message: String },

    #[error("Failed to stage remote file: {message}")]
    StagingFailed { message: String },

    #[error("Staged database file not found at {path}")]
    StagedFileMissing { path: String },

    #[error("Cannot read and write staged database file {path}: check local permissions")]
    StagedFilePermission { path: String },

    #[error("No remote file to sync for connection '{connection_id}'")]
    NoStagedFile { connection_id: String },

    #[error("Syntax error: {message}")]
    SyntaxError { message: String },

    #[error("Execution error: {message}")]
    ExecutionError { message: String },

    #[error("Not supported: {message}")]
    NotSupported { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Not connected")]
    NotConnected { connection_id: String },

    #[error("Connection id '{connection_id}' is already in use; disconnect it first")]
    ConnectionIdInUse { connection_id: String },

    #[error("No driver registered for protocol '{protocol}'")]
    DriverNotFound { protocol: String },
}

impl EngineError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }

    pub fn ssh(message: impl Into<String>) -> Self {
        Self::SshError {
            message: message.into(),
        }
    }

    pub fn staging_failed(message: impl Into<String>) -> Self {
        Self::StagingFailed {
            message: message.into(),
        }
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::SyntaxError {
            message: message.into(),
        }
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::ExecutionError {
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn not_connected(connection_id: impl Into<String>) -> Self {
        Self::NotConnected {
            connection_id: connection_id.into(),
        }
    }

    pub fn driver_not_found(protocol: impl Into<String>) -> Self {
        Self::DriverNotFound {
            protocol: protocol.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. } | Self::AuthFailed { .. } | Self::Timeout { .. } => {
                ErrorKind::Connection
            }
            Self::SshError { .. }
            | Self::StagingFailed { .. }
            | Self::StagedFileMissing { .. }
            | Self::StagedFilePermission { .. }
            | Self::NoStagedFile { .. } => ErrorKind::Staging,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::SyntaxError { .. }
            | Self::ExecutionError { .. }
            | Self::NotSupported { .. }
            | Self::InvalidConfig { .. }
            | Self::ConnectionIdInUse { .. }
            | Self::DriverNotFound { .. } => ErrorKind::Query,
        }
    }
}
