//! Error types for batch runs and device sessions.
//!
//! Errors are split by how far they travel: [`ConfigError`] and [`RunError`]
//! are returned to the caller of the coordinator, while [`SessionError`] never
//! leaves the device it happened on and ends up tagged in that device's
//! [`DeviceResult`](crate::model::DeviceResult).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run configuration was rejected before any connection was opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The device list is empty.
    #[error("no devices loaded")]
    NoDevices,

    /// A device was given without an address.
    #[error("device '{0}' has an empty address")]
    EmptyAddress(String),

    /// Two devices share the same address within one run.
    #[error("duplicate device address {0}")]
    DuplicateAddress(String),

    /// The command script is empty after dropping blank lines.
    #[error("no commands loaded")]
    NoCommands,

    /// Username or password is missing.
    #[error("username and password are required")]
    MissingCredentials,

    /// Concurrency limit must be at least one.
    #[error("concurrency limit must be positive")]
    InvalidConcurrency,

    /// Per-command timeout must be non-zero.
    #[error("command timeout must be positive")]
    InvalidTimeout,

    /// A job file could not be parsed.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// A prompt profile regex failed to compile.
    #[error("invalid prompt profile: {0}")]
    InvalidProfile(String),
}

/// Coarse error classification carried by device results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ErrorKind {
    ConnectError,
    AuthError,
    PrivilegeError,
    CommandTimeout,
    PagingSuppressFailure,
    ChannelClosed,
    LogError,
    Cancelled,
    /// The session task ended abnormally.
    TaskFailed,
}

/// Errors that end a single device session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The transport could not be opened (dial, handshake or host key).
    #[error("connection failed: {0}")]
    Connect(String),

    /// Credentials were rejected or the login did not reach a prompt.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Privilege escalation was rejected or did not reach a privileged prompt.
    #[error("privilege escalation failed: {0}")]
    Privilege(String),

    /// A command did not return to the prompt in time.
    ///
    /// `partial` holds the output received before the deadline; it has already
    /// been written to the device log.
    #[error("command '{command}' timed out")]
    CommandTimeout { command: String, partial: String },

    /// The paging command was answered with a device error.
    #[error("paging suppression rejected: {0}")]
    PagingRejected(String),

    /// The remote shell closed while a response was awaited.
    #[error("channel closed by remote")]
    ChannelClosed,

    /// The run was cancelled while this session was active.
    #[error("cancelled")]
    Cancelled,

    /// Writing the device log failed.
    #[error("log write failed: {0}")]
    Log(#[from] std::io::Error),

    /// The session task panicked or was aborted.
    #[error("session task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// Classification used in device results.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connect(_) => ErrorKind::ConnectError,
            SessionError::Auth(_) => ErrorKind::AuthError,
            SessionError::Privilege(_) => ErrorKind::PrivilegeError,
            SessionError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            SessionError::PagingRejected(_) => ErrorKind::PagingSuppressFailure,
            SessionError::ChannelClosed => ErrorKind::ChannelClosed,
            SessionError::TaskFailed(_) => ErrorKind::TaskFailed,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Log(_) => ErrorKind::LogError,
        }
    }
}

/// Errors returned by coordinator control operations.
#[derive(Error, Debug)]
pub enum RunError {
    /// The run configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another run is still `Running` or `Cancelling`.
    #[error("another run is already active")]
    RunActive,

    /// The operation needs a completed run.
    #[error("run has not completed")]
    NotCompleted,

    /// No run has been started yet.
    #[error("no run has been started")]
    NoRun,

    /// Filesystem error on the log directory or report.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The results report could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_result_kinds() {
        assert_eq!(
            SessionError::Connect("refused".to_string()).kind(),
            ErrorKind::ConnectError
        );
        assert_eq!(
            SessionError::Auth("rejected".to_string()).kind(),
            ErrorKind::AuthError
        );
        assert_eq!(
            SessionError::CommandTimeout {
                command: "show run".to_string(),
                partial: String::new(),
            }
            .kind(),
            ErrorKind::CommandTimeout
        );
        assert_eq!(SessionError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn config_error_is_wrapped_transparently() {
        let err = RunError::from(ConfigError::NoCommands);
        assert_eq!(err.to_string(), "no commands loaded");
    }
}
