//! Error types for linuxdiag-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while resolving or executing a command
///
/// A non-zero exit status is never an error here: it comes back as a
/// normal [`CommandResult`](crate::result::CommandResult).
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Executable could not be located, locally or on the remote host
    #[error("unable to find command '{command}' on {location}")]
    NotFound {
        /// Bare command name that was looked up
        command: String,
        /// `localhost`, `host` or `user@host`
        location: String,
    },

    /// Failed to connect to, or lost the transport to, a remote host
    #[error("connection to {host} failed: {message}")]
    ConnectionFailed {
        /// Host identifier
        host: String,
        /// Underlying cause
        message: String,
    },

    /// Remote host rejected our credentials
    #[error("authentication failed for {user}@{host}: {message}")]
    AuthenticationFailed {
        /// Host identifier
        host: String,
        /// Username that was offered
        user: String,
        /// Underlying cause
        message: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?} on {}: {command}", .host.as_deref().unwrap_or("localhost"))]
    Timeout {
        /// Command line that was running
        command: String,
        /// Remote host, `None` for local execution
        host: Option<String>,
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// I/O error outside of a command's own execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    pub(crate) fn connection(host: impl Into<String>, message: impl ToString) -> Self {
        ExecError::ConnectionFailed {
            host: host.into(),
            message: message.to_string(),
        }
    }

    /// Whether the transport (not the command) failed
    ///
    /// The pool evicts a connection whenever a call on it returns an error
    /// for which this is true.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            ExecError::ConnectionFailed { .. } | ExecError::AuthenticationFailed { .. } => true,
            ExecError::Timeout { host, .. } => host.is_some(),
            _ => false,
        }
    }

    /// Whether the executable could not be resolved
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_timeout_is_connection_error() {
        let err = ExecError::Timeout {
            command: "sleep 10".to_string(),
            host: Some("h1".to_string()),
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("2s"));
        assert!(err.to_string().contains("h1"));
    }

    #[test]
    fn test_local_timeout_is_not_connection_error() {
        let err = ExecError::Timeout {
            command: "sleep 10".to_string(),
            host: None,
            timeout: Duration::from_secs(1),
        };
        assert!(!err.is_connection_error());
        assert!(err.to_string().contains("localhost"));
    }

    #[test]
    fn test_not_found_is_distinct() {
        let err = ExecError::NotFound {
            command: "ss".to_string(),
            location: "admin@h1".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_connection_error());
        assert_eq!(err.to_string(), "unable to find command 'ss' on admin@h1");
    }
}
