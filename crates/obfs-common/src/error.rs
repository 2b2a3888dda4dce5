//! Error types for obfuscation rotation operations.
//!
//! This module defines the error taxonomy shared by the rotation daemon
//! and its CLI entry points. All errors implement `std::error::Error`
//! via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for rotation operations.
pub type ObfsResult<T> = Result<T, ObfsError>;

/// Errors that can occur during obfuscation rotation operations.
#[derive(Debug, Error)]
pub enum ObfsError {
    /// Obfuscation is globally disabled in the configuration.
    ///
    /// Not a defect: the caller is expected to exit cleanly with
    /// nothing to do.
    #[error("Obfuscation is disabled in configuration")]
    ObfuscationDisabled,

    /// Configuration file could not be read.
    #[error("Failed to load configuration from '{path}': {source}")]
    ConfigLoad {
        /// The configuration file path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Another operation holds the exclusive lock.
    #[error("Operation lock busy: '{path}' is held by another invocation")]
    LockContention {
        /// The lock marker path.
        path: String,
    },

    /// The lock infrastructure itself failed (e.g. lock directory
    /// cannot be created). Fatal at startup.
    #[error("Failed to set up operation lock at '{path}': {source}")]
    LockSetup {
        /// The lock marker path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Failed to spawn a shell command.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Shell command did not complete within the bounded timeout.
    #[error("Shell command timed out after {timeout_secs}s: '{command}'")]
    CommandTimeout {
        /// The command that timed out.
        command: String,
        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// State file read/write failed. Degrades to in-memory operation.
    #[error("State persistence failed for '{path}': {message}")]
    Persistence {
        /// The state file path.
        path: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl ObfsError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a persistence error.
    pub fn persistence(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error must terminate the process at startup.
    ///
    /// Per-interface mutation failures, lock contention, and persistence
    /// problems are all contained at the operation level and never
    /// propagate past a single rotation cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObfsError::ConfigLoad { .. }
                | ObfsError::InvalidConfig { .. }
                | ObfsError::LockSetup { .. }
        )
    }

    /// Returns true if this error means another invocation won the
    /// exclusive lock and the caller should back off immediately.
    pub fn is_contention(&self) -> bool {
        matches!(self, ObfsError::LockContention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ObfsError::invalid_config("VLAN_POOL", "empty pool");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for VLAN_POOL: empty pool"
        );
    }

    #[test]
    fn test_shell_command_failed_display() {
        let err = ObfsError::ShellCommandFailed {
            command: "ovs-vsctl set port nm-wg0 tag=100".to_string(),
            exit_code: 1,
            output: "no port named nm-wg0".to_string(),
        };
        assert!(err.to_string().contains("ovs-vsctl set port"));
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_is_fatal() {
        assert!(ObfsError::invalid_config("f", "m").is_fatal());
        assert!(ObfsError::LockSetup {
            path: "/run/x".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        }
        .is_fatal());

        assert!(!ObfsError::ObfuscationDisabled.is_fatal());
        assert!(!ObfsError::persistence("/var/lib/x", "read-only fs").is_fatal());
        assert!(!ObfsError::ShellCommandFailed {
            command: "ip link show nm-wg0".into(),
            exit_code: 1,
            output: "does not exist".into(),
        }
        .is_fatal());
        assert!(!ObfsError::LockContention {
            path: "/run/x".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_is_contention() {
        assert!(ObfsError::LockContention {
            path: "/run/x".into()
        }
        .is_contention());
        assert!(!ObfsError::ObfuscationDisabled.is_contention());
    }
}
