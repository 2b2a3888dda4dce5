//! Shell command execution utilities for the rotation daemon.
//!
//! All switch and interface manipulation goes through external CLIs
//! (`ovs-vsctl`, `ip`, `tc`). This module provides safe command execution
//! with proper quoting to prevent command injection, and a bounded-timeout
//! variant so a hung external command cannot stall a rotation cycle.
//!
//! # Example
//!
//! ```ignore
//! use obfs_common::shell::{self, OVS_VSCTL_CMD, shellquote};
//!
//! let iface = "nm-wg0";
//! let cmd = format!("{} set port {} tag=100", OVS_VSCTL_CMD, shellquote(iface));
//! shell::exec_or_throw(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{ObfsError, ObfsResult};

/// Path to the `ovs-vsctl` command for OVS bridge/port configuration.
pub const OVS_VSCTL_CMD: &str = "/usr/bin/ovs-vsctl";

/// Path to the `ip` command for network interface configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `tc` command for qdisc manipulation.
pub const TC_CMD: &str = "/sbin/tc";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes characters with special
/// meaning inside double quotes: `$`, `` ` ``, `"`, `\`, and newline.
///
/// # Example
///
/// ```
/// use obfs_common::shell::shellquote;
///
/// assert_eq!(shellquote("nm-wg0"), "\"nm-wg0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The combined stdout output.
    pub stdout: String,
    /// The combined stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Executes a shell command asynchronously.
///
/// Runs the command through `/bin/sh -c` to support shell features like
/// pipes and command chaining. A non-zero exit is reported in the
/// returned [`ExecResult`], not as an `Err`.
pub async fn exec(cmd: &str) -> ObfsResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ObfsError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Executes a shell command and returns an error on non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> ObfsResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(ObfsError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Executes a shell command with a bounded timeout.
///
/// External mutation calls are expected to complete quickly or fail.
/// The timeout guarantees a hung command surfaces as
/// [`ObfsError::CommandTimeout`] instead of stalling the caller's cycle.
pub async fn exec_with_timeout(cmd: &str, timeout: Duration) -> ObfsResult<String> {
    match tokio::time::timeout(timeout, exec_or_throw(cmd)).await {
        Ok(result) => result,
        Err(_) => Err(ObfsError::CommandTimeout {
            command: cmd.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("nm-wg0"), "\"nm-wg0\"");
        assert_eq!(shellquote("100"), "\"100\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        // Dollar sign (variable expansion)
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");

        // Backtick (command substitution)
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");

        // Double quote
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");

        // Backslash
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_exec_result_success() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "output".to_string(),
            stderr: "".to_string(),
        };
        assert!(result.success());
        assert_eq!(result.combined_output(), "output");
    }

    #[test]
    fn test_exec_result_failure() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "".to_string(),
            stderr: "error message".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "error message");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert_eq!(result.combined_output(), "stdout\nstderr");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_failure() {
        let result = exec("exit 42").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_exec_or_throw_success() {
        let output = exec_or_throw("echo success").await.unwrap();
        assert_eq!(output, "success");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        let result = exec_or_throw("exit 1").await;
        match result {
            Err(ObfsError::ShellCommandFailed { exit_code, .. }) => {
                assert_eq!(exit_code, 1);
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_with_timeout_completes() {
        let output = exec_with_timeout("echo fast", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output, "fast");
    }

    #[tokio::test]
    async fn test_exec_with_timeout_expires() {
        let result = exec_with_timeout("sleep 5", Duration::from_millis(100)).await;
        match result {
            Err(ObfsError::CommandTimeout { command, .. }) => {
                assert!(command.contains("sleep"));
            }
            other => panic!("Expected CommandTimeout, got {:?}", other),
        }
    }
}
