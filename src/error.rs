// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy (§7).
//!
//! One enum, one `Display` impl per variant, no panics. Every variant that
//! can surface to a caller carries enough context (masked command, adapter
//! tag, host) to build a useful message without a second round-trip into the
//! adapter that raised it.

use crate::outcome::AdapterTag;
use std::path::PathBuf;
use std::time::Duration;

/// Crate-wide result alias, mirroring the teacher's `errors::Result`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Nonzero exit with `throwOnNonZero` in effect.
    #[error("command `{command}` exited with {}", exit_cause(*exit_code, signal.as_deref()))]
    CommandFailed {
        exit_code: i32,
        signal: Option<String>,
        command: String,
        stdout: String,
        stderr: String,
        duration: Duration,
        adapter: AdapterTag,
        host: Option<String>,
        container: Option<String>,
    },

    /// Watchdog fired before the command completed.
    #[error("command `{command}` timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, command: String },

    /// Captured stream exceeded `maxBuffer`.
    #[error("{stream} exceeded max buffer of {max_bytes} bytes while running `{command}`")]
    BufferOverflow {
        stream: StreamKind,
        max_bytes: usize,
        command: String,
    },

    /// External cancellation token tripped.
    #[error("command `{command}` was cancelled")]
    Cancelled { command: String },

    /// Could not start the child at all.
    #[error("failed to spawn `{command}`{}", cwd.as_ref().map(|c| format!(" in {}", c.display())).unwrap_or_default())]
    Spawn {
        command: String,
        cwd: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// SSH handshake/auth/keepalive failure.
    #[error("connection to {host}:{port} failed on attempt {attempt}: {message}")]
    Connection {
        host: String,
        port: u16,
        attempt: u32,
        message: String,
    },

    /// Availability probe failed (e.g. cluster CLI absent).
    #[error("{adapter} adapter unavailable: {reason}")]
    AdapterUnavailable { adapter: AdapterTag, reason: String },

    /// Constructor or option misuse.
    #[error("invalid configuration: {message}")]
    Validation { message: String },

    /// Adapter-specific failure (pod not found, container not running, ...).
    #[error("{adapter} backend error: {message}")]
    Backend { adapter: AdapterTag, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

fn exit_cause(code: i32, signal: Option<&str>) -> String {
    match signal {
        Some(sig) => format!("signal: {sig}"),
        None => format!("exitCode: {code}"),
    }
}

impl Error {
    /// The masked command string this error concerns, when it has one.
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { command, .. }
            | Error::Timeout { command, .. }
            | Error::BufferOverflow { command, .. }
            | Error::Cancelled { command }
            | Error::Spawn { command, .. } => Some(command),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display_prefers_signal_over_exit_code() {
        let err = Error::CommandFailed {
            exit_code: 137,
            signal: Some("SIGKILL".to_owned()),
            command: "echo hi".to_owned(),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(5),
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        };
        assert_eq!(err.to_string(), "command `echo hi` exited with signal: SIGKILL");
        assert_eq!(err.command(), Some("echo hi"));
    }

    #[test]
    fn command_failed_display_falls_back_to_exit_code() {
        let err = Error::CommandFailed {
            exit_code: 7,
            signal: None,
            command: "exit 7".to_owned(),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        };
        assert_eq!(err.to_string(), "command `exit 7` exited with exitCode: 7");
    }

    #[test]
    fn spawn_error_names_the_offending_directory() {
        let err = Error::Spawn {
            command: "ls".to_owned(),
            cwd: Some(PathBuf::from("/no/such/dir")),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "failed to spawn `ls` in /no/such/dir");
    }

    #[test]
    fn errors_without_a_command_field_return_none() {
        let err = Error::Validation {
            message: "bad option".to_owned(),
        };
        assert_eq!(err.command(), None);
    }
}
