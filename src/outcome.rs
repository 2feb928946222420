// SPDX-License-Identifier: MPL-2.0

//! The terminal outcome of one `Command` execution (§3 "Result").
//!
//! Named `Outcome` rather than `Result` to leave that name free for
//! `std::result::Result`/[`crate::error::Result`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which adapter produced an [`Outcome`] or emitted an [`crate::events::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterTag {
    Local,
    Ssh,
    Container,
    Cluster,
}

impl std::fmt::Display for AdapterTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AdapterTag::Local => "local",
            AdapterTag::Ssh => "ssh",
            AdapterTag::Container => "container",
            AdapterTag::Cluster => "cluster",
        })
    }
}

/// The terminal record of one executed [`crate::command::Command`] (§3).
///
/// Produced exactly once per execution and immutable thereafter. All text
/// fields (`stdout`, `stderr`, `command`) have already passed through the
/// [`crate::mask::Masker`] configured on the adapter that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub signal: Option<String>,
    /// The reconstructed (masked) command string, as actually dispatched.
    pub command: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub adapter: AdapterTag,
    pub host: Option<String>,
    pub container: Option<String>,
}

impl Outcome {
    /// `exitCode == 0`.
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    /// `"exitCode: N"` or `"signal: NAME"`, empty iff [`Outcome::ok`].
    ///
    /// The synthesized `nothrow` sentinels (124 for timeout, 130 for
    /// cancellation, §9 "Exit-code 124 ... convention") are named explicitly
    /// so `cause` identifies the timeout/cancellation rather than reading as
    /// an ordinary nonzero exit.
    pub fn cause(&self) -> Option<String> {
        if self.ok() {
            return None;
        }
        if let Some(sig) = &self.signal {
            return Some(format!("signal: {sig}"));
        }
        Some(match self.exit_code {
            124 => "exitCode: 124 (timeout)".to_owned(),
            130 => "exitCode: 130 (cancelled)".to_owned(),
            code => format!("exitCode: {code}"),
        })
    }

    /// `end - start`.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Stdout trimmed of a single trailing newline, per §8.
    pub fn text(&self) -> String {
        trim_trailing_newline(&self.stdout)
    }

    /// Stdout as a raw byte buffer.
    pub fn buffer(&self) -> Vec<u8> {
        self.stdout.clone().into_bytes()
    }

    /// Stdout split into lines, trailing empty line dropped.
    pub fn lines(&self) -> Vec<String> {
        let trimmed = trim_trailing_newline(&self.stdout);
        if trimmed.is_empty() {
            return Vec::new();
        }
        trimmed.lines().map(str::to_owned).collect()
    }

    /// Stdout parsed as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.stdout.trim())
    }
}

fn trim_trailing_newline(s: &str) -> String {
    s.strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(s)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stdout: &str, exit_code: i32) -> Outcome {
        let now = Utc::now();
        Outcome {
            stdout: stdout.to_owned(),
            stderr: String::new(),
            exit_code,
            signal: None,
            command: "echo abc".to_owned(),
            start: now,
            end: now,
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        }
    }

    #[test]
    fn text_trims_single_trailing_newline() {
        assert_eq!(outcome("abc\n", 0).text(), "abc");
        assert_eq!(outcome("abc", 0).lines(), vec!["abc".to_owned()]);
    }

    #[test]
    fn cause_empty_iff_ok() {
        assert!(outcome("", 0).cause().is_none());
        assert_eq!(outcome("", 42).cause(), Some("exitCode: 42".to_owned()));
    }
}
