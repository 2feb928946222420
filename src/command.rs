// SPDX-License-Identifier: MPL-2.0

//! Immutable record of what to run and how (§3 "Command").
//!
//! A `Command` is built once, by the engine, and never mutated afterwards;
//! every chain method on [`crate::engine::Engine`] or
//! [`crate::process::ProcessHandle`] returns a new value instead.

use crate::cache::CacheOptions;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use crate::cancel::CancelToken;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// What to execute: either an argv vector (no shell involved unless asked
/// for) or a single shell line assembled by the escaper.
#[derive(Debug, Clone)]
pub enum Program {
    Argv { program: String, args: Vec<String> },
    ShellLine(String),
}

/// Which shell, if any, runs the assembled command line (§3).
#[derive(Debug, Clone, Default)]
pub enum Shell {
    /// Exec the program directly; no shell involved.
    #[default]
    None,
    /// The host family's default shell (`/bin/sh` on POSIX if found, else a
    /// built-in fallback; `cmd.exe` on Windows).
    Default,
    /// An explicit shell binary, invoked with its `-c`-equivalent flag.
    Explicit(PathBuf),
}

/// Stdin source for a spawned command.
pub enum Stdin {
    Empty,
    Bytes(Vec<u8>),
    Reader(Arc<tokio::sync::Mutex<dyn AsyncRead + Send + Unpin>>),
}

impl std::fmt::Debug for Stdin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stdin::Empty => f.write_str("Stdin::Empty"),
            Stdin::Bytes(b) => write!(f, "Stdin::Bytes({} bytes)", b.len()),
            Stdin::Reader(_) => f.write_str("Stdin::Reader(..)"),
        }
    }
}

impl Clone for Stdin {
    fn clone(&self) -> Self {
        match self {
            Stdin::Empty => Stdin::Empty,
            Stdin::Bytes(b) => Stdin::Bytes(b.clone()),
            // A live reader cannot be cloned; a Command carrying one is
            // consumed exactly once by the adapter that executes it, so
            // this only matters for chain methods that don't touch stdin.
            Stdin::Reader(r) => Stdin::Reader(r.clone()),
        }
    }
}

/// Where a stream's bytes end up.
#[derive(Clone)]
pub enum Disposition {
    Capture,
    Discard,
    Sink(Arc<tokio::sync::Mutex<dyn tokio::io::AsyncWrite + Send + Unpin>>),
}

impl std::fmt::Debug for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Disposition::Capture => "Disposition::Capture",
            Disposition::Discard => "Disposition::Discard",
            Disposition::Sink(_) => "Disposition::Sink(..)",
        })
    }
}

impl Disposition {
    pub fn is_sink(&self) -> bool {
        matches!(self, Disposition::Sink(_))
    }
}

/// The adapter a [`Command`] targets, with its backend-specific options
/// (§6 "Adapter options").
#[derive(Debug, Clone)]
pub enum AdapterSelector {
    Local,
    Ssh(crate::adapter::ssh::SshOptions),
    Container(crate::adapter::container::ContainerOptions),
    Cluster(crate::adapter::cluster::ClusterOptions),
    RemoteContainer {
        ssh: crate::adapter::ssh::SshOptions,
        container: crate::adapter::container::ContainerOptions,
    },
}

/// Immutable record of what to run and how (§3).
pub struct Command {
    pub program: Program,
    pub cwd: Option<PathBuf>,
    pub env: IndexMap<String, String>,
    pub shell: Shell,
    pub stdin: Stdin,
    pub stdout: Disposition,
    pub stderr: Disposition,
    /// 0 means "no timeout" (§9 fixes the ambiguity in the source).
    pub timeout_ms: u64,
    /// Upper bound, in bytes, on captured stdout/stderr before a bounded
    /// buffer error is raised (§3 invariants, §4.2).
    pub max_buffer: usize,
    pub terminate_signal: String,
    pub throw_on_nonzero: bool,
    /// Overrides `throw_on_nonzero` to `false` regardless of its value.
    pub nothrow: bool,
    pub detach: bool,
    pub cancel: Option<CancelToken>,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<CacheOptions>,
    pub progress: Option<ProgressCallback>,
    pub adapter: AdapterSelector,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("shell", &self.shell)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("timeout_ms", &self.timeout_ms)
            .field("throw_on_nonzero", &self.throw_on_nonzero)
            .field("nothrow", &self.nothrow)
            .field("detach", &self.detach)
            .field("adapter", &self.adapter)
            .finish()
    }
}

impl Command {
    /// Whether a nonzero exit should raise, once `nothrow` is considered
    /// (§4.4 "Error-vs-result decision").
    pub fn effective_throw(&self) -> bool {
        self.throw_on_nonzero && !self.nothrow
    }

    /// A human-readable, unmasked description of the program for spawn
    /// errors (§7 "Spawn error").
    pub fn program_display(&self) -> String {
        match &self.program {
            Program::Argv { program, args } => {
                let mut s = program.clone();
                for a in args {
                    s.push(' ');
                    s.push_str(a);
                }
                s
            }
            Program::ShellLine(line) => line.clone(),
        }
    }
}

impl Clone for Command {
    fn clone(&self) -> Self {
        Command {
            program: self.program.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            shell: self.shell.clone(),
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            timeout_ms: self.timeout_ms,
            max_buffer: self.max_buffer,
            terminate_signal: self.terminate_signal.clone(),
            throw_on_nonzero: self.throw_on_nonzero,
            nothrow: self.nothrow,
            detach: self.detach,
            cancel: self.cancel.clone(),
            retry: self.retry.clone(),
            cache: self.cache.clone(),
            progress: self.progress.clone(),
            adapter: self.adapter.clone(),
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command {
            program: Program::ShellLine(String::new()),
            cwd: None,
            env: IndexMap::new(),
            shell: Shell::default(),
            stdin: Stdin::Empty,
            stdout: Disposition::Capture,
            stderr: Disposition::Capture,
            timeout_ms: 0,
            max_buffer: 10 * 1024 * 1024,
            terminate_signal: "SIGTERM".to_owned(),
            throw_on_nonzero: true,
            nothrow: false,
            detach: false,
            cancel: None,
            retry: None,
            cache: None,
            progress: None,
            adapter: AdapterSelector::Local,
        }
    }
}

/// Duration helper for `timeout_ms`; `0` means "no timeout" (§9).
pub fn timeout_duration(timeout_ms: u64) -> Option<Duration> {
    if timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms))
    }
}
