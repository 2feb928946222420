// SPDX-License-Identifier: MPL-2.0

//! Shared merging, timeout/retry wrapping, masking, and result construction
//! used by all four adapters (§4.4 "Base adapter").
//!
//! Generalizes the teacher's per-provider `factory()`/`available()` pattern
//! (`command::providers::{CommandProvider, factory}`) from "one OS command
//! provider" to "one policy wrapper shared by every backend".

use crate::cache::{CacheOptions, ResultCache};
use crate::command::{Command, Program, Shell};
use crate::error::{Error, Result};
use crate::escape::HostFamily;
use crate::events::EventBus;
use crate::mask::Masker;
use crate::outcome::{AdapterTag, Outcome};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

/// How a [`Command`] resolves to an actual thing-to-spawn, once its
/// `Program`/`Shell` combination is known.
pub enum ResolvedLine {
    /// Exec `program` with `args` directly; no shell involved.
    Argv { program: String, args: Vec<String> },
    /// Hand `line` to `shell`'s `-c`-equivalent flag.
    ShellLine {
        shell: PathBuf,
        flag: &'static str,
        line: String,
    },
}

/// Pick the host family's default shell. POSIX prefers `sh` on `PATH`,
/// falling back to `/bin/sh` if the probe fails; Windows uses `cmd.exe`.
pub fn default_shell(family: HostFamily) -> (PathBuf, &'static str) {
    match family {
        HostFamily::Posix => {
            let sh = which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"));
            (sh, "-c")
        }
        HostFamily::WindowsCmd => (PathBuf::from("cmd.exe"), "/C"),
    }
}

/// Resolve a `Command`'s program/shell pair into something an adapter can
/// spawn (§4.6 local adapter rules, generalized to every backend that
/// ultimately shells out).
pub fn resolve(cmd: &Command, family: HostFamily) -> ResolvedLine {
    match (&cmd.program, &cmd.shell) {
        (Program::Argv { program, args }, Shell::None) => ResolvedLine::Argv {
            program: program.clone(),
            args: args.clone(),
        },
        (Program::Argv { program, args }, Shell::Default) => {
            let (shell, flag) = default_shell(family);
            ResolvedLine::ShellLine {
                shell,
                flag,
                line: argv_to_line(program, args, family),
            }
        }
        (Program::Argv { program, args }, Shell::Explicit(path)) => ResolvedLine::ShellLine {
            shell: path.clone(),
            flag: shell_flag_for(path),
            line: argv_to_line(program, args, family),
        },
        (Program::ShellLine(line), Shell::None | Shell::Default) => {
            let (shell, flag) = default_shell(family);
            ResolvedLine::ShellLine {
                shell,
                flag,
                line: line.clone(),
            }
        }
        (Program::ShellLine(line), Shell::Explicit(path)) => ResolvedLine::ShellLine {
            shell: path.clone(),
            flag: shell_flag_for(path),
            line: line.clone(),
        },
    }
}

fn argv_to_line(program: &str, args: &[String], family: HostFamily) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(crate::escape::escape_one(program, family));
    parts.extend(args.iter().map(|a| crate::escape::escape_one(a, family)));
    parts.join(" ")
}

fn shell_flag_for(path: &std::path::Path) -> &'static str {
    match path.file_stem().and_then(|s| s.to_str()) {
        Some("cmd") => "/C",
        _ => "-c",
    }
}

/// Turn a nonzero exit into [`Error::CommandFailed`] iff the command's
/// effective `throwOnNonZero` says so (§4.4 "Error-vs-result decision").
pub fn decide_exit(outcome: Outcome, cmd: &Command) -> Result<Outcome> {
    if !outcome.ok() && cmd.effective_throw() {
        let duration = outcome.duration().to_std().unwrap_or_default();
        Err(Error::CommandFailed {
            exit_code: outcome.exit_code,
            signal: outcome.signal.clone(),
            command: outcome.command.clone(),
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            duration,
            adapter: outcome.adapter,
            host: outcome.host.clone(),
            container: outcome.container.clone(),
        })
    } else {
        Ok(outcome)
    }
}

/// Convert a raised [`Error`] into a synthesized [`Outcome`] for `nothrow`
/// (§7 "Propagation", §9 "Exit-code 124 ... convention").
fn synthesize(err: Error, cmd: &Command, masker: &Masker, tag: AdapterTag, started: DateTime<Utc>) -> Outcome {
    let command = masker.mask(err.command().unwrap_or(&cmd.program_display()));
    let (exit_code, stderr) = match &err {
        Error::Timeout { timeout_ms, .. } => (124, format!("timed out after {timeout_ms}ms")),
        Error::Cancelled { .. } => (130, "cancelled".to_owned()),
        other => (1, other.to_string()),
    };
    Outcome {
        stdout: String::new(),
        stderr: masker.mask(&stderr),
        exit_code,
        signal: None,
        command,
        start: started,
        end: Utc::now(),
        adapter: tag,
        host: None,
        container: None,
    }
}

/// Look up a cached [`Outcome`] for `opts.key`, emitting `cache:hit` or
/// `cache:miss` accordingly (§4.14).
pub fn cache_lookup(cache: &ResultCache, events: &EventBus, tag: AdapterTag, opts: &CacheOptions) -> Option<Outcome> {
    match cache.get(&opts.key) {
        Some(hit) => {
            events.emit("cache:hit", tag, serde_json::json!({ "key": opts.key }));
            Some(hit)
        }
        None => {
            events.emit("cache:miss", tag, serde_json::json!({ "key": opts.key }));
            None
        }
    }
}

/// Store a freshly computed [`Outcome`] under `opts.key`, emitting
/// `cache:set` (§4.14).
pub fn cache_store(cache: &ResultCache, events: &EventBus, tag: AdapterTag, opts: &CacheOptions, outcome: &Outcome) {
    cache.set(opts.key.clone(), outcome.clone(), opts.ttl);
    events.emit("cache:set", tag, serde_json::json!({ "key": opts.key }));
}

type AttemptFuture<'a> = Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>>;

/// Run `one_attempt` under the command's retry policy (skipped entirely
/// when output is streamed to a user sink, §4.5), then apply the
/// error-vs-result decision and `nothrow` synthesis (§4.4).
pub async fn execute_with_policy<'a, F>(
    cmd: &'a Command,
    masker: &'a Masker,
    events: &'a EventBus,
    tag: AdapterTag,
    started: DateTime<Utc>,
    mut one_attempt: F,
) -> Result<Outcome>
where
    F: FnMut(u32) -> AttemptFuture<'a>,
{
    let output_streamed = cmd.stdout.is_sink() || cmd.stderr.is_sink();
    let policy = if output_streamed { None } else { cmd.retry.clone() };

    let mut attempt = 1u32;
    let decided: Result<Outcome> = loop {
        let result = one_attempt(attempt).await.and_then(|o| decide_exit(o, cmd));
        match result {
            Ok(outcome) => {
                if attempt > 1 {
                    events.emit(
                        "retry:success",
                        tag,
                        serde_json::json!({ "attempt": attempt }),
                    );
                }
                break Ok(outcome);
            }
            Err(e) => {
                let Some(policy) = policy.as_ref() else {
                    break Err(e);
                };
                if !policy.should_retry(&e) || attempt >= policy.max_attempts {
                    events.emit(
                        "retry:failed",
                        tag,
                        serde_json::json!({ "attempt": attempt }),
                    );
                    break Err(e);
                }
                events.emit(
                    "retry:attempt",
                    tag,
                    serde_json::json!({ "attempt": attempt + 1 }),
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    };

    match decided {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if cmd.nothrow {
                Ok(synthesize(e, cmd, masker, tag, started))
            } else {
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AdapterSelector, Disposition};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn base_cmd() -> Command {
        Command {
            program: Program::ShellLine("true".into()),
            adapter: AdapterSelector::Local,
            ..Command::default()
        }
    }

    fn outcome(code: i32, adapter: AdapterTag, started: DateTime<Utc>) -> Outcome {
        Outcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: code,
            signal: None,
            command: "true".into(),
            start: started,
            end: Utc::now(),
            adapter,
            host: None,
            container: None,
        }
    }

    #[tokio::test]
    async fn nonzero_exit_raises_by_default() {
        let cmd = base_cmd();
        let masker = Masker::default_enabled();
        let events = EventBus::new();
        let started = Utc::now();
        let result = execute_with_policy(&cmd, &masker, &events, AdapterTag::Local, started, |_| {
            Box::pin(async move { Ok(outcome(1, AdapterTag::Local, started)) })
        })
        .await;
        assert!(matches!(result, Err(Error::CommandFailed { exit_code: 1, .. })));
    }

    #[tokio::test]
    async fn nothrow_never_raises() {
        let mut cmd = base_cmd();
        cmd.nothrow = true;
        let masker = Masker::default_enabled();
        let events = EventBus::new();
        let started = Utc::now();
        let result = execute_with_policy(&cmd, &masker, &events, AdapterTag::Local, started, |_| {
            Box::pin(async move { Ok(outcome(42, AdapterTag::Local, started)) })
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, 42);
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let mut cmd = base_cmd();
        cmd.retry = Some(crate::retry::RetryPolicy::new(
            3,
            std::time::Duration::from_millis(1),
        ));
        let masker = Masker::default_enabled();
        let events = EventBus::new();
        let started = Utc::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = execute_with_policy(&cmd, &masker, &events, AdapterTag::Local, started, move |attempt| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Ok(outcome(1, AdapterTag::Local, started))
                } else {
                    Ok(outcome(0, AdapterTag::Local, started))
                }
            })
        })
        .await
        .unwrap();
        assert!(result.ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_skipped_when_streaming_to_sink() {
        let mut cmd = base_cmd();
        cmd.retry = Some(crate::retry::RetryPolicy::new(
            3,
            std::time::Duration::from_millis(1),
        ));
        cmd.stdout = Disposition::Sink(Arc::new(tokio::sync::Mutex::new(tokio::io::sink())));
        let masker = Masker::default_enabled();
        let events = EventBus::new();
        let started = Utc::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = execute_with_policy(&cmd, &masker, &events, AdapterTag::Local, started, move |_| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(outcome(1, AdapterTag::Local, started))
            })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
