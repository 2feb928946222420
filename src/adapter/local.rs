// SPDX-License-Identifier: MPL-2.0

//! Run commands on the machine the engine itself is running on (§4.6).
//!
//! Generalizes the teacher's `command::providers::generic::Generic`
//! provider (spawn argv via `std::process::Command` + `tokio_process`) to
//! the full `Command` surface: shells, stdin sources, stream sinks,
//! timeouts, cancellation, and the retry/cache/nothrow policy layer.

use crate::adapter::base::{self, ResolvedLine};
use crate::adapter::Adapter;
use crate::cache::ResultCache;
use crate::command::{Command, Disposition, Stdin};
use crate::error::{Error, Result, StreamKind};
use crate::escape::HostFamily;
use crate::events::EventBus;
use crate::mask::Masker;
use crate::outcome::{AdapterTag, Outcome};
use crate::progress::ProgressEvent;
use crate::stream::StreamHandler;
use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

#[cfg(unix)]
fn host_family() -> HostFamily {
    HostFamily::Posix
}

#[cfg(windows)]
fn host_family() -> HostFamily {
    HostFamily::WindowsCmd
}

/// The adapter that spawns children directly via [`tokio::process`].
pub struct LocalAdapter {
    masker: Arc<Masker>,
    events: Arc<EventBus>,
    cache: Arc<ResultCache>,
}

impl LocalAdapter {
    pub fn new(masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<ResultCache>) -> Self {
        LocalAdapter {
            masker,
            events,
            cache,
        }
    }

    fn build_std_command(&self, cmd: &Command) -> (tokio::process::Command, String) {
        let family = host_family();
        let display = cmd.program_display();
        let mut tokio_cmd = match base::resolve(cmd, family) {
            ResolvedLine::Argv { program, args } => {
                let mut c = tokio::process::Command::new(program);
                c.args(args);
                c
            }
            ResolvedLine::ShellLine { shell, flag, line } => {
                let mut c = tokio::process::Command::new(shell);
                c.arg(flag).arg(line);
                c
            }
        };
        if let Some(cwd) = &cmd.cwd {
            tokio_cmd.current_dir(cwd);
        }
        for (k, v) in cmd.env.iter() {
            tokio_cmd.env(k, v);
        }
        tokio_cmd.stdin(match &cmd.stdin {
            Stdin::Empty => Stdio::null(),
            Stdin::Bytes(_) | Stdin::Reader(_) => Stdio::piped(),
        });
        tokio_cmd.stdout(Stdio::piped());
        tokio_cmd.stderr(Stdio::piped());
        (tokio_cmd, display)
    }

    async fn spawn_once(&self, cmd: &Command, started_at: chrono::DateTime<Utc>) -> Result<Outcome> {
        let (mut tokio_cmd, display) = self.build_std_command(cmd);

        let mut child: Child = tokio_cmd.spawn().map_err(|source| Error::Spawn {
            command: display.clone(),
            cwd: cmd.cwd.clone(),
            source,
        })?;

        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Spawned);
        }
        self.events.emit(
            "command:spawned",
            AdapterTag::Local,
            serde_json::json!({ "command": self.masker.mask(&display) }),
        );

        feed_stdin(&mut child, &cmd.stdin).await?;

        let stdout_task = spawn_stream_task(
            child.stdout.take(),
            StreamKind::Stdout,
            cmd.stdout.clone(),
            cmd.max_buffer,
            self.masker.clone(),
            display.clone(),
            cmd.progress.clone(),
        );
        let stderr_task = spawn_stream_task(
            child.stderr.take(),
            StreamKind::Stderr,
            cmd.stderr.clone(),
            cmd.max_buffer,
            self.masker.clone(),
            display.clone(),
            cmd.progress.clone(),
        );

        let wait_fut = child.wait();
        let timeout = crate::command::timeout_duration(cmd.timeout_ms);

        let status = match (timeout, &cmd.cancel) {
            (Some(dur), Some(token)) => {
                tokio::select! {
                    res = wait_fut => res.map_err(|source| Error::Spawn { command: display.clone(), cwd: cmd.cwd.clone(), source })?,
                    _ = tokio::time::sleep(dur) => {
                        kill_child(&mut child, &cmd.terminate_signal).await;
                        return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                    }
                    _ = token.cancelled() => {
                        kill_child(&mut child, &cmd.terminate_signal).await;
                        return Err(Error::Cancelled { command: self.masker.mask(&display) });
                    }
                }
            }
            (Some(dur), None) => {
                tokio::select! {
                    res = wait_fut => res.map_err(|source| Error::Spawn { command: display.clone(), cwd: cmd.cwd.clone(), source })?,
                    _ = tokio::time::sleep(dur) => {
                        kill_child(&mut child, &cmd.terminate_signal).await;
                        return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                    }
                }
            }
            (None, Some(token)) => {
                tokio::select! {
                    res = wait_fut => res.map_err(|source| Error::Spawn { command: display.clone(), cwd: cmd.cwd.clone(), source })?,
                    _ = token.cancelled() => {
                        kill_child(&mut child, &cmd.terminate_signal).await;
                        return Err(Error::Cancelled { command: self.masker.mask(&display) });
                    }
                }
            }
            (None, None) => wait_fut.await.map_err(|source| Error::Spawn {
                command: display.clone(),
                cwd: cmd.cwd.clone(),
                source,
            })?,
        };

        let stdout = stdout_task.await.unwrap_or(Ok(String::new()))?;
        let stderr = stderr_task.await.unwrap_or(Ok(String::new()))?;

        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Exited {
                exit_code: status.code().unwrap_or(-1),
            });
        }

        Ok(Outcome {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            signal: signal_name(&status),
            command: self.masker.mask(&display),
            start: started_at,
            end: Utc::now(),
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        })
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, cmd: Command) -> Result<Outcome> {
        if let Some(opts) = &cmd.cache {
            if let Some(hit) = base::cache_lookup(&self.cache, &self.events, AdapterTag::Local, opts) {
                return Ok(hit);
            }
        }

        let started = Utc::now();
        let cache_opts = cmd.cache.clone();
        let masker = self.masker.clone();
        let events = self.events.clone();
        let result = base::execute_with_policy(&cmd, &masker, &events, AdapterTag::Local, started, |_attempt| {
            Box::pin(self.spawn_once(&cmd, started))
        })
        .await;

        if let (Ok(outcome), Some(opts)) = (&result, &cache_opts) {
            base::cache_store(&self.cache, &self.events, AdapterTag::Local, opts, outcome);
        }
        result
    }

    fn execute_sync(&self, cmd: Command) -> Result<Outcome> {
        use std::io::{Read, Write};

        let family = host_family();
        let display = cmd.program_display();
        let mut std_cmd = match base::resolve(&cmd, family) {
            ResolvedLine::Argv { program, args } => {
                let mut c = std::process::Command::new(program);
                c.args(args);
                c
            }
            ResolvedLine::ShellLine { shell, flag, line } => {
                let mut c = std::process::Command::new(shell);
                c.arg(flag).arg(line);
                c
            }
        };
        if let Some(cwd) = &cmd.cwd {
            std_cmd.current_dir(cwd);
        }
        for (k, v) in cmd.env.iter() {
            std_cmd.env(k, v);
        }
        let wants_stdin = matches!(cmd.stdin, Stdin::Bytes(_));
        if matches!(cmd.stdin, Stdin::Reader(_)) {
            return Err(Error::Validation {
                message: "synchronous local execution does not support streaming stdin".into(),
            });
        }
        if cmd.stdout.is_sink() || cmd.stderr.is_sink() {
            return Err(Error::Validation {
                message: "synchronous local execution does not support stream sinks".into(),
            });
        }
        std_cmd.stdin(if wants_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        std_cmd.stdout(Stdio::piped());
        std_cmd.stderr(Stdio::piped());

        let started = Utc::now();
        let mut child = std_cmd.spawn().map_err(|source| Error::Spawn {
            command: display.clone(),
            cwd: cmd.cwd.clone(),
            source,
        })?;

        if let Stdin::Bytes(bytes) = &cmd.stdin {
            if let Some(stdin) = child.stdin.take() {
                let mut stdin = stdin;
                let _ = stdin.write_all(bytes);
            }
        }

        let timeout = crate::command::timeout_duration(cmd.timeout_ms);
        let status = match timeout {
            Some(dur) => match child
                .wait_timeout(dur)
                .map_err(|source| Error::Spawn {
                    command: display.clone(),
                    cwd: cmd.cwd.clone(),
                    source,
                })? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout {
                        timeout_ms: cmd.timeout_ms,
                        command: self.masker.mask(&display),
                    });
                }
            },
            None => child.wait().map_err(|source| Error::Spawn {
                command: display.clone(),
                cwd: cmd.cwd.clone(),
                source,
            })?,
        };

        let mut stdout_buf = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_end(&mut stdout_buf);
        }
        let mut stderr_buf = Vec::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_end(&mut stderr_buf);
        }

        let outcome = Outcome {
            stdout: self.masker.mask(&String::from_utf8_lossy(&stdout_buf)),
            stderr: self.masker.mask(&String::from_utf8_lossy(&stderr_buf)),
            exit_code: status.code().unwrap_or(-1),
            signal: None,
            command: self.masker.mask(&display),
            start: started,
            end: Utc::now(),
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        };
        base::decide_exit(outcome, &cmd)
    }
}

/// `wait_timeout` needs the extension trait brought into scope once, here.
trait WaitTimeoutExt {
    fn wait_timeout(&mut self, dur: std::time::Duration) -> std::io::Result<Option<std::process::ExitStatus>>;
}

impl WaitTimeoutExt for std::process::Child {
    fn wait_timeout(&mut self, dur: std::time::Duration) -> std::io::Result<Option<std::process::ExitStatus>> {
        wait_timeout::ChildExt::wait_timeout(self, dur)
    }
}

async fn feed_stdin(child: &mut Child, stdin: &Stdin) -> Result<()> {
    match stdin {
        Stdin::Empty => {}
        Stdin::Bytes(bytes) => {
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(bytes).await;
                let _ = pipe.shutdown().await;
            }
        }
        Stdin::Reader(reader) => {
            if let Some(mut pipe) = child.stdin.take() {
                let mut guard = reader.lock().await;
                let _ = tokio::io::copy(&mut *guard, &mut pipe).await;
                let _ = pipe.shutdown().await;
            }
        }
    }
    Ok(())
}

fn spawn_stream_task(
    pipe: Option<impl tokio::io::AsyncRead + Send + Unpin + 'static>,
    kind: StreamKind,
    disposition: Disposition,
    max_buffer: usize,
    masker: Arc<Masker>,
    display: String,
    progress: Option<crate::progress::ProgressCallback>,
) -> tokio::task::JoinHandle<Result<String>> {
    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return Ok(String::new());
        };
        match disposition {
            Disposition::Discard => {
                let mut sink = tokio::io::sink();
                let mut pipe = pipe;
                let _ = tokio::io::copy(&mut pipe, &mut sink).await;
                Ok(String::new())
            }
            Disposition::Capture => {
                let on_chunk: Option<crate::stream::ChunkCallback> = progress.map(|p| {
                    let kind = kind;
                    Arc::new(move |chunk: &str| {
                        let event = match kind {
                            StreamKind::Stdout => ProgressEvent::Stdout(chunk.to_owned()),
                            StreamKind::Stderr => ProgressEvent::Stderr(chunk.to_owned()),
                        };
                        p(event);
                    }) as crate::stream::ChunkCallback
                });
                let handler = StreamHandler::new(kind, max_buffer, masker, display, on_chunk);
                handler.consume(pipe).await
            }
            Disposition::Sink(sink) => {
                let on_chunk: crate::stream::ChunkCallback = {
                    let sink = sink.clone();
                    Arc::new(move |chunk: &str| {
                        let sink = sink.clone();
                        let chunk = chunk.to_owned();
                        tokio::spawn(async move {
                            let mut guard = sink.lock().await;
                            let _ = guard.write_all(chunk.as_bytes()).await;
                        });
                    })
                };
                let handler = StreamHandler::new(kind, max_buffer, masker, display, Some(on_chunk));
                handler.consume(pipe).await
            }
        }
    })
}

async fn kill_child(child: &mut Child, terminate_signal: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            if let Ok(sig) = parse_signal(terminate_signal) {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig);
                let grace = tokio::time::sleep(std::time::Duration::from_millis(500));
                tokio::select! {
                    _ = child.wait() => return,
                    _ = grace => {}
                }
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(unix)]
fn parse_signal(name: &str) -> std::result::Result<nix::sys::signal::Signal, ()> {
    use nix::sys::signal::Signal::*;
    Ok(match name {
        "SIGTERM" => SIGTERM,
        "SIGKILL" => SIGKILL,
        "SIGINT" => SIGINT,
        "SIGHUP" => SIGHUP,
        "SIGQUIT" => SIGQUIT,
        "SIGUSR1" => SIGUSR1,
        "SIGUSR2" => SIGUSR2,
        _ => return Err(()),
    })
}

#[cfg(unix)]
fn signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| match sig {
        1 => "SIGHUP".to_owned(),
        2 => "SIGINT".to_owned(),
        3 => "SIGQUIT".to_owned(),
        6 => "SIGABRT".to_owned(),
        9 => "SIGKILL".to_owned(),
        15 => "SIGTERM".to_owned(),
        other => format!("signal {other}"),
    })
}

#[cfg(windows)]
fn signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AdapterSelector, Program, Shell};

    fn adapter() -> LocalAdapter {
        LocalAdapter::new(
            Arc::new(Masker::default_enabled()),
            Arc::new(EventBus::new()),
            Arc::new(ResultCache::default()),
        )
    }

    fn cmd(line: &str) -> Command {
        Command {
            program: Program::ShellLine(line.to_owned()),
            shell: Shell::Default,
            adapter: AdapterSelector::Local,
            ..Command::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let outcome = adapter().execute(cmd("echo hello")).await.unwrap();
        assert!(outcome.ok());
        assert_eq!(outcome.text(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_raises() {
        let err = adapter().execute(cmd("exit 3")).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn nothrow_reports_exit_code() {
        let mut c = cmd("exit 7");
        c.nothrow = true;
        let outcome = adapter().execute(c).await.unwrap();
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_synthesizes_124_under_nothrow() {
        let mut c = cmd("sleep 5");
        c.timeout_ms = 20;
        c.nothrow = true;
        let outcome = adapter().execute(c).await.unwrap();
        assert_eq!(outcome.exit_code, 124);
    }

    #[tokio::test]
    async fn stdin_bytes_are_delivered() {
        let mut c = cmd("cat");
        c.stdin = Stdin::Bytes(b"piped input".to_vec());
        let outcome = adapter().execute(c).await.unwrap();
        assert_eq!(outcome.text(), "piped input");
    }

    #[test]
    fn execute_sync_captures_output() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let outcome = adapter().execute_sync(cmd("echo sync")).unwrap();
        assert_eq!(outcome.text(), "sync");
    }
}
