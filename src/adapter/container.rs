// SPDX-License-Identifier: MPL-2.0

//! Drives a container-runtime CLI (`docker`/`podman`-compatible) for
//! ephemeral and persistent containers (§4.9).
//!
//! The runtime has no daemon socket in this crate's dependency graph, so
//! "driving a container" means exactly what it means for the cluster
//! adapter next door: resolve a CLI binary, build an argv, spawn it with
//! [`tokio::process`], and stream its stdout/stderr through the same
//! bounded handlers every other adapter uses. Generalizes the teacher's
//! `package::providers::{apt,yum,...}` habit of shelling out to a package
//! manager CLI (`apt-get`, `yum`, ...) from "one fixed subcommand" to "the
//! subcommand the caller's fluent builder asked for".

use crate::adapter::base;
use crate::adapter::Adapter;
use crate::command::Command;
use crate::error::{Error, Result, StreamKind};
use crate::events::EventBus;
use crate::mask::Masker;
use crate::outcome::{AdapterTag, Outcome};
use crate::progress::ProgressEvent;
use crate::stream::StreamHandler;
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Which binary this adapter drives; `docker` is the default, but the same
/// argv shape works for any CLI that speaks the Docker CLI dialect.
fn runtime_binary() -> PathBuf {
    which::which("docker")
        .or_else(|_| which::which("podman"))
        .unwrap_or_else(|_| PathBuf::from("docker"))
}

/// Exactly one of `image` (ephemeral `run --rm`) or `container` (exec
/// against a running container) is required (§6 "Container").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOptions {
    pub image: Option<String>,
    pub container: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<(String, String)>,
    #[serde(default)]
    pub ports: Vec<(String, String)>,
    pub network: Option<String>,
    pub hostname: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(default = "default_true")]
    pub rm: bool,
    pub restart: Option<String>,
    #[serde(default)]
    pub pull: Option<String>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ContainerOptions {
    pub fn ephemeral(image: impl Into<String>) -> Self {
        ContainerOptions {
            image: Some(image.into()),
            ..Default::default()
        }
    }

    pub fn existing(container: impl Into<String>) -> Self {
        ContainerOptions {
            container: Some(container.into()),
            ..Default::default()
        }
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        match (&self.image, &self.container) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::Validation {
                message: "container adapter requires exactly one of `image` or `container`".into(),
            }),
        }
    }

    /// Build the `run --rm ...` argv for an ephemeral invocation.
    fn run_argv(&self, inline_env: &IndexMap<String, String>) -> Vec<String> {
        let mut argv = vec!["run".to_owned()];
        if self.rm {
            argv.push("--rm".into());
        }
        if let Some(name) = &self.name {
            argv.push("--name".into());
            argv.push(name.clone());
        }
        if let Some(user) = &self.user {
            argv.push("--user".into());
            argv.push(user.clone());
        }
        if let Some(workdir) = &self.workdir {
            argv.push("--workdir".into());
            argv.push(workdir.clone());
        }
        for (k, v) in self.env.iter().chain(inline_env.iter()) {
            argv.push("--env".into());
            argv.push(format!("{k}={v}"));
        }
        for (host, container) in &self.volumes {
            argv.push("--volume".into());
            argv.push(format!("{host}:{container}"));
        }
        for (host, container) in &self.ports {
            argv.push("--publish".into());
            argv.push(format!("{host}:{container}"));
        }
        if let Some(network) = &self.network {
            argv.push("--network".into());
            argv.push(network.clone());
        }
        if let Some(hostname) = &self.hostname {
            argv.push("--hostname".into());
            argv.push(hostname.clone());
        }
        if let Some(memory) = &self.memory {
            argv.push("--memory".into());
            argv.push(memory.clone());
        }
        if let Some(cpus) = &self.cpus {
            argv.push("--cpus".into());
            argv.push(cpus.clone());
        }
        if self.privileged {
            argv.push("--privileged".into());
        }
        for cap in &self.cap_add {
            argv.push("--cap-add".into());
            argv.push(cap.clone());
        }
        for cap in &self.cap_drop {
            argv.push("--cap-drop".into());
            argv.push(cap.clone());
        }
        if let Some(restart) = &self.restart {
            argv.push("--restart".into());
            argv.push(restart.clone());
        }
        if let Some(pull) = &self.pull {
            argv.push("--pull".into());
            argv.push(pull.clone());
        }
        argv.extend(self.extra_flags.iter().cloned());
        argv.push(self.image.clone().expect("validated by caller"));
        argv
    }

    /// Build the `exec ...` argv for a command against a running container.
    fn exec_argv(&self, interactive_stdin: bool, inline_env: &IndexMap<String, String>) -> Vec<String> {
        let mut argv = vec!["exec".to_owned()];
        if interactive_stdin {
            argv.push("-i".into());
        }
        if let Some(user) = &self.user {
            argv.push("--user".into());
            argv.push(user.clone());
        }
        if let Some(workdir) = &self.workdir {
            argv.push("--workdir".into());
            argv.push(workdir.clone());
        }
        for (k, v) in self.env.iter().chain(inline_env.iter()) {
            argv.push("--env".into());
            argv.push(format!("{k}={v}"));
        }
        argv.extend(self.extra_flags.iter().cloned());
        argv.push(self.container.clone().expect("validated by caller"));
        argv
    }
}

pub struct ContainerAdapter {
    masker: Arc<Masker>,
    events: Arc<EventBus>,
    cache: Arc<crate::cache::ResultCache>,
}

/// Build the full `docker`/`podman`-dialect argv for `cmd` against `opts`
/// (`run ...` for an ephemeral container, `exec ...` for an existing one,
/// followed by the caller's own program). Shared between [`ContainerAdapter`]
/// and the SSH-tunnelled variant in [`crate::adapter::remote_container`],
/// since both drive the same CLI dialect — only how the resulting argv gets
/// spawned differs.
pub(crate) fn build_argv(cmd: &Command, opts: &ContainerOptions) -> Result<Vec<String>> {
    opts.validate()?;
    let user_argv = match &cmd.program {
        crate::command::Program::Argv { program, args } => {
            let mut v = vec![program.clone()];
            v.extend(args.clone());
            v
        }
        crate::command::Program::ShellLine(line) => vec!["sh".to_owned(), "-c".to_owned(), line.clone()],
    };
    // The engine-wide `cwd()` chain method has no container-native meaning of
    // its own; fold it into `--workdir` unless the container options already
    // pin one explicitly.
    let opts = if opts.workdir.is_none() && cmd.cwd.is_some() {
        let mut opts = opts.clone();
        opts.workdir = cmd.cwd.as_ref().map(|p| p.display().to_string());
        std::borrow::Cow::Owned(opts)
    } else {
        std::borrow::Cow::Borrowed(opts)
    };
    let opts = opts.as_ref();
    let mut argv = if opts.image.is_some() {
        opts.run_argv(&cmd.env)
    } else {
        opts.exec_argv(!matches!(cmd.stdin, crate::command::Stdin::Empty), &cmd.env)
    };
    argv.extend(user_argv);
    Ok(argv)
}

impl ContainerAdapter {
    pub fn new(masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<crate::cache::ResultCache>) -> Self {
        ContainerAdapter { masker, events, cache }
    }

    async fn spawn_once(&self, cmd: &Command, opts: &ContainerOptions, started: chrono::DateTime<Utc>) -> Result<Outcome> {
        let argv = build_argv(cmd, opts)?;
        let binary = runtime_binary();
        let display = format!("{} {}", binary.display(), argv.join(" "));

        let mut proc = tokio::process::Command::new(&binary);
        proc.args(&argv);
        proc.stdin(match &cmd.stdin {
            crate::command::Stdin::Empty => Stdio::null(),
            _ => Stdio::piped(),
        });
        proc.stdout(Stdio::piped());
        proc.stderr(Stdio::piped());

        let mut child = proc.spawn().map_err(|source| Error::Spawn {
            command: display.clone(),
            cwd: None,
            source,
        })?;

        self.events.emit(
            "command:spawned",
            AdapterTag::Container,
            serde_json::json!({ "command": self.masker.mask(&display) }),
        );
        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Spawned);
        }

        match &cmd.stdin {
            crate::command::Stdin::Empty => {}
            crate::command::Stdin::Bytes(bytes) => {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(bytes).await;
                    let _ = stdin.shutdown().await;
                }
            }
            crate::command::Stdin::Reader(reader) => {
                if let Some(mut stdin) = child.stdin.take() {
                    let mut guard = reader.lock().await;
                    let _ = tokio::io::copy(&mut *guard, &mut stdin).await;
                    let _ = stdin.shutdown().await;
                }
            }
        }

        let stdout_handler = StreamHandler::new(
            StreamKind::Stdout,
            cmd.max_buffer,
            self.masker.clone(),
            display.clone(),
            None,
        );
        let stderr_handler = StreamHandler::new(
            StreamKind::Stderr,
            cmd.max_buffer,
            self.masker.clone(),
            display.clone(),
            None,
        );
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let timeout = crate::command::timeout_duration(cmd.timeout_ms);
        let run = async {
            let stdout = match stdout_pipe {
                Some(pipe) => stdout_handler.consume(pipe).await?,
                None => String::new(),
            };
            let stderr = match stderr_pipe {
                Some(pipe) => stderr_handler.consume(pipe).await?,
                None => String::new(),
            };
            let status = child.wait().await.map_err(|source| Error::Spawn {
                command: display.clone(),
                cwd: None,
                source,
            })?;
            Ok::<_, Error>((stdout, stderr, status))
        };

        let (stdout, stderr, status) = match (timeout, &cmd.cancel) {
            (Some(dur), Some(token)) => tokio::select! {
                res = run => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
                _ = token.cancelled() => return Err(Error::Cancelled { command: self.masker.mask(&display) }),
            },
            (Some(dur), None) => tokio::select! {
                res = run => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
            },
            (None, Some(token)) => tokio::select! {
                res = run => res?,
                _ = token.cancelled() => return Err(Error::Cancelled { command: self.masker.mask(&display) }),
            },
            (None, None) => run.await?,
        };

        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Exited {
                exit_code: status.code().unwrap_or(-1),
            });
        }

        Ok(Outcome {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            signal: None,
            command: self.masker.mask(&display),
            start: started,
            end: Utc::now(),
            adapter: AdapterTag::Container,
            host: None,
            container: opts.container.clone().or_else(|| opts.name.clone()),
        })
    }

    /// Run one lifecycle subcommand (`start`, `stop`, `pause`, `restart`,
    /// `stats`, `commit`, ...) against a named container and return its raw
    /// stdout, trimmed. Not part of the core exec contract (§4.9).
    pub async fn lifecycle(&self, subcommand: &str, container: &str, extra: &[&str]) -> Result<String> {
        let binary = runtime_binary();
        let mut args = vec![subcommand.to_owned(), container.to_owned()];
        args.extend(extra.iter().map(|s| s.to_string()));
        let output = tokio::process::Command::new(&binary)
            .args(&args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", binary.display(), args.join(" ")),
                cwd: None,
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Container,
                message: format!(
                    "{subcommand} {container} failed: {}",
                    self.masker.mask(&String::from_utf8_lossy(&output.stderr))
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Stream `logs -f` for `container`, delivering each masked line to
    /// `on_line` until the follower exits or `stop` token cancels.
    pub async fn logs_follow(
        &self,
        container: &str,
        on_line: Arc<dyn Fn(String) + Send + Sync>,
        stop: crate::cancel::CancelToken,
    ) -> Result<()> {
        let binary = runtime_binary();
        let mut child = tokio::process::Command::new(&binary)
            .args(["logs", "-f", container])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: format!("{} logs -f {container}", binary.display()),
                cwd: None,
                source,
            })?;
        let Some(stdout) = child.stdout.take() else {
            return Ok(());
        };
        let mut lines = tokio::io::BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(l)) => on_line(self.masker.mask(&l)),
                        _ => break,
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
        Ok(())
    }

    pub fn copy_into(&self, container: &str, local_path: &str, container_path: &str) -> Result<()> {
        self.copy(local_path, &format!("{container}:{container_path}"))
    }

    pub fn copy_out_of(&self, container: &str, container_path: &str, local_path: &str) -> Result<()> {
        self.copy(&format!("{container}:{container_path}"), local_path)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let binary = runtime_binary();
        let status = std::process::Command::new(&binary)
            .args(["cp", src, dst])
            .status()
            .map_err(|source| Error::Spawn {
                command: format!("{} cp {src} {dst}", binary.display()),
                cwd: None,
                source,
            })?;
        if !status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Container,
                message: format!("cp {src} {dst} failed"),
            });
        }
        Ok(())
    }
}

fn extract_opts(cmd: &Command) -> Result<&ContainerOptions> {
    match &cmd.adapter {
        crate::command::AdapterSelector::Container(opts) => Ok(opts),
        crate::command::AdapterSelector::RemoteContainer { container, .. } => Ok(container),
        _ => Err(Error::Validation {
            message: "ContainerAdapter received a command not targeting the container adapter".into(),
        }),
    }
}

#[async_trait]
impl Adapter for ContainerAdapter {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn is_available(&self) -> bool {
        which::which("docker").is_ok() || which::which("podman").is_ok()
    }

    async fn execute(&self, cmd: Command) -> Result<Outcome> {
        let opts = extract_opts(&cmd)?.clone();

        if let Some(cache_opts) = &cmd.cache {
            if let Some(hit) = base::cache_lookup(&self.cache, &self.events, AdapterTag::Container, cache_opts) {
                return Ok(hit);
            }
        }

        let started = Utc::now();
        let cache_opts = cmd.cache.clone();
        let masker = self.masker.clone();
        let events = self.events.clone();
        let result = base::execute_with_policy(&cmd, &masker, &events, AdapterTag::Container, started, |_attempt| {
            Box::pin(self.spawn_once(&cmd, &opts, started))
        })
        .await;

        if let (Ok(outcome), Some(cache_opts)) = (&result, &cache_opts) {
            base::cache_store(&self.cache, &self.events, AdapterTag::Container, cache_opts, outcome);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_exactly_one_of_image_or_container() {
        let opts = ContainerOptions::default();
        assert!(opts.validate().is_err());
        assert!(ContainerOptions::ephemeral("alpine").validate().is_ok());
        assert!(ContainerOptions::existing("web").validate().is_ok());
    }

    #[test]
    fn run_argv_carries_workdir_and_env() {
        let opts = ContainerOptions::ephemeral("alpine")
            .workdir("/srv")
            .env("FOO", "bar");
        let argv = opts.run_argv(&IndexMap::new());
        assert!(argv.contains(&"--workdir".to_owned()));
        assert!(argv.contains(&"/srv".to_owned()));
        assert!(argv.windows(2).any(|w| w == ["--env".to_owned(), "FOO=bar".to_owned()]));
        assert_eq!(argv.last(), Some(&"alpine".to_owned()));
    }

    #[test]
    fn exec_argv_targets_existing_container() {
        let opts = ContainerOptions::existing("web");
        let argv = opts.exec_argv(false, &IndexMap::new());
        assert_eq!(argv, vec!["exec".to_owned(), "web".to_owned()]);
    }
}
