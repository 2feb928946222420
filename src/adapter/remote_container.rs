// SPDX-License-Identifier: MPL-2.0

//! Drives a container-runtime CLI on the far side of an SSH session
//! (§4.11 "`remoteContainer`").
//!
//! Shells the exact argv [`container::build_argv`] would hand to a local
//! `tokio::process::Command` through an `openssh` exec channel instead,
//! reusing the SSH adapter's pooled sessions ([`pool::SshPool`]) and the
//! container adapter's argv construction rather than duplicating either.

use crate::adapter::container::{self, ContainerOptions};
use crate::adapter::ssh::pool::SshPool;
use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::{Error, Result, StreamKind};
use crate::events::EventBus;
use crate::mask::Masker;
use crate::outcome::{AdapterTag, Outcome};
use crate::progress::ProgressEvent;
use crate::stream::StreamHandler;
use async_trait::async_trait;
use chrono::Utc;
use openssh::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct RemoteContainerAdapter {
    pool: Arc<SshPool>,
    masker: Arc<Masker>,
    events: Arc<EventBus>,
    cache: Arc<crate::cache::ResultCache>,
}

impl RemoteContainerAdapter {
    pub fn new(pool: Arc<SshPool>, masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<crate::cache::ResultCache>) -> Self {
        RemoteContainerAdapter { pool, masker, events, cache }
    }

    /// Probe the remote host for `docker`, falling back to `podman`, the
    /// same preference order [`container::runtime_binary`] uses locally.
    async fn resolve_remote_binary(session: &openssh::Session) -> Result<String> {
        let mut probe = session.command("sh");
        probe
            .raw_arg("-c")
            .arg("command -v docker || command -v podman");
        probe.stdout(Stdio::piped());
        let output = probe.output().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Container,
            message: format!("failed to probe remote container runtime: {e}"),
        })?;
        let path = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if path.is_empty() {
            return Err(Error::AdapterUnavailable {
                adapter: AdapterTag::Container,
                reason: "neither docker nor podman found on remote host".into(),
            });
        }
        Ok(path)
    }

    async fn dispatch(
        &self,
        cmd: &Command,
        ssh_opts: &crate::adapter::ssh::SshOptions,
        container_opts: &ContainerOptions,
        started: chrono::DateTime<Utc>,
    ) -> Result<Outcome> {
        let lease = self
            .pool
            .acquire(
                ssh_opts.fingerprint(),
                Duration::from_secs(ssh_opts.acquire_timeout_secs),
                || crate::adapter::ssh::SshAdapter::connect(ssh_opts),
            )
            .await?;
        let session = lease.session();

        let binary = Self::resolve_remote_binary(session).await?;
        let argv = container::build_argv(cmd, container_opts)?;
        let display = format!("{binary} {}", argv.join(" "));

        let mut remote_cmd = session.command(&binary);
        for arg in &argv {
            remote_cmd.arg(arg);
        }
        remote_cmd.stdin(match &cmd.stdin {
            Stdin::Empty => Stdio::null(),
            Stdin::Bytes(_) | Stdin::Reader(_) => Stdio::piped(),
        });
        remote_cmd.stdout(Stdio::piped());
        remote_cmd.stderr(Stdio::piped());

        let mut child = remote_cmd.spawn().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Container,
            message: format!("failed to open remote container exec channel: {e}"),
        })?;

        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Spawned);
        }

        match &cmd.stdin {
            Stdin::Empty => {}
            Stdin::Bytes(bytes) => {
                if let Some(mut stdin) = child.stdin().take() {
                    let _ = stdin.write_all(bytes).await;
                    let _ = stdin.shutdown().await;
                }
            }
            Stdin::Reader(reader) => {
                if let Some(mut stdin) = child.stdin().take() {
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
        let stdout_pipe = child.stdout().take();
        let stderr_pipe = child.stderr().take();

        let timeout = crate::command::timeout_duration(cmd.timeout_ms);
        let wait_and_stream = async {
            let stdout = match stdout_pipe {
                Some(pipe) => stdout_handler.consume(pipe).await?,
                None => String::new(),
            };
            let stderr = match stderr_pipe {
                Some(pipe) => stderr_handler.consume(pipe).await?,
                None => String::new(),
            };
            let status = child.wait().await.map_err(|e| Error::Backend {
                adapter: AdapterTag::Container,
                message: format!("remote exec channel closed unexpectedly: {e}"),
            })?;
            Ok::<_, Error>((stdout, stderr, status))
        };

        let (stdout, stderr, status) = match (timeout, &cmd.cancel) {
            (Some(dur), Some(token)) => tokio::select! {
                res = wait_and_stream => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
                _ = token.cancelled() => return Err(Error::Cancelled { command: self.masker.mask(&display) }),
            },
            (Some(dur), None) => tokio::select! {
                res = wait_and_stream => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
            },
            (None, Some(token)) => tokio::select! {
                res = wait_and_stream => res?,
                _ = token.cancelled() => return Err(Error::Cancelled { command: self.masker.mask(&display) }),
            },
            (None, None) => wait_and_stream.await?,
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
            host: Some(ssh_opts.host.clone()),
            container: container_opts.container.clone().or_else(|| container_opts.name.clone()),
        })
    }
}

fn extract_opts(
    cmd: &Command,
) -> Result<(&crate::adapter::ssh::SshOptions, &ContainerOptions)> {
    match &cmd.adapter {
        crate::command::AdapterSelector::RemoteContainer { ssh, container } => Ok((ssh, container)),
        _ => Err(Error::Validation {
            message: "RemoteContainerAdapter received a command not targeting remoteContainer".into(),
        }),
    }
}

#[async_trait]
impl Adapter for RemoteContainerAdapter {
    fn name(&self) -> &'static str {
        "remote_container"
    }

    async fn is_available(&self) -> bool {
        which::which("ssh").is_ok()
    }

    async fn execute(&self, cmd: Command) -> Result<Outcome> {
        let (ssh_opts, container_opts) = extract_opts(&cmd)?;
        let ssh_opts = ssh_opts.clone();
        let container_opts = container_opts.clone();

        if let Some(cache_opts) = &cmd.cache {
            if let Some(hit) = crate::adapter::base::cache_lookup(&self.cache, &self.events, AdapterTag::Container, cache_opts) {
                return Ok(hit);
            }
        }

        let started = Utc::now();
        let cache_opts = cmd.cache.clone();
        let masker = self.masker.clone();
        let events = self.events.clone();
        let result = crate::adapter::base::execute_with_policy(&cmd, &masker, &events, AdapterTag::Container, started, |_attempt| {
            Box::pin(self.dispatch(&cmd, &ssh_opts, &container_opts, started))
        })
        .await;

        if let (Ok(outcome), Some(cache_opts)) = (&result, &cache_opts) {
            crate::adapter::base::cache_store(&self.cache, &self.events, AdapterTag::Container, cache_opts, outcome);
        }
        result
    }

    async fn dispose(&self) {
        self.pool.dispose_all().await;
    }
}
