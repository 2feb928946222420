// SPDX-License-Identifier: MPL-2.0

//! Runs commands on a remote host over a single pooled session (§4.7).
//!
//! `openssh::Session` already speaks to a real `ssh` client under the hood
//! (native multiplexing via `ControlMaster`), so this adapter's job is
//! mostly policy: picking the right session out of [`pool::SshPool`],
//! streaming the exec channel through the same bounded handlers as every
//! other adapter, and handling the sudo-askpass dance (§4.7 "Sudo with
//! hidden passphrase").

pub mod pool;
pub mod sudo;
pub mod tunnel;

use crate::adapter::base;
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
use openssh::{KnownHosts, SessionBuilder, Stdio};
use pool::{Fingerprint, SshPool};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sudo::SudoOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Remote target and connection tuning (§6 "SSH" adapter options).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshOptions {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub agent: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: bool,
    #[serde(default)]
    pub compress: bool,
    pub bastion_host: Option<String>,
    pub algorithms: Option<Vec<String>>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(skip)]
    pub sudo: Option<SudoOptions>,
}

fn default_port() -> u16 {
    22
}
fn default_keepalive() -> u64 {
    30
}
fn default_ready_timeout() -> u64 {
    15
}
fn default_strict_host_key_checking() -> bool {
    true
}
fn default_max_connections() -> usize {
    8
}
fn default_acquire_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    60
}

impl SshOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        SshOptions {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: None,
            private_key: None,
            passphrase: None,
            agent: false,
            keepalive_interval_secs: default_keepalive(),
            ready_timeout_secs: default_ready_timeout(),
            strict_host_key_checking: default_strict_host_key_checking(),
            compress: false,
            bastion_host: None,
            algorithms: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            sudo: None,
        }
    }

    pub(crate) fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            host: self.host.clone(),
            port: self.port,
            user: Some(self.username.clone()),
            identity_file: self.private_key.clone(),
        }
    }

    fn destination(&self) -> String {
        format!("ssh://{}@{}:{}", self.username, self.host, self.port)
    }
}

/// The adapter that dispatches commands over a pooled SSH session.
pub struct SshAdapter {
    pool: Arc<SshPool>,
    masker: Arc<Masker>,
    events: Arc<EventBus>,
    cache: Arc<ResultCache>,
}

impl SshAdapter {
    pub fn new(masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<ResultCache>) -> Self {
        SshAdapter {
            pool: SshPool::new(events.clone(), default_max_connections(), Duration::from_secs(default_idle_timeout())),
            masker,
            events,
            cache,
        }
    }

    /// Build a pool sized to this particular command's options; every
    /// fingerprint still gets its own independent session, so a single
    /// shared pool instance is enough (§4.8).
    pub fn with_pool(pool: Arc<SshPool>, masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<ResultCache>) -> Self {
        SshAdapter {
            pool,
            masker,
            events,
            cache,
        }
    }

    pub(crate) async fn connect(opts: &SshOptions) -> Result<openssh::Session> {
        if opts.password.is_some() {
            // openssh shells out to the system `ssh` client, which refuses
            // non-interactive password auth. Fail loudly instead of
            // silently connecting via key/agent and ignoring the password
            // the caller configured.
            return Err(Error::Validation {
                message: "ssh adapter does not support password authentication; use privateKey or agent".into(),
            });
        }
        let mut builder = SessionBuilder::default();
        builder
            .user(opts.username.clone())
            .port(opts.port)
            .connect_timeout(Duration::from_secs(opts.ready_timeout_secs))
            .server_alive_interval(Duration::from_secs(opts.keepalive_interval_secs))
            .known_hosts_check(if opts.strict_host_key_checking {
                KnownHosts::Strict
            } else {
                KnownHosts::Accept
            })
            .compression(opts.compress);
        if let Some(key) = &opts.private_key {
            builder.keyfile(key);
        }
        if let Some(bastion) = &opts.bastion_host {
            builder.jump_hosts([bastion.as_str()]);
        }
        builder
            .connect_mux(opts.destination())
            .await
            .map_err(|e| Error::Connection {
                host: opts.host.clone(),
                port: opts.port,
                attempt: 1,
                message: e.to_string(),
            })
    }

    async fn dispatch(&self, cmd: &Command, opts: &SshOptions, started: chrono::DateTime<Utc>) -> Result<Outcome> {
        let lease = self
            .pool
            .acquire(
                opts.fingerprint(),
                Duration::from_secs(opts.acquire_timeout_secs),
                || Self::connect(opts),
            )
            .await?;
        let session = lease.session();

        let family = HostFamily::Posix;
        let line = match base::resolve(cmd, family) {
            base::ResolvedLine::Argv { program, args } => {
                let mut parts = vec![crate::escape::escape_one(&program, family)];
                parts.extend(args.iter().map(|a| crate::escape::escape_one(a, family)));
                parts.join(" ")
            }
            base::ResolvedLine::ShellLine { flag: _, line, .. } => line,
        };
        let line = match &opts.sudo {
            Some(sudo_opts) => match &sudo_opts.password {
                Some(password) => {
                    let askpass = sudo::Askpass::write(password)?;
                    let remote_path = format!("/tmp/.anyhost-askpass-{}", std::process::id());
                    let mut upload = session.command("sh");
                    upload
                        .raw_arg("-c")
                        .arg(format!("cat > {remote_path} && chmod 700 {remote_path}"))
                        .stdin(Stdio::piped());
                    let mut upload_child = upload.spawn().await.map_err(|e| Error::Backend {
                        adapter: AdapterTag::Ssh,
                        message: format!("failed to stage askpass helper: {e}"),
                    })?;
                    if let Some(mut stdin) = upload_child.stdin().take() {
                        let bytes = std::fs::read(askpass.path()).unwrap_or_default();
                        let _ = stdin.write_all(&bytes).await;
                        let _ = stdin.shutdown().await;
                    }
                    let _ = upload_child.wait().await;
                    let wrapped = sudo::wrap_line(&line, &remote_path);
                    // The remote helper is removed after use; the passphrase
                    // itself never touches the command string (§4.7).
                    format!("{wrapped}; rm -f {remote_path}")
                }
                None => line,
            },
            None => line,
        };

        let line = match &cmd.cwd {
            Some(cwd) => format!(
                "cd {} && {}",
                crate::escape::escape_one(&cwd.display().to_string(), family),
                line
            ),
            None => line,
        };
        let mut ssh_cmd = session.command("sh");
        ssh_cmd.raw_arg("-c").arg(&line);
        for (k, v) in cmd.env.iter() {
            ssh_cmd.env(k, v);
        }
        ssh_cmd.stdin(match &cmd.stdin {
            Stdin::Empty => Stdio::null(),
            Stdin::Bytes(_) | Stdin::Reader(_) => Stdio::piped(),
        });
        ssh_cmd.stdout(Stdio::piped());
        ssh_cmd.stderr(Stdio::piped());

        let display = cmd.program_display();
        let mut child = ssh_cmd.spawn().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Ssh,
            message: format!("failed to open exec channel: {e}"),
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
            progress_chunk_cb(&cmd.progress, StreamKind::Stdout),
        );
        let stderr_handler = StreamHandler::new(
            StreamKind::Stderr,
            cmd.max_buffer,
            self.masker.clone(),
            display.clone(),
            progress_chunk_cb(&cmd.progress, StreamKind::Stderr),
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
                adapter: AdapterTag::Ssh,
                message: format!("exec channel closed unexpectedly: {e}"),
            })?;
            Ok::<_, Error>((stdout, stderr, status))
        };

        let (stdout, stderr, status) = match (timeout, &cmd.cancel) {
            (Some(dur), Some(token)) => tokio::select! {
                res = wait_and_stream => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
                _ = token.cancelled() => {
                    return Err(Error::Cancelled { command: self.masker.mask(&display) });
                }
            },
            (Some(dur), None) => tokio::select! {
                res = wait_and_stream => res?,
                _ = tokio::time::sleep(dur) => {
                    return Err(Error::Timeout { timeout_ms: cmd.timeout_ms, command: self.masker.mask(&display) });
                }
            },
            (None, Some(token)) => tokio::select! {
                res = wait_and_stream => res?,
                _ = token.cancelled() => {
                    return Err(Error::Cancelled { command: self.masker.mask(&display) });
                }
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
            adapter: AdapterTag::Ssh,
            host: Some(opts.host.clone()),
            container: None,
        })
    }

    /// Upload a local byte buffer to a remote path by piping it through
    /// `cat > path` on the exec channel (§4.7 "File transfer"); the crate's
    /// dependency graph carries no SFTP client, so transfer rides the same
    /// bounded stream machinery as every other remote stdin/stdout.
    pub async fn upload(
        &self,
        opts: &SshOptions,
        local_bytes: &[u8],
        remote_path: &str,
        on_progress: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    ) -> Result<()> {
        let lease = self
            .pool
            .acquire(opts.fingerprint(), Duration::from_secs(opts.acquire_timeout_secs), || {
                Self::connect(opts)
            })
            .await?;
        let session = lease.session();
        let mut cmd = session.command("sh");
        cmd.raw_arg("-c")
            .arg(format!("cat > {}", crate::escape::escape_one(remote_path, HostFamily::Posix)));
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Ssh,
            message: format!("failed to open upload channel: {e}"),
        })?;
        if let Some(mut stdin) = child.stdin().take() {
            let mut written = 0u64;
            for chunk in local_bytes.chunks(64 * 1024) {
                let _ = stdin.write_all(chunk).await;
                written += chunk.len() as u64;
                if let Some(cb) = &on_progress {
                    cb(written);
                }
            }
            let _ = stdin.shutdown().await;
        }
        let status = child.wait().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Ssh,
            message: format!("upload channel closed unexpectedly: {e}"),
        })?;
        if !status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Ssh,
                message: format!("upload to {remote_path} exited with {status:?}"),
            });
        }
        Ok(())
    }

    /// Download a remote file by reading `cat path`'s stdout to completion.
    pub async fn download(
        &self,
        opts: &SshOptions,
        remote_path: &str,
        on_progress: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    ) -> Result<Vec<u8>> {
        let lease = self
            .pool
            .acquire(opts.fingerprint(), Duration::from_secs(opts.acquire_timeout_secs), || {
                Self::connect(opts)
            })
            .await?;
        let session = lease.session();
        let mut cmd = session.command("cat");
        cmd.raw_arg(crate::escape::escape_one(remote_path, HostFamily::Posix));
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Ssh,
            message: format!("failed to open download channel: {e}"),
        })?;
        let mut buf = Vec::new();
        if let Some(mut stdout) = child.stdout().take() {
            let mut chunk = [0u8; 64 * 1024];
            loop {
                let n = stdout.read(&mut chunk).await.map_err(|source| Error::Spawn {
                    command: format!("cat {remote_path}"),
                    cwd: None,
                    source,
                })?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(cb) = &on_progress {
                    cb(buf.len() as u64);
                }
            }
        }
        let status = child.wait().await.map_err(|e| Error::Backend {
            adapter: AdapterTag::Ssh,
            message: format!("download channel closed unexpectedly: {e}"),
        })?;
        if !status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Ssh,
                message: format!("download from {remote_path} exited with {status:?}"),
            });
        }
        Ok(buf)
    }

    pub fn pool(&self) -> Arc<SshPool> {
        self.pool.clone()
    }
}

fn progress_chunk_cb(
    progress: &Option<crate::progress::ProgressCallback>,
    kind: StreamKind,
) -> Option<crate::stream::ChunkCallback> {
    progress.clone().map(|p| {
        Arc::new(move |chunk: &str| {
            let event = match kind {
                StreamKind::Stdout => ProgressEvent::Stdout(chunk.to_owned()),
                StreamKind::Stderr => ProgressEvent::Stderr(chunk.to_owned()),
            };
            p(event);
        }) as crate::stream::ChunkCallback
    })
}

fn extract_opts(cmd: &Command) -> Result<&SshOptions> {
    match &cmd.adapter {
        crate::command::AdapterSelector::Ssh(opts) => Ok(opts),
        crate::command::AdapterSelector::RemoteContainer { ssh, .. } => Ok(ssh),
        _ => Err(Error::Validation {
            message: "SshAdapter received a command not targeting the ssh adapter".into(),
        }),
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn is_available(&self) -> bool {
        which::which("ssh").is_ok()
    }

    async fn execute(&self, cmd: Command) -> Result<Outcome> {
        let opts = extract_opts(&cmd)?.clone();

        if let Some(cache_opts) = &cmd.cache {
            if let Some(hit) = base::cache_lookup(&self.cache, &self.events, AdapterTag::Ssh, cache_opts) {
                return Ok(hit);
            }
        }

        let started = Utc::now();
        let cache_opts = cmd.cache.clone();
        let masker = self.masker.clone();
        let events = self.events.clone();
        let result = base::execute_with_policy(&cmd, &masker, &events, AdapterTag::Ssh, started, |_attempt| {
            Box::pin(self.dispatch(&cmd, &opts, started))
        })
        .await;

        if let (Ok(outcome), Some(cache_opts)) = (&result, &cache_opts) {
            base::cache_store(&self.cache, &self.events, AdapterTag::Ssh, cache_opts, outcome);
        }
        result
    }

    async fn dispose(&self) {
        self.pool.dispose_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_distinguishes_by_user_and_key() {
        let a = SshOptions::new("example.com", "alice");
        let mut b = a.clone();
        b.username = "bob".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn destination_formats_as_ssh_uri() {
        let opts = SshOptions::new("example.com", "alice");
        assert_eq!(opts.destination(), "ssh://alice@example.com:22");
    }
}
