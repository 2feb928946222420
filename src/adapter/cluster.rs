// SPDX-License-Identifier: MPL-2.0

//! Drives a cluster-orchestrator CLI (`kubectl`-compatible) for pod exec,
//! port-forward, logs, and copy (§4.10).
//!
//! Same shape as [`crate::adapter::container`]: no client library, just a
//! resolved binary and argv construction, because the spec explicitly
//! leaves cluster/container *lifecycle* to external tools (§1 "Non-goals").

use crate::cancel::CancelToken;
use crate::command::Command;
use crate::error::{Error, Result, StreamKind};
use crate::events::EventBus;
use crate::mask::Masker;
use crate::outcome::{AdapterTag, Outcome};
use crate::progress::ProgressEvent;
use crate::stream::StreamHandler;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/local/bin/kubectl",
    "/usr/bin/kubectl",
    "/opt/homebrew/bin/kubectl",
];

/// Resolve the cluster CLI binary at construction time: well-known install
/// paths first, then `PATH` (§4.10).
fn resolve_binary() -> PathBuf {
    for candidate in WELL_KNOWN_PATHS {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return path;
        }
    }
    which::which("kubectl").unwrap_or_else(|_| PathBuf::from("kubectl"))
}

/// `pod` may be a bare name or a label selector beginning with `-l`
/// (§6 "Cluster").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub pod: String,
    pub namespace: Option<String>,
    pub container: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub exec_flags: Vec<String>,
}

impl ClusterOptions {
    pub fn new(pod: impl Into<String>) -> Self {
        ClusterOptions {
            pod: pod.into(),
            namespace: None,
            container: None,
            kubeconfig: None,
            context: None,
            stdin: false,
            tty: false,
            exec_flags: Vec::new(),
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }

    fn is_selector(&self) -> bool {
        self.pod.starts_with("-l")
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".into());
            args.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.context {
            args.push("--context".into());
            args.push(context.clone());
        }
        if let Some(ns) = &self.namespace {
            args.push("--namespace".into());
            args.push(ns.clone());
        }
        args
    }
}

pub struct ClusterAdapter {
    masker: Arc<Masker>,
    events: Arc<EventBus>,
    cache: Arc<crate::cache::ResultCache>,
    binary: PathBuf,
}

impl ClusterAdapter {
    pub fn new(masker: Arc<Masker>, events: Arc<EventBus>, cache: Arc<crate::cache::ResultCache>) -> Self {
        ClusterAdapter {
            masker,
            events,
            cache,
            binary: resolve_binary(),
        }
    }

    /// Resolve a label selector to a concrete pod name via a one-shot
    /// `get pods -o jsonpath=...` (§4.10 "Exec").
    async fn resolve_pod(&self, opts: &ClusterOptions) -> Result<String> {
        if !opts.is_selector() {
            return Ok(opts.pod.clone());
        }
        let selector = opts.pod.trim_start_matches("-l").trim();
        let mut args = opts.global_args();
        args.extend([
            "get".to_owned(),
            "pods".to_owned(),
            "-l".to_owned(),
            selector.to_owned(),
            "-o".to_owned(),
            "jsonpath={.items[0].metadata.name}".to_owned(),
        ]);
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                cwd: None,
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Cluster,
                message: format!(
                    "resolving selector `{selector}` failed: {}",
                    self.masker.mask(&String::from_utf8_lossy(&output.stderr))
                ),
            });
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if name.is_empty() {
            return Err(Error::Backend {
                adapter: AdapterTag::Cluster,
                message: format!("no pod matched selector `{selector}`"),
            });
        }
        Ok(name)
    }

    fn exec_argv(&self, opts: &ClusterOptions, pod: &str, cmd: &Command) -> Vec<String> {
        let mut argv = opts.global_args();
        argv.push("exec".into());
        if opts.stdin || !matches!(cmd.stdin, crate::command::Stdin::Empty) {
            argv.push("-i".into());
        }
        if opts.tty {
            argv.push("-t".into());
        }
        if let Some(container) = &opts.container {
            argv.push("-c".into());
            argv.push(container.clone());
        }
        argv.extend(opts.exec_flags.iter().cloned());
        argv.push(pod.to_owned());
        argv.push("--".into());
        // `kubectl exec` has no `--workdir`; fold the engine-wide `cwd()`
        // chain method into a `cd && ...` wrapper, same as the ssh adapter.
        match (&cmd.program, &cmd.cwd) {
            (crate::command::Program::Argv { program, args }, None) => {
                argv.push(program.clone());
                argv.extend(args.clone());
            }
            (crate::command::Program::Argv { program, args }, Some(cwd)) => {
                let mut parts = vec![crate::escape::escape_one(program, crate::escape::HostFamily::Posix)];
                parts.extend(args.iter().map(|a| crate::escape::escape_one(a, crate::escape::HostFamily::Posix)));
                argv.push("sh".into());
                argv.push("-c".into());
                argv.push(format!(
                    "cd {} && {}",
                    crate::escape::escape_one(&cwd.display().to_string(), crate::escape::HostFamily::Posix),
                    parts.join(" ")
                ));
            }
            (crate::command::Program::ShellLine(line), None) => {
                argv.push("sh".into());
                argv.push("-c".into());
                argv.push(line.clone());
            }
            (crate::command::Program::ShellLine(line), Some(cwd)) => {
                argv.push("sh".into());
                argv.push("-c".into());
                argv.push(format!(
                    "cd {} && {}",
                    crate::escape::escape_one(&cwd.display().to_string(), crate::escape::HostFamily::Posix),
                    line
                ));
            }
        }
        argv
    }

    async fn spawn_once(&self, cmd: &Command, opts: &ClusterOptions, started: chrono::DateTime<Utc>) -> Result<Outcome> {
        let pod = self.resolve_pod(opts).await?;
        let argv = self.exec_argv(opts, &pod, cmd);
        let display = format!("{} {}", self.binary.display(), argv.join(" "));

        let mut proc = tokio::process::Command::new(&self.binary);
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

        if let Some(progress) = &cmd.progress {
            progress(ProgressEvent::Spawned);
        }
        self.events.emit(
            "command:spawned",
            AdapterTag::Cluster,
            serde_json::json!({ "command": self.masker.mask(&display), "pod": pod }),
        );

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

        let stdout_handler = StreamHandler::new(StreamKind::Stdout, cmd.max_buffer, self.masker.clone(), display.clone(), None);
        let stderr_handler = StreamHandler::new(StreamKind::Stderr, cmd.max_buffer, self.masker.clone(), display.clone(), None);
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
            progress(ProgressEvent::Exited { exit_code: status.code().unwrap_or(-1) });
        }

        Ok(Outcome {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            signal: None,
            command: self.masker.mask(&display),
            start: started,
            end: Utc::now(),
            adapter: AdapterTag::Cluster,
            host: None,
            container: opts.container.clone(),
        })
    }

    /// `logs -f`, splitting stdout on newlines and delivering each
    /// non-empty line to `on_line` (§4.10 "Logs").
    pub async fn logs(
        &self,
        opts: &ClusterOptions,
        tail: Option<u32>,
        previous: bool,
        timestamps: bool,
        on_line: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Result<LogFollower> {
        let pod = self.resolve_pod(opts).await?;
        let mut args = opts.global_args();
        args.push("logs".into());
        args.push("-f".into());
        if let Some(container) = &opts.container {
            args.push("-c".into());
            args.push(container.clone());
        }
        if let Some(n) = tail {
            args.push("--tail".into());
            args.push(n.to_string());
        }
        if previous {
            args.push("--previous".into());
        }
        if timestamps {
            args.push("--timestamps".into());
        }
        args.push(pod);

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                cwd: None,
                source,
            })?;

        let stdout = child.stdout.take();
        let masker = self.masker.clone();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    on_line(masker.mask(&line));
                }
            }
        });

        Ok(LogFollower {
            child: Arc::new(AsyncMutex::new(Some(child))),
        })
    }

    /// Spawn `port-forward localPort:remotePort` (or `:remotePort` for a
    /// dynamic local port), parsing the bound local port from the CLI's
    /// early stdout line (§4.10 "Port forward").
    pub async fn port_forward(&self, opts: &ClusterOptions, local_port: u16, remote_port: u16) -> Result<PortForward> {
        let pod = self.resolve_pod(opts).await?;
        let spec = if local_port == 0 {
            format!(":{remote_port}")
        } else {
            format!("{local_port}:{remote_port}")
        };
        let mut args = opts.global_args();
        args.extend(["port-forward".to_owned(), pod, spec]);

        let mut child = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                cwd: None,
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| Error::Backend {
            adapter: AdapterTag::Cluster,
            message: "port-forward child had no stdout pipe".into(),
        })?;

        static FORWARDING_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"Forwarding from (?:127\.0\.0\.1|\[::1\]):(\d+) ->").unwrap()
        });

        let mut reader = tokio::io::BufReader::new(stdout).lines();
        let bound_port = loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if let Some(caps) = FORWARDING_LINE.captures(&line) {
                        break caps[1].parse().map_err(|_| Error::Backend {
                            adapter: AdapterTag::Cluster,
                            message: format!("could not parse bound port from `{line}`"),
                        })?;
                    }
                }
                Ok(None) => {
                    let _ = child.wait().await;
                    return Err(Error::Backend {
                        adapter: AdapterTag::Cluster,
                        message: "port-forward exited before announcing a bound port".into(),
                    });
                }
                Err(e) => {
                    return Err(Error::Backend {
                        adapter: AdapterTag::Cluster,
                        message: format!("reading port-forward stdout failed: {e}"),
                    })
                }
            }
        };

        Ok(PortForward {
            child: Arc::new(AsyncMutex::new(Some(child))),
            bound_port,
        })
    }

    pub async fn copy(&self, opts: &ClusterOptions, direction: CopyDirection) -> Result<()> {
        let pod = self.resolve_pod(opts).await?;
        let mut args = opts.global_args();
        args.push("cp".into());
        match direction {
            CopyDirection::ToPod { local_path, pod_path } => {
                args.push(local_path);
                args.push(format!("{pod}:{pod_path}"));
            }
            CopyDirection::FromPod { pod_path, local_path } => {
                args.push(format!("{pod}:{pod_path}"));
                args.push(local_path);
            }
        }
        if let Some(container) = &opts.container {
            args.push("-c".into());
            args.push(container.clone());
        }
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: format!("{} {}", self.binary.display(), args.join(" ")),
                cwd: None,
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Backend {
                adapter: AdapterTag::Cluster,
                message: format!("cp failed: {}", self.masker.mask(&String::from_utf8_lossy(&output.stderr))),
            });
        }
        Ok(())
    }

    /// `version --client` and `get ns`, both short-timeout (§4.10
    /// "Availability probe").
    pub async fn is_available_full(&self, opts: Option<&ClusterOptions>) -> bool {
        let probe = |args: Vec<String>| {
            let binary = self.binary.clone();
            async move {
                tokio::time::timeout(
                    std::time::Duration::from_secs(3),
                    tokio::process::Command::new(&binary).args(&args).status(),
                )
                .await
                .ok()
                .and_then(|r| r.ok())
                .map(|s| s.success())
                .unwrap_or(false)
            }
        };
        let mut ns_args = opts.map(|o| o.global_args()).unwrap_or_default();
        ns_args.extend(["get".to_owned(), "ns".to_owned()]);
        probe(vec!["version".to_owned(), "--client".to_owned()]).await && probe(ns_args).await
    }
}

pub enum CopyDirection {
    ToPod { local_path: String, pod_path: String },
    FromPod { pod_path: String, local_path: String },
}

/// Handle for a running `logs -f` follower. `stop()` kills the subprocess
/// (§4.10 "Logs").
pub struct LogFollower {
    child: Arc<AsyncMutex<Option<tokio::process::Child>>>,
}

impl LogFollower {
    pub async fn stop(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// `new -> open -> closed` handle for a cluster port-forward (§4.8 "Tunnel
/// state", generalized here to the CLI-driven cluster forward). Must
/// survive transient stderr writes from the child; only a fatal exit or
/// explicit [`PortForward::close`] ends it (§4.10).
pub struct PortForward {
    child: Arc<AsyncMutex<Option<tokio::process::Child>>>,
    pub bound_port: u16,
}

impl PortForward {
    /// Idempotent: a second close is a no-op (§8 "closed port-forward").
    pub async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.child.lock().await.is_some()
    }
}

fn extract_opts(cmd: &Command) -> Result<&ClusterOptions> {
    match &cmd.adapter {
        crate::command::AdapterSelector::Cluster(opts) => Ok(opts),
        _ => Err(Error::Validation {
            message: "ClusterAdapter received a command not targeting the cluster adapter".into(),
        }),
    }
}

#[async_trait]
impl crate::adapter::Adapter for ClusterAdapter {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn is_available(&self) -> bool {
        self.is_available_full(None).await
    }

    async fn execute(&self, cmd: Command) -> Result<Outcome> {
        let opts = extract_opts(&cmd)?.clone();

        if let Some(cache_opts) = &cmd.cache {
            if let Some(hit) = crate::adapter::base::cache_lookup(&self.cache, &self.events, AdapterTag::Cluster, cache_opts) {
                return Ok(hit);
            }
        }

        let started = Utc::now();
        let cache_opts = cmd.cache.clone();
        let masker = self.masker.clone();
        let events = self.events.clone();
        let result = crate::adapter::base::execute_with_policy(&cmd, &masker, &events, AdapterTag::Cluster, started, |_attempt| {
            Box::pin(self.spawn_once(&cmd, &opts, started))
        })
        .await;

        if let (Ok(outcome), Some(cache_opts)) = (&result, &cache_opts) {
            crate::adapter::base::cache_store(&self.cache, &self.events, AdapterTag::Cluster, cache_opts, outcome);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_detection() {
        assert!(ClusterOptions::new("-l app=web").is_selector());
        assert!(!ClusterOptions::new("web-0").is_selector());
    }

    #[test]
    fn exec_argv_targets_resolved_pod_with_separator() {
        let opts = ClusterOptions::new("web-0").namespace("prod").container("app");
        let adapter_opts = opts.clone();
        let cmd = Command {
            program: crate::command::Program::Argv {
                program: "echo".into(),
                args: vec!["hi".into()],
            },
            adapter: crate::command::AdapterSelector::Cluster(adapter_opts),
            ..Command::default()
        };
        let masker = Arc::new(Masker::disabled());
        let events = Arc::new(EventBus::new());
        let adapter = ClusterAdapter {
            masker,
            events,
            cache: Arc::new(crate::cache::ResultCache::default()),
            binary: PathBuf::from("kubectl"),
        };
        let argv = adapter.exec_argv(&opts, "web-0", &cmd);
        assert!(argv.contains(&"--namespace".to_owned()));
        assert!(argv.contains(&"prod".to_owned()));
        assert!(argv.windows(2).any(|w| w == ["--".to_owned(), "echo".to_owned()]));
    }

    #[test]
    fn forwarding_line_regex_extracts_port() {
        let re = Regex::new(r"Forwarding from (?:127\.0\.0\.1|\[::1\]):(\d+) ->").unwrap();
        let caps = re.captures("Forwarding from 127.0.0.1:54321 -> 8080").unwrap();
        assert_eq!(&caps[1], "54321");
    }
}
