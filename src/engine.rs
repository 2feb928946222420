// SPDX-License-Identifier: MPL-2.0

//! Immutable configuration, chain builder, template entry point, and
//! adapter dispatch (§4.11).
//!
//! Generalizes the teacher's `host::Host` (a cheaply-cloned handle wrapping
//! provider accessors) from "one machine, fixed providers" to "one
//! configuration, four selectable backends". An [`Engine`] is an
//! `Arc`-wrapped value: every chain method clones the `Arc`'s pointee into
//! a new one rather than mutating in place, so `e.cd(p).cd(q)` never
//! touches `e` (§5 "Mutation discipline").

use crate::adapter::cluster::{ClusterAdapter, ClusterOptions};
use crate::adapter::container::{ContainerAdapter, ContainerOptions};
use crate::adapter::local::LocalAdapter;
use crate::adapter::ssh::pool::SshPool;
use crate::adapter::ssh::{SshAdapter, SshOptions};
use crate::adapter::Adapter;
use crate::cache::ResultCache;
use crate::cancel::CancelToken;
use crate::command::{AdapterSelector, Command, Program, Shell};
use crate::error::Result;
use crate::escape::{HostFamily, Interpolate};
use crate::events::EventBus;
use crate::mask::Masker;
use crate::process::ProcessHandle;
use crate::progress::ProgressCallback;
use crate::retry::RetryPolicy;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// `sensitiveDataMasking` (§6 "To callers"): whether the masker runs at all,
/// extra regex patterns layered on the default catalog, and the literal that
/// replaces each match.
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    pub enabled: bool,
    pub patterns: Vec<String>,
    pub replacement: String,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        MaskingConfig {
            enabled: true,
            patterns: Vec::new(),
            replacement: "[REDACTED]".to_owned(),
        }
    }
}

/// Recognized engine-wide options (§6 "To callers").
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timeout_ms: u64,
    pub default_cwd: Option<PathBuf>,
    pub default_env: IndexMap<String, String>,
    pub default_shell: Shell,
    pub max_buffer: usize,
    pub throw_on_nonzero_exit: bool,
    pub sensitive_data_masking: MaskingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_timeout_ms: 0,
            default_cwd: None,
            default_env: IndexMap::new(),
            default_shell: Shell::Default,
            max_buffer: 10 * 1024 * 1024,
            throw_on_nonzero_exit: true,
            sensitive_data_masking: MaskingConfig::default(),
        }
    }
}

struct Inner {
    config: EngineConfig,
    adapter_selector: AdapterSelector,
    retry: Option<RetryPolicy>,
    cache: Option<crate::cache::CacheOptions>,
    nothrow: bool,
    quiet: bool,
    events: Arc<EventBus>,
    masker: Arc<Masker>,
    result_cache: Arc<ResultCache>,
    ssh_pool: Arc<SshPool>,
}

/// The caller's primary surface: immutable configuration plus chain methods
/// and adapter selectors (§4.11). Cloning an `Engine` is cheap (one `Arc`
/// bump) and shares the same event bus, masker, result cache, and SSH pool
/// as its ancestor — only the per-engine configuration fields are forked.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine, or a [`crate::error::Error::Validation`] if
    /// `config.sensitive_data_masking.patterns` contains an invalid regex
    /// (§7 "Validation error").
    pub fn try_new(config: EngineConfig) -> crate::error::Result<Self> {
        let masking = &config.sensitive_data_masking;
        let masker = Masker::with_patterns(masking.enabled, &masking.patterns, masking.replacement.clone(), true)
            .map_err(|e| crate::error::Error::Validation {
                message: format!("invalid sensitive-data masking pattern: {e}"),
            })?;
        Ok(Self::from_parts(config, masker))
    }

    /// As [`Engine::try_new`], panicking if a custom masking pattern fails to
    /// compile. Fine for the common case (no custom patterns, or patterns
    /// validated ahead of time); callers loading patterns from an untrusted
    /// source should use `try_new`.
    pub fn new(config: EngineConfig) -> Self {
        match Self::try_new(config) {
            Ok(engine) => engine,
            Err(e) => panic!("{e}"),
        }
    }

    fn from_parts(config: EngineConfig, masker: Masker) -> Self {
        let events = Arc::new(EventBus::new());
        let masker = Arc::new(masker);
        Engine {
            inner: Arc::new(Inner {
                config,
                adapter_selector: AdapterSelector::Local,
                retry: None,
                cache: None,
                nothrow: false,
                quiet: false,
                events: events.clone(),
                masker,
                result_cache: Arc::new(ResultCache::default()),
                ssh_pool: SshPool::new(events, 8, Duration::from_secs(60)),
            }),
        }
    }

    fn fork(&self, mutate: impl FnOnce(&mut Inner)) -> Engine {
        let mut next = Inner {
            config: self.inner.config.clone(),
            adapter_selector: self.inner.adapter_selector.clone(),
            retry: self.inner.retry.clone(),
            cache: self.inner.cache.clone(),
            nothrow: self.inner.nothrow,
            quiet: self.inner.quiet,
            events: self.inner.events.clone(),
            masker: self.inner.masker.clone(),
            result_cache: self.inner.result_cache.clone(),
            ssh_pool: self.inner.ssh_pool.clone(),
        };
        mutate(&mut next);
        Engine {
            inner: Arc::new(next),
        }
    }

    // ---- chain methods (§4.11) ----

    pub fn cd(&self, path: impl AsRef<Path>) -> Engine {
        let path = path.as_ref().to_path_buf();
        self.fork(|inner| inner.config.default_cwd = Some(path))
    }

    pub fn env(&self, vars: impl IntoIterator<Item = (String, String)>) -> Engine {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        self.fork(|inner| {
            for (k, v) in vars {
                inner.config.default_env.insert(k, v);
            }
        })
    }

    pub fn shell(&self, shell: Shell) -> Engine {
        self.fork(|inner| inner.config.default_shell = shell)
    }

    pub fn timeout(&self, ms: u64) -> Engine {
        self.fork(|inner| inner.config.default_timeout_ms = ms)
    }

    pub fn nothrow(&self) -> Engine {
        self.fork(|inner| inner.nothrow = true)
    }

    pub fn quiet(&self) -> Engine {
        self.fork(|inner| inner.quiet = true)
    }

    pub fn retry(&self, policy: RetryPolicy) -> Engine {
        self.fork(|inner| inner.retry = Some(policy))
    }

    pub fn cache(&self, opts: crate::cache::CacheOptions) -> Engine {
        self.fork(|inner| inner.cache = Some(opts))
    }

    /// Merge a partial config atop the current one (§4.11 "`defaults`").
    pub fn defaults(&self, config: EngineConfig) -> Engine {
        self.fork(|inner| inner.config = config)
    }

    // ---- adapter selectors (§4.11) ----

    pub fn local(&self) -> Engine {
        self.fork(|inner| inner.adapter_selector = AdapterSelector::Local)
    }

    pub fn ssh(&self, opts: SshOptions) -> Engine {
        self.fork(|inner| inner.adapter_selector = AdapterSelector::Ssh(opts))
    }

    pub fn container(&self, opts: ContainerOptions) -> Engine {
        self.fork(|inner| inner.adapter_selector = AdapterSelector::Container(opts))
    }

    pub fn cluster(&self, opts: ClusterOptions) -> Engine {
        self.fork(|inner| inner.adapter_selector = AdapterSelector::Cluster(opts))
    }

    /// Runs container-runtime CLI invocations through an SSH session
    /// (§4.11 "`remoteContainer`").
    pub fn remote_container(&self, ssh: SshOptions, container: ContainerOptions) -> Engine {
        self.fork(|inner| inner.adapter_selector = AdapterSelector::RemoteContainer { ssh, container })
    }

    /// Produce a derived engine whose selected adapter and adapter options
    /// are overridden (§4.11 "`with`").
    pub fn with(&self, adapter: AdapterSelector) -> Engine {
        self.fork(|inner| inner.adapter_selector = adapter)
    }

    // ---- event subscription (§4.13, exposed through the engine) ----

    pub fn on(&self, name: impl Into<String>, handler: crate::events::Handler) -> crate::events::SubscriptionId {
        self.inner.events.on(name, handler)
    }

    pub fn on_filtered(
        &self,
        pattern: impl Into<String>,
        filter: crate::events::Filter,
        handler: crate::events::Handler,
    ) -> crate::events::SubscriptionId {
        self.inner.events.on_filtered(pattern, filter, handler)
    }

    pub fn off(&self, id: crate::events::SubscriptionId) {
        self.inner.events.off(id)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new()
    }

    fn host_family(&self) -> HostFamily {
        match &self.inner.adapter_selector {
            AdapterSelector::Local => {
                #[cfg(windows)]
                {
                    HostFamily::WindowsCmd
                }
                #[cfg(not(windows))]
                {
                    HostFamily::Posix
                }
            }
            _ => HostFamily::Posix,
        }
    }

    /// Build the [`Command`] that a template invocation would dispatch,
    /// without dispatching it. Exposed so [`ProcessHandle`] chain methods
    /// can derive a new command from this engine's defaults.
    fn base_command(&self, program: Program) -> Command {
        Command {
            program,
            cwd: self.inner.config.default_cwd.clone(),
            env: self.inner.config.default_env.clone(),
            shell: self.inner.config.default_shell.clone(),
            timeout_ms: self.inner.config.default_timeout_ms,
            max_buffer: self.inner.config.max_buffer,
            throw_on_nonzero: self.inner.config.throw_on_nonzero_exit,
            nothrow: self.inner.nothrow,
            retry: self.inner.retry.clone(),
            cache: self.inner.cache.clone(),
            adapter: self.inner.adapter_selector.clone(),
            ..Command::default()
        }
    }

    /// Assemble and dispatch `fmt`/`values` through the escaper (§4.1),
    /// selecting the adapter this engine currently points at.
    pub fn template(&self, fmt: &str, values: Vec<Box<dyn Interpolate>>) -> ProcessHandle {
        let family = self.host_family();
        let line = crate::escape::assemble(fmt, &values, family);
        self.dispatch(self.base_command(Program::ShellLine(line)))
    }

    /// As [`Engine::template`], but skips escaping entirely (§4.1 "Raw
    /// mode").
    pub fn template_raw(&self, fmt: &str, values: Vec<Box<dyn Interpolate>>) -> ProcessHandle {
        let line = crate::escape::assemble_raw(fmt, &values);
        self.dispatch(self.base_command(Program::ShellLine(line)))
    }

    /// Dispatch a fully-built `Command` (used by `ProcessHandle::pipe` and
    /// by callers constructing a `Command` directly rather than through a
    /// template).
    pub fn dispatch(&self, mut cmd: Command) -> ProcessHandle {
        // `quiet()` forks an engine whose commands never report progress,
        // mirroring `ProcessHandle::quiet`'s per-call override; applied here
        // so it also covers a `Command` built and dispatched directly.
        if self.inner.quiet {
            cmd.progress = None;
        }
        let adapter = self.build_adapter(&cmd.adapter);
        ProcessHandle::new(cmd, adapter, self.clone())
    }

    /// Build a fresh adapter handle for `selector`, sharing this engine's
    /// masker, event bus, result cache, and SSH pool. Exposed crate-wide so
    /// [`ProcessHandle::pipe`] can retarget a second command at the same
    /// backend the first ran on.
    pub(crate) fn build_adapter_handle(&self, selector: &AdapterSelector) -> Arc<dyn Adapter> {
        self.build_adapter(selector)
    }

    fn build_adapter(&self, selector: &AdapterSelector) -> Arc<dyn Adapter> {
        match selector {
            AdapterSelector::Local => Arc::new(LocalAdapter::new(
                self.inner.masker.clone(),
                self.inner.events.clone(),
                self.inner.result_cache.clone(),
            )),
            AdapterSelector::Ssh(_) => Arc::new(SshAdapter::with_pool(
                self.inner.ssh_pool.clone(),
                self.inner.masker.clone(),
                self.inner.events.clone(),
                self.inner.result_cache.clone(),
            )),
            AdapterSelector::Container(_) => Arc::new(ContainerAdapter::new(
                self.inner.masker.clone(),
                self.inner.events.clone(),
                self.inner.result_cache.clone(),
            )),
            AdapterSelector::Cluster(_) => Arc::new(ClusterAdapter::new(
                self.inner.masker.clone(),
                self.inner.events.clone(),
                self.inner.result_cache.clone(),
            )),
            AdapterSelector::RemoteContainer { .. } => Arc::new(crate::adapter::remote_container::RemoteContainerAdapter::new(
                self.inner.ssh_pool.clone(),
                self.inner.masker.clone(),
                self.inner.events.clone(),
                self.inner.result_cache.clone(),
            )),
        }
    }

    /// Release pooled SSH sessions and any other adapter-held resources.
    pub async fn dispose(&self) {
        self.inner.ssh_pool.dispose_all().await;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_methods_do_not_mutate_the_original() {
        let e = Engine::default();
        let forked = e.cd("/tmp").cd("/var");
        assert!(e.inner.config.default_cwd.is_none());
        assert_eq!(forked.inner.config.default_cwd, Some(PathBuf::from("/var")));
    }

    #[test]
    fn adapter_selector_defaults_to_local() {
        let e = Engine::default();
        assert!(matches!(e.inner.adapter_selector, AdapterSelector::Local));
    }

    #[tokio::test]
    async fn template_runs_through_local_adapter() {
        let e = Engine::default();
        let outcome = crate::sh!(e, "echo {}", "hello").await.unwrap();
        assert_eq!(outcome.text(), "hello");
    }

    #[tokio::test]
    async fn raw_template_skips_escaping() {
        let e = Engine::default();
        let outcome = e
            .template_raw("echo {}", vec![Box::new("$(echo nested)".to_string())])
            .await
            .unwrap();
        assert_eq!(outcome.text(), "nested");
    }
}
