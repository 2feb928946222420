// SPDX-License-Identifier: MPL-2.0

//! Run one shape of command against four different backends: the local
//! machine, a remote host over SSH, a container, or a cluster pod.
//!
//! ```no_run
//! use anyhost::{sh, Engine};
//!
//! # async fn demo() -> anyhost::Result<()> {
//! let engine = Engine::default();
//! let who = sh!(engine, "whoami").text().await?;
//! println!("{who}");
//! # Ok(())
//! # }
//! ```
//!
//! An [`Engine`] is immutable configuration plus a chain builder: every
//! chain method (`cd`, `env`, `ssh`, `timeout`, ...) returns a new `Engine`
//! rather than mutating the one it was called on, so a shared base
//! configuration can be forked freely without callers stepping on each
//! other. The [`sh!`]/[`raw!`] macros assemble a shell-safe command line
//! from a format string and interpolated values the same way a tagged
//! template literal would, and dispatch it through the engine's currently
//! selected adapter, returning a [`ProcessHandle`] that is both awaitable
//! and further chainable before it resolves to an [`Outcome`].

pub mod adapter;
pub mod cache;
pub mod cancel;
pub mod command;
pub mod engine;
pub mod error;
pub mod escape;
pub mod events;
pub mod mask;
pub mod outcome;
pub mod process;
pub mod progress;
pub mod retry;
pub mod stream;

pub use adapter::cluster::ClusterOptions;
pub use adapter::container::ContainerOptions;
pub use adapter::ssh::SshOptions;
pub use cache::CacheOptions;
pub use cancel::CancelToken;
pub use command::{AdapterSelector, Command, Program, Shell, Stdin};
pub use engine::{Engine, EngineConfig, MaskingConfig};
pub use error::{Error, Result};
pub use escape::{HostFamily, Interpolate};
pub use events::{Event, EventBus, Filter, Handler, SubscriptionId};
pub use mask::Masker;
pub use outcome::{AdapterTag, Outcome};
pub use process::ProcessHandle;
pub use progress::{ProgressCallback, ProgressEvent};
pub use retry::{Backoff, RetryPolicy};
