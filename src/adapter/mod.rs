// SPDX-License-Identifier: MPL-2.0

//! One abstraction, implemented four times (§4.4-§4.10).
//!
//! Generalizes the teacher's `command::providers::CommandProvider` (one OS
//! command provider keyed off the local host) into one trait implemented by
//! four backends with very different resource models.

pub mod base;
pub mod cluster;
pub mod container;
pub mod local;
pub mod remote_container;
pub mod ssh;

use crate::command::Command;
use crate::error::Result;
use crate::outcome::Outcome;
use async_trait::async_trait;

/// The internal contract every backend implements (§6 "To adapters").
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short tag used in events, errors, and `Outcome::adapter`.
    fn name(&self) -> &'static str;

    /// Whether this backend can currently be used (binary present, CLI
    /// probe succeeds, ...).
    async fn is_available(&self) -> bool;

    /// Run one merged `Command` to completion.
    async fn execute(&self, cmd: Command) -> Result<Outcome>;

    /// Blocking variant. Not every backend can support streaming sinks or
    /// readable-stream stdin synchronously (§4.6); the default rejects it.
    fn execute_sync(&self, _cmd: Command) -> Result<Outcome> {
        Err(crate::error::Error::Validation {
            message: format!("{} adapter has no synchronous variant", self.name()),
        })
    }

    /// Release any resources held for future calls (idle connections,
    /// cached CLI binary paths, ...). Safe to call more than once.
    async fn dispose(&self) {}
}
