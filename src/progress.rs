// SPDX-License-Identifier: MPL-2.0

//! Optional lifecycle callbacks during execution (§2 "Progress reporter").

use std::sync::Arc;

/// One lifecycle notification delivered to a [`Command`](crate::command::Command)'s
/// progress callback. Stdout/stderr chunks have already passed through the
/// masker (§4.2).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Spawned,
    Stdout(String),
    Stderr(String),
    Exited { exit_code: i32 },
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
