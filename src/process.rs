// SPDX-License-Identifier: MPL-2.0

//! Dual-role wrapper returned by the engine's template entry point: both
//! awaitable and chainable before completion (§4.12).
//!
//! Rust has no object that is simultaneously "a value you can `.await`" and
//! "a builder you can keep configuring" without one of the two winning by
//! construction, so this follows the teacher's own split of that concern —
//! `command::child::{Child, CommandResult}` separates "the running thing"
//! from "the thing that resolves to an outcome" — generalized here via
//! [`std::future::IntoFuture`]: a [`ProcessHandle`] is a plain builder value
//! until the moment it is `.await`ed (or a terminal accessor consumes it),
//! at which point it resolves through that same split.

use crate::adapter::Adapter;
use crate::cache::CacheOptions;
use crate::cancel::CancelToken;
use crate::command::{Command, Disposition, Stdin};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use std::future::{Future, IntoFuture};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Boxed, owned, `Send` future — the same shape
/// [`crate::adapter::base::execute_with_policy`] uses internally.
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Pre-completion builder / awaitable wrapper around an in-flight
/// [`Command`] (§4.12).
pub struct ProcessHandle {
    cmd: Command,
    adapter: Arc<dyn Adapter>,
    engine: Engine,
    upstream: Option<Box<ProcessHandle>>,
}

impl ProcessHandle {
    pub(crate) fn new(mut cmd: Command, adapter: Arc<dyn Adapter>, engine: Engine) -> Self {
        if cmd.cancel.is_none() {
            cmd.cancel = Some(CancelToken::new());
        }
        ProcessHandle {
            cmd,
            adapter,
            engine,
            upstream: None,
        }
    }

    // ---- chain methods (§4.12) ----

    pub fn nothrow(mut self) -> Self {
        self.cmd.nothrow = true;
        self
    }

    /// Suppresses progress callbacks for this invocation.
    pub fn quiet(mut self) -> Self {
        self.cmd.progress = None;
        self
    }

    pub fn timeout(mut self, ms: u64) -> Self {
        self.cmd.timeout_ms = ms;
        self
    }

    pub fn cwd(mut self, path: impl AsRef<Path>) -> Self {
        self.cmd.cwd = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (k, v) in vars {
            self.cmd.env.insert(k, v);
        }
        self
    }

    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.cmd.stdin = Stdin::Bytes(bytes);
        self
    }

    pub fn stdin_reader<R>(mut self, reader: R) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        self.cmd.stdin = Stdin::Reader(Arc::new(tokio::sync::Mutex::new(reader)));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.cmd.retry = Some(policy);
        self
    }

    pub fn cache(mut self, opts: CacheOptions) -> Self {
        self.cmd.cache = Some(opts);
        self
    }

    /// Connect this command's stdout to `next`'s stdin within the same
    /// adapter (§4.12 "`pipe`"). The returned handle resolves to the final
    /// command's [`Outcome`].
    pub fn pipe(self, mut next: Command) -> ProcessHandle {
        next.adapter = self.cmd.adapter.clone();
        let next_adapter = self.engine.build_adapter_handle(&next.adapter);
        ProcessHandle {
            cmd: next,
            adapter: next_adapter,
            engine: self.engine.clone(),
            upstream: Some(Box::new(self)),
        }
    }

    /// A token that, once cancelled, trips this command's adapter-specific
    /// cleanup (§5 "Cancellation"). Usable before or during execution
    /// because it is attached at construction, not at spawn time.
    pub fn cancel_token(&self) -> CancelToken {
        self.cmd
            .cancel
            .clone()
            .expect("ProcessHandle::new always attaches a cancel token")
    }

    /// Terminate the underlying child through its adapter-specific cleanup
    /// (§4.12 "`kill`"). Safe to call whether or not execution has started;
    /// a command that has already completed simply ignores it.
    pub fn kill(&self) {
        self.cancel_token().cancel();
    }

    /// Redirect stdout to a caller-provided async sink instead of
    /// capturing it in the final [`Outcome`] (§3 "stdout/stderr
    /// disposition").
    pub fn stdout_to(mut self, sink: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.cmd.stdout = Disposition::Sink(Arc::new(tokio::sync::Mutex::new(sink)));
        self
    }

    pub fn stderr_to(mut self, sink: impl tokio::io::AsyncWrite + Send + Unpin + 'static) -> Self {
        self.cmd.stderr = Disposition::Sink(Arc::new(tokio::sync::Mutex::new(sink)));
        self
    }

    /// A live view of stdout chunks as they arrive, paired with a task
    /// handle that resolves to the final [`Outcome`] (§4.12 "stdout /
    /// stderr as live readable streams").
    pub fn stdout_stream(self) -> (UnboundedReceiverStream<Bytes>, tokio::task::JoinHandle<Result<Outcome>>) {
        self.stream_one(true)
    }

    pub fn stderr_stream(self) -> (UnboundedReceiverStream<Bytes>, tokio::task::JoinHandle<Result<Outcome>>) {
        self.stream_one(false)
    }

    fn stream_one(mut self, is_stdout: bool) -> (UnboundedReceiverStream<Bytes>, tokio::task::JoinHandle<Result<Outcome>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ChannelSink { tx };
        if is_stdout {
            self.cmd.stdout = Disposition::Sink(Arc::new(tokio::sync::Mutex::new(sink)));
        } else {
            self.cmd.stderr = Disposition::Sink(Arc::new(tokio::sync::Mutex::new(sink)));
        }
        let handle = tokio::spawn(self.run());
        (UnboundedReceiverStream::new(rx), handle)
    }

    // ---- terminal accessors (§4.12) ----

    pub async fn text(self) -> Result<String> {
        Ok(self.run().await?.text())
    }

    pub async fn lines(self) -> Result<Vec<String>> {
        Ok(self.run().await?.lines())
    }

    pub async fn buffer(self) -> Result<Vec<u8>> {
        Ok(self.run().await?.buffer())
    }

    pub async fn json<T: for<'de> serde::Deserialize<'de>>(self) -> Result<T> {
        let outcome = self.run().await?;
        outcome.json().map_err(|e| Error::Validation {
            message: format!("stdout was not valid JSON: {e}"),
        })
    }

    fn run(self) -> BoxFuture<Result<Outcome>> {
        Box::pin(async move {
            let mut cmd = self.cmd;
            if let Some(upstream) = self.upstream {
                let upstream_outcome = upstream.run().await?;
                cmd.stdin = Stdin::Bytes(upstream_outcome.text().into_bytes());
            }
            self.adapter.execute(cmd).await
        })
    }
}

impl IntoFuture for ProcessHandle {
    type Output = Result<Outcome>;
    type IntoFuture = BoxFuture<Result<Outcome>>;

    fn into_future(self) -> Self::IntoFuture {
        self.run()
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl tokio::io::AsyncWrite for ChannelSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::result::Result<usize, std::io::Error>> {
        let _ = self.tx.send(Bytes::copy_from_slice(buf));
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[tokio::test]
    async fn chain_methods_return_new_handle_and_await_resolves() {
        let engine = Engine::default();
        let handle = crate::sh!(engine, "exit {}", 0i64).nothrow().timeout(5_000);
        let outcome = handle.await.unwrap();
        assert!(outcome.ok());
    }

    #[tokio::test]
    async fn kill_cancels_before_await_completes() {
        let engine = Engine::default();
        let handle = crate::sh!(engine, "sleep {}", 5i64).nothrow();
        let token = handle.cancel_token();
        let join = tokio::spawn(handle.into_future());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
        let outcome = join.await.unwrap().unwrap();
        assert!(!outcome.ok());
    }
}
