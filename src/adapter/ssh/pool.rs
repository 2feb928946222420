// SPDX-License-Identifier: MPL-2.0

//! Connection pooling for the SSH adapter (§4.8 "Connection pool").
//!
//! One `openssh::Session` already multiplexes many remote commands over a
//! single `ControlMaster` socket, so pooling here means keeping that one
//! session alive across calls rather than re-authenticating every time, and
//! capping how many channels run concurrently against it (sshd's
//! `MaxSessions` defaults to 10).

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::outcome::AdapterTag;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies one logical remote endpoint+identity combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{user}@{}:{}", self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

struct PooledSession {
    session: openssh::Session,
    semaphore: Arc<tokio::sync::Semaphore>,
    last_used: parking_lot::Mutex<Instant>,
}

/// A checked-out session. The underlying channel slot is released back to
/// the pool when this is dropped.
pub struct SessionLease {
    entry: Arc<PooledSession>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session(&self) -> &openssh::Session {
        &self.entry.session
    }
}

pub struct SshPool {
    entries: dashmap::DashMap<Fingerprint, Arc<PooledSession>>,
    events: Arc<EventBus>,
    max_concurrent: usize,
    idle_timeout: Duration,
}

impl SshPool {
    pub fn new(events: Arc<EventBus>, max_concurrent: usize, idle_timeout: Duration) -> Arc<Self> {
        let pool = Arc::new(SshPool {
            entries: dashmap::DashMap::new(),
            events,
            max_concurrent: max_concurrent.max(1),
            idle_timeout,
        });
        pool.clone().spawn_idle_sweeper();
        pool
    }

    /// Borrow (or open) the session for `key`, waiting up to
    /// `acquire_timeout` for a free channel slot if the pool is saturated.
    pub async fn acquire<F, Fut>(
        &self,
        key: Fingerprint,
        acquire_timeout: Duration,
        connect: F,
    ) -> Result<SessionLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<openssh::Session>>,
    {
        if let Some(existing) = self.entries.get(&key) {
            let entry = existing.clone();
            drop(existing);
            return self.lease(&key, entry, acquire_timeout).await;
        }

        let session = connect().await?;
        let fresh = Arc::new(PooledSession {
            session,
            semaphore: Arc::new(tokio::sync::Semaphore::new(self.max_concurrent)),
            last_used: parking_lot::Mutex::new(Instant::now()),
        });

        let entry = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                self.events.emit(
                    "connection:open",
                    AdapterTag::Ssh,
                    serde_json::json!({ "host": key.host, "port": key.port }),
                );
                vacant.insert(fresh.clone());
                fresh
            }
        };
        self.lease(&key, entry, acquire_timeout).await
    }

    async fn lease(
        &self,
        key: &Fingerprint,
        entry: Arc<PooledSession>,
        acquire_timeout: Duration,
    ) -> Result<SessionLease> {
        let semaphore = entry.semaphore.clone();
        let permit = tokio::time::timeout(acquire_timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| Error::Backend {
                adapter: AdapterTag::Ssh,
                message: format!("timed out waiting for a free SSH channel to {key}"),
            })?
            .map_err(|_| Error::Backend {
                adapter: AdapterTag::Ssh,
                message: format!("SSH channel pool for {key} is closed"),
            })?;
        *entry.last_used.lock() = Instant::now();
        Ok(SessionLease {
            entry,
            _permit: permit,
        })
    }

    /// Drop any session that has had zero leased channels for longer than
    /// `idle_timeout`, closing it so the remote `ControlMaster` exits.
    fn spawn_idle_sweeper(self: Arc<Self>) {
        if self.idle_timeout == Duration::ZERO {
            return;
        }
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.idle_timeout.min(Duration::from_secs(30)));
            loop {
                tick.tick().await;
                let stale: Vec<Fingerprint> = self
                    .entries
                    .iter()
                    .filter(|entry| {
                        let idle_for = entry.last_used.lock().elapsed();
                        let fully_free = entry.semaphore.available_permits() == self.max_concurrent;
                        fully_free && idle_for >= self.idle_timeout
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in stale {
                    if let Some((_, entry)) = self.entries.remove(&key) {
                        self.events.emit(
                            "connection:close",
                            AdapterTag::Ssh,
                            serde_json::json!({ "host": key.host, "port": key.port, "reason": "idle" }),
                        );
                        // `entries` no longer holds a clone; if no lease is
                        // still outstanding this is the sole `Arc`, so it can
                        // be unwrapped and the session closed by value.
                        if let Ok(pooled) = Arc::try_unwrap(entry) {
                            let _ = pooled.session.close().await;
                        }
                    }
                }
            }
        });
    }

    /// Evict and close every pooled session immediately (engine shutdown).
    pub async fn dispose_all(&self) {
        let keys: Vec<Fingerprint> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.events.emit(
                    "connection:close",
                    AdapterTag::Ssh,
                    serde_json::json!({ "host": key.host, "port": key.port, "reason": "dispose" }),
                );
                if let Ok(pooled) = Arc::try_unwrap(entry) {
                    let _ = pooled.session.close().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_display_includes_user_when_present() {
        let fp = Fingerprint {
            host: "example.com".into(),
            port: 22,
            user: Some("deploy".into()),
            identity_file: None,
        };
        assert_eq!(format!("{fp}"), "deploy@example.com:22");
    }
}
