// SPDX-License-Identifier: MPL-2.0

//! Opt-in result caching, keyed by caller-supplied string (§4.14).

use crate::outcome::Outcome;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-command cache options (the `cache()` chain method, §4.11).
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub key: String,
    pub ttl: Duration,
}

impl CacheOptions {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        CacheOptions {
            key: key.into(),
            ttl,
        }
    }
}

struct Entry {
    outcome: Outcome,
    expires_at: Instant,
}

/// Shared cache of [`Outcome`]s, capped by entry count with LRU eviction.
///
/// Expiry is lazy: an expired entry is only reaped on the next [`ResultCache::get`]
/// that touches it, per §4.14.
pub struct ResultCache {
    entries: DashMap<String, Entry>,
    recency: Mutex<VecDeque<String>>,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        ResultCache {
            entries: DashMap::new(),
            recency: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns a clone of the cached [`Outcome`] with refreshed timestamps
    /// if `key` is present and not expired.
    pub fn get(&self, key: &str) -> Option<Outcome> {
        let hit = {
            let entry = self.entries.get(key)?;
            if entry.expires_at <= Instant::now() {
                None
            } else {
                Some(entry.outcome.clone())
            }
        };
        if hit.is_none() {
            self.entries.remove(key);
            return None;
        }
        self.touch(key);
        let now = chrono::Utc::now();
        hit.map(|mut outcome| {
            outcome.start = now;
            outcome.end = now;
            outcome
        })
    }

    pub fn set(&self, key: String, outcome: Outcome, ttl: Duration) {
        self.entries.insert(
            key.clone(),
            Entry {
                outcome,
                expires_at: Instant::now() + ttl,
            },
        );
        self.touch(&key);
        self.evict_if_over_capacity();
    }

    fn touch(&self, key: &str) {
        let mut order = self.recency.lock();
        order.retain(|k| k != key);
        order.push_back(key.to_owned());
    }

    fn evict_if_over_capacity(&self) {
        let mut order = self.recency.lock();
        while order.len() > self.max_entries {
            if let Some(oldest) = order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        ResultCache::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::AdapterTag;

    fn outcome() -> Outcome {
        let now = chrono::Utc::now();
        Outcome {
            stdout: "hi".into(),
            stderr: String::new(),
            exit_code: 0,
            signal: None,
            command: "echo hi".into(),
            start: now,
            end: now,
            adapter: AdapterTag::Local,
            host: None,
            container: None,
        }
    }

    #[test]
    fn hits_until_expired() {
        let cache = ResultCache::new(4);
        cache.set("k".into(), outcome(), Duration::from_secs(60));
        assert!(cache.get("k").is_some());

        cache.set("expired".into(), outcome(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("expired").is_none());
    }

    #[test]
    fn evicts_oldest_over_capacity() {
        let cache = ResultCache::new(2);
        cache.set("a".into(), outcome(), Duration::from_secs(60));
        cache.set("b".into(), outcome(), Duration::from_secs(60));
        cache.set("c".into(), outcome(), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
