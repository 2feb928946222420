// SPDX-License-Identifier: MPL-2.0

//! Filtered, wildcard-capable publish/subscribe event bus (§4.13).

use crate::outcome::AdapterTag;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One emitted lifecycle event, e.g. `command:start`, `connection:open`,
/// `retry:attempt`, `cache:hit`.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub adapter: AdapterTag,
    pub fields: Value,
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Opaque handle returned by [`EventBus::on`]/[`EventBus::on_filtered`],
/// passed back to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    pattern: String,
    filter: Option<Filter>,
    handler: Handler,
}

/// The single pub/sub surface shared by an [`crate::engine::Engine`] and all
/// adapters built from it.
#[derive(Default)]
pub struct EventBus {
    subs: DashMap<u64, Subscription>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Subscribe to an exact event name.
    pub fn on(&self, name: impl Into<String>, handler: Handler) -> SubscriptionId {
        self.insert(name.into(), None, handler)
    }

    /// Subscribe to a name pattern (trailing `*` wildcard, bare `*` matches
    /// everything) filtered by a predicate over the event's fields.
    pub fn on_filtered(
        &self,
        pattern: impl Into<String>,
        filter: Filter,
        handler: Handler,
    ) -> SubscriptionId {
        self.insert(pattern.into(), Some(filter), handler)
    }

    fn insert(&self, pattern: String, filter: Option<Filter>, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.insert(
            id,
            Subscription {
                pattern,
                filter,
                handler,
            },
        );
        SubscriptionId(id)
    }

    /// Remove a subscription registered by [`EventBus::on`] or
    /// [`EventBus::on_filtered`].
    pub fn off(&self, id: SubscriptionId) {
        self.subs.remove(&id.0);
    }

    /// Alias for [`EventBus::off`]; kept distinct per §4.13's naming of
    /// `off`/`offFiltered` as the two removal entry points.
    pub fn off_filtered(&self, id: SubscriptionId) {
        self.off(id);
    }

    /// Publish an event synchronously to every matching subscriber.
    pub fn emit(&self, name: &str, adapter: AdapterTag, fields: Value) {
        let event = Event {
            name: name.to_owned(),
            timestamp: Utc::now(),
            adapter,
            fields,
        };
        for entry in self.subs.iter() {
            let sub = entry.value();
            if !matches_pattern(&sub.pattern, &event.name) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(&event) {
                    continue;
                }
            }
            (sub.handler)(&event);
        }
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn exact_match_only_fires_exact() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on("command:start", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.emit("command:start", AdapterTag::Local, Value::Null);
        bus.emit("command:complete", AdapterTag::Local, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_prefix_matches() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on("command:*", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.emit("command:start", AdapterTag::Local, Value::Null);
        bus.emit("command:complete", AdapterTag::Local, Value::Null);
        bus.emit("connection:open", AdapterTag::Ssh, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on("*", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.emit("anything:here", AdapterTag::Cluster, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_subscription() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on("x", Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }));
        bus.off(id);
        bus.emit("x", AdapterTag::Local, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn filtered_subscription_respects_predicate() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on_filtered(
            "*",
            Arc::new(|e: &Event| e.adapter == AdapterTag::Ssh),
            Arc::new(move |_| { c.fetch_add(1, Ordering::SeqCst); }),
        );
        bus.emit("connection:open", AdapterTag::Local, Value::Null);
        bus.emit("connection:open", AdapterTag::Ssh, Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
