//! Integration tests against a live Redis. They run only when
//! `POOLGATE_REDIS_URL` (or `REDIS_URL`) is set and silently pass otherwise,
//! so the default `cargo test` stays hermetic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::SlotStore;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("POOLGATE_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

static NAMESPACE_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_store(url: &str) -> SlotStore {
    let n = NAMESPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    SlotStore::new(url, 15, 0)
        .expect("store")
        .with_namespace(format!("poolgate_test:{ms}:{n}:"))
}

#[tokio::test]
async fn member_slot_respects_cap_and_releases() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.acquire_account_slot(1, 2, "req-a").await.expect("acquire"));
    assert!(store.acquire_account_slot(1, 2, "req-b").await.expect("acquire"));
    assert!(!store.acquire_account_slot(1, 2, "req-c").await.expect("acquire"));
    // Re-acquiring an existing member refreshes, not double-counts.
    assert!(store.acquire_account_slot(1, 2, "req-a").await.expect("acquire"));
    assert_eq!(store.account_concurrency(1).await.expect("count"), 2);

    store.release_account_slot(1, "req-a").await.expect("release");
    assert_eq!(store.account_concurrency(1).await.expect("count"), 1);
    assert!(store.acquire_account_slot(1, 2, "req-c").await.expect("acquire"));

    store.release_account_slot(1, "req-b").await.expect("release");
    store.release_account_slot(1, "req-c").await.expect("release");
    assert_eq!(store.account_concurrency(1).await.expect("count"), 0);
    // Releasing twice never drives the pool negative.
    store.release_account_slot(1, "req-c").await.expect("release");
    assert_eq!(store.account_concurrency(1).await.expect("count"), 0);
}

#[tokio::test]
async fn range_acquire_prefers_target_and_never_crosses() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    // Range [0, 2): target free.
    assert_eq!(store.acquire_slot_in_range(2, 1, 0, 2, 4).await.expect("acquire"), Some(1));
    // Target taken, falls back inside the range.
    assert_eq!(store.acquire_slot_in_range(2, 1, 0, 2, 4).await.expect("acquire"), Some(0));
    // Saturated range refuses even though [2, 4) is empty.
    assert_eq!(store.acquire_slot_in_range(2, 1, 0, 2, 4).await.expect("acquire"), None);
    // The other range is untouched.
    assert_eq!(store.acquire_slot_in_range(2, 2, 2, 4, 4).await.expect("acquire"), Some(2));

    store.release_slot_index(2, 0).await.expect("release");
    assert_eq!(store.acquire_slot_in_range(2, 1, 0, 2, 4).await.expect("acquire"), Some(0));
}

#[tokio::test]
async fn session_slot_shares_only_within_one_session() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    // Same session stacks up to max_parallel on one slot.
    assert!(store.acquire_slot_with_session(3, 0, "sess-a", 3, 3).await.expect("acquire"));
    assert!(store.acquire_slot_with_session(3, 0, "sess-a", 3, 3).await.expect("acquire"));
    assert!(store.acquire_slot_with_session(3, 0, "sess-a", 3, 3).await.expect("acquire"));
    assert!(!store.acquire_slot_with_session(3, 0, "sess-a", 3, 3).await.expect("acquire"));
    // A different session never shares the slot.
    assert!(!store.acquire_slot_with_session(3, 0, "sess-b", 3, 3).await.expect("acquire"));
    // The shared slot occupies exactly one seat.
    assert_eq!(store.account_concurrency(3).await.expect("count"), 1);

    // Only the owner can release; the count drains one holder at a time.
    assert!(!store.release_slot_with_session(3, 0, "sess-b").await.expect("release"));
    assert!(store.release_slot_with_session(3, 0, "sess-a").await.expect("release"));
    assert!(store.release_slot_with_session(3, 0, "sess-a").await.expect("release"));
    assert!(!store.acquire_slot_with_session(3, 0, "sess-b", 3, 3).await.expect("acquire"));
    assert!(store.release_slot_with_session(3, 0, "sess-a").await.expect("release"));

    // Fully drained: the slot is free for another session.
    assert_eq!(store.account_concurrency(3).await.expect("count"), 0);
    assert!(store.acquire_slot_with_session(3, 0, "sess-b", 3, 3).await.expect("acquire"));
}

#[tokio::test]
async fn session_slot_respects_foreign_zset_member() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    // A plain indexed claim holds slot_0 with no owner record; the
    // session-aware acquire must see it and refuse.
    assert_eq!(store.acquire_slot_in_range(4, 0, 0, 2, 2).await.expect("acquire"), Some(0));
    assert!(!store.acquire_slot_with_session(4, 0, "sess-a", 3, 2).await.expect("acquire"));

    store.release_slot_index(4, 0).await.expect("release");
    assert!(store.acquire_slot_with_session(4, 0, "sess-a", 3, 2).await.expect("acquire"));
}

#[tokio::test]
async fn occupancy_cap_holds_across_both_pools() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    // Four positions, three seats (concurrency 3): pools [0, 2) and [2, 4)
    // can hold two slots each, but the fourth claim must fail regardless of
    // which pool it lands in.
    assert!(store.acquire_slot_with_session(20, 0, "s0", 1, 3).await.expect("acquire"));
    assert!(store.acquire_slot_with_session(20, 1, "s1", 1, 3).await.expect("acquire"));
    assert!(store.acquire_slot_with_session(20, 2, "s2", 1, 3).await.expect("acquire"));
    assert!(!store.acquire_slot_with_session(20, 3, "s3", 1, 3).await.expect("acquire"));
    assert_eq!(store.acquire_slot_in_range(20, 3, 2, 4, 3).await.expect("acquire"), None);
    assert_eq!(store.account_concurrency(20).await.expect("count"), 3);

    // Freeing one seat re-opens the pool.
    assert!(store.release_slot_with_session(20, 1, "s1").await.expect("release"));
    assert!(store.acquire_slot_with_session(20, 3, "s3", 1, 3).await.expect("acquire"));
}

#[tokio::test]
async fn session_mutex_is_exclusive_and_holder_released() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.acquire_session_mutex(5, "sess", "req-a").await.expect("acquire"));
    assert!(!store.acquire_session_mutex(5, "sess", "req-b").await.expect("acquire"));

    // Only the holder can release.
    assert!(!store.release_session_mutex(5, "sess", "req-b").await.expect("release"));
    assert!(store.release_session_mutex(5, "sess", "req-a").await.expect("release"));
    assert!(store.acquire_session_mutex(5, "sess", "req-b").await.expect("acquire"));
}

#[tokio::test]
async fn wait_counter_bounds_and_round_trips() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.increment_wait(6, 2).await.expect("inc"));
    assert!(store.increment_wait(6, 2).await.expect("inc"));
    assert!(!store.increment_wait(6, 2).await.expect("inc"));

    store.decrement_wait(6).await.expect("dec");
    assert!(store.increment_wait(6, 2).await.expect("inc"));

    // Draining below zero is a no-op; the counter comes back at 1.
    store.decrement_wait(6).await.expect("dec");
    store.decrement_wait(6).await.expect("dec");
    store.decrement_wait(6).await.expect("dec");
    assert!(store.increment_wait(6, 1).await.expect("inc"));
    assert!(!store.increment_wait(6, 1).await.expect("inc"));
}

#[tokio::test]
async fn load_batch_reports_concurrency_waiting_and_percent() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.acquire_account_slot(7, 4, "req-a").await.expect("acquire"));
    assert!(store.acquire_account_slot(7, 4, "req-b").await.expect("acquire"));
    assert!(store.increment_account_wait(7, 10).await.expect("inc"));

    let loads = store.accounts_load_batch(&[(7, 4), (8, 2)]).await.expect("batch");
    let busy = loads.get(&7).expect("account 7");
    assert_eq!(busy.current_concurrency, 2);
    assert_eq!(busy.waiting, 1);
    assert_eq!(busy.load_percent, 75);

    let idle = loads.get(&8).expect("account 8");
    assert_eq!(idle.current_concurrency, 0);
    assert_eq!(idle.load_percent, 0);
}

#[tokio::test]
async fn session_binding_round_trips() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert_eq!(store.session_slot(9, "sess").await.expect("get"), None);
    store.set_session_slot(9, "sess", 3).await.expect("set");
    assert_eq!(store.session_slot(9, "sess").await.expect("get"), Some(3));
    store.refresh_session_slot(9, "sess").await.expect("refresh");
    assert_eq!(store.session_slot(9, "sess").await.expect("get"), Some(3));
}

#[tokio::test]
async fn sliding_windows_count_and_expose_oldest() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert_eq!(store.rpm_count(10).await.expect("count"), 0);
    assert_eq!(store.rpm_oldest_remaining_ms(10).await.expect("oldest"), None);

    assert_eq!(store.record_rpm(10, "req-a").await.expect("record"), 1);
    assert_eq!(store.record_rpm(10, "req-b").await.expect("record"), 2);
    assert_eq!(store.rpm_count(10).await.expect("count"), 2);

    let remaining = store.rpm_oldest_remaining_ms(10).await.expect("oldest").expect("some");
    assert!(remaining <= 60_000);

    assert_eq!(store.record_30m(10, "req-a").await.expect("record"), 1);
    assert_eq!(store.count_30m(10).await.expect("count"), 1);
}

#[tokio::test]
async fn pause_marker_round_trips() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(!store.is_account_paused(11).await.expect("check"));
    store.set_account_paused(11, 60).await.expect("pause");
    assert!(store.is_account_paused(11).await.expect("check"));

    let flags = store.paused_batch(&[11, 12]).await.expect("batch");
    assert_eq!(flags.get(&11), Some(&true));
    assert_eq!(flags.get(&12), Some(&false));
}

#[tokio::test]
async fn request_counts_accumulate_in_window() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    store.incr_request_count(13, 10).await.expect("incr");
    store.incr_request_count(13, 10).await.expect("incr");
    store.incr_request_count(14, 10).await.expect("incr");

    let counts = store.request_counts(&[13, 14, 15], 10).await.expect("counts");
    assert_eq!(counts.get(&13), Some(&2));
    assert_eq!(counts.get(&14), Some(&1));
    assert_eq!(counts.get(&15), Some(&0));
}

#[tokio::test]
async fn response_end_elapsed_tracks_server_clock() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert_eq!(store.response_end_elapsed_secs(16, 0).await.expect("get"), None);
    store.set_slot_response_end(16, 0).await.expect("set");
    let elapsed = store.response_end_elapsed_secs(16, 0).await.expect("get").expect("some");
    assert!(elapsed <= 2);
}

#[tokio::test]
async fn clear_all_wipes_runtime_state_but_not_wait_counters() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.acquire_account_slot(17, 2, "req-a").await.expect("acquire"));
    assert!(store.acquire_user_slot(18, 2, "req-b").await.expect("acquire"));
    assert!(store.acquire_session_mutex(17, "sess", "req-a").await.expect("mutex"));
    assert!(store.acquire_slot_with_session(17, 1, "sess", 3, 2).await.expect("session slot"));
    store.set_session_slot(17, "sess", 1).await.expect("bind");
    assert!(store.increment_wait(18, 5).await.expect("inc"));

    let cleared = store.clear_all().await.expect("clear");
    assert!(cleared >= 4);

    assert_eq!(store.account_concurrency(17).await.expect("count"), 0);
    assert_eq!(store.user_concurrency(18).await.expect("count"), 0);
    assert_eq!(store.session_slot(17, "sess").await.expect("get"), None);
    assert!(store.acquire_session_mutex(17, "sess", "req-c").await.expect("mutex"));
    // The wait counter survived the wipe, so one seat is still taken.
    assert!(store.increment_wait(18, 2).await.expect("inc"));
    assert!(!store.increment_wait(18, 2).await.expect("inc"));
}

#[tokio::test]
async fn cleanup_all_leaves_live_members_alone() {
    let Some(url) = redis_url() else { return };
    let store = test_store(&url);

    assert!(store.acquire_account_slot(19, 2, "req-a").await.expect("acquire"));
    assert!(store.acquire_slot_with_session(19, 0, "sess", 3, 2).await.expect("session slot"));

    let _ = store.cleanup_all().await.expect("cleanup");

    assert_eq!(store.account_concurrency(19).await.expect("count"), 2);
    assert!(!store.acquire_slot_with_session(19, 0, "other", 3, 2).await.expect("still held"));
}
