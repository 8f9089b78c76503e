//! Concurrency manager: typed slot, mutex, wait-queue, and rate-window
//! operations over the slot store, with release handles that survive client
//! disconnects.

mod backoff;
mod handle;
mod waits;

pub use handle::ReleaseHandle;
pub use waits::{WaitError, Waiter};

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{ConcurrencyConfig, PacingConfig};
use crate::sse::ReplyChannel;
use crate::store::{SlotStore, StoreError};

/// Extra queue seats beyond a user's concurrency limit.
const EXTRA_WAIT_SLOTS: u32 = 20;

/// Ceiling for one RPM wait; a full window is the longest any entry can
/// take to expire.
const RPM_WAIT_CEILING: Duration = Duration::from_secs(60);

/// Fallback RPM sleep when the window reports no oldest entry.
const RPM_FALLBACK_SLEEP: Duration = Duration::from_secs(5);

/// Unique id for one admission attempt; doubles as the slot member and the
/// mutex holder token.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos() as u64)
            .unwrap_or(0);
        return format!("{nanos:016x}");
    }
    crate::session::hex_lower(&bytes)
}

/// Wait-queue bound for a user: their concurrency limit plus a fixed slack.
pub fn max_wait(user_concurrency: u32) -> u32 {
    user_concurrency.max(1) + EXTRA_WAIT_SLOTS
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RecordOutcome {
    pub should_pause: bool,
    pub count_30m: u32,
}

#[derive(Clone, Debug)]
pub struct ConcurrencyManager {
    store: SlotStore,
    config: ConcurrencyConfig,
}

impl ConcurrencyManager {
    pub fn new(store: SlotStore, config: ConcurrencyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.config.ping_interval_seconds.max(1))
    }

    pub fn slot_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.config.max_concurrency_wait_seconds.max(1))
    }

    pub fn session_mutex_timeout(&self) -> Duration {
        Duration::from_secs(self.config.session_mutex_wait_seconds.max(1))
    }

    /// Configured wait loop for one slot type.
    pub fn waiter(&self, slot_type: &'static str, timeout: Duration) -> Waiter<'_> {
        Waiter {
            slot_type,
            timeout,
            backoff: &self.config.backoff,
            ping_interval: self.ping_interval(),
        }
    }

    // Immediate (non-blocking) acquires. `None` means the pool is full.

    pub async fn acquire_user_slot(
        &self,
        user_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<Option<ReleaseHandle>, StoreError> {
        if max_concurrency == 0 {
            return Ok(Some(ReleaseHandle::noop()));
        }
        if !self.store.acquire_user_slot(user_id, max_concurrency, request_id).await? {
            return Ok(None);
        }
        let store = self.store.clone();
        let request_id = request_id.to_string();
        Ok(Some(ReleaseHandle::spawn_on_release(async move {
            if let Err(err) = store.release_user_slot(user_id, &request_id).await {
                tracing::warn!(user_id, %err, "user slot release failed");
            }
        })))
    }

    pub async fn acquire_account_slot(
        &self,
        account_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<Option<ReleaseHandle>, StoreError> {
        if max_concurrency == 0 {
            return Ok(Some(ReleaseHandle::noop()));
        }
        if !self.store.acquire_account_slot(account_id, max_concurrency, request_id).await? {
            return Ok(None);
        }
        let store = self.store.clone();
        let request_id = request_id.to_string();
        Ok(Some(ReleaseHandle::spawn_on_release(async move {
            if let Err(err) = store.release_account_slot(account_id, &request_id).await {
                tracing::warn!(account_id, %err, "account slot release failed");
            }
        })))
    }

    // Blocking acquires used by the pipeline.

    pub async fn user_slot_with_wait(
        &self,
        user_id: i64,
        max_concurrency: u32,
        request_id: &str,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<ReleaseHandle, WaitError> {
        self.waiter("user", self.slot_wait_timeout())
            .run(reply, cancel, || async {
                self.acquire_user_slot(user_id, max_concurrency, request_id).await
            })
            .await
    }

    pub async fn account_slot_with_wait(
        &self,
        account_id: i64,
        max_concurrency: u32,
        timeout: Duration,
        request_id: &str,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<ReleaseHandle, WaitError> {
        self.waiter("account", timeout)
            .run(reply, cancel, || async {
                self.acquire_account_slot(account_id, max_concurrency, request_id).await
            })
            .await
    }

    /// Serialize opus/sonnet requests of one session on one account. Empty
    /// sessions skip the mutex entirely.
    pub async fn session_mutex_with_wait(
        &self,
        account_id: i64,
        session: &str,
        request_id: &str,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<ReleaseHandle, WaitError> {
        if session.is_empty() {
            return Ok(ReleaseHandle::noop());
        }
        self.waiter("session_mutex", self.session_mutex_timeout())
            .run(reply, cancel, || async {
                if self.store.acquire_session_mutex(account_id, session, request_id).await? {
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            })
            .await?;

        let store = self.store.clone();
        let session = session.to_string();
        let request_id = request_id.to_string();
        Ok(ReleaseHandle::spawn_on_release(async move {
            if let Err(err) = store.release_session_mutex(account_id, &session, &request_id).await {
                tracing::warn!(account_id, %err, "session mutex release failed");
            }
        }))
    }

    // Wait-queue seats, released through the same handle machinery so a
    // disconnect while queued still decrements the counter.

    pub async fn user_wait_seat(
        &self,
        user_id: i64,
        max_waiting: u32,
    ) -> Result<Option<ReleaseHandle>, StoreError> {
        if !self.store.increment_wait(user_id, max_waiting).await? {
            return Ok(None);
        }
        let store = self.store.clone();
        Ok(Some(ReleaseHandle::spawn_on_release(async move {
            if let Err(err) = store.decrement_wait(user_id).await {
                tracing::warn!(user_id, %err, "wait counter decrement failed");
            }
        })))
    }

    pub async fn account_wait_seat(
        &self,
        account_id: i64,
        max_waiting: u32,
    ) -> Result<Option<ReleaseHandle>, StoreError> {
        if !self.store.increment_account_wait(account_id, max_waiting).await? {
            return Ok(None);
        }
        let store = self.store.clone();
        Ok(Some(ReleaseHandle::spawn_on_release(async move {
            if let Err(err) = store.decrement_account_wait(account_id).await {
                tracing::warn!(account_id, %err, "account wait counter decrement failed");
            }
        })))
    }

    // RPM and 30-minute accounting.

    /// Block until the account is below its RPM cap. Sleeps until the oldest
    /// window entry expires, re-checks, and gives up (admitting the request)
    /// after a full window; rate limiting here is best-effort by design.
    pub async fn wait_for_rpm_slot(
        &self,
        account_id: i64,
        max_rpm: u32,
        reply: &mut ReplyChannel,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        if max_rpm == 0 {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + RPM_WAIT_CEILING;
        loop {
            let count = match self.store.rpm_count(account_id).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(account_id, %err, "rpm read failed, admitting");
                    return Ok(());
                }
            };
            if count < max_rpm {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(account_id, count, max_rpm, "rpm wait ceiling hit, admitting");
                return Ok(());
            }

            let remaining = match self.store.rpm_oldest_remaining_ms(account_id).await {
                Ok(Some(ms)) => Duration::from_millis(ms.max(1)),
                Ok(None) => continue,
                Err(_) => RPM_FALLBACK_SLEEP,
            };
            let sleep = remaining.min(deadline - now);
            tracing::debug!(account_id, count, max_rpm, ?sleep, "rpm cap reached, waiting");
            self.waiter("rpm", RPM_WAIT_CEILING).sleep(sleep, reply, cancel).await?;
        }
    }

    /// Record one forwarded request in the RPM and 30-minute windows and
    /// report whether the 30-minute cap tripped. Accounting failures are
    /// logged, never propagated: the upstream call already happened.
    pub async fn record_account_request(
        &self,
        account_id: i64,
        request_id: &str,
        max_30m_requests: u32,
    ) -> RecordOutcome {
        if let Err(err) = self.store.record_rpm(account_id, request_id).await {
            tracing::warn!(account_id, %err, "rpm record failed");
        }
        let count_30m = match self.store.record_30m(account_id, request_id).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(account_id, %err, "30m record failed");
                return RecordOutcome::default();
            }
        };
        if max_30m_requests == 0 {
            return RecordOutcome { should_pause: false, count_30m };
        }
        RecordOutcome {
            should_pause: count_30m >= max_30m_requests,
            count_30m,
        }
    }

    pub async fn set_account_paused(&self, account_id: i64, duration: Duration) {
        if let Err(err) = self.store.set_account_paused(account_id, duration.as_secs()).await {
            tracing::warn!(account_id, %err, "pause marker write failed");
        }
    }

    // User-input pacing.

    /// Hold a user-initiated request until a random 10-20 s gap has passed
    /// since the slot's previous response finished, mimicking typing cadence.
    /// Errors only on client cancellation.
    pub async fn pace_user_input(
        &self,
        account_id: i64,
        slot_index: u32,
        pacing: &PacingConfig,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let elapsed = match self.store.response_end_elapsed_secs(account_id, slot_index).await {
            Ok(Some(elapsed)) => elapsed,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::warn!(account_id, slot_index, %err, "pacing read failed, skipping");
                return Ok(());
            }
        };

        let min = pacing.min_seconds;
        let max = pacing.max_seconds.max(min);
        let target = { rand::thread_rng().gen_range(min..=max) };
        if elapsed >= target {
            return Ok(());
        }

        let wait = Duration::from_secs(target - elapsed);
        tracing::debug!(account_id, slot_index, elapsed, target, "pacing user input");
        tokio::select! {
            _ = cancel.cancelled() => Err(WaitError::Cancelled { slot_type: "pacing" }),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    pub async fn mark_response_end(&self, account_id: i64, slot_index: u32) {
        if let Err(err) = self.store.set_slot_response_end(account_id, slot_index).await {
            tracing::warn!(account_id, slot_index, %err, "response end record failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_hex() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(a.bytes().all(|byte| byte.is_ascii_hexdigit()));
    }

    #[test]
    fn max_wait_adds_fixed_slack() {
        assert_eq!(max_wait(1), 21);
        assert_eq!(max_wait(5), 25);
        // Zero concurrency still queues as if it were one.
        assert_eq!(max_wait(0), 21);
    }
}
