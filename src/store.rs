//! Atomic slot store: the single shared-state authority for admission slots,
//! wait queues, session bindings, mutexes, and rate windows.
//!
//! All mutating operations run as server-side scripts (see [`scripts`]) so
//! every replica observes the same linearized slot state, timed by the
//! store's own clock.

mod maintenance;
mod scripts;
#[cfg(test)]
mod tests;
mod windows;

use std::collections::HashMap;

use redis::AsyncCommands;
use thiserror::Error;

/// Session mutexes are short-lived by design; a crashed holder must not be
/// able to deadlock a session for longer than this.
const SESSION_MUTEX_TTL_SECS: i64 = 300;

pub(crate) const RPM_WINDOW_MS: i64 = 60 * 1000;
pub(crate) const RPM_KEY_TTL_SECS: i64 = 120;
pub(crate) const RATE_30M_WINDOW_MS: i64 = 30 * 60 * 1000;
pub(crate) const RATE_30M_KEY_TTL_SECS: i64 = 3600;
pub(crate) const RESPONSE_END_TTL_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Per-account load snapshot returned by the batch query.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccountLoad {
    pub current_concurrency: u32,
    pub waiting: u32,
    pub load_percent: u32,
}

#[derive(Clone, Debug)]
pub struct SlotStore {
    client: redis::Client,
    namespace: String,
    slot_ttl_secs: i64,
    wait_queue_ttl_secs: i64,
}

impl SlotStore {
    pub fn new(
        url: impl AsRef<str>,
        slot_ttl_minutes: u64,
        wait_queue_ttl_seconds: u64,
    ) -> Result<Self, StoreError> {
        let slot_ttl_minutes = if slot_ttl_minutes == 0 { 15 } else { slot_ttl_minutes };
        let slot_ttl_secs = (slot_ttl_minutes * 60) as i64;
        let wait_queue_ttl_secs = if wait_queue_ttl_seconds == 0 {
            slot_ttl_secs
        } else {
            wait_queue_ttl_seconds as i64
        };
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            namespace: String::new(),
            slot_ttl_secs,
            wait_queue_ttl_secs,
        })
    }

    /// Prefix every key; used to isolate parallel test runs sharing one
    /// Redis instance.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn slot_ttl_secs(&self) -> i64 {
        self.slot_ttl_secs
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}__ping__", self.namespace)).await?;
        Ok(())
    }

    // Key layout is shared wire format between replicas; do not change it
    // without draining every replica first.

    fn account_slot_key(&self, account_id: i64) -> String {
        format!("{}concurrency:account:{account_id}", self.namespace)
    }

    fn user_slot_key(&self, user_id: i64) -> String {
        format!("{}concurrency:user:{user_id}", self.namespace)
    }

    fn wait_queue_key(&self, user_id: i64) -> String {
        format!("{}concurrency:wait:{user_id}", self.namespace)
    }

    fn account_wait_key(&self, account_id: i64) -> String {
        format!("{}wait:account:{account_id}", self.namespace)
    }

    fn session_mutex_key(&self, account_id: i64, session: &str) -> String {
        format!("{}session_mutex:{account_id}:{session}", self.namespace)
    }

    fn slot_owner_key(&self, account_id: i64, slot_index: u32) -> String {
        format!("{}slot_owner:{account_id}:{slot_index}", self.namespace)
    }

    fn session_slot_key(&self, account_id: i64, session: &str) -> String {
        format!("{}session_slot:{account_id}:{session}", self.namespace)
    }

    fn response_end_key(&self, account_id: i64, slot_index: u32) -> String {
        format!("{}slot_response_end:{account_id}:{slot_index}", self.namespace)
    }

    fn rpm_key(&self, account_id: i64) -> String {
        format!("{}rpm_limit:{account_id}", self.namespace)
    }

    fn rate_30m_key(&self, account_id: i64) -> String {
        format!("{}rate_30m:{account_id}", self.namespace)
    }

    fn paused_key(&self, account_id: i64) -> String {
        format!("{}account_paused:{account_id}", self.namespace)
    }

    // Member-keyed slots (user pools and plain account pools).

    async fn acquire_member_slot(
        &self,
        key: String,
        max_concurrency: u32,
        member: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let granted: i64 = redis::Script::new(scripts::ACQUIRE_SLOT)
            .key(key)
            .arg(max_concurrency)
            .arg(self.slot_ttl_secs)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    pub async fn acquire_account_slot(
        &self,
        account_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        self.acquire_member_slot(self.account_slot_key(account_id), max_concurrency, request_id)
            .await
    }

    pub async fn release_account_slot(
        &self,
        account_id: i64,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.zrem(self.account_slot_key(account_id), request_id).await?;
        Ok(())
    }

    pub async fn acquire_user_slot(
        &self,
        user_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        self.acquire_member_slot(self.user_slot_key(user_id), max_concurrency, request_id)
            .await
    }

    pub async fn release_user_slot(&self, user_id: i64, request_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.zrem(self.user_slot_key(user_id), request_id).await?;
        Ok(())
    }

    pub async fn account_concurrency(&self, account_id: i64) -> Result<u32, StoreError> {
        self.live_count(self.account_slot_key(account_id)).await
    }

    pub async fn user_concurrency(&self, user_id: i64) -> Result<u32, StoreError> {
        self.live_count(self.user_slot_key(user_id)).await
    }

    async fn live_count(&self, key: String) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::Script::new(scripts::LIVE_COUNT)
            .key(key)
            .arg(self.slot_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u32)
    }

    // Indexed slots.

    /// Claim a slot inside `[range_start, range_end)`, preferring `target`.
    /// Returns the claimed index, or `None` when the range or the account's
    /// occupancy cap is saturated.
    pub async fn acquire_slot_in_range(
        &self,
        account_id: i64,
        target: u32,
        range_start: u32,
        range_end: u32,
        max_concurrency: u32,
    ) -> Result<Option<u32>, StoreError> {
        let mut conn = self.connection().await?;
        let slot: i64 = redis::Script::new(scripts::ACQUIRE_SLOT_IN_RANGE)
            .key(self.account_slot_key(account_id))
            .arg(self.slot_ttl_secs)
            .arg(target)
            .arg(range_start)
            .arg(range_end)
            .arg(max_concurrency)
            .invoke_async(&mut conn)
            .await?;
        if slot < 0 {
            Ok(None)
        } else {
            Ok(Some(slot as u32))
        }
    }

    pub async fn release_slot_index(
        &self,
        account_id: i64,
        slot_index: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .zrem(self.account_slot_key(account_id), format!("slot_{slot_index}"))
            .await?;
        Ok(())
    }

    // Session-aware slots (same-session sharing for haiku).

    pub async fn acquire_slot_with_session(
        &self,
        account_id: i64,
        slot_index: u32,
        session: &str,
        max_parallel: u32,
        max_concurrency: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let granted: i64 = redis::Script::new(scripts::ACQUIRE_SLOT_WITH_SESSION)
            .key(self.slot_owner_key(account_id, slot_index))
            .key(self.account_slot_key(account_id))
            .arg(self.slot_ttl_secs)
            .arg(slot_index)
            .arg(session)
            .arg(max_parallel)
            .arg(max_concurrency)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    pub async fn release_slot_with_session(
        &self,
        account_id: i64,
        slot_index: u32,
        session: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let released: i64 = redis::Script::new(scripts::RELEASE_SLOT_WITH_SESSION)
            .key(self.slot_owner_key(account_id, slot_index))
            .key(self.account_slot_key(account_id))
            .arg(slot_index)
            .arg(session)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    // Session mutex.

    pub async fn acquire_session_mutex(
        &self,
        account_id: i64,
        session: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let granted: i64 = redis::Script::new(scripts::ACQUIRE_SESSION_MUTEX)
            .key(self.session_mutex_key(account_id, session))
            .arg(SESSION_MUTEX_TTL_SECS)
            .arg(request_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    pub async fn release_session_mutex(
        &self,
        account_id: i64,
        session: &str,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let released: i64 = redis::Script::new(scripts::RELEASE_SESSION_MUTEX)
            .key(self.session_mutex_key(account_id, session))
            .arg(request_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    // Wait-queue counters.

    pub async fn increment_wait(&self, user_id: i64, max_waiting: u32) -> Result<bool, StoreError> {
        self.increment_wait_key(self.wait_queue_key(user_id), max_waiting).await
    }

    pub async fn decrement_wait(&self, user_id: i64) -> Result<(), StoreError> {
        self.decrement_wait_key(self.wait_queue_key(user_id)).await
    }

    pub async fn increment_account_wait(
        &self,
        account_id: i64,
        max_waiting: u32,
    ) -> Result<bool, StoreError> {
        self.increment_wait_key(self.account_wait_key(account_id), max_waiting).await
    }

    pub async fn decrement_account_wait(&self, account_id: i64) -> Result<(), StoreError> {
        self.decrement_wait_key(self.account_wait_key(account_id)).await
    }

    pub async fn account_waiting(&self, account_id: i64) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let waiting: Option<i64> = conn.get(self.account_wait_key(account_id)).await?;
        Ok(waiting.unwrap_or(0).max(0) as u32)
    }

    async fn increment_wait_key(&self, key: String, max_waiting: u32) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let admitted: i64 = redis::Script::new(scripts::INCREMENT_WAIT)
            .key(key)
            .arg(max_waiting)
            .arg(self.wait_queue_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn decrement_wait_key(&self, key: String) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(scripts::DECREMENT_WAIT)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    // Batch load query for the selector.

    pub async fn accounts_load_batch(
        &self,
        accounts: &[(i64, u32)],
    ) -> Result<HashMap<i64, AccountLoad>, StoreError> {
        if accounts.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection().await?;
        let script = redis::Script::new(scripts::LOAD_BATCH);
        let mut invocation = script.prepare_invoke();
        invocation.arg(self.slot_ttl_secs).arg(&self.namespace);
        for (account_id, max_concurrency) in accounts {
            invocation.arg(*account_id).arg(*max_concurrency);
        }
        let raw: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        if raw.len() % 4 != 0 {
            return Err(StoreError::UnexpectedReply(format!(
                "load batch returned {} fields",
                raw.len()
            )));
        }

        let mut loads = HashMap::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            loads.insert(
                chunk[0],
                AccountLoad {
                    current_concurrency: chunk[1].max(0) as u32,
                    waiting: chunk[2].max(0) as u32,
                    load_percent: chunk[3].max(0) as u32,
                },
            );
        }
        Ok(loads)
    }

    // Session -> slot binding. The binding TTL tracks the slot TTL so a
    // binding never outlives the longest-lived slot it could point at.

    pub async fn session_slot(
        &self,
        account_id: i64,
        session: &str,
    ) -> Result<Option<u32>, StoreError> {
        let mut conn = self.connection().await?;
        let slot: Option<i64> = conn.get(self.session_slot_key(account_id, session)).await?;
        Ok(slot.and_then(|value| u32::try_from(value).ok()))
    }

    pub async fn set_session_slot(
        &self,
        account_id: i64,
        session: &str,
        slot_index: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(
                self.session_slot_key(account_id, session),
                slot_index,
                self.slot_ttl_secs as u64,
            )
            .await?;
        Ok(())
    }

    pub async fn refresh_session_slot(
        &self,
        account_id: i64,
        session: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: bool = conn
            .expire(self.session_slot_key(account_id, session), self.slot_ttl_secs)
            .await?;
        Ok(())
    }
}
