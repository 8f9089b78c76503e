//! Sliding-window counters (RPM, 30-minute quota), the pause marker, pacing
//! timestamps, and the load-balancing request counters.

use std::collections::HashMap;

use redis::AsyncCommands;

use super::{
    scripts, SlotStore, StoreError, RATE_30M_KEY_TTL_SECS, RATE_30M_WINDOW_MS, RESPONSE_END_TTL_SECS,
    RPM_KEY_TTL_SECS, RPM_WINDOW_MS,
};

impl SlotStore {
    /// Record one request in the RPM window; returns the window cardinality
    /// after the insert.
    pub async fn record_rpm(&self, account_id: i64, member: &str) -> Result<u32, StoreError> {
        self.record_window(self.rpm_key(account_id), RPM_WINDOW_MS, RPM_KEY_TTL_SECS, member)
            .await
    }

    pub async fn rpm_count(&self, account_id: i64) -> Result<u32, StoreError> {
        self.window_count(self.rpm_key(account_id), RPM_WINDOW_MS).await
    }

    /// Milliseconds until the oldest RPM entry leaves the window; `None` when
    /// the window is empty.
    pub async fn rpm_oldest_remaining_ms(&self, account_id: i64) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let remaining: i64 = redis::Script::new(scripts::WINDOW_OLDEST_REMAINING)
            .key(self.rpm_key(account_id))
            .arg(RPM_WINDOW_MS)
            .invoke_async(&mut conn)
            .await?;
        if remaining < 0 {
            Ok(None)
        } else {
            Ok(Some(remaining as u64))
        }
    }

    /// Record one request in the 30-minute window; returns the window
    /// cardinality after the insert, which the pipeline compares against the
    /// account's cap.
    pub async fn record_30m(&self, account_id: i64, member: &str) -> Result<u32, StoreError> {
        self.record_window(
            self.rate_30m_key(account_id),
            RATE_30M_WINDOW_MS,
            RATE_30M_KEY_TTL_SECS,
            member,
        )
        .await
    }

    pub async fn count_30m(&self, account_id: i64) -> Result<u32, StoreError> {
        self.window_count(self.rate_30m_key(account_id), RATE_30M_WINDOW_MS).await
    }

    async fn record_window(
        &self,
        key: String,
        window_ms: i64,
        key_ttl_secs: i64,
        member: &str,
    ) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::Script::new(scripts::RECORD_WINDOW)
            .key(key)
            .arg(window_ms)
            .arg(key_ttl_secs)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u32)
    }

    async fn window_count(&self, key: String, window_ms: i64) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::Script::new(scripts::WINDOW_COUNT)
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u32)
    }

    // Pause marker.

    pub async fn set_account_paused(
        &self,
        account_id: i64,
        duration_secs: u64,
    ) -> Result<(), StoreError> {
        if duration_secs == 0 {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(self.paused_key(account_id), 1, duration_secs).await?;
        Ok(())
    }

    pub async fn is_account_paused(&self, account_id: i64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let exists: i64 = conn.exists(self.paused_key(account_id)).await?;
        Ok(exists > 0)
    }

    /// Pause markers for a batch of accounts, pipelined.
    pub async fn paused_batch(&self, account_ids: &[i64]) -> Result<HashMap<i64, bool>, StoreError> {
        if account_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for account_id in account_ids {
            pipe.exists(self.paused_key(*account_id));
        }
        let flags: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(account_ids.iter().copied().zip(flags.into_iter().map(|f| f > 0)).collect())
    }

    // Pacing timestamps.

    pub async fn set_slot_response_end(
        &self,
        account_id: i64,
        slot_index: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(scripts::SET_RESPONSE_END)
            .key(self.response_end_key(account_id, slot_index))
            .arg(RESPONSE_END_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Seconds since the slot's last response ended, measured on the server
    /// clock; `None` when there is no record.
    pub async fn response_end_elapsed_secs(
        &self,
        account_id: i64,
        slot_index: u32,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let elapsed: i64 = redis::Script::new(scripts::RESPONSE_END_ELAPSED)
            .key(self.response_end_key(account_id, slot_index))
            .invoke_async(&mut conn)
            .await?;
        if elapsed < 0 {
            Ok(None)
        } else {
            Ok(Some(elapsed as u64))
        }
    }

    // Load-balancing request counters.

    pub async fn incr_request_count(
        &self,
        account_id: i64,
        retain_minutes: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::Script::new(scripts::INCR_REQUEST_COUNT)
            .arg(&self.namespace)
            .arg(account_id)
            .arg(retain_minutes)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Windowed request totals for a batch of accounts, one round trip.
    pub async fn request_counts(
        &self,
        account_ids: &[i64],
        window_minutes: u32,
    ) -> Result<HashMap<i64, i64>, StoreError> {
        if account_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection().await?;
        let script = redis::Script::new(scripts::REQUEST_COUNTS);
        let mut invocation = script.prepare_invoke();
        invocation.arg(&self.namespace).arg(window_minutes.max(1));
        for account_id in account_ids {
            invocation.arg(*account_id);
        }
        let raw: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        if raw.len() % 2 != 0 {
            return Err(StoreError::UnexpectedReply(format!(
                "request counts returned {} fields",
                raw.len()
            )));
        }
        Ok(raw.chunks_exact(2).map(|chunk| (chunk[0], chunk[1])).collect())
    }
}
