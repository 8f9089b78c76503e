//! Background sweeps: expired-slot cleanup and the startup wipe.

use super::{scripts, SlotStore, StoreError};

/// Owner records carry their expiry in the hash itself; the sweep deletes
/// records whose `expire` field has passed (the paired sorted-set member
/// ages out through its own score).
const CLEANUP_OWNER: &str = r#"
local value = redis.call('HGET', KEYS[1], 'expire')
if not value then
  redis.call('DEL', KEYS[1])
  return 1
end
local time = redis.call('TIME')
if tonumber(value) < tonumber(time[1]) then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#;

impl SlotStore {
    /// Drop expired slot members for a single account.
    pub async fn cleanup_account_slots(&self, account_id: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(scripts::CLEANUP_EXPIRED)
            .key(self.account_slot_key(account_id))
            .arg(self.slot_ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed.max(0) as u64)
    }

    /// Sweep every slot sorted set, owner record, and mutex for expired
    /// entries. Live entries are untouched: removal is strictly by score /
    /// expiry threshold, never by key age.
    pub async fn cleanup_all(&self) -> Result<u64, StoreError> {
        let mut cleaned = 0u64;

        let slot_keys = self.scan_keys(&format!("{}concurrency:*", self.namespace)).await?;
        let wait_prefix = format!("{}concurrency:wait:", self.namespace);
        for key in slot_keys {
            // Wait counters are plain strings with their own TTL.
            if key.starts_with(&wait_prefix) {
                continue;
            }
            let mut conn = self.connection().await?;
            let removed: i64 = match redis::Script::new(scripts::CLEANUP_EXPIRED)
                .key(&key)
                .arg(self.slot_ttl_secs)
                .invoke_async(&mut conn)
                .await
            {
                Ok(removed) => removed,
                // Skip keys of a foreign type rather than aborting the sweep.
                Err(_) => continue,
            };
            cleaned += removed.max(0) as u64;
        }

        for key in self.scan_keys(&format!("{}slot_owner:*", self.namespace)).await? {
            let mut conn = self.connection().await?;
            let removed: i64 = match redis::Script::new(CLEANUP_OWNER)
                .key(&key)
                .invoke_async(&mut conn)
                .await
            {
                Ok(removed) => removed,
                Err(_) => continue,
            };
            cleaned += removed.max(0) as u64;
        }

        // Mutexes expire through their native TTL; the sweep only reaps keys
        // that somehow lost it.
        for key in self.scan_keys(&format!("{}session_mutex:*", self.namespace)).await? {
            let mut conn = self.connection().await?;
            let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
            if ttl == -1 {
                let removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                cleaned += removed.max(0) as u64;
            }
        }

        Ok(cleaned)
    }

    /// Delete all runtime slot state. Called once at process startup: a
    /// restart implies no in-flight requests, so every leftover slot, owner
    /// record, mutex, and session binding is stale. Wait counters keep their
    /// own TTL and are left to expire.
    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut cleared = 0u64;
        let wait_prefix = format!("{}concurrency:wait:", self.namespace);

        for pattern in ["concurrency:*", "session_mutex:*", "slot_owner:*", "session_slot:*"] {
            let keys = self.scan_keys(&format!("{}{pattern}", self.namespace)).await?;
            for key in keys {
                if key.starts_with(&wait_prefix) {
                    continue;
                }
                let mut conn = self.connection().await?;
                let removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                cleared += removed.max(0) as u64;
            }
        }

        Ok(cleared)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
