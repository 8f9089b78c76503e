//! Idle cleaner: wipes runtime slot state at startup and sweeps expired
//! entries on an interval.

use std::time::Duration;

use crate::store::SlotStore;

const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IdleCleaner {
    store: SlotStore,
    interval: Duration,
}

impl IdleCleaner {
    pub fn new(store: SlotStore, interval_secs: u64) -> Self {
        Self {
            store,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Wipe stale runtime state, then keep sweeping in the background. A
    /// restart means every previous in-flight request is gone, so leftover
    /// slots, owner records, mutexes, and bindings are meaningless.
    pub async fn start(self) -> tokio::task::JoinHandle<()> {
        match tokio::time::timeout(SWEEP_TIMEOUT, self.store.clear_all()).await {
            Ok(Ok(0)) => tracing::info!("no stale slots to clear on startup"),
            Ok(Ok(cleared)) => tracing::info!(cleared, "cleared stale slots on startup"),
            Ok(Err(err)) => tracing::warn!(%err, "startup slot wipe failed"),
            Err(_) => tracing::warn!("startup slot wipe timed out"),
        }

        let store = self.store;
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; that initial sweep is harmless
            // right after the wipe and simplifies the loop.
            loop {
                ticker.tick().await;
                match tokio::time::timeout(SWEEP_TIMEOUT, store.cleanup_all()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(cleaned)) => tracing::info!(cleaned, "swept expired slot entries"),
                    Ok(Err(err)) => tracing::warn!(%err, "slot sweep failed"),
                    Err(_) => tracing::warn!("slot sweep timed out"),
                }
            }
        })
    }
}
