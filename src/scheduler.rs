//! Session-affine slot scheduling: slot-count math, model-pool partitioning,
//! and the binding-aware acquire that keeps one session on one slot.

use crate::concurrency::ReleaseHandle;
use crate::session::ModelFamily;
use crate::store::{SlotStore, StoreError};

/// Same-session ceiling for models outside the known families; they share
/// the whole pool without a meaningful parallelism bound.
const UNBOUNDED_PARALLEL: u32 = 9_999;

/// Total slot positions for an account: ceil(4c/3). More positions than
/// concurrent seats spreads sessions across distinct slots; occupancy is
/// still capped by the concurrency limit, not the position count.
pub fn total_slots(concurrency: u32) -> u32 {
    if concurrency == 0 {
        return 0;
    }
    (concurrency * 4 + 2) / 3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u32,
    pub end: u32,
}

impl SlotRange {
    pub fn len(self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(self) -> bool {
        self.start >= self.end
    }

    pub fn contains(self, slot: u32) -> bool {
        slot >= self.start && slot < self.end
    }
}

/// Hard-isolated pools: opus gets the lower half, sonnet the upper half.
/// Each pool keeps at least one slot; a single-slot account shares it.
pub fn model_slot_ranges(total: u32) -> (SlotRange, SlotRange) {
    if total == 0 {
        return (SlotRange { start: 0, end: 0 }, SlotRange { start: 0, end: 0 });
    }
    if total == 1 {
        let shared = SlotRange { start: 0, end: 1 };
        return (shared, shared);
    }
    let mut opus_slots = total / 2;
    if opus_slots == 0 {
        opus_slots = 1;
    }
    if opus_slots >= total {
        opus_slots = total - 1;
    }
    (
        SlotRange { start: 0, end: opus_slots },
        SlotRange { start: opus_slots, end: total },
    )
}

/// The slot pool a request may draw from. Haiku and unrecognised models use
/// the whole pool; opus/sonnet stay inside their halves.
pub fn slot_range_for(family: Option<ModelFamily>, total: u32) -> SlotRange {
    match family {
        Some(ModelFamily::Opus) => model_slot_ranges(total).0,
        Some(ModelFamily::Sonnet) => model_slot_ranges(total).1,
        _ => SlotRange { start: 0, end: total },
    }
}

/// Deterministic session -> slot mapping: byte sum modulo the range size.
/// Deliberately simple; the slot space is tiny and the mapping must be
/// reproducible across replicas and runtimes.
pub fn hash_to_slot_index(session: &str, range_len: u32) -> u32 {
    if range_len == 0 {
        return 0;
    }
    let sum: u32 = session.bytes().map(u32::from).fold(0, u32::wrapping_add);
    sum % range_len
}

#[derive(Debug)]
pub struct SessionSlot {
    pub acquired: bool,
    /// The slot that was claimed, or on failure the target slot the session
    /// would queue for.
    pub slot_index: Option<u32>,
    pub release: Option<ReleaseHandle>,
}

impl SessionSlot {
    fn unlimited() -> Self {
        Self {
            acquired: true,
            slot_index: None,
            release: Some(ReleaseHandle::noop()),
        }
    }

    fn full(target: u32) -> Self {
        Self {
            acquired: false,
            slot_index: Some(target),
            release: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionScheduler {
    store: SlotStore,
    haiku_max_parallel: u32,
}

impl SessionScheduler {
    pub fn new(store: SlotStore, haiku_max_parallel: u32) -> Self {
        Self {
            store,
            haiku_max_parallel: haiku_max_parallel.max(1),
        }
    }

    fn max_parallel(&self, family: Option<ModelFamily>) -> u32 {
        match family {
            Some(ModelFamily::Haiku) => self.haiku_max_parallel,
            Some(_) => 1,
            None => UNBOUNDED_PARALLEL,
        }
    }

    /// Claim a slot for `session` on `account_id`, preferring the slot the
    /// session is bound to, then its hash target, then the rest of the
    /// model's range in rotation. Never leaves the range.
    pub async fn acquire_session_slot(
        &self,
        account_id: i64,
        max_concurrency: u32,
        session: &str,
        family: Option<ModelFamily>,
    ) -> Result<SessionSlot, StoreError> {
        if max_concurrency == 0 {
            return Ok(SessionSlot::unlimited());
        }

        let total = total_slots(max_concurrency);
        let range = slot_range_for(family, total);
        if range.is_empty() {
            return Ok(SessionSlot {
                acquired: false,
                slot_index: None,
                release: None,
            });
        }
        let max_parallel = self.max_parallel(family);

        // A live binding keeps the session on its previous slot, but only
        // while that slot lies inside the current model's pool; a model
        // switch invalidates it.
        let bound = match self.store.session_slot(account_id, session).await {
            Ok(bound) => bound,
            Err(err) => {
                tracing::warn!(account_id, %err, "session binding read failed");
                None
            }
        };
        if let Some(bound_slot) = bound {
            if range.contains(bound_slot) {
                if self
                    .store
                    .acquire_slot_with_session(
                        account_id,
                        bound_slot,
                        session,
                        max_parallel,
                        max_concurrency,
                    )
                    .await?
                {
                    if let Err(err) = self.store.refresh_session_slot(account_id, session).await {
                        tracing::warn!(account_id, %err, "session binding refresh failed");
                    }
                    return Ok(self.claimed(account_id, bound_slot, session));
                }
                tracing::debug!(account_id, bound_slot, "bound slot busy, falling back");
            } else {
                tracing::debug!(
                    account_id,
                    bound_slot,
                    range_start = range.start,
                    range_end = range.end,
                    "bound slot outside model pool, rebinding"
                );
            }
        }

        let target_in_range = hash_to_slot_index(session, range.len());
        let target = range.start + target_in_range;

        for offset in 0..range.len() {
            let slot = range.start + (target_in_range + offset) % range.len();
            if self
                .store
                .acquire_slot_with_session(account_id, slot, session, max_parallel, max_concurrency)
                .await?
            {
                if let Err(err) = self.store.set_session_slot(account_id, session, slot).await {
                    tracing::warn!(account_id, slot, %err, "session binding write failed");
                }
                return Ok(self.claimed(account_id, slot, session));
            }
        }

        tracing::debug!(
            account_id,
            range_start = range.start,
            range_end = range.end,
            "model pool saturated"
        );
        Ok(SessionSlot::full(target))
    }

    fn claimed(&self, account_id: i64, slot_index: u32, session: &str) -> SessionSlot {
        let store = self.store.clone();
        let session = session.to_string();
        SessionSlot {
            acquired: true,
            slot_index: Some(slot_index),
            release: Some(ReleaseHandle::spawn_on_release(async move {
                if let Err(err) =
                    store.release_slot_with_session(account_id, slot_index, &session).await
                {
                    tracing::warn!(account_id, slot_index, %err, "session slot release failed");
                }
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_slots_is_four_thirds_rounded_up() {
        assert_eq!(total_slots(0), 0);
        assert_eq!(total_slots(1), 2);
        assert_eq!(total_slots(3), 4);
        assert_eq!(total_slots(6), 8);
        assert_eq!(total_slots(9), 12);
    }

    #[test]
    fn ranges_split_evenly_with_floor_to_opus() {
        let (opus, sonnet) = model_slot_ranges(8);
        assert_eq!(opus, SlotRange { start: 0, end: 4 });
        assert_eq!(sonnet, SlotRange { start: 4, end: 8 });

        let (opus, sonnet) = model_slot_ranges(5);
        assert_eq!(opus, SlotRange { start: 0, end: 2 });
        assert_eq!(sonnet, SlotRange { start: 2, end: 5 });
    }

    #[test]
    fn tiny_pools_still_give_each_family_a_slot() {
        let (opus, sonnet) = model_slot_ranges(2);
        assert_eq!(opus.len(), 1);
        assert_eq!(sonnet.len(), 1);

        // A single slot is shared rather than leaving one family empty.
        let (opus, sonnet) = model_slot_ranges(1);
        assert_eq!(opus, sonnet);
        assert_eq!(opus, SlotRange { start: 0, end: 1 });

        let (opus, sonnet) = model_slot_ranges(0);
        assert!(opus.is_empty());
        assert!(sonnet.is_empty());
    }

    #[test]
    fn haiku_and_unknown_use_the_whole_pool() {
        assert_eq!(
            slot_range_for(Some(ModelFamily::Haiku), 8),
            SlotRange { start: 0, end: 8 }
        );
        assert_eq!(slot_range_for(None, 8), SlotRange { start: 0, end: 8 });
        assert_eq!(
            slot_range_for(Some(ModelFamily::Opus), 8),
            SlotRange { start: 0, end: 4 }
        );
        assert_eq!(
            slot_range_for(Some(ModelFamily::Sonnet), 8),
            SlotRange { start: 4, end: 8 }
        );
    }

    #[test]
    fn hash_is_stable_and_in_range() {
        // Byte sum of "abc" is 294.
        assert_eq!(hash_to_slot_index("abc", 4), 294 % 4);
        assert_eq!(hash_to_slot_index("abc", 4), hash_to_slot_index("abc", 4));
        assert_eq!(hash_to_slot_index("", 4), 0);
        assert_eq!(hash_to_slot_index("anything", 0), 0);
        for len in 1..16u32 {
            assert!(hash_to_slot_index("some-session-hash", len) < len);
        }
    }
}
