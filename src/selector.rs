//! Account selection: given a group, session, and model, pick a schedulable
//! account by priority and observed load, preferring sticky sessions, and
//! hand back either a pre-acquired slot or a wait plan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::concurrency::{self, ConcurrencyManager, ReleaseHandle};
use crate::config::LoadBalancingConfig;
use crate::entities::{Account, EntityError, EntityStore, Group};
use crate::scheduler::SessionScheduler;
use crate::session::ModelFamily;
use crate::store::{AccountLoad, StoreError};

#[derive(Debug, Error)]
pub enum SelectError {
    /// The group only admits Claude Code clients; surfaced as 403.
    #[error("group restricted to claude code clients")]
    ClaudeCodeOnly,
    #[error("no accounts configured for group {0}")]
    NoAccounts(i64),
    #[error("no schedulable accounts for group {0}")]
    NoSchedulable(i64),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How the pipeline should queue when no account had a free slot.
#[derive(Clone, Copy, Debug)]
pub struct WaitPlan {
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub max_waiting: u32,
}

#[derive(Debug)]
pub struct Selection {
    pub account: Account,
    pub acquired: bool,
    pub slot_index: Option<u32>,
    pub release: Option<ReleaseHandle>,
    pub wait_plan: Option<WaitPlan>,
}

pub struct AccountSelector {
    entities: Arc<dyn EntityStore>,
    concurrency: Arc<ConcurrencyManager>,
    scheduler: SessionScheduler,
    load_balancing: LoadBalancingConfig,
}

impl AccountSelector {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        concurrency: Arc<ConcurrencyManager>,
        scheduler: SessionScheduler,
        load_balancing: LoadBalancingConfig,
    ) -> Self {
        Self {
            entities,
            concurrency,
            scheduler,
            load_balancing,
        }
    }

    /// Pick an account for `(group, session, model)`, excluding `failed`.
    /// Walks candidates best-first with an immediate non-blocking slot
    /// acquire; when every candidate is busy, returns the best one plus the
    /// wait plan to queue against it.
    pub async fn select(
        &self,
        group_id: i64,
        session_key: &str,
        model: &str,
        failed: &HashSet<i64>,
        client_is_claude_code: bool,
    ) -> Result<Selection, SelectError> {
        let group = self.resolve_group(group_id, client_is_claude_code).await?;

        let accounts = self.entities.list_accounts_by_group(group.id).await?;
        if accounts.is_empty() {
            return Err(SelectError::NoAccounts(group.id));
        }

        let mut eligible: Vec<Account> = accounts
            .into_iter()
            .filter(|account| account.schedulable && !failed.contains(&account.id))
            .collect();
        if eligible.is_empty() {
            return Err(SelectError::NoSchedulable(group.id));
        }

        // Admin pause markers live in the store, not the snapshot.
        let ids: Vec<i64> = eligible.iter().map(|account| account.id).collect();
        let paused = self.concurrency.store().paused_batch(&ids).await?;
        eligible.retain(|account| !paused.get(&account.id).copied().unwrap_or(false));
        if eligible.is_empty() {
            return Err(SelectError::NoSchedulable(group.id));
        }

        let ids: Vec<i64> = eligible.iter().map(|account| account.id).collect();
        let with_concurrency: Vec<(i64, u32)> =
            eligible.iter().map(|account| (account.id, account.max_concurrency)).collect();
        let loads = self.concurrency.store().accounts_load_batch(&with_concurrency).await?;
        let counts = if self.load_balancing.enabled {
            self.concurrency
                .store()
                .request_counts(&ids, self.load_balancing.window_minutes)
                .await?
        } else {
            Default::default()
        };

        let mut candidates: Vec<Candidate> = eligible
            .into_iter()
            .map(|account| {
                let load = loads.get(&account.id).copied().unwrap_or_default();
                let request_count = counts.get(&account.id).copied().unwrap_or(0);
                Candidate {
                    account,
                    load,
                    request_count,
                }
            })
            .collect();
        sort_candidates(&mut candidates, &self.load_balancing);

        // Conversation continuity beats load: a still-schedulable sticky
        // account jumps the queue. Bindings are keyed by the requested
        // group, not the fallback, to match where the pipeline writes them.
        if !session_key.is_empty() {
            if let Some(sticky_id) = self.entities.get_sticky_account(group_id, session_key).await?
            {
                if let Some(pos) = candidates.iter().position(|c| c.account.id == sticky_id) {
                    let sticky = candidates.remove(pos);
                    candidates.insert(0, sticky);
                }
            }
        }

        let family = ModelFamily::parse(model);
        for candidate in &candidates {
            let account = &candidate.account;
            if account.is_anthropic() && !session_key.is_empty() {
                let slot = self
                    .scheduler
                    .acquire_session_slot(account.id, account.max_concurrency, session_key, family)
                    .await?;
                if slot.acquired {
                    tracing::debug!(
                        account_id = account.id,
                        slot = ?slot.slot_index,
                        "selected account with session slot"
                    );
                    return Ok(Selection {
                        account: account.clone(),
                        acquired: true,
                        slot_index: slot.slot_index,
                        release: slot.release,
                        wait_plan: None,
                    });
                }
            } else {
                let request_id = concurrency::generate_request_id();
                if let Some(release) = self
                    .concurrency
                    .acquire_account_slot(account.id, account.max_concurrency, &request_id)
                    .await?
                {
                    tracing::debug!(account_id = account.id, "selected account");
                    return Ok(Selection {
                        account: account.clone(),
                        acquired: true,
                        slot_index: None,
                        release: Some(release),
                        wait_plan: None,
                    });
                }
            }
        }

        // Everyone is busy: queue on the best candidate.
        let best = candidates.first().expect("candidates non-empty").account.clone();
        tracing::debug!(account_id = best.id, "all accounts busy, returning wait plan");
        let wait_plan = WaitPlan {
            max_concurrency: best.max_concurrency,
            timeout: self.concurrency.slot_wait_timeout(),
            max_waiting: concurrency::max_wait(best.max_concurrency),
        };
        Ok(Selection {
            account: best,
            acquired: false,
            slot_index: None,
            release: None,
            wait_plan: Some(wait_plan),
        })
    }

    async fn resolve_group(
        &self,
        group_id: i64,
        client_is_claude_code: bool,
    ) -> Result<Group, SelectError> {
        let group = self
            .entities
            .get_group(group_id)
            .await?
            .ok_or(EntityError::GroupNotFound(group_id))?;
        if !group.claude_code_only || client_is_claude_code {
            return Ok(group);
        }
        // One level of fallback, never a chain.
        if let Some(fallback_id) = group.fallback_group_id {
            let fallback = self
                .entities
                .get_group(fallback_id)
                .await?
                .ok_or(EntityError::GroupNotFound(fallback_id))?;
            if !fallback.claude_code_only {
                tracing::debug!(group_id, fallback_id, "redirecting non-cli client to fallback group");
                return Ok(fallback);
            }
        }
        Err(SelectError::ClaudeCodeOnly)
    }
}

struct Candidate {
    account: Account,
    load: AccountLoad,
    request_count: i64,
}

/// Order candidates best-first.
///
/// With load balancing off: strict priority, then observed load. With it on:
/// the effective load blends the windowed request count with a per-priority
/// offset so lower tiers absorb overflow once the top tier saturates.
fn sort_candidates(candidates: &mut [Candidate], settings: &LoadBalancingConfig) {
    if settings.enabled {
        let base = candidates
            .iter()
            .map(|candidate| candidate.request_count)
            .max()
            .unwrap_or(0)
            .max(100);
        let offset = i64::from(settings.priority_offset);
        candidates.sort_by(|a, b| {
            let effective_a =
                a.request_count + i64::from(a.account.priority.saturating_sub(1)) * offset * base / 100;
            let effective_b =
                b.request_count + i64::from(b.account.priority.saturating_sub(1)) * offset * base / 100;
            effective_a
                .cmp(&effective_b)
                .then(a.request_count.cmp(&b.request_count))
        });
    } else {
        candidates.sort_by(|a, b| {
            a.account
                .priority
                .cmp(&b.account.priority)
                .then(a.load.load_percent.cmp(&b.load.load_percent))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, priority: u32, load_percent: u32, request_count: i64) -> Candidate {
        Candidate {
            account: Account {
                id,
                name: format!("acct-{id}"),
                platform: crate::entities::Platform::Anthropic,
                priority,
                max_concurrency: 3,
                max_rpm: 0,
                max_30m_requests: 0,
                rate_limit_cooldown_minutes: 0,
                schedulable: true,
                intercept_warmup: false,
                base_url: String::new(),
                api_key: String::new(),
            },
            load: AccountLoad {
                current_concurrency: 0,
                waiting: 0,
                load_percent,
            },
            request_count,
        }
    }

    fn order(candidates: &[Candidate]) -> Vec<i64> {
        candidates.iter().map(|candidate| candidate.account.id).collect()
    }

    fn settings(enabled: bool, offset: u32) -> LoadBalancingConfig {
        LoadBalancingConfig {
            enabled,
            priority_offset: offset,
            window_minutes: 10,
        }
    }

    #[test]
    fn strict_priority_when_disabled() {
        let mut candidates = vec![candidate(1, 2, 10, 10), candidate(2, 1, 50, 50)];
        sort_candidates(&mut candidates, &settings(false, 30));
        assert_eq!(order(&candidates), vec![2, 1]);
    }

    #[test]
    fn load_breaks_priority_ties_when_disabled() {
        let mut candidates = vec![candidate(1, 1, 80, 0), candidate(2, 1, 20, 0)];
        sort_candidates(&mut candidates, &settings(false, 30));
        assert_eq!(order(&candidates), vec![2, 1]);
    }

    #[test]
    fn weighted_equal_requests_prefers_priority() {
        let mut candidates = vec![candidate(1, 1, 0, 0), candidate(2, 2, 0, 0)];
        sort_candidates(&mut candidates, &settings(true, 30));
        // effective: 0 vs 0 + 1*30*100/100 = 30.
        assert_eq!(order(&candidates), vec![1, 2]);
    }

    #[test]
    fn weighted_overflow_shifts_to_lower_priority() {
        let mut candidates = vec![candidate(1, 1, 0, 50), candidate(2, 2, 0, 10)];
        sort_candidates(&mut candidates, &settings(true, 30));
        // effective: 50 vs 10 + 30 = 40.
        assert_eq!(order(&candidates), vec![2, 1]);
    }

    #[test]
    fn weighted_similar_load_keeps_top_priority_first() {
        let mut candidates = vec![candidate(1, 1, 0, 20), candidate(2, 2, 0, 0)];
        sort_candidates(&mut candidates, &settings(true, 30));
        // effective: 20 vs 0 + 30 = 30.
        assert_eq!(order(&candidates), vec![1, 2]);
    }

    #[test]
    fn weighted_full_tie_falls_back_to_raw_count() {
        let mut candidates = vec![
            candidate(1, 1, 0, 100),
            candidate(2, 2, 0, 50),
            candidate(3, 3, 0, 0),
        ];
        sort_candidates(&mut candidates, &settings(true, 50));
        // base 100: effective 100, 50+50, 0+100 -> all 100; raw counts decide.
        assert_eq!(order(&candidates), vec![3, 2, 1]);
    }

    #[test]
    fn base_count_has_a_floor_of_one_hundred() {
        // With max count 5 the base would collapse the offset to nearly
        // nothing without the floor.
        let mut candidates = vec![candidate(1, 1, 0, 5), candidate(2, 2, 0, 0)];
        sort_candidates(&mut candidates, &settings(true, 30));
        // effective: 5 vs 0 + 1*30*100/100 = 30.
        assert_eq!(order(&candidates), vec![1, 2]);
    }

    #[test]
    fn zero_offset_behaves_like_raw_counts() {
        let mut candidates = vec![candidate(1, 5, 0, 100), candidate(2, 1, 0, 200)];
        sort_candidates(&mut candidates, &settings(true, 0));
        assert_eq!(order(&candidates), vec![1, 2]);
    }
}
