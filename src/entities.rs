//! Account/group snapshots and the contracts the admission core consumes.
//!
//! The relational store, billing, and upstream forwarding live outside this
//! crate; the pipeline only ever sees read snapshots and idempotent writes
//! through the traits below.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sse::ReplyChannel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    Gemini,
}

impl Default for Platform {
    fn default() -> Self {
        Platform::Anthropic
    }
}

/// Upstream provider account snapshot.
///
/// `schedulable` is derived upstream from the account flags (paused,
/// rate-limited, overloaded, expired, archived); an unschedulable account
/// never receives new requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Max concurrent requests; 0 means unlimited.
    #[serde(default)]
    pub max_concurrency: u32,
    /// Requests per minute; 0 disables the RPM gate.
    #[serde(default)]
    pub max_rpm: u32,
    /// 30-minute request cap; 0 disables the cap.
    #[serde(default)]
    pub max_30m_requests: u32,
    /// Cooldown applied when the 30-minute cap trips.
    #[serde(default)]
    pub rate_limit_cooldown_minutes: u32,
    #[serde(default = "default_true")]
    pub schedulable: bool,
    /// Answer warmup / suggestion-mode probes locally instead of spending an
    /// upstream call on them.
    #[serde(default)]
    pub intercept_warmup: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Account {
    pub fn is_anthropic(&self) -> bool {
        self.platform == Platform::Anthropic
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub claude_code_only: bool,
    #[serde(default)]
    pub fallback_group_id: Option<i64>,
    /// Empty list allows every model.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Request model -> upstream model rewrites.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

impl Group {
    pub fn is_model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    pub fn map_model(&self, model: &str) -> String {
        match self.model_mapping.get(model) {
            Some(mapped) if !mapped.is_empty() => mapped.clone(),
            _ => model.to_string(),
        }
    }
}

/// Authenticated caller, resolved by the (external) auth middleware.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: i64,
    pub api_key_id: i64,
    pub group_id: i64,
    /// Per-user concurrent request cap; 0 means unlimited.
    #[serde(default)]
    pub concurrency: u32,
}

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("group {0} not found")]
    GroupNotFound(i64),
    #[error("entity store error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Default)]
pub struct UsageRecord {
    pub api_key_id: i64,
    pub user_id: i64,
    pub account_id: i64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stream: bool,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn resolve_key(&self, token: &str) -> Result<Option<AuthContext>, EntityError>;
    async fn get_group(&self, group_id: i64) -> Result<Option<Group>, EntityError>;
    async fn list_accounts_by_group(&self, group_id: i64) -> Result<Vec<Account>, EntityError>;
    async fn get_sticky_account(
        &self,
        group_id: i64,
        session_key: &str,
    ) -> Result<Option<i64>, EntityError>;
    async fn bind_sticky_session(
        &self,
        group_id: i64,
        session_key: &str,
        account_id: i64,
    ) -> Result<(), EntityError>;
    /// Mark an account unschedulable for `cooldown_minutes` after it hit its
    /// 30-minute request cap. Idempotent.
    async fn pause_account_for_30m_limit(
        &self,
        account_id: i64,
        cooldown_minutes: u32,
        request_count: u32,
    ) -> Result<(), EntityError>;
    async fn record_usage(&self, usage: UsageRecord) -> Result<(), EntityError>;
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing denied: {0}")]
    Denied(String),
    #[error("billing service unavailable: {0}")]
    Unavailable(String),
}

/// Balance/subscription eligibility. Checked by middleware before admission
/// and re-checked after the user-slot wait, since a balance can drain while
/// the request sits in the queue.
#[async_trait]
pub trait BillingGate: Send + Sync {
    async fn check_eligibility(&self, auth: &AuthContext) -> Result<(), BillingError>;
}

/// Billing gate that admits everything; used when billing runs entirely in
/// the fronting middleware.
#[derive(Debug, Default)]
pub struct NoopBillingGate;

#[async_trait]
impl BillingGate for NoopBillingGate {
    async fn check_eligibility(&self, _auth: &AuthContext) -> Result<(), BillingError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ForwardResult {
    pub status: u16,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Error)]
pub enum ForwardError {
    /// A per-attempt upstream failure; the pipeline excludes the account and
    /// retries on another one.
    #[error("upstream returned status {status}")]
    Failover { status: u16 },
    /// Terminal for the request; the response (if any) was already written.
    #[error("forward failed: {0}")]
    Terminal(String),
}

#[derive(Clone, Debug)]
pub struct ForwardRequest {
    pub body: bytes::Bytes,
    pub model: String,
    pub stream: bool,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        request: &ForwardRequest,
        account: &Account,
        reply: &mut ReplyChannel,
    ) -> Result<ForwardResult, ForwardError>;
}

/// Entity store backed by the config file. Good enough for single-replica
/// deployments and tests; production deployments put their relational store
/// behind the same trait.
#[derive(Debug, Default)]
pub struct StaticEntityStore {
    accounts: Vec<Account>,
    groups: Vec<Group>,
    keys: Vec<StaticKey>,
    account_groups: HashMap<i64, Vec<i64>>,
    sticky: Mutex<HashMap<(i64, String), i64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticKey {
    pub token: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub group_id: i64,
    #[serde(default)]
    pub concurrency: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StaticEntities {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub keys: Vec<StaticKey>,
    /// group id -> member account ids
    #[serde(default)]
    pub account_groups: HashMap<i64, Vec<i64>>,
}

impl StaticEntityStore {
    pub fn new(entities: StaticEntities) -> Self {
        Self {
            accounts: entities.accounts,
            groups: entities.groups,
            keys: entities.keys,
            account_groups: entities.account_groups,
            sticky: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EntityStore for StaticEntityStore {
    async fn resolve_key(&self, token: &str) -> Result<Option<AuthContext>, EntityError> {
        Ok(self.keys.iter().find(|key| key.token == token).map(|key| AuthContext {
            user_id: key.user_id,
            api_key_id: key.api_key_id,
            group_id: key.group_id,
            concurrency: key.concurrency,
        }))
    }

    async fn get_group(&self, group_id: i64) -> Result<Option<Group>, EntityError> {
        Ok(self.groups.iter().find(|group| group.id == group_id).cloned())
    }

    async fn list_accounts_by_group(&self, group_id: i64) -> Result<Vec<Account>, EntityError> {
        let members = match self.account_groups.get(&group_id) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(self
            .accounts
            .iter()
            .filter(|account| members.contains(&account.id))
            .cloned()
            .collect())
    }

    async fn get_sticky_account(
        &self,
        group_id: i64,
        session_key: &str,
    ) -> Result<Option<i64>, EntityError> {
        let sticky = self.sticky.lock().expect("sticky map poisoned");
        Ok(sticky.get(&(group_id, session_key.to_string())).copied())
    }

    async fn bind_sticky_session(
        &self,
        group_id: i64,
        session_key: &str,
        account_id: i64,
    ) -> Result<(), EntityError> {
        let mut sticky = self.sticky.lock().expect("sticky map poisoned");
        sticky.insert((group_id, session_key.to_string()), account_id);
        Ok(())
    }

    async fn pause_account_for_30m_limit(
        &self,
        account_id: i64,
        cooldown_minutes: u32,
        request_count: u32,
    ) -> Result<(), EntityError> {
        tracing::warn!(
            account_id,
            cooldown_minutes,
            request_count,
            "account hit 30m request cap"
        );
        Ok(())
    }

    async fn record_usage(&self, usage: UsageRecord) -> Result<(), EntityError> {
        tracing::debug!(
            account_id = usage.account_id,
            model = %usage.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "usage recorded"
        );
        Ok(())
    }
}

fn default_priority() -> u32 {
    1
}

fn default_true() -> bool {
    true
}
