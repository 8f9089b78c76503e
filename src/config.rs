use serde::{Deserialize, Serialize};

/// Runtime configuration for the admission core.
///
/// Every field has a default so a partial config file (or none at all) yields
/// a working gateway; the defaults match the values the scheduler and store
/// were tuned against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    #[serde(default)]
    pub user_input_pacing: PacingConfig,
    /// Accounts, groups, and API keys for the built-in static entity store.
    #[serde(default)]
    pub entities: crate::entities::StaticEntities,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            redis_url: default_redis_url(),
            concurrency: ConcurrencyConfig::default(),
            gateway: GatewayConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            user_input_pacing: PacingConfig::default(),
            entities: crate::entities::StaticEntities::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Live-set member expiry, in minutes.
    #[serde(default = "default_slot_ttl_minutes")]
    pub slot_ttl_minutes: u64,
    /// Wait-counter TTL in seconds; 0 falls back to `slot_ttl_minutes * 60`.
    #[serde(default)]
    pub wait_queue_ttl_seconds: u64,
    /// SSE keep-alive interval while a streaming request waits.
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,
    /// Ceiling for a single slot wait.
    #[serde(default = "default_max_wait_seconds")]
    pub max_concurrency_wait_seconds: u64,
    /// Bounded wait for the per-session mutex.
    #[serde(default = "default_session_mutex_wait_seconds")]
    pub session_mutex_wait_seconds: u64,
    /// Same-session parallel requests sharing one slot (haiku only).
    #[serde(default = "default_haiku_max_parallel")]
    pub haiku_max_parallel: u32,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            slot_ttl_minutes: default_slot_ttl_minutes(),
            wait_queue_ttl_seconds: 0,
            ping_interval_seconds: default_ping_interval_seconds(),
            max_concurrency_wait_seconds: default_max_wait_seconds(),
            session_mutex_wait_seconds: default_session_mutex_wait_seconds(),
            haiku_max_parallel: default_haiku_max_parallel(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn wait_queue_ttl_secs(&self) -> u64 {
        if self.wait_queue_ttl_seconds > 0 {
            self.wait_queue_ttl_seconds
        } else {
            self.slot_ttl_minutes.max(1) * 60
        }
    }
}

/// Exponential backoff between slot acquisition attempts. Deterministic
/// periodic polling causes thundering herds on the store, so retries spread
/// out with jitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction; 0.2 means each delay is scaled by [0.8, 1.2].
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_backoff_ms(),
            max_ms: default_max_backoff_ms(),
            multiplier: default_backoff_multiplier(),
            jitter: default_backoff_jitter(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Failover budget for anthropic-platform groups.
    #[serde(default = "default_max_account_switches")]
    pub max_account_switches: u32,
    /// Failover budget for gemini-platform groups.
    #[serde(default = "default_max_account_switches_gemini")]
    pub max_account_switches_gemini: u32,
    /// When set, only requests validated as Claude Code clients are admitted,
    /// regardless of group policy.
    #[serde(default)]
    pub require_claude_code: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_account_switches: default_max_account_switches(),
            max_account_switches_gemini: default_max_account_switches_gemini(),
            require_claude_code: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percentage added to the effective load per priority step.
    #[serde(default = "default_priority_offset")]
    pub priority_offset: u32,
    /// Window for the per-account request counts feeding the weighted sort.
    #[serde(default = "default_lb_window_minutes")]
    pub window_minutes: u32,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority_offset: default_priority_offset(),
            window_minutes: default_lb_window_minutes(),
        }
    }
}

/// Delay range enforced between a slot's previous response end and the next
/// user-initiated request on that slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_pacing_min")]
    pub min_seconds: u64,
    #[serde(default = "default_pacing_max")]
    pub max_seconds: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_pacing_min(),
            max_seconds: default_pacing_max(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8085".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_slot_ttl_minutes() -> u64 {
    15
}

fn default_ping_interval_seconds() -> u64 {
    10
}

fn default_max_wait_seconds() -> u64 {
    30
}

fn default_session_mutex_wait_seconds() -> u64 {
    120
}

fn default_haiku_max_parallel() -> u32 {
    3
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_max_account_switches() -> u32 {
    10
}

fn default_max_account_switches_gemini() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_priority_offset() -> u32 {
    30
}

fn default_lb_window_minutes() -> u32 {
    10
}

fn default_pacing_min() -> u64 {
    10
}

fn default_pacing_max() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_takes_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.concurrency.slot_ttl_minutes, 15);
        assert_eq!(config.concurrency.wait_queue_ttl_secs(), 15 * 60);
        assert_eq!(config.concurrency.max_concurrency_wait_seconds, 30);
        assert_eq!(config.gateway.max_account_switches, 10);
        assert_eq!(config.gateway.max_account_switches_gemini, 3);
        assert!(config.load_balancing.enabled);
        assert_eq!(config.load_balancing.priority_offset, 30);
        assert_eq!(config.user_input_pacing.min_seconds, 10);
        assert_eq!(config.user_input_pacing.max_seconds, 20);
    }

    #[test]
    fn explicit_wait_queue_ttl_wins_over_slot_ttl() {
        let config: Config = serde_json::from_str(
            r#"{"concurrency": {"slot_ttl_minutes": 2, "wait_queue_ttl_seconds": 45}}"#,
        )
        .expect("parse");
        assert_eq!(config.concurrency.wait_queue_ttl_secs(), 45);
    }
}
