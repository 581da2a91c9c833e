//! Manager configuration
//!
//! Hosts either build a `Config` directly or source it from the environment
//! with `Config::from_env()`. Malformed numeric values are fatal at startup;
//! unknown persistence types and unregistered policy engine names are
//! rejected by `Manager::new`.

use std::env;
use std::time::Duration;

use serde_json::Value;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_address: String,
    pub api_port: u16,
    pub cors_enabled: bool,
    /// Wake period of the policy loop when no signal arrives first
    pub policy_loop_interval: Duration,
    /// Backoff for persistence/connector retries inside a policy cycle
    pub retry: RetryPolicy,
    /// Admission cap on the in-flight set
    pub max_in_flight: usize,
    /// Cap on each transaction's error history ring
    pub error_history_count: usize,
    /// Validity window of the per-signer nonce cache
    pub nonce_state_timeout: Duration,
    /// Block depth required before a receipt is considered final
    pub confirmations_required: usize,
    /// Only "sqlite" is recognised
    pub persistence_type: String,
    /// SQLite file path; ":memory:" for ephemeral stores
    pub persistence_path: String,
    pub policy_engine: String,
    /// Engine-owned config section, passed to the factory untouched
    pub policy_engine_config: Value,
    /// Default page size for list endpoints
    pub api_default_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_address: "127.0.0.1".to_string(),
            api_port: 5008,
            cors_enabled: true,
            policy_loop_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_in_flight: 100,
            error_history_count: 25,
            nonce_state_timeout: Duration::from_secs(3600),
            confirmations_required: 20,
            persistence_type: "sqlite".to_string(),
            persistence_path: "./data/txmgr.db".to_string(),
            policy_engine: "simple".to_string(),
            policy_engine_config: Value::Object(Default::default()),
            api_default_limit: 25,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|e| panic!("{} must be a valid value: {:?}", key, e)),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            api_address: env::var("TXMGR_API_ADDRESS").unwrap_or(d.api_address),
            api_port: env_or("TXMGR_API_PORT", d.api_port),
            cors_enabled: env_or("TXMGR_CORS_ENABLED", d.cors_enabled),
            policy_loop_interval: env_millis("TXMGR_POLICYLOOP_INTERVAL_MS", d.policy_loop_interval),
            retry: RetryPolicy {
                initial_delay: env_millis("TXMGR_POLICYLOOP_RETRY_INIT_MS", d.retry.initial_delay),
                max_delay: env_millis("TXMGR_POLICYLOOP_RETRY_MAX_MS", d.retry.max_delay),
                factor: env_or("TXMGR_POLICYLOOP_RETRY_FACTOR", d.retry.factor),
            },
            max_in_flight: env_or("TXMGR_MAX_INFLIGHT", d.max_in_flight),
            error_history_count: env_or("TXMGR_ERROR_HISTORY_COUNT", d.error_history_count),
            nonce_state_timeout: env_millis("TXMGR_NONCE_STATE_TIMEOUT_MS", d.nonce_state_timeout),
            confirmations_required: env_or("TXMGR_CONFIRMATIONS_REQUIRED", d.confirmations_required),
            persistence_type: env::var("TXMGR_PERSISTENCE_TYPE").unwrap_or(d.persistence_type),
            persistence_path: env::var("TXMGR_PERSISTENCE_PATH").unwrap_or(d.persistence_path),
            policy_engine: env::var("TXMGR_POLICY_ENGINE").unwrap_or(d.policy_engine),
            policy_engine_config: match env::var("TXMGR_POLICY_ENGINE_CONFIG") {
                Ok(raw) => serde_json::from_str(&raw)
                    .unwrap_or_else(|e| panic!("TXMGR_POLICY_ENGINE_CONFIG must be valid JSON: {}", e)),
                Err(_) => d.policy_engine_config,
            },
            api_default_limit: env_or("TXMGR_API_DEFAULT_LIMIT", d.api_default_limit),
        }
    }
}
