//! The built-in "simple" policy engine
//!
//! Submits once, then re-submits whenever a receipt has failed to appear for
//! `resubmit_interval_ms`. Gas price comes from config (fixed) or from a REST
//! gas oracle, and is bumped by `gas_bump_factor` when the connector reports
//! the transaction underpriced. Counters live in the transaction's opaque
//! `policy_state` blob.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{PolicyEngine, PolicyEngineFactory, PolicyError, PolicyOutcome};
use crate::connector::{ConnectorApi, ErrorReason, TransactionSendRequest};
use crate::errors::StartupError;
use crate::http::shared_client;
use crate::models::ManagedTransaction;

fn default_resubmit_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_gas_bump_factor() -> f64 {
    1.2
}

fn default_oracle_field() -> String {
    "/gas_price".to_string()
}

fn default_oracle_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasOracleConfig {
    pub url: String,
    /// JSON pointer into the oracle response
    #[serde(default = "default_oracle_field")]
    pub field: String,
    #[serde(default = "default_oracle_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimplePolicyConfig {
    pub fixed_gas_price: Option<Value>,
    pub gas_oracle: Option<GasOracleConfig>,
    pub resubmit_interval_ms: u64,
    pub gas_bump_factor: f64,
}

impl Default for SimplePolicyConfig {
    fn default() -> Self {
        Self {
            fixed_gas_price: None,
            gas_oracle: None,
            resubmit_interval_ms: default_resubmit_interval_ms(),
            gas_bump_factor: default_gas_bump_factor(),
        }
    }
}

#[derive(Debug)]
pub struct SimplePolicyEngine {
    conf: SimplePolicyConfig,
    oracle_cache: Mutex<Option<(Value, Instant)>>,
}

impl SimplePolicyEngine {
    pub fn new(conf: SimplePolicyConfig) -> Self {
        Self {
            conf,
            oracle_cache: Mutex::new(None),
        }
    }

    async fn acquire_gas_price(&self) -> Result<Option<Value>, PolicyError> {
        if let Some(fixed) = &self.conf.fixed_gas_price {
            return Ok(Some(fixed.clone()));
        }
        let oracle = match &self.conf.gas_oracle {
            Some(o) => o,
            None => return Ok(None),
        };
        if let Some((price, at)) = self.oracle_cache.lock().as_ref() {
            if at.elapsed() < Duration::from_secs(oracle.ttl_secs) {
                return Ok(Some(price.clone()));
            }
        }
        let body: Value = shared_client()
            .get(&oracle.url)
            .send()
            .await
            .map_err(|e| {
                PolicyError::new(ErrorReason::DownstreamDown, format!("gas oracle request failed: {}", e))
            })?
            .json()
            .await
            .map_err(|e| {
                PolicyError::new(ErrorReason::DownstreamDown, format!("gas oracle returned invalid JSON: {}", e))
            })?;
        let price = body.pointer(&oracle.field).cloned().ok_or_else(|| {
            PolicyError::new(
                ErrorReason::Unknown,
                format!("gas oracle response missing field {}", oracle.field),
            )
        })?;
        *self.oracle_cache.lock() = Some((price.clone(), Instant::now()));
        Ok(Some(price))
    }

    /// Multiply a numeric gas price (number or numeric string) by the bump
    /// factor. Structured gas prices are left for the connector contract.
    fn bump_gas_price(&self, tx: &mut ManagedTransaction) -> bool {
        let bumped = match &tx.gas_price {
            Some(Value::Number(n)) => {
                if let Some(i) = n.as_u64() {
                    Some(json!((i as f64 * self.conf.gas_bump_factor).ceil() as u64))
                } else {
                    n.as_f64().map(|f| json!(f * self.conf.gas_bump_factor))
                }
            }
            Some(Value::String(s)) => s
                .parse::<u64>()
                .ok()
                .map(|i| json!(((i as f64 * self.conf.gas_bump_factor).ceil() as u64).to_string())),
            _ => None,
        };
        match bumped {
            Some(price) => {
                log::info!(
                    "[POLICY] Bumping gas price for {}: {:?} -> {}",
                    tx.id,
                    tx.gas_price,
                    price
                );
                tx.gas_price = Some(price);
                bump_counter(tx, "gas_bumps");
                true
            }
            None => false,
        }
    }
}

/// Increment a counter inside the engine-owned policy state blob
fn bump_counter(tx: &mut ManagedTransaction, key: &str) {
    let state = tx.policy_state.get_or_insert_with(|| json!({}));
    if let Value::Object(map) = state {
        let n = map.get(key).and_then(Value::as_u64).unwrap_or(0);
        map.insert(key.to_string(), json!(n + 1));
    }
}

#[async_trait]
impl PolicyEngine for SimplePolicyEngine {
    async fn execute(
        &self,
        connector: &dyn ConnectorApi,
        tx: &mut ManagedTransaction,
    ) -> PolicyOutcome {
        if tx.status.is_terminal() || tx.receipt.is_some() {
            return PolicyOutcome::unchanged();
        }

        let send_due = match (tx.first_submit, tx.last_submit) {
            (None, _) => true,
            (_, None) => true,
            (_, Some(last)) => {
                Utc::now().signed_duration_since(last)
                    >= chrono::Duration::milliseconds(self.conf.resubmit_interval_ms as i64)
            }
        };
        if !send_due {
            return PolicyOutcome::unchanged();
        }

        if tx.gas_price.is_none() {
            match self.acquire_gas_price().await {
                Ok(Some(price)) => tx.gas_price = Some(price),
                Ok(None) => {}
                Err(e) => return PolicyOutcome::failed(false, e),
            }
        }

        let first = tx.first_submit.is_none();
        let req = TransactionSendRequest {
            signer: tx.signer.clone(),
            nonce: tx.nonce,
            gas_price: tx.gas_price.clone(),
            transaction_data: tx.transaction_data.clone(),
        };
        match connector.transaction_send(req).await {
            Ok(resp) => {
                let now = Utc::now();
                if first {
                    log::info!(
                        "[POLICY] Transaction {} submitted as {} (nonce {})",
                        tx.id,
                        resp.transaction_hash,
                        tx.nonce
                    );
                    tx.first_submit = Some(now);
                } else {
                    log::info!(
                        "[POLICY] Transaction {} re-submitted as {}",
                        tx.id,
                        resp.transaction_hash
                    );
                }
                tx.last_submit = Some(now);
                tx.transaction_hash = Some(resp.transaction_hash);
                bump_counter(tx, "submission_count");
                PolicyOutcome::updated()
            }
            Err(e) => match e.reason {
                ErrorReason::TransactionUnderpriced => {
                    let bumped = self.bump_gas_price(tx);
                    PolicyOutcome::failed(bumped, e.into())
                }
                ErrorReason::NonceTooLow => {
                    // someone burnt this nonce under us; re-resolve from the
                    // chain so the next cycle submits above it
                    match connector.next_nonce_for_signer(&tx.signer).await {
                        Ok(n) if n > tx.nonce => {
                            log::warn!(
                                "[POLICY] Nonce {} too low for {}; advancing to {}",
                                tx.nonce,
                                tx.id,
                                n
                            );
                            tx.nonce = n;
                            PolicyOutcome::failed(true, e.into())
                        }
                        _ => PolicyOutcome::failed(false, e.into()),
                    }
                }
                _ => PolicyOutcome::failed(false, e.into()),
            },
        }
    }
}

pub struct SimplePolicyEngineFactory;

impl PolicyEngineFactory for SimplePolicyEngineFactory {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn build(&self, conf: &Value) -> Result<Arc<dyn PolicyEngine>, StartupError> {
        let conf: SimplePolicyConfig = serde_json::from_value(conf.clone())
            .map_err(|e| StartupError::PolicyEngineConfig(e.to_string()))?;
        Ok(Arc::new(SimplePolicyEngine::new(conf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorError;
    use crate::testutil::{make_tx, MockConnector};

    fn engine(conf: SimplePolicyConfig) -> SimplePolicyEngine {
        SimplePolicyEngine::new(conf)
    }

    #[tokio::test]
    async fn test_first_cycle_submits() {
        let connector = MockConnector::new();
        let e = engine(SimplePolicyConfig {
            fixed_gas_price: Some(json!(1000)),
            ..Default::default()
        });
        let mut tx = make_tx("tx-1", "0xaaa", 7);

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(outcome.updated);
        assert!(outcome.error.is_none());
        assert!(tx.first_submit.is_some());
        assert!(tx.last_submit.is_some());
        assert!(tx.transaction_hash.is_some());
        assert_eq!(tx.gas_price, Some(json!(1000)));
        assert_eq!(
            tx.policy_state.as_ref().unwrap().get("submission_count"),
            Some(&json!(1))
        );
    }

    #[tokio::test]
    async fn test_no_resubmit_before_interval() {
        let connector = MockConnector::new();
        let e = engine(SimplePolicyConfig::default());
        let mut tx = make_tx("tx-1", "0xaaa", 7);

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(outcome.updated);
        let hash = tx.transaction_hash.clone();

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(!outcome.updated);
        assert_eq!(tx.transaction_hash, hash);
        assert_eq!(connector.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_resubmits_after_interval() {
        let connector = MockConnector::new();
        let e = engine(SimplePolicyConfig {
            resubmit_interval_ms: 0,
            ..Default::default()
        });
        let mut tx = make_tx("tx-1", "0xaaa", 7);

        assert!(e.execute(&connector, &mut tx).await.updated);
        assert!(e.execute(&connector, &mut tx).await.updated);
        assert_eq!(connector.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_confirmed_transaction_untouched() {
        let connector = MockConnector::new();
        let e = engine(SimplePolicyConfig::default());
        let mut tx = make_tx("tx-1", "0xaaa", 7);
        tx.receipt = Some(crate::testutil::receipt_at(100, "0xb100"));

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(!outcome.updated);
        assert_eq!(connector.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_underpriced_bumps_gas() {
        let connector = MockConnector::new();
        connector.push_send_error(ConnectorError::new(
            ErrorReason::TransactionUnderpriced,
            "underpriced",
        ));
        let e = engine(SimplePolicyConfig {
            fixed_gas_price: Some(json!(1000)),
            gas_bump_factor: 1.5,
            ..Default::default()
        });
        let mut tx = make_tx("tx-1", "0xaaa", 7);

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(outcome.updated); // the bumped gas price must be persisted
        assert_eq!(outcome.error.unwrap().reason, ErrorReason::TransactionUnderpriced);
        assert_eq!(tx.gas_price, Some(json!(1500)));
        assert!(tx.first_submit.is_none());

        // next cycle retries at the higher price and succeeds
        let outcome = e.execute(&connector, &mut tx).await;
        assert!(outcome.updated);
        assert!(outcome.error.is_none());
        assert!(tx.transaction_hash.is_some());
    }

    #[tokio::test]
    async fn test_nonce_too_low_advances_nonce() {
        let connector = MockConnector::new();
        connector.set_next_nonce("0xaaa", 12);
        connector.push_send_error(ConnectorError::new(ErrorReason::NonceTooLow, "nonce too low"));
        let e = engine(SimplePolicyConfig::default());
        let mut tx = make_tx("tx-1", "0xaaa", 7);

        let outcome = e.execute(&connector, &mut tx).await;
        assert!(outcome.updated);
        assert_eq!(outcome.error.unwrap().reason, ErrorReason::NonceTooLow);
        assert_eq!(tx.nonce, 12);
    }

    #[tokio::test]
    async fn test_string_gas_price_bump() {
        let e = engine(SimplePolicyConfig {
            gas_bump_factor: 2.0,
            ..Default::default()
        });
        let mut tx = make_tx("tx-1", "0xaaa", 7);
        tx.gas_price = Some(json!("100"));
        assert!(e.bump_gas_price(&mut tx));
        assert_eq!(tx.gas_price, Some(json!("200")));

        // structured prices are not interpreted
        tx.gas_price = Some(json!({"maxFeePerGas": 100}));
        assert!(!e.bump_gas_price(&mut tx));
    }
}
