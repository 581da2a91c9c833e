//! Submission, lookup, listing, and deletion of managed transactions

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::{ManagerInner, PolicyApiRequest};
use crate::errors::ApiError;
use crate::models::{ManagedTransaction, TxStatus};
use crate::nonces::NonceError;
use crate::persistence::SortDirection;

/// How long a queued control request may wait on the policy loop
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /transactions`. Payload, hash, and gas estimate arrive
/// pre-computed from the connector's prepare step.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub signer: String,
    pub transaction_data: String,
    #[serde(default)]
    pub gas_price: Option<Value>,
}

impl ManagerInner {
    /// Admit a new transaction: assign its nonce under the signer's lock,
    /// persist it, and only then release the nonce slot.
    pub(crate) async fn submit_transaction(
        &self,
        req: TransactionRequest,
    ) -> Result<ManagedTransaction, ApiError> {
        if req.signer.trim().is_empty() {
            return Err(ApiError::BadRequest("signer must not be empty".to_string()));
        }
        if req.transaction_data.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "transaction_data must not be empty".to_string(),
            ));
        }

        let id = req
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.persistence.get_transaction_by_id(&id)?.is_some() {
            return Err(ApiError::Conflict(format!(
                "transaction '{}' already exists",
                id
            )));
        }

        let lease = self
            .nonces
            .assign(&req.signer, self.connector.as_ref(), self.persistence.as_ref())
            .await
            .map_err(|e| match e {
                NonceError::Connector(e) => ApiError::from(e),
                NonceError::Store(e) => ApiError::from(e),
            })?;

        let now = Utc::now();
        let mut tx = ManagedTransaction {
            id,
            sequence_id: None,
            signer: req.signer,
            nonce: lease.nonce,
            status: TxStatus::Pending,
            created_at: now,
            updated_at: now,
            transaction_data: req.transaction_data,
            transaction_hash: None,
            gas_price: req.gas_price,
            first_submit: None,
            last_submit: None,
            receipt: None,
            confirmations: Vec::new(),
            error_history: Vec::new(),
            policy_state: None,
        };

        let seq = self.persistence.write_transaction(&tx)?;
        tx.sequence_id = Some(seq);
        lease.complete();

        log::info!(
            "[MANAGER] Admitted transaction {} (signer {}, nonce {})",
            tx.id,
            tx.signer,
            tx.nonce
        );
        self.mark_inflight_stale();
        Ok(tx)
    }

    pub(crate) fn get_transaction(&self, id: &str) -> Result<ManagedTransaction, ApiError> {
        self.persistence
            .get_transaction_by_id(id)?
            .ok_or_else(|| ApiError::NotFound(format!("transaction '{}' not found", id)))
    }

    pub(crate) fn get_transactions(
        &self,
        after: Option<&str>,
        limit: Option<usize>,
        signer: Option<&str>,
        pending: bool,
        direction: Option<&str>,
    ) -> Result<Vec<ManagedTransaction>, ApiError> {
        let limit = match limit {
            None => self.config.api_default_limit,
            Some(0) => {
                return Err(ApiError::BadRequest("limit must be greater than zero".to_string()))
            }
            Some(n) => n,
        };

        let dir = match direction.unwrap_or("").to_lowercase().as_str() {
            "" | "desc" | "descending" => SortDirection::Descending,
            "asc" | "ascending" => SortDirection::Ascending,
            other => {
                return Err(ApiError::BadRequest(format!(
                    "unrecognised sort direction '{}'",
                    other
                )))
            }
        };

        // the cursor transaction must exist so the right index key can be
        // picked off it below
        let after_tx = match after {
            Some(id) => Some(
                self.persistence
                    .get_transaction_by_id(id)?
                    .ok_or_else(|| {
                        ApiError::NotFound(format!("pagination cursor '{}' not found", id))
                    })?,
            ),
            None => None,
        };

        match (signer, pending) {
            (Some(_), true) => Err(ApiError::BadRequest(
                "signer and pending filters are mutually exclusive".to_string(),
            )),
            (Some(signer), false) => Ok(self.persistence.list_transactions_by_nonce(
                signer,
                after_tx.map(|tx| tx.nonce),
                limit,
                dir,
            )?),
            (None, true) => Ok(self.persistence.list_transactions_pending(
                after_tx.and_then(|tx| tx.sequence_id),
                limit,
                dir,
            )?),
            (None, false) => Ok(self
                .persistence
                .list_transactions_by_create_time(after_tx.as_ref(), limit, dir)?),
        }
    }

    /// Queue a delete for the policy loop and wait for its verdict
    pub(crate) async fn delete_transaction(
        &self,
        id: &str,
    ) -> Result<(u16, ManagedTransaction), ApiError> {
        let (reply, reply_rx) = oneshot::channel();
        self.api_requests.lock().push(PolicyApiRequest::Delete {
            tx_id: id.to_string(),
            reply,
        });
        self.mark_inflight_update();

        match tokio::time::timeout(API_REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::Internal(
                "policy loop dropped the request".to_string(),
            )),
            Err(_) => Err(ApiError::Internal(
                "timed out waiting for the policy loop".to_string(),
            )),
        }
    }
}
