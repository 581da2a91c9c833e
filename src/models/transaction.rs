//! Managed transaction data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connector::ErrorReason;

/// Status of a managed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Admitted, not yet terminal
    Pending,
    /// Parked by an operator; not eligible for the in-flight set
    Suspended,
    /// Confirmed on-chain
    Succeeded,
    /// Terminally failed or cancelled
    Failed,
}

impl TxStatus {
    /// Terminal states are durable and never left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Succeeded | TxStatus::Failed)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Pending => write!(f, "pending"),
            TxStatus::Suspended => write!(f, "suspended"),
            TxStatus::Succeeded => write!(f, "succeeded"),
            TxStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TxStatus::Pending),
            "suspended" => Ok(TxStatus::Suspended),
            "succeeded" => Ok(TxStatus::Succeeded),
            "failed" => Ok(TxStatus::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Descriptor of a block delivered by the connector's new-block feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block_number: u64,
    pub block_hash: String,
    #[serde(default)]
    pub parent_hash: String,
}

/// The connector's representation of an on-chain execution outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    pub success: bool,
    /// Connector-specific detail, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<Value>,
}

/// One entry of a transaction's bounded error history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub reason: ErrorReason,
    pub message: String,
}

/// A transaction owned by the manager, durable under its string id.
///
/// `transaction_data`, `transaction_hash` and `gas_price` arrive pre-computed
/// from the connector's prepare step; the manager never interprets them.
/// `policy_state` is an opaque blob owned by the policy engine and only
/// round-tripped through persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedTransaction {
    pub id: String,
    /// Store-assigned insertion id, strictly increasing; used by the
    /// pending-view pagination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<i64>,
    pub signer: String,
    pub nonce: u64,
    pub status: TxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transaction_data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_submit: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_submit: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirmations: Vec<BlockInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_state: Option<Value>,
}

impl ManagedTransaction {
    /// Append an error record, trimming the history to `cap` newest entries
    pub fn add_error(&mut self, cap: usize, reason: ErrorReason, message: impl Into<String>) {
        self.error_history.push(ErrorRecord {
            time: Utc::now(),
            reason,
            message: message.into(),
        });
        while self.error_history.len() > cap {
            self.error_history.remove(0);
        }
    }
}
