//! Connector gateway contract.
//!
//! The manager is chain-agnostic: exactly one connector implementation is
//! injected at construction and used for everything that touches the chain.
//! Connectors must be safe for concurrent invocation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{BlockInfo, TransactionReceipt};

/// Structured classification of connector (and core) failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidInputs,
    TransactionUnderpriced,
    TransactionReverted,
    NonceTooLow,
    NotFound,
    DownstreamDown,
    /// Raised only by the core when a delete request reaps an in-flight
    /// transaction; never returned by connectors
    Cancelled,
    Unknown,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorReason::InvalidInputs => write!(f, "invalid_inputs"),
            ErrorReason::TransactionUnderpriced => write!(f, "transaction_underpriced"),
            ErrorReason::TransactionReverted => write!(f, "transaction_reverted"),
            ErrorReason::NonceTooLow => write!(f, "nonce_too_low"),
            ErrorReason::NotFound => write!(f, "not_found"),
            ErrorReason::DownstreamDown => write!(f, "downstream_down"),
            ErrorReason::Cancelled => write!(f, "cancelled"),
            ErrorReason::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ErrorReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_inputs" => Ok(ErrorReason::InvalidInputs),
            "transaction_underpriced" => Ok(ErrorReason::TransactionUnderpriced),
            "transaction_reverted" => Ok(ErrorReason::TransactionReverted),
            "nonce_too_low" => Ok(ErrorReason::NonceTooLow),
            "not_found" => Ok(ErrorReason::NotFound),
            "downstream_down" => Ok(ErrorReason::DownstreamDown),
            "cancelled" => Ok(ErrorReason::Cancelled),
            "unknown" => Ok(ErrorReason::Unknown),
            _ => Err(format!("Unknown error reason: {}", s)),
        }
    }
}

/// A connector failure with its structured reason
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConnectorError {
    pub reason: ErrorReason,
    pub message: String,
}

impl ConnectorError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::NotFound, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.reason == ErrorReason::NotFound
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Request to open the connector's new-block feed.
///
/// The connector writes a [`BlockInfo`] into `listener` for every new block
/// it observes. The channel is bounded; a full buffer blocks the connector's
/// producer, propagating backpressure from the confirmation tracker.
#[derive(Debug)]
pub struct NewBlockListenerRequest {
    pub listener: mpsc::Sender<BlockInfo>,
}

#[derive(Debug, Clone)]
pub struct NewBlockListenerResponse {
    pub initial_block: u64,
}

/// Submission of an already-prepared transaction to the chain.
/// The gas price contract is between the policy engine and the connector;
/// the manager passes it through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSendRequest {
    pub signer: String,
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<Value>,
    pub transaction_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSendResponse {
    pub transaction_hash: String,
}

/// Capabilities the manager consumes from a blockchain connector
#[async_trait]
pub trait ConnectorApi: Send + Sync {
    /// Subscribe to new-block notifications for the life of the manager
    async fn new_block_listener(
        &self,
        req: NewBlockListenerRequest,
    ) -> ConnectorResult<NewBlockListenerResponse>;

    /// Push a prepared transaction into the chain's transaction pool
    async fn transaction_send(
        &self,
        req: TransactionSendRequest,
    ) -> ConnectorResult<TransactionSendResponse>;

    /// Fetch the receipt for a transaction hash; `NotFound` when the hash is
    /// not (or no longer) mined
    async fn get_receipt(&self, tx_hash: &str) -> ConnectorResult<TransactionReceipt>;

    /// The next on-chain nonce for a signer
    async fn next_nonce_for_signer(&self, signer: &str) -> ConnectorResult<u64>;

    /// Liveness probe, surfaced by the status endpoint only
    async fn is_live(&self) -> bool {
        true
    }
}
