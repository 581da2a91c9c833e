//! Pluggable transaction policy
//!
//! The policy engine owns every decision about when and how a transaction is
//! (re)submitted and what gas price it carries. The manager invokes it once
//! per policy cycle for each in-flight transaction and persists whatever the
//! engine changed. Engine-private state rides in the transaction's opaque
//! `policy_state` blob.

pub mod registry;
pub mod simple;

use async_trait::async_trait;
use thiserror::Error;

use crate::connector::{ConnectorApi, ConnectorError, ErrorReason};
use crate::models::ManagedTransaction;

pub use registry::{PolicyEngineFactory, PolicyEngineRegistry};
pub use simple::{SimplePolicyEngine, SimplePolicyEngineFactory};

/// A non-fatal policy failure, recorded into the transaction's error history
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PolicyError {
    pub reason: ErrorReason,
    pub message: String,
}

impl PolicyError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl From<ConnectorError> for PolicyError {
    fn from(e: ConnectorError) -> Self {
        Self {
            reason: e.reason,
            message: e.message,
        }
    }
}

/// Result of one engine invocation for one transaction
#[derive(Debug)]
pub struct PolicyOutcome {
    /// The engine mutated the transaction; the manager must persist it
    pub updated: bool,
    pub error: Option<PolicyError>,
}

impl PolicyOutcome {
    pub fn unchanged() -> Self {
        Self {
            updated: false,
            error: None,
        }
    }

    pub fn updated() -> Self {
        Self {
            updated: true,
            error: None,
        }
    }

    pub fn failed(updated: bool, error: PolicyError) -> Self {
        Self {
            updated,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync + std::fmt::Debug {
    /// Advance one transaction by one step. Errors are captured, not thrown:
    /// the policy loop records them and continues with the next transaction.
    async fn execute(
        &self,
        connector: &dyn ConnectorApi,
        tx: &mut ManagedTransaction,
    ) -> PolicyOutcome;
}
