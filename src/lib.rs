//! Transaction manager for blockchain connectors.
//!
//! The manager sits between an upstream orchestrator and a chain-specific
//! connector: it admits submitted transactions, assigns per-signer nonces,
//! drives each transaction through a pluggable policy engine until it is
//! confirmed on chain, and delivers receipt/lifecycle events to WebSocket
//! subscribers with durable, acknowledged checkpoints.
//!
//! Hosts construct a [`Manager`] with a [`Config`], their
//! [`connector::ConnectorApi`] implementation, and a
//! [`policy::PolicyEngineRegistry`], then call `start()`.

pub mod config;
pub mod confirmations;
pub mod connector;
pub mod controllers;
pub mod errors;
pub mod events;
pub mod http;
pub mod manager;
pub mod models;
pub mod nonces;
pub mod persistence;
pub mod policy;
pub mod retry;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use connector::{
    ConnectorApi, ConnectorError, ConnectorResult, ErrorReason, NewBlockListenerRequest,
    NewBlockListenerResponse, TransactionSendRequest, TransactionSendResponse,
};
pub use errors::{ApiError, StartupError};
pub use manager::{AppState, Manager};
pub use models::{
    BlockInfo, ErrorRecord, EventStreamSpec, ListenerSpec, ManagedTransaction,
    TransactionReceipt, TxStatus,
};
pub use persistence::{Persistence, SortDirection, StoreError};
pub use policy::{PolicyEngine, PolicyEngineFactory, PolicyEngineRegistry, PolicyOutcome};
