//! Durable storage contract and the SQLite implementation

pub mod sqlite;
pub mod tables;

use serde_json::Value;
use thiserror::Error;

pub use sqlite::Database;

use crate::models::{
    EventStreamSpec, ListenerSpec, ManagedTransaction, StreamEvent,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sort order for the list indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// The storage contract the manager consumes. Implementations must be safe
/// for concurrent reads and writes; the core does not serialise access.
pub trait Persistence: Send + Sync {
    fn get_transaction_by_id(&self, id: &str) -> StoreResult<Option<ManagedTransaction>>;

    /// Insert or update by id, returning the store-assigned sequence id.
    /// Inserts assign a fresh, strictly-increasing sequence; updates keep it.
    fn write_transaction(&self, tx: &ManagedTransaction) -> StoreResult<i64>;

    fn delete_transaction(&self, id: &str) -> StoreResult<bool>;

    /// Highest admitted nonce for a signer, if any transaction exists
    fn highest_nonce_for_signer(&self, signer: &str) -> StoreResult<Option<u64>>;

    fn list_transactions_by_nonce(
        &self,
        signer: &str,
        after_nonce: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>>;

    /// Non-terminal transactions in insertion order
    fn list_transactions_pending(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>>;

    fn list_transactions_by_create_time(
        &self,
        after: Option<&ManagedTransaction>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>>;

    fn write_stream(&self, spec: &EventStreamSpec) -> StoreResult<()>;
    fn get_stream(&self, id: &str) -> StoreResult<Option<EventStreamSpec>>;
    fn get_stream_by_name(&self, name: &str) -> StoreResult<Option<EventStreamSpec>>;
    fn list_streams(&self) -> StoreResult<Vec<EventStreamSpec>>;
    /// Removes the stream together with its listeners, checkpoint, and
    /// buffered events
    fn delete_stream(&self, id: &str) -> StoreResult<bool>;

    fn write_listener(&self, listener: &ListenerSpec) -> StoreResult<()>;
    fn list_listeners(&self, stream_id: &str) -> StoreResult<Vec<ListenerSpec>>;
    fn delete_listener(&self, stream_id: &str, listener_id: &str) -> StoreResult<bool>;

    fn write_checkpoint(&self, stream_id: &str, checkpoint: i64) -> StoreResult<()>;
    fn get_checkpoint(&self, stream_id: &str) -> StoreResult<Option<i64>>;

    /// Buffer an event for a stream, returning its checkpoint position
    fn append_stream_event(&self, stream_id: &str, payload: &Value) -> StoreResult<i64>;
    fn list_stream_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<StreamEvent>>;

    fn close(&self);
}

// The SQLite implementation: delegates to the inherent methods in `tables/`
impl Persistence for Database {
    fn get_transaction_by_id(&self, id: &str) -> StoreResult<Option<ManagedTransaction>> {
        Database::get_transaction_by_id(self, id)
    }

    fn write_transaction(&self, tx: &ManagedTransaction) -> StoreResult<i64> {
        Database::write_transaction(self, tx)
    }

    fn delete_transaction(&self, id: &str) -> StoreResult<bool> {
        Database::delete_transaction(self, id)
    }

    fn highest_nonce_for_signer(&self, signer: &str) -> StoreResult<Option<u64>> {
        Database::highest_nonce_for_signer(self, signer)
    }

    fn list_transactions_by_nonce(
        &self,
        signer: &str,
        after_nonce: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        Database::list_transactions_by_nonce(self, signer, after_nonce, limit, dir)
    }

    fn list_transactions_pending(
        &self,
        after_sequence: Option<i64>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        Database::list_transactions_pending(self, after_sequence, limit, dir)
    }

    fn list_transactions_by_create_time(
        &self,
        after: Option<&ManagedTransaction>,
        limit: usize,
        dir: SortDirection,
    ) -> StoreResult<Vec<ManagedTransaction>> {
        Database::list_transactions_by_create_time(self, after, limit, dir)
    }

    fn write_stream(&self, spec: &EventStreamSpec) -> StoreResult<()> {
        Database::write_stream(self, spec)
    }

    fn get_stream(&self, id: &str) -> StoreResult<Option<EventStreamSpec>> {
        Database::get_stream(self, id)
    }

    fn get_stream_by_name(&self, name: &str) -> StoreResult<Option<EventStreamSpec>> {
        Database::get_stream_by_name(self, name)
    }

    fn list_streams(&self) -> StoreResult<Vec<EventStreamSpec>> {
        Database::list_streams(self)
    }

    fn delete_stream(&self, id: &str) -> StoreResult<bool> {
        Database::delete_stream(self, id)
    }

    fn write_listener(&self, listener: &ListenerSpec) -> StoreResult<()> {
        Database::write_listener(self, listener)
    }

    fn list_listeners(&self, stream_id: &str) -> StoreResult<Vec<ListenerSpec>> {
        Database::list_listeners(self, stream_id)
    }

    fn delete_listener(&self, stream_id: &str, listener_id: &str) -> StoreResult<bool> {
        Database::delete_listener(self, stream_id, listener_id)
    }

    fn write_checkpoint(&self, stream_id: &str, checkpoint: i64) -> StoreResult<()> {
        Database::write_checkpoint(self, stream_id, checkpoint)
    }

    fn get_checkpoint(&self, stream_id: &str) -> StoreResult<Option<i64>> {
        Database::get_checkpoint(self, stream_id)
    }

    fn append_stream_event(&self, stream_id: &str, payload: &Value) -> StoreResult<i64> {
        Database::append_stream_event(self, stream_id, payload)
    }

    fn list_stream_events(
        &self,
        stream_id: &str,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<StreamEvent>> {
        Database::list_stream_events(self, stream_id, after, limit)
    }

    fn close(&self) {
        // rusqlite closes on drop; nothing buffered to flush
    }
}
