pub mod event_stream;
pub mod transaction;

pub use event_stream::{
    EventStreamSpec, ListenerSpec, StreamEvent, StreamType, TransactionEvent, TxEventType,
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT_MS,
};
pub use transaction::{BlockInfo, ErrorRecord, ManagedTransaction, TransactionReceipt, TxStatus};
