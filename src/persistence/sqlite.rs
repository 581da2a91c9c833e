//! SQLite-backed persistence
//!
//! A single bundled-SQLite connection behind a mutex. The schema is created
//! on open; all table-level operations live under `tables/`.

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;

use super::StoreResult;

pub type DbConn<'a> = MutexGuard<'a, Connection>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    id                  TEXT NOT NULL UNIQUE,
    signer              TEXT NOT NULL,
    nonce               INTEGER NOT NULL,
    status              TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    transaction_data    TEXT NOT NULL,
    transaction_hash    TEXT,
    gas_price           TEXT,
    first_submit        TEXT,
    last_submit         TEXT,
    receipt             TEXT,
    confirmations       TEXT NOT NULL DEFAULT '[]',
    error_history       TEXT NOT NULL DEFAULT '[]',
    policy_state        TEXT,
    UNIQUE (signer, nonce)
);
CREATE INDEX IF NOT EXISTS idx_transactions_signer_nonce ON transactions (signer, nonce);
CREATE INDEX IF NOT EXISTS idx_transactions_status_seq ON transactions (status, seq);
CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions (created_at, seq);

CREATE TABLE IF NOT EXISTS event_streams (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    stream_type         TEXT NOT NULL,
    filter              TEXT,
    batch_size          INTEGER NOT NULL,
    batch_timeout_ms    INTEGER NOT NULL,
    suspended           INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_listeners (
    id                  TEXT PRIMARY KEY,
    stream_id           TEXT NOT NULL,
    filter              TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_listeners_stream ON stream_listeners (stream_id);

CREATE TABLE IF NOT EXISTS stream_checkpoints (
    stream_id           TEXT PRIMARY KEY,
    checkpoint          INTEGER NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_events (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id           TEXT NOT NULL,
    payload             TEXT NOT NULL,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stream_events_stream ON stream_events (stream_id, seq);
";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &str) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> DbConn<'_> {
        self.conn.lock()
    }
}
