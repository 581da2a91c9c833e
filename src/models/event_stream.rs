//! Event stream and listener definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transaction::{ErrorRecord, ManagedTransaction, TransactionReceipt, TxStatus};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 250;

/// Transport of an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Websocket,
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Websocket => write!(f, "websocket"),
        }
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "websocket" => Ok(StreamType::Websocket),
            _ => Err(format!("Unknown stream type: {}", s)),
        }
    }
}

/// Durable definition of an event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamSpec {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    /// Optional signer regex applied before listener filters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
}

/// Durable definition of a listener attached to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub id: String,
    pub stream_id: String,
    /// Signer regex; a listener without a filter matches everything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One buffered event row, as read back from persistence
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub checkpoint: i64,
    pub payload: Value,
}

/// Lifecycle event types delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxEventType {
    TransactionSucceeded,
    TransactionFailed,
}

/// The event envelope written to matching streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event: TxEventType,
    pub id: String,
    pub signer: String,
    pub nonce: u64,
    pub status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
    /// Most recent error records, carried on terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorRecord>>,
    pub timestamp: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn succeeded(tx: &ManagedTransaction) -> Self {
        Self {
            event: TxEventType::TransactionSucceeded,
            id: tx.id.clone(),
            signer: tx.signer.clone(),
            nonce: tx.nonce,
            status: tx.status,
            receipt: tx.receipt.clone(),
            errors: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(tx: &ManagedTransaction) -> Self {
        let recent = tx.error_history.iter().rev().take(2).rev().cloned().collect::<Vec<_>>();
        Self {
            event: TxEventType::TransactionFailed,
            id: tx.id.clone(),
            signer: tx.signer.clone(),
            nonce: tx.nonce,
            status: tx.status,
            receipt: None,
            errors: if recent.is_empty() { None } else { Some(recent) },
            timestamp: Utc::now(),
        }
    }
}

/// Whether an event for `signer` should be written to this stream.
///
/// The stream-level filter (if any) must match; then, if the stream has
/// listeners, at least one listener filter must match too. A listener with
/// no filter matches everything. An invalid regex never matches.
pub fn stream_matches(spec: &EventStreamSpec, listeners: &[ListenerSpec], signer: &str) -> bool {
    if let Some(f) = &spec.filter {
        if !regex_matches(f, signer) {
            return false;
        }
    }
    if listeners.is_empty() {
        return true;
    }
    listeners
        .iter()
        .any(|l| l.filter.as_deref().map(|f| regex_matches(f, signer)).unwrap_or(true))
}

fn regex_matches(pattern: &str, input: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(input),
        Err(e) => {
            log::warn!("[STREAM] Invalid filter regex '{}': {}", pattern, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(filter: Option<&str>) -> EventStreamSpec {
        EventStreamSpec {
            id: "es-1".to_string(),
            name: "receipts".to_string(),
            stream_type: StreamType::Websocket,
            filter: filter.map(|s| s.to_string()),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            suspended: false,
            created_at: Utc::now(),
        }
    }

    fn listener(filter: Option<&str>) -> ListenerSpec {
        ListenerSpec {
            id: "l-1".to_string(),
            stream_id: "es-1".to_string(),
            filter: filter.map(|s| s.to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_listeners_matches_all() {
        assert!(stream_matches(&spec(None), &[], "0xabc"));
    }

    #[test]
    fn test_stream_filter_applies() {
        assert!(stream_matches(&spec(Some("^0xa")), &[], "0xabc"));
        assert!(!stream_matches(&spec(Some("^0xb")), &[], "0xabc"));
    }

    #[test]
    fn test_listener_filters() {
        let ls = [listener(Some("^0xdead")), listener(Some("^0xbeef"))];
        assert!(stream_matches(&spec(None), &ls, "0xbeef01"));
        assert!(!stream_matches(&spec(None), &ls, "0xabc"));
        // listener without filter matches anything
        let open = [listener(None)];
        assert!(stream_matches(&spec(None), &open, "0xanything"));
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        assert!(!stream_matches(&spec(Some("([")), &[], "0xabc"));
    }
}
