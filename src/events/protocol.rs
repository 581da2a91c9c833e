//! WebSocket wire protocol for event streams
//!
//! A client names a stream with `listen`, receives `batch` frames, and
//! acknowledges each batch's checkpoint with `ack`. The stream only advances
//! durably on acknowledgment; an unacknowledged batch is redelivered after
//! reconnect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Listen { stream: String },
    Ack { stream: String, checkpoint: i64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Batch {
        stream: String,
        checkpoint: i64,
        events: Vec<Value>,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"listen","stream":"receipts"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Listen { ref stream } if stream == "receipts"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ack","stream":"receipts","checkpoint":42}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ack { checkpoint: 42, .. }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn test_batch_serialization() {
        let json = serde_json::to_value(ServerMessage::Batch {
            stream: "receipts".to_string(),
            checkpoint: 7,
            events: vec![json!({"n": 1})],
        })
        .unwrap();
        assert_eq!(json["type"], "batch");
        assert_eq!(json["checkpoint"], 7);
        assert_eq!(json["events"][0]["n"], 1);
    }
}
