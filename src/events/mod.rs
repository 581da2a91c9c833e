//! Checkpointed event delivery to WebSocket subscribers

pub mod protocol;
pub mod stream;
pub mod websocket;

pub use protocol::{ClientMessage, ServerMessage};
pub use stream::{spawn_stream_worker, StreamHandle, Subscriber};
