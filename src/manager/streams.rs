//! Event stream lifecycle and fan-out dispatch

use chrono::Utc;
use tokio::sync::mpsc;

use super::ManagerInner;
use crate::errors::{ApiError, StartupError};
use crate::events::{spawn_stream_worker, Subscriber};
use crate::models::{
    event_stream::stream_matches, EventStreamSpec, ListenerSpec, StreamType, TransactionEvent,
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT_MS,
};

impl ManagerInner {
    /// Spawn a worker for every non-suspended stream found in persistence
    pub(crate) fn restore_streams(&self) -> Result<(), StartupError> {
        let specs = self.persistence.list_streams()?;
        let count = specs.len();
        for spec in specs {
            if !spec.suspended {
                self.spawn_stream(spec);
            }
        }
        if count > 0 {
            log::info!("[STREAM] Restored {} event stream(s)", count);
        }
        Ok(())
    }

    fn spawn_stream(&self, spec: EventStreamSpec) {
        let handle = spawn_stream_worker(
            spec.clone(),
            self.persistence.clone(),
            self.config.retry.clone(),
            self.cancel.child_token(),
        );
        self.streams.insert(spec.id, handle);
    }

    pub(crate) fn create_stream(
        &self,
        name: String,
        filter: Option<String>,
        batch_size: Option<usize>,
        batch_timeout_ms: Option<u64>,
    ) -> Result<EventStreamSpec, ApiError> {
        if name.trim().is_empty() {
            return Err(ApiError::BadRequest("stream name must not be empty".to_string()));
        }
        if self.persistence.get_stream_by_name(&name)?.is_some() {
            return Err(ApiError::Conflict(format!("stream '{}' already exists", name)));
        }
        let spec = EventStreamSpec {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            stream_type: StreamType::Websocket,
            filter,
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_timeout_ms: batch_timeout_ms.unwrap_or(DEFAULT_BATCH_TIMEOUT_MS),
            suspended: false,
            created_at: Utc::now(),
        };
        self.persistence.write_stream(&spec)?;
        self.spawn_stream(spec.clone());
        log::info!("[STREAM] Created stream '{}' ({})", spec.name, spec.id);
        Ok(spec)
    }

    pub(crate) fn get_stream(&self, id: &str) -> Result<EventStreamSpec, ApiError> {
        self.persistence
            .get_stream(id)?
            .ok_or_else(|| ApiError::NotFound(format!("stream '{}' not found", id)))
    }

    pub(crate) fn list_streams(&self) -> Result<Vec<EventStreamSpec>, ApiError> {
        Ok(self.persistence.list_streams()?)
    }

    /// Apply updates and restart the worker so it picks up the new settings
    pub(crate) async fn update_stream(
        &self,
        id: &str,
        filter: Option<Option<String>>,
        batch_size: Option<usize>,
        batch_timeout_ms: Option<u64>,
        suspended: Option<bool>,
    ) -> Result<EventStreamSpec, ApiError> {
        let mut spec = self.get_stream(id)?;
        if let Some(filter) = filter {
            spec.filter = filter;
        }
        if let Some(batch_size) = batch_size {
            if batch_size == 0 {
                return Err(ApiError::BadRequest("batch_size must be greater than zero".to_string()));
            }
            spec.batch_size = batch_size;
        }
        if let Some(batch_timeout_ms) = batch_timeout_ms {
            spec.batch_timeout_ms = batch_timeout_ms;
        }
        if let Some(suspended) = suspended {
            spec.suspended = suspended;
        }
        self.persistence.write_stream(&spec)?;

        self.stop_stream_worker(id).await;
        if !spec.suspended {
            self.spawn_stream(spec.clone());
        }
        log::info!(
            "[STREAM] Updated stream '{}' (suspended: {})",
            spec.name,
            spec.suspended
        );
        Ok(spec)
    }

    pub(crate) async fn delete_stream(&self, id: &str) -> Result<(), ApiError> {
        let spec = self.get_stream(id)?;
        self.stop_stream_worker(id).await;
        self.persistence.delete_stream(id)?;
        log::info!("[STREAM] Deleted stream '{}' ({})", spec.name, id);
        Ok(())
    }

    async fn stop_stream_worker(&self, id: &str) {
        if let Some((_, handle)) = self.streams.remove(id) {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    pub(crate) fn create_listener(
        &self,
        stream_id: &str,
        filter: Option<String>,
    ) -> Result<ListenerSpec, ApiError> {
        self.get_stream(stream_id)?;
        let listener = ListenerSpec {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream_id.to_string(),
            filter,
            created_at: Utc::now(),
        };
        self.persistence.write_listener(&listener)?;
        Ok(listener)
    }

    pub(crate) fn list_listeners(&self, stream_id: &str) -> Result<Vec<ListenerSpec>, ApiError> {
        self.get_stream(stream_id)?;
        Ok(self.persistence.list_listeners(stream_id)?)
    }

    pub(crate) fn delete_listener(
        &self,
        stream_id: &str,
        listener_id: &str,
    ) -> Result<(), ApiError> {
        self.get_stream(stream_id)?;
        if !self.persistence.delete_listener(stream_id, listener_id)? {
            return Err(ApiError::NotFound(format!(
                "listener '{}' not found",
                listener_id
            )));
        }
        Ok(())
    }

    /// Attach a WebSocket subscription to a running stream worker by name.
    /// Returns the sender the connection forwards checkpoint acks into.
    pub(crate) async fn attach_subscriber(
        &self,
        name: &str,
        batch_tx: mpsc::Sender<String>,
    ) -> Result<mpsc::Sender<i64>, ApiError> {
        let attach_tx = self
            .streams
            .iter()
            .find(|entry| entry.value().spec.name == name)
            .map(|entry| entry.value().attach_tx.clone());
        let attach_tx = match attach_tx {
            Some(tx) => tx,
            None => {
                return Err(match self.persistence.get_stream_by_name(name)? {
                    Some(_) => ApiError::Conflict(format!("stream '{}' is suspended", name)),
                    None => ApiError::NotFound(format!("stream '{}' not found", name)),
                })
            }
        };

        let (ack_tx, ack_rx) = mpsc::channel(16);
        attach_tx
            .send(Subscriber { batch_tx, ack_rx })
            .await
            .map_err(|_| ApiError::Internal(format!("stream '{}' worker is not running", name)))?;
        Ok(ack_tx)
    }

    /// Write an event into every matching stream's durable buffer and wake
    /// the workers. Dispatch failures are logged, never fatal to the caller.
    pub(crate) fn dispatch_event(&self, event: &TransactionEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                log::error!("[STREAM] Failed to serialize event for {}: {}", event.id, e);
                return;
            }
        };
        for entry in self.streams.iter() {
            let handle = entry.value();
            let listeners = match self.persistence.list_listeners(&handle.spec.id) {
                Ok(l) => l,
                Err(e) => {
                    log::warn!(
                        "[STREAM] Listener load failed for '{}': {}",
                        handle.spec.name,
                        e
                    );
                    continue;
                }
            };
            if !stream_matches(&handle.spec, &listeners, &event.signer) {
                continue;
            }
            match self.persistence.append_stream_event(&handle.spec.id, &payload) {
                Ok(checkpoint) => {
                    log::debug!(
                        "[STREAM] Event for {} buffered on '{}' at checkpoint {}",
                        event.id,
                        handle.spec.name,
                        checkpoint
                    );
                    handle.notify.notify_one();
                }
                Err(e) => {
                    log::error!(
                        "[STREAM] Failed to buffer event on '{}': {}",
                        handle.spec.name,
                        e
                    );
                }
            }
        }
    }
}
