//! Per-stream fan-out worker
//!
//! One worker task per active stream. The worker reads the durable event
//! buffer from the last acknowledged checkpoint, delivers ordered batches to
//! the current subscriber, and only advances the checkpoint once the
//! subscriber acknowledges. A disconnect discards the pending batch; a new
//! `listen` displaces the previous subscriber.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::protocol::ServerMessage;
use crate::models::EventStreamSpec;
use crate::persistence::Persistence;
use crate::retry::RetryPolicy;

/// The delivery half of one WebSocket subscription
pub struct Subscriber {
    /// Serialized `ServerMessage::Batch` frames to forward to the socket
    pub batch_tx: mpsc::Sender<String>,
    /// Checkpoints acknowledged by the client
    pub ack_rx: mpsc::Receiver<i64>,
}

/// Handle kept by the manager for each running stream worker
pub struct StreamHandle {
    pub spec: EventStreamSpec,
    /// Poked whenever a new event lands in the stream's buffer
    pub notify: Arc<Notify>,
    pub attach_tx: mpsc::Sender<Subscriber>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

pub fn spawn_stream_worker(
    spec: EventStreamSpec,
    persistence: Arc<dyn Persistence>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> StreamHandle {
    let notify = Arc::new(Notify::new());
    let (attach_tx, attach_rx) = mpsc::channel(4);
    let task = tokio::spawn(run_stream(
        spec.clone(),
        persistence,
        retry,
        cancel.clone(),
        notify.clone(),
        attach_rx,
    ));
    StreamHandle {
        spec,
        notify,
        attach_tx,
        cancel,
        task,
    }
}

enum AckOutcome {
    Acked(i64),
    Disconnected,
    Displaced(Subscriber),
    Cancelled,
}

async fn run_stream(
    spec: EventStreamSpec,
    persistence: Arc<dyn Persistence>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    mut attach_rx: mpsc::Receiver<Subscriber>,
) {
    log::info!("[STREAM] Worker started for stream '{}'", spec.name);

    let mut checkpoint = match retry
        .run(&cancel, "stream checkpoint load", || persistence.get_checkpoint(&spec.id))
        .await
    {
        Some(cp) => cp.unwrap_or(0),
        None => return,
    };

    let mut subscriber: Option<Subscriber> = None;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if subscriber.is_none() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                attached = attach_rx.recv() => match attached {
                    Some(s) => {
                        log::debug!("[STREAM] Subscriber attached to '{}'", spec.name);
                        subscriber = Some(s);
                    }
                    None => break,
                },
            }
            continue;
        }

        let events = match retry
            .run(&cancel, "stream batch load", || {
                persistence.list_stream_events(&spec.id, checkpoint, spec.batch_size)
            })
            .await
        {
            Some(events) => events,
            None => break,
        };

        if events.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notify.notified() => {
                    // allow a partial batch to fill before flushing
                    tokio::time::sleep(Duration::from_millis(spec.batch_timeout_ms)).await;
                }
                attached = attach_rx.recv() => match attached {
                    Some(s) => subscriber = Some(s),
                    None => break,
                },
            }
            continue;
        }

        let batch_checkpoint = events[events.len() - 1].checkpoint;
        let frame = ServerMessage::Batch {
            stream: spec.name.clone(),
            checkpoint: batch_checkpoint,
            events: events.into_iter().map(|e| e.payload).collect(),
        };
        let frame = match serde_json::to_string(&frame) {
            Ok(s) => s,
            Err(e) => {
                log::error!("[STREAM] Failed to serialize batch for '{}': {}", spec.name, e);
                break;
            }
        };

        let sent = match subscriber.as_mut() {
            Some(s) => s.batch_tx.send(frame).await.is_ok(),
            None => false,
        };
        if !sent {
            log::debug!("[STREAM] Subscriber of '{}' disconnected before delivery", spec.name);
            subscriber = None;
            continue;
        }

        let outcome = match (subscriber.as_mut(), &mut attach_rx) {
            (Some(s), attach) => wait_for_ack(s, attach, &cancel, batch_checkpoint).await,
            (None, _) => AckOutcome::Disconnected,
        };
        match outcome {
            AckOutcome::Acked(acked) => {
                if retry
                    .run(&cancel, "stream checkpoint write", || {
                        persistence.write_checkpoint(&spec.id, acked)
                    })
                    .await
                    .is_none()
                {
                    break;
                }
                checkpoint = acked;
            }
            AckOutcome::Disconnected => {
                log::debug!(
                    "[STREAM] Subscriber of '{}' disconnected; batch at {} discarded",
                    spec.name,
                    batch_checkpoint
                );
                subscriber = None;
            }
            AckOutcome::Displaced(s) => {
                log::debug!("[STREAM] Subscriber of '{}' displaced", spec.name);
                subscriber = Some(s);
            }
            AckOutcome::Cancelled => break,
        }
    }
    log::info!("[STREAM] Worker stopped for stream '{}'", spec.name);
}

async fn wait_for_ack(
    subscriber: &mut Subscriber,
    attach_rx: &mut mpsc::Receiver<Subscriber>,
    cancel: &CancellationToken,
    batch_checkpoint: i64,
) -> AckOutcome {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return AckOutcome::Cancelled,
            ack = subscriber.ack_rx.recv() => match ack {
                Some(acked) if acked >= batch_checkpoint => return AckOutcome::Acked(acked),
                Some(stale) => {
                    log::debug!("[STREAM] Ignoring stale ack {} (awaiting {})", stale, batch_checkpoint);
                }
                None => return AckOutcome::Disconnected,
            },
            attached = attach_rx.recv() => match attached {
                Some(s) => return AckOutcome::Displaced(s),
                None => return AckOutcome::Disconnected,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StreamType;
    use crate::persistence::Database;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn spec() -> EventStreamSpec {
        EventStreamSpec {
            id: "es-1".to_string(),
            name: "receipts".to_string(),
            stream_type: StreamType::Websocket,
            filter: None,
            batch_size: 2,
            batch_timeout_ms: 10,
            suspended: false,
            created_at: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    async fn attach(handle: &StreamHandle) -> (mpsc::Receiver<String>, mpsc::Sender<i64>) {
        let (batch_tx, batch_rx) = mpsc::channel(8);
        let (ack_tx, ack_rx) = mpsc::channel(8);
        handle
            .attach_tx
            .send(Subscriber { batch_tx, ack_rx })
            .await
            .unwrap();
        (batch_rx, ack_tx)
    }

    async fn next_batch(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for batch")
            .expect("worker dropped batch channel");
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_ordered_delivery_and_checkpoint() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handle = spawn_stream_worker(spec(), db.clone(), fast_retry(), CancellationToken::new());

        db.append_stream_event("es-1", &json!({"n": 1})).unwrap();
        db.append_stream_event("es-1", &json!({"n": 2})).unwrap();
        db.append_stream_event("es-1", &json!({"n": 3})).unwrap();
        handle.notify.notify_one();

        let (mut batch_rx, ack_tx) = attach(&handle).await;

        // batch_size is 2: first frame carries events 1 and 2
        let batch = next_batch(&mut batch_rx).await;
        assert_eq!(batch["events"].as_array().unwrap().len(), 2);
        assert_eq!(batch["events"][0]["n"], 1);
        let cp1 = batch["checkpoint"].as_i64().unwrap();
        ack_tx.send(cp1).await.unwrap();

        let batch = next_batch(&mut batch_rx).await;
        assert_eq!(batch["events"][0]["n"], 3);
        let cp2 = batch["checkpoint"].as_i64().unwrap();
        assert!(cp2 > cp1);
        ack_tx.send(cp2).await.unwrap();

        // the acknowledged checkpoint becomes durable
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if db.get_checkpoint("es-1").unwrap() == Some(cp2) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "checkpoint never persisted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.cancel.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unacked_batch_redelivered_on_reconnect() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let handle = spawn_stream_worker(spec(), db.clone(), fast_retry(), CancellationToken::new());

        db.append_stream_event("es-1", &json!({"n": 1})).unwrap();
        handle.notify.notify_one();

        // first subscriber receives the batch but never acks
        let (mut batch_rx, _ack_tx) = attach(&handle).await;
        let first = next_batch(&mut batch_rx).await;
        drop(batch_rx);
        drop(_ack_tx);

        // reconnect: same events, same checkpoint
        let (mut batch_rx, ack_tx) = attach(&handle).await;
        let again = next_batch(&mut batch_rx).await;
        assert_eq!(first["checkpoint"], again["checkpoint"]);
        assert_eq!(first["events"], again["events"]);

        ack_tx.send(again["checkpoint"].as_i64().unwrap()).await.unwrap();
        handle.cancel.cancel();
        handle.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_resumes_from_persisted_checkpoint() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let a = db.append_stream_event("es-1", &json!({"n": 1})).unwrap();
        db.append_stream_event("es-1", &json!({"n": 2})).unwrap();
        db.write_checkpoint("es-1", a).unwrap();

        let handle = spawn_stream_worker(spec(), db.clone(), fast_retry(), CancellationToken::new());
        let (mut batch_rx, ack_tx) = attach(&handle).await;

        let batch = next_batch(&mut batch_rx).await;
        assert_eq!(batch["events"].as_array().unwrap().len(), 1);
        assert_eq!(batch["events"][0]["n"], 2);

        ack_tx.send(batch["checkpoint"].as_i64().unwrap()).await.unwrap();
        handle.cancel.cancel();
        handle.task.await.unwrap();
    }
}
