//! WebSocket endpoint for event stream delivery

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::AggregatedMessage;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, ServerMessage};
use crate::manager::AppState;

/// WebSocket handler mounted at `/ws`
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;
    let manager = state.manager.clone();
    actix_web::rt::spawn(handle_ws_connection(session, msg_stream, manager));
    Ok(response)
}

async fn handle_ws_connection(
    mut session: actix_ws::Session,
    msg_stream: actix_ws::MessageStream,
    manager: std::sync::Arc<crate::manager::ManagerInner>,
) {
    log::info!("[STREAM] New WebSocket connection");

    let mut msg_stream = msg_stream
        .aggregate_continuations()
        .max_continuation_size(64 * 1024);

    // batches from every listened stream funnel through one channel
    let (out_tx, mut out_rx) = mpsc::channel::<String>(16);
    let mut acks: HashMap<String, mpsc::Sender<i64>> = HashMap::new();

    loop {
        tokio::select! {
            Some(frame) = out_rx.recv() => {
                if session.text(frame).await.is_err() {
                    break;
                }
            }
            msg = msg_stream.next() => match msg {
                Some(Ok(AggregatedMessage::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Listen { stream }) => {
                            match manager.attach_subscriber(&stream, out_tx.clone()).await {
                                Ok(ack_tx) => {
                                    log::info!("[STREAM] Connection listening on '{}'", stream);
                                    acks.insert(stream, ack_tx);
                                }
                                Err(e) => {
                                    if !send_error(&mut session, &e.to_string()).await {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(ClientMessage::Ack { stream, checkpoint }) => {
                            match acks.get(&stream) {
                                Some(ack_tx) => {
                                    let _ = ack_tx.send(checkpoint).await;
                                }
                                None => {
                                    if !send_error(
                                        &mut session,
                                        &format!("not listening on stream '{}'", stream),
                                    )
                                    .await
                                    {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            if !send_error(&mut session, &format!("invalid message: {}", e)).await {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(AggregatedMessage::Ping(data))) => {
                    if session.pong(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(AggregatedMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::warn!("[STREAM] WebSocket error: {:?}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    // dropping the ack senders and the out channel detaches this connection
    // from every stream worker; pending batches are discarded
    let _ = session.close(None).await;
    log::info!("[STREAM] WebSocket connection closed");
}

async fn send_error(session: &mut actix_ws::Session, message: &str) -> bool {
    let frame = ServerMessage::Error {
        message: message.to_string(),
    };
    match serde_json::to_string(&frame) {
        Ok(json) => session.text(json).await.is_ok(),
        Err(_) => true,
    }
}
