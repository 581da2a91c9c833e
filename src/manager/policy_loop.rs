//! The policy loop: the single task that owns the in-flight set
//!
//! Wakes on the configured interval or on a stale/update signal, whichever
//! comes first. Each cycle refills the in-flight set from the pending index,
//! drains queued control requests, steps every transaction through the policy
//! engine, applies confirmation-tracker signals, and reaps terminal entries.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{ManagerInner, PolicyApiRequest};
use crate::confirmations::TrackedEvent;
use crate::connector::ErrorReason;
use crate::errors::ApiError;
use crate::models::{ManagedTransaction, TransactionEvent, TxStatus};

/// In-memory state for one in-flight transaction
pub(crate) struct PendingState {
    pub mtx: ManagedTransaction,
    pub last_policy_cycle: DateTime<Utc>,
    pub tracking_transaction_hash: Option<String>,
    pub tracked_events: Option<mpsc::Receiver<TrackedEvent>>,
    pub confirmed: bool,
    pub remove: bool,
}

pub(crate) async fn run(inner: Arc<ManagerInner>) {
    log::info!(
        "[POLICY] Policy loop started (interval {:?}, max in-flight {})",
        inner.config.policy_loop_interval,
        inner.config.max_in_flight
    );
    let mut inflight: Vec<PendingState> = Vec::new();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.policy_loop_interval) => {},
            _ = inner.inflight_stale.notified() => {},
            _ = inner.inflight_update.notified() => {},
        }
        if inner.cancel.is_cancelled() {
            break;
        }
        cycle(&inner, &mut inflight).await;
        inner.inflight_count.store(inflight.len(), Ordering::Relaxed);
    }
    log::info!("[POLICY] Policy loop exited");
}

async fn cycle(inner: &Arc<ManagerInner>, inflight: &mut Vec<PendingState>) {
    refill(inner, inflight).await;
    process_api_requests(inner, inflight);
    step_transactions(inner, inflight).await;
    reap(inner, inflight).await;
}

/// Top the in-flight set up to `max_in_flight` with the oldest pending
/// transactions, strictly FIFO by sequence id
async fn refill(inner: &Arc<ManagerInner>, inflight: &mut Vec<PendingState>) {
    let deficit = inner.config.max_in_flight.saturating_sub(inflight.len());
    if deficit == 0 {
        return;
    }
    let candidates = match inner
        .config
        .retry
        .run(&inner.cancel, "pending refill query", || {
            inner.persistence.list_transactions_pending(
                None,
                inner.config.max_in_flight,
                crate::persistence::SortDirection::Ascending,
            )
        })
        .await
    {
        Some(candidates) => candidates,
        None => return,
    };

    for tx in candidates {
        if inflight.len() >= inner.config.max_in_flight {
            break;
        }
        if tx.status != TxStatus::Pending {
            continue;
        }
        if inflight.iter().any(|p| p.mtx.id == tx.id) {
            continue;
        }
        // a transaction that was already submitted before a restart resumes
        // tracking its last known hash
        let (tracking, tracked_events) = match tx.transaction_hash.clone() {
            Some(hash) => {
                let rx = inner
                    .confirmations
                    .register(tx.id.clone(), hash.clone())
                    .await;
                (Some(hash), Some(rx))
            }
            None => (None, None),
        };
        log::debug!("[POLICY] Admitted {} to the in-flight set", tx.id);
        inflight.push(PendingState {
            mtx: tx,
            last_policy_cycle: Utc::now(),
            tracking_transaction_hash: tracking,
            tracked_events,
            confirmed: false,
            remove: false,
        });
    }
}

/// Drain queued control requests. Deletes of in-flight transactions are
/// deferred to the reap step (202); everything else resolves synchronously.
fn process_api_requests(inner: &Arc<ManagerInner>, inflight: &mut Vec<PendingState>) {
    let requests: Vec<PolicyApiRequest> = std::mem::take(&mut *inner.api_requests.lock());
    for request in requests {
        match request {
            PolicyApiRequest::Delete { tx_id, reply } => {
                let result = if let Some(pending) =
                    inflight.iter_mut().find(|p| p.mtx.id == tx_id)
                {
                    pending.remove = true;
                    log::info!("[POLICY] Delete of in-flight {} deferred to reap", tx_id);
                    Ok((202, pending.mtx.clone()))
                } else {
                    match inner.persistence.get_transaction_by_id(&tx_id) {
                        Ok(Some(tx)) => match inner.persistence.delete_transaction(&tx_id) {
                            Ok(_) => {
                                log::info!("[POLICY] Deleted stored transaction {}", tx_id);
                                Ok((200, tx))
                            }
                            Err(e) => Err(ApiError::from(e)),
                        },
                        Ok(None) => {
                            Err(ApiError::NotFound(format!("transaction '{}' not found", tx_id)))
                        }
                        Err(e) => Err(ApiError::from(e)),
                    }
                };
                let _ = reply.send(result);
            }
        }
    }
}

async fn step_transactions(inner: &Arc<ManagerInner>, inflight: &mut Vec<PendingState>) {
    for pending in inflight.iter_mut() {
        if pending.remove || pending.confirmed {
            continue;
        }

        // apply tracker signals first so the engine never re-submits a
        // transaction whose confirmation is already in hand
        drain_tracker_signals(inner, pending).await;
        if pending.confirmed {
            continue;
        }

        let outcome = inner
            .policy_engine
            .execute(inner.connector.as_ref(), &mut pending.mtx)
            .await;
        pending.last_policy_cycle = Utc::now();

        if let Some(error) = outcome.error {
            log::info!(
                "[POLICY] Engine error for {}: {} ({})",
                pending.mtx.id,
                error.message,
                error.reason
            );
            pending
                .mtx
                .add_error(inner.config.error_history_count, error.reason, error.message);
        }

        if outcome.updated {
            pending.mtx.updated_at = Utc::now();
            if persist(inner, &pending.mtx).await.is_none() {
                return; // cancelled
            }
            if pending.mtx.transaction_hash != pending.tracking_transaction_hash {
                retrack(inner, pending).await;
            }
        }
    }
}

/// Swap confirmation tracking over to the transaction's current hash
async fn retrack(inner: &Arc<ManagerInner>, pending: &mut PendingState) {
    if pending.tracking_transaction_hash.is_some() {
        inner.confirmations.deregister(&pending.mtx.id).await;
    }
    match pending.mtx.transaction_hash.clone() {
        Some(hash) => {
            log::debug!("[POLICY] Tracking {} for {}", hash, pending.mtx.id);
            let rx = inner
                .confirmations
                .register(pending.mtx.id.clone(), hash.clone())
                .await;
            pending.tracking_transaction_hash = Some(hash);
            pending.tracked_events = Some(rx);
        }
        None => {
            pending.tracking_transaction_hash = None;
            pending.tracked_events = None;
        }
    }
}

async fn drain_tracker_signals(inner: &Arc<ManagerInner>, pending: &mut PendingState) {
    let mut confirmed = false;
    let mut removed = false;
    if let Some(rx) = pending.tracked_events.as_mut() {
        while let Ok(event) = rx.try_recv() {
            match event {
                TrackedEvent::Confirmed {
                    receipt,
                    confirmations,
                } => {
                    log::info!(
                        "[POLICY] Transaction {} confirmed in block {}",
                        pending.mtx.id,
                        receipt.block_number
                    );
                    pending.confirmed = true;
                    pending.mtx.receipt = Some(receipt);
                    pending.mtx.confirmations = confirmations;
                    pending.mtx.status = TxStatus::Succeeded;
                    pending.mtx.updated_at = Utc::now();
                    confirmed = true;
                }
                TrackedEvent::Removed { reason } => {
                    log::warn!(
                        "[POLICY] Tracking of {} removed ({}); engine will re-submit",
                        pending.mtx.id,
                        reason
                    );
                    // the engine observes the missing receipt next cycle
                    pending.mtx.receipt = None;
                    pending.mtx.confirmations.clear();
                    removed = true;
                }
            }
        }
    }
    if removed && !confirmed {
        pending.tracking_transaction_hash = None;
        pending.tracked_events = None;
    }
    if confirmed {
        if persist(inner, &pending.mtx).await.is_some() {
            inner.dispatch_event(&TransactionEvent::succeeded(&pending.mtx));
        }
    }
}

/// Remove-flagged and terminal transactions get one final persist, a terminal
/// event if they failed, and their in-flight slot back
async fn reap(inner: &Arc<ManagerInner>, inflight: &mut Vec<PendingState>) {
    let mut kept = Vec::with_capacity(inflight.len());
    let mut reaped_any = false;
    for mut pending in std::mem::take(inflight) {
        let terminal = pending.mtx.status.is_terminal();
        if !pending.remove && !terminal {
            kept.push(pending);
            continue;
        }

        if pending.remove && !terminal {
            pending.mtx.status = TxStatus::Failed;
            pending.mtx.add_error(
                inner.config.error_history_count,
                ErrorReason::Cancelled,
                "cancelled by delete request",
            );
            pending.mtx.updated_at = Utc::now();
        }

        if persist(inner, &pending.mtx).await.is_none() {
            return; // cancelled; the transaction stays durable in its last state
        }
        if pending.tracking_transaction_hash.is_some() {
            inner.confirmations.deregister(&pending.mtx.id).await;
        }
        if pending.mtx.status == TxStatus::Failed {
            inner.dispatch_event(&TransactionEvent::failed(&pending.mtx));
        }
        log::info!(
            "[POLICY] Reaped {} from the in-flight set (status {})",
            pending.mtx.id,
            pending.mtx.status
        );
        reaped_any = true;
    }
    *inflight = kept;
    if reaped_any {
        inner.mark_inflight_stale();
    }
}

async fn persist(inner: &Arc<ManagerInner>, tx: &ManagedTransaction) -> Option<i64> {
    inner
        .config
        .retry
        .run(&inner.cancel, "transaction persist", || {
            inner.persistence.write_transaction(tx)
        })
        .await
}
