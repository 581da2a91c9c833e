//! Block-driven confirmation tracking
//!
//! A single task owns the registration map. It is fed by the connector's
//! new-block channel (bounded, so a slow tracker back-pressures the
//! connector's listener) and by register/deregister commands from the policy
//! loop. Per tracked hash it maintains a window of blocks from the receipt
//! block upward; when the window depth reaches the required confirmation
//! count it emits `Confirmed`. A hash that disappears from the chain resets
//! the window and, after `REORG_REMOVAL_CYCLES` receipt-less blocks, is
//! reported `Removed` so the policy engine can re-submit.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connector::ConnectorApi;
use crate::models::{BlockInfo, TransactionReceipt};

/// Capacity of the connector-to-tracker block buffer
const BLOCK_BUFFER_CAPACITY: usize = 64;

/// Receipt-less blocks tolerated before a tracked hash is declared reorged
const REORG_REMOVAL_CYCLES: u32 = 3;

/// Terminal signals for one registration, delivered in order on its channel
#[derive(Debug, Clone)]
pub enum TrackedEvent {
    Confirmed {
        receipt: TransactionReceipt,
        confirmations: Vec<BlockInfo>,
    },
    Removed {
        reason: String,
    },
}

enum TrackerCommand {
    Register {
        tx_id: String,
        tx_hash: String,
        events: mpsc::Sender<TrackedEvent>,
    },
    Deregister {
        tx_id: String,
    },
}

struct Registration {
    tx_hash: String,
    events: mpsc::Sender<TrackedEvent>,
    receipt: Option<TransactionReceipt>,
    window: Vec<BlockInfo>,
    empty_cycles: u32,
}

/// Handle to the tracker task
pub struct ConfirmationManager {
    commands: mpsc::Sender<TrackerCommand>,
}

impl ConfirmationManager {
    /// Spawn the tracker. Returns the handle, the block sender to hand to the
    /// connector, and the task join handle for shutdown.
    pub fn start(
        connector: Arc<dyn ConnectorApi>,
        required_confirmations: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<BlockInfo>, JoinHandle<()>) {
        let (block_tx, block_rx) = mpsc::channel(BLOCK_BUFFER_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(run(
            connector,
            required_confirmations.max(1),
            cancel,
            block_rx,
            cmd_rx,
        ));
        (Self { commands: cmd_tx }, block_tx, task)
    }

    /// Track `tx_hash` for `tx_id`, replacing any prior registration for the
    /// same id. Signals arrive on the returned channel.
    pub async fn register(&self, tx_id: String, tx_hash: String) -> mpsc::Receiver<TrackedEvent> {
        let (events, rx) = mpsc::channel(4);
        let _ = self
            .commands
            .send(TrackerCommand::Register {
                tx_id,
                tx_hash,
                events,
            })
            .await;
        rx
    }

    pub async fn deregister(&self, tx_id: &str) {
        let _ = self
            .commands
            .send(TrackerCommand::Deregister {
                tx_id: tx_id.to_string(),
            })
            .await;
    }
}

async fn run(
    connector: Arc<dyn ConnectorApi>,
    required: usize,
    cancel: CancellationToken,
    mut block_rx: mpsc::Receiver<BlockInfo>,
    mut cmd_rx: mpsc::Receiver<TrackerCommand>,
) {
    log::info!("[CONFIRM] Confirmation tracker started (required depth {})", required);
    let mut registrations: HashMap<String, Registration> = HashMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(cmd) = cmd_rx.recv() => match cmd {
                TrackerCommand::Register { tx_id, tx_hash, events } => {
                    log::debug!("[CONFIRM] Tracking {} for transaction {}", tx_hash, tx_id);
                    registrations.insert(tx_id, Registration {
                        tx_hash,
                        events,
                        receipt: None,
                        window: Vec::new(),
                        empty_cycles: 0,
                    });
                }
                TrackerCommand::Deregister { tx_id } => {
                    if registrations.remove(&tx_id).is_some() {
                        log::debug!("[CONFIRM] Stopped tracking transaction {}", tx_id);
                    }
                }
            },
            Some(block) = block_rx.recv() => {
                process_block(connector.as_ref(), required, &mut registrations, &block).await;
            }
            else => break,
        }
    }
    log::info!("[CONFIRM] Confirmation tracker exited");
}

async fn process_block(
    connector: &dyn ConnectorApi,
    required: usize,
    registrations: &mut HashMap<String, Registration>,
    block: &BlockInfo,
) {
    log::debug!(
        "[CONFIRM] New block {} ({}) against {} registrations",
        block.block_number,
        block.block_hash,
        registrations.len()
    );
    let mut finished = Vec::new();
    for (tx_id, reg) in registrations.iter_mut() {
        match connector.get_receipt(&reg.tx_hash).await {
            Ok(receipt) => {
                reg.empty_cycles = 0;
                let moved = reg
                    .receipt
                    .as_ref()
                    .map(|prev| prev.block_hash != receipt.block_hash)
                    .unwrap_or(true);
                if moved || reg.window.is_empty() {
                    // first sighting, or the receipt moved in a reorg:
                    // rebuild the window from the mined block
                    reg.window = vec![BlockInfo {
                        block_number: receipt.block_number,
                        block_hash: receipt.block_hash.clone(),
                        parent_hash: String::new(),
                    }];
                    reg.receipt = Some(receipt);
                    if block.block_number > reg.window[0].block_number {
                        reg.window.push(block.clone());
                    }
                } else {
                    let last = &reg.window[reg.window.len() - 1];
                    let forked = block.block_number == last.block_number + 1
                        && !block.parent_hash.is_empty()
                        && !last.block_hash.is_empty()
                        && block.parent_hash != last.block_hash;
                    if forked {
                        log::info!(
                            "[CONFIRM] Fork at block {} while tracking {}; window reset",
                            block.block_number,
                            reg.tx_hash
                        );
                        let mined = reg.window[0].clone();
                        reg.window = vec![mined];
                    } else if block.block_number > last.block_number {
                        reg.window.push(block.clone());
                    }
                }
                if reg.window.len() >= required {
                    if let Some(receipt) = reg.receipt.clone() {
                        log::info!(
                            "[CONFIRM] Transaction {} confirmed at depth {}",
                            tx_id,
                            reg.window.len()
                        );
                        let _ = reg
                            .events
                            .send(TrackedEvent::Confirmed {
                                receipt,
                                confirmations: reg.window.clone(),
                            })
                            .await;
                        finished.push(tx_id.clone());
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                if !reg.window.is_empty() {
                    log::info!(
                        "[CONFIRM] Receipt for {} disappeared at block {}; window reset",
                        reg.tx_hash,
                        block.block_number
                    );
                    reg.window.clear();
                    reg.receipt = None;
                }
                reg.empty_cycles += 1;
                if reg.empty_cycles >= REORG_REMOVAL_CYCLES {
                    log::warn!(
                        "[CONFIRM] Transaction {} removed after {} receipt-less blocks (reorged)",
                        tx_id,
                        reg.empty_cycles
                    );
                    let _ = reg
                        .events
                        .send(TrackedEvent::Removed {
                            reason: "reorged".to_string(),
                        })
                        .await;
                    finished.push(tx_id.clone());
                }
            }
            Err(e) => {
                // transient connector failure: leave the window as-is and
                // try again on the next block
                log::warn!(
                    "[CONFIRM] Receipt query failed for {}: {} ({})",
                    reg.tx_hash,
                    e,
                    e.reason
                );
            }
        }
    }
    for tx_id in finished {
        registrations.remove(&tx_id);
    }
}
