//! Shared test fixtures: a programmable mock connector and builders

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connector::{
    ConnectorApi, ConnectorError, ConnectorResult, NewBlockListenerRequest,
    NewBlockListenerResponse, TransactionSendRequest, TransactionSendResponse,
};
use crate::models::{BlockInfo, ManagedTransaction, TransactionReceipt, TxStatus};
use crate::retry::RetryPolicy;

pub(crate) fn make_tx(id: &str, signer: &str, nonce: u64) -> ManagedTransaction {
    let now = Utc::now();
    ManagedTransaction {
        id: id.to_string(),
        sequence_id: None,
        signer: signer.to_string(),
        nonce,
        status: TxStatus::Pending,
        created_at: now,
        updated_at: now,
        transaction_data: "0xaa".to_string(),
        transaction_hash: None,
        gas_price: None,
        first_submit: None,
        last_submit: None,
        receipt: None,
        confirmations: Vec::new(),
        error_history: Vec::new(),
        policy_state: None,
    }
}

pub(crate) fn receipt_at(block_number: u64, block_hash: &str) -> TransactionReceipt {
    TransactionReceipt {
        block_number,
        block_hash: block_hash.to_string(),
        transaction_index: 0,
        success: true,
        extra_info: None,
    }
}

pub(crate) fn block(n: u64) -> BlockInfo {
    BlockInfo {
        block_number: n,
        block_hash: format!("0xb{}", n),
        parent_hash: format!("0xb{}", n.saturating_sub(1)),
    }
}

/// A fast-cycling config over an in-memory store, for pipeline tests
pub(crate) fn test_config() -> Config {
    Config {
        persistence_path: ":memory:".to_string(),
        policy_loop_interval: Duration::from_millis(20),
        retry: RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            factor: 2.0,
        },
        confirmations_required: 3,
        ..Config::default()
    }
}

/// Poll until `check` passes or the timeout elapses
pub(crate) async fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Programmable in-memory connector
pub(crate) struct MockConnector {
    next_nonces: Mutex<HashMap<String, u64>>,
    nonce_queries: AtomicU64,
    send_errors: Mutex<VecDeque<ConnectorError>>,
    receipts: Mutex<HashMap<String, TransactionReceipt>>,
    sent: Mutex<Vec<TransactionSendRequest>>,
    block_listener: Mutex<Option<mpsc::Sender<BlockInfo>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            next_nonces: Mutex::new(HashMap::new()),
            nonce_queries: AtomicU64::new(0),
            send_errors: Mutex::new(VecDeque::new()),
            receipts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            block_listener: Mutex::new(None),
        }
    }

    pub fn set_next_nonce(&self, signer: &str, nonce: u64) {
        self.next_nonces.lock().insert(signer.to_string(), nonce);
    }

    pub fn nonce_queries(&self) -> u64 {
        self.nonce_queries.load(Ordering::SeqCst)
    }

    /// Queue an error to be returned (once) ahead of successful sends
    pub fn push_send_error(&self, e: ConnectorError) {
        self.send_errors.lock().push_back(e);
    }

    pub fn set_receipt(&self, tx_hash: &str, receipt: TransactionReceipt) {
        self.receipts.lock().insert(tx_hash.to_string(), receipt);
    }

    pub fn remove_receipt(&self, tx_hash: &str) {
        self.receipts.lock().remove(tx_hash);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_requests(&self) -> Vec<TransactionSendRequest> {
        self.sent.lock().clone()
    }

    /// Hash assigned to the n-th successful send (1-based)
    pub fn hash_of_send(n: usize) -> String {
        format!("0xhash{}", n)
    }

    /// Push a block notification through the captured listener channel
    pub async fn send_block(&self, block: BlockInfo) {
        let listener = self.block_listener.lock().clone();
        let listener = listener.expect("no block listener registered");
        listener.send(block).await.expect("block channel closed");
    }
}

#[async_trait]
impl ConnectorApi for MockConnector {
    async fn new_block_listener(
        &self,
        req: NewBlockListenerRequest,
    ) -> ConnectorResult<NewBlockListenerResponse> {
        *self.block_listener.lock() = Some(req.listener);
        Ok(NewBlockListenerResponse { initial_block: 100 })
    }

    async fn transaction_send(
        &self,
        req: TransactionSendRequest,
    ) -> ConnectorResult<TransactionSendResponse> {
        if let Some(e) = self.send_errors.lock().pop_front() {
            return Err(e);
        }
        let mut sent = self.sent.lock();
        sent.push(req);
        Ok(TransactionSendResponse {
            transaction_hash: Self::hash_of_send(sent.len()),
        })
    }

    async fn get_receipt(&self, tx_hash: &str) -> ConnectorResult<TransactionReceipt> {
        self.receipts
            .lock()
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| ConnectorError::not_found(format!("no receipt for {}", tx_hash)))
    }

    async fn next_nonce_for_signer(&self, signer: &str) -> ConnectorResult<u64> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_nonces.lock().get(signer).copied().unwrap_or(0))
    }
}
