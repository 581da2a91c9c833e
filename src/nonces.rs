//! Per-signer nonce allocation
//!
//! Assignments for one signer are fully serialised through a per-signer async
//! mutex; distinct signers proceed in parallel. A short-lived cache window
//! avoids a connector round trip per submission under burst load — safe
//! because the slot is held exclusively from assignment until the caller
//! either commits the nonce (successful persist) or drops the lease.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::connector::{ConnectorApi, ConnectorError};
use crate::persistence::{Persistence, StoreError};

#[derive(Debug, Error)]
pub enum NonceError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct NonceCache {
    next_nonce: u64,
    cached_at: Option<Instant>,
}

/// An exclusively-held nonce for one signer. The cache only advances when the
/// caller invokes [`NonceLease::complete`]; dropping the lease releases the
/// slot without incrementing, so a failed persist never burns a nonce.
pub struct NonceLease {
    pub nonce: u64,
    guard: OwnedMutexGuard<NonceCache>,
}

impl NonceLease {
    pub fn complete(mut self) {
        self.guard.next_nonce = self.nonce + 1;
        self.guard.cached_at = Some(Instant::now());
    }
}

pub struct NonceAllocator {
    slots: DashMap<String, Arc<Mutex<NonceCache>>>,
    state_timeout: Duration,
}

impl NonceAllocator {
    pub fn new(state_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            state_timeout,
        }
    }

    /// Assign the next nonce for `signer`, holding the signer's slot until
    /// the returned lease is completed or dropped.
    pub async fn assign(
        &self,
        signer: &str,
        connector: &dyn ConnectorApi,
        persistence: &dyn Persistence,
    ) -> Result<NonceLease, NonceError> {
        self.sweep();

        let slot = self
            .slots
            .entry(signer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NonceCache::default())))
            .value()
            .clone();

        let guard = slot.lock_owned().await;

        let fresh = guard
            .cached_at
            .map(|t| t.elapsed() < self.state_timeout)
            .unwrap_or(false);
        let nonce = if fresh {
            log::debug!("[NONCE] Cached nonce {} for signer {}", guard.next_nonce, signer);
            guard.next_nonce
        } else {
            let on_chain = connector.next_nonce_for_signer(signer).await?;
            let persisted = persistence.highest_nonce_for_signer(signer)?;
            let next = match persisted {
                Some(highest) => on_chain.max(highest + 1),
                None => on_chain,
            };
            log::debug!(
                "[NONCE] Resolved nonce {} for signer {} (chain {}, persisted {:?})",
                next,
                signer,
                on_chain,
                persisted
            );
            next
        };

        Ok(NonceLease { nonce, guard })
    }

    /// Drop idle slots whose cache has been stale for two full windows.
    /// Busy slots (lock held or waited on) are always kept.
    fn sweep(&self) {
        let horizon = self.state_timeout * 2;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(cache) => cache
                .cached_at
                .map(|t| t.elapsed() < horizon)
                .unwrap_or(false),
            Err(_) => true,
        });
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
