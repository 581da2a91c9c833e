//! Bounded exponential backoff for in-cycle persistence calls

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, backing off between attempts.
    /// Returns `None` as soon as the token is cancelled.
    pub async fn run<T, E, F>(&self, cancel: &CancellationToken, tag: &str, mut op: F) -> Option<T>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match op() {
                Ok(v) => return Some(v),
                Err(e) => {
                    attempt += 1;
                    log::warn!("[RETRY] {} failed (attempt {}): {}", tag, attempt, e);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            factor: 2.0,
        };
        let cancel = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = policy
            .run(&cancel, "test op", || {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<u32> = policy
            .run(&cancel, "cancelled op", || Err("always"))
            .await;
        assert_eq!(result, None);
    }
}
