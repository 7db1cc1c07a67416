//! Jittered capped exponential backoff for transient storage failures
//! (§4.1, §7, §9: "retries transient deadlocks with capped exponential
//! backoff and jitter"). Used by every `ObjectStore` write path that can
//! race another phase worker over the same rows.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::StorageError;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 2_000;

fn backoff_delay(attempt: u32) -> Duration {
    let capped_exp = BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10)).min(MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0..=capped_exp / 2);
    Duration::from_millis(capped_exp / 2 + jitter)
}

/// Retries `op` up to [`MAX_ATTEMPTS`] times while it fails with
/// [`StorageError::Transient`]. Any other error, or exhaustion of the
/// attempt budget, is returned immediately.
pub async fn retry_transient<F, Fut, T>(mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StorageError::Transient(msg)) if attempt + 1 < MAX_ATTEMPTS => {
                attempt += 1;
                log::warn!("transient storage error (attempt {attempt}/{MAX_ATTEMPTS}): {msg}");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, StorageError> = retry_transient(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StorageError::Transient("deadlock".into()))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = retry_transient(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Transient("deadlock".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), StorageError> = retry_transient(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Constraint("duplicate key".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
