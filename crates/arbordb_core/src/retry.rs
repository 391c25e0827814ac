//! Bounded retry with linear backoff.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::error::StoreResult;

/// Runs `op` up to `attempts` times, sleeping `n * 10ms` after the n-th
/// failure. Renames contend briefly with watchers and scanners holding
/// handles; everything else in the store calls its operation once.
pub(crate) async fn retry<T, Fut, F>(attempts: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut failed = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failed += 1;
                if failed >= attempts {
                    return Err(err);
                }
                trace!(
                    target: "arbordb::persist",
                    attempt = failed,
                    error = %err,
                    "retrying operation"
                );
                tokio::time::sleep(Duration::from_millis(u64::from(failed) * 10)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::StoreError;

    use super::*;

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let result = retry(10, move || {
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::invalid_operation("not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_when_attempts_run_out() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let result: StoreResult<()> = retry(3, move || {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::invalid_operation("always"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
