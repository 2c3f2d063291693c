//! Bounded retry around storage writes.

use crate::config::RetryPolicy;
use crate::error::{Result, RollcallError, StorageError};

/// Run `f` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted. Backs off exponentially between attempts.
pub fn with_retry<T, F>(policy: &RetryPolicy, op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> std::result::Result<T, StorageError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                attempt += 1;
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    op,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient storage failure; retrying"
                );
                std::thread::sleep(backoff);
            }
            Err(e) => {
                tracing::error!(op, attempt, error = %e, "storage operation failed");
                return Err(RollcallError::Persistence { op, source: e });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, base_backoff_ms: 0 }
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let out = with_retry(&fast(3), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StorageError::Transient("busy".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let out: Result<()> = with_retry(&fast(2), "test", || {
            calls.set(calls.get() + 1);
            Err(StorageError::Transient("busy".into()))
        });
        assert!(matches!(out, Err(RollcallError::Persistence { op: "test", .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_fatal_error_not_retried() {
        let calls = Cell::new(0);
        let out: Result<()> = with_retry(&fast(5), "test", || {
            calls.set(calls.get() + 1);
            Err(StorageError::Corrupt("bad row".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls.get(), 1);
    }
}
