//! Bounded linear-backoff retry shared by the portal-facing call sites.

use std::future::Future;
use std::time::Duration;

/// Classification an operation assigns its own failure. Transient failures
/// are retried; permanent ones abort the loop on the spot.
#[derive(Debug)]
pub enum RetryError<E> {
    Transient(E),
    Permanent(E),
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The operation reported a permanent failure; no further attempts ran.
    Aborted(E),
    /// Every attempt failed. Carries the attempt count and the last error.
    Exhausted { attempts: u32, last: E },
}

/// Runs `op` up to `attempts` times with linear backoff: the first attempt
/// starts immediately, and after the n-th transient failure the loop sleeps
/// `n * unit` before trying again.
pub async fn retry<T, E, F, Fut>(
    attempts: u32,
    unit: Duration,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError<E>>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::Permanent(err)) => return Err(RetryFailure::Aborted(err)),
            Err(RetryError::Transient(err)) => {
                if attempt >= attempts {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                tokio::time::sleep(unit * attempt).await;
            }
        }
    }
}
