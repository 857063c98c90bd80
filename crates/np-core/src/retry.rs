//! Bounded retry with exponential backoff.
//!
//! Applied to substrate-level transient failures only; protocol errors
//! (auth, remote nack, timeout) are never retried here.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Attempts per operation, including the first.
pub const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Backoff ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Run `op` up to [`MAX_ATTEMPTS`] times, sleeping between attempts.
///
/// Delay doubles each round starting from [`BACKOFF_BASE`], capped at
/// [`BACKOFF_CAP`]. The final error is returned unchanged.
pub async fn with_backoff<T, E, F, Fut>(label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                debug!(error = %e, attempt, ?delay, "{label}: transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(1u32 << (attempt - 1).min(16))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP)
}
