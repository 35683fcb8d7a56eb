//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

/// Longest wait between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at [`MAX_BACKOFF`], plus up to 25% jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(factor).min(MAX_BACKOFF);
    let jitter_ms = (delay.as_millis() / 4) as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

/// Run `op` up to `attempts` times, sleeping with backoff between failures.
///
/// `op` receives the 1-based attempt number. The last error is returned when
/// every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
