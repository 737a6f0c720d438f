//! Bounded retry with exponential backoff for in-handler dispatch.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

/// Run `op` up to `max_retries` times, sleeping `delay * backoff^attempt`
/// between attempts. Returns the last error when every attempt fails.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    max_retries: u32,
    delay: Duration,
    backoff: f64,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < max_retries {
                    let wait = delay.mul_f64(backoff.powi(attempt as i32));
                    tracing::warn!(
                        "attempt {} failed: {e}; retrying in {wait:?}",
                        attempt + 1
                    );
                    last_error = Some(e);
                    sleep(wait).await;
                } else {
                    tracing::error!("all {max_retries} attempts failed: {e}");
                    last_error = Some(e);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retry failed without an error")))
}
