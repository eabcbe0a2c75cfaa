use crate::error::AppError;

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Two retries: half a second, then two seconds.
pub const DEFAULT_BACKOFF: &[Duration] =
    &[Duration::from_millis(500), Duration::from_millis(2_000)];

/// Run `op`, retrying once per entry of `schedule` while `retryable` accepts the error.  The
/// final error is returned unchanged.
pub async fn with_retry<T, F, Fut>(
    op_name: &str,
    schedule: &[Duration],
    retryable: fn(&AppError) -> bool,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut delays = schedule.iter();
    loop {
        match op().await {
            Ok(v) => break Ok(v),
            Err(e) if retryable(&e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        op = op_name,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    sleep(*delay).await;
                }
                None => break Err(e),
            },
            Err(e) => break Err(e),
        }
    }
}
