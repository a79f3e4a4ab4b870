//! Top-level retry policy.
//!
//! Wraps a fallible async operation with a fixed-backoff retry loop:
//! warnings on every failure, an alert every Nth consecutive failure, a
//! recovery notification once a previously-failing operation succeeds, and
//! a fatal error once the attempt budget is exhausted. Fatal errors
//! (configuration problems) abort immediately without retrying.

use std::future::Future;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::emit;
use crate::error::SyncError;
use crate::metrics::events::LoadAttemptFailed;
use crate::notify::Notifier;

/// Run `op` under the retry policy, returning its first success.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryConfig,
    notifier: &dyn Notifier,
    what: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let escalate_every = policy.escalate_every.max(1);
    let mut failures: u32 = 0;
    let mut last_error: Option<SyncError> = None;

    for attempt in 1..=max_attempts {
        match op().await {
            Ok(value) => {
                if failures > 0 {
                    notifier
                        .recovered(
                            what,
                            &format!("succeeded after {failures} failed attempts"),
                        )
                        .await;
                }
                return Ok(value);
            }
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                failures += 1;
                warn!("{what}: attempt {attempt}/{max_attempts} failed: {error}");
                emit!(LoadAttemptFailed);

                if failures % escalate_every == 0 {
                    notifier
                        .alert(
                            what,
                            &format!("{failures} consecutive failures, last: {error}"),
                        )
                        .await;
                }

                last_error = Some(error);
                if attempt < max_attempts {
                    sleep(policy.backoff()).await;
                }
            }
        }
    }

    Err(SyncError::RetriesExhausted {
        attempts: max_attempts,
        source: Box::new(last_error.expect("exhaustion implies at least one failure")),
    })
}
