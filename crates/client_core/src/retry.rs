use std::{fmt, future::Future, sync::Arc, time::Duration};

use shared::error::SyncError;
use tracing::{debug, warn};

pub const MESSAGE_SEND_MAX_RETRIES: u32 = 3;
pub const MESSAGE_SEND_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
pub const FILE_UPLOAD_MAX_RETRIES: u32 = 3;
pub const FILE_UPLOAD_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

type ShouldRetry<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

pub struct RetryPolicy<E> {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
    should_retry: ShouldRetry<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            delays: self.delays.clone(),
            should_retry: Arc::clone(&self.should_retry),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}

impl<E> RetryPolicy<E> {
    pub fn new(
        max_retries: u32,
        delays: Vec<Duration>,
        should_retry: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_retries,
            delays,
            should_retry: Arc::new(should_retry),
        }
    }

    pub fn from_millis(
        max_retries: u32,
        delays_ms: &[u64],
        should_retry: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            max_retries,
            delays_ms.iter().copied().map(Duration::from_millis).collect(),
            should_retry,
        )
    }

    /// Same schedule, different retry predicate.
    pub fn with_should_retry(
        &self,
        should_retry: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_retries: self.max_retries,
            delays: self.delays.clone(),
            should_retry: Arc::new(should_retry),
        }
    }

    pub fn should_retry(&self, err: &E) -> bool {
        (self.should_retry)(err)
    }

    /// Delay before retry number `retry_index` (zero-based). Indices past the
    /// end of the schedule reuse its last entry.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.delays
            .get(retry_index as usize)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

impl RetryPolicy<SyncError> {
    pub fn message_send() -> Self {
        Self::from_millis(
            MESSAGE_SEND_MAX_RETRIES,
            &MESSAGE_SEND_DELAYS_MS,
            SyncError::is_retryable,
        )
    }

    pub fn file_upload() -> Self {
        Self::from_millis(
            FILE_UPLOAD_MAX_RETRIES,
            &FILE_UPLOAD_DELAYS_MS,
            SyncError::is_retryable,
        )
    }
}

/// Bookkeeping for one retrying operation; dropped when it settles.
#[derive(Debug)]
pub struct RetryAttempt<E> {
    pub attempt_number: u32,
    pub delays: Vec<Duration>,
    pub last_error: Option<E>,
}

/// Runs `operation` until it succeeds, fails with an error the policy will not
/// retry, or has been retried `max_retries` times.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy<E>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = RetryAttempt {
        attempt_number: 0,
        delays: Vec::new(),
        last_error: None,
    };

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            debug!(error = %err, "retry: error is not retryable");
            return Err(err);
        }
        if attempt.attempt_number >= policy.max_retries {
            warn!(
                attempts = attempt.attempt_number + 1,
                error = %err,
                "retry: attempts exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay_for(attempt.attempt_number);
        attempt.attempt_number += 1;
        attempt.delays.push(delay);
        debug!(
            retry = attempt.attempt_number,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retry: scheduling retry"
        );
        attempt.last_error = Some(err);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
