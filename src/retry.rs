use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{classify, RawError};
use crate::AppError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential: bool,
    /// Adds up to 10% random jitter on top of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential: true,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential {
            backoff_delay(self.base_delay, attempt, self.max_delay)
        } else {
            self.base_delay.min(self.max_delay)
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 10;
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// `base * 2^(attempt-1)`, capped at `max`.
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Scales `delay` by a random factor in `[0.5, 1.5]`.
pub fn with_jitter_factor(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.5))
}

/// Retries `operation` while the classified error says it is retryable.
pub async fn retry<T, F, Fut, R>(operation: F, policy: &RetryPolicy, on_retry: R) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    R: FnMut(u32, &AppError),
{
    retry_if(operation, policy, |err: &AppError| err.retryable, on_retry).await
}

/// Re-invokes `operation` up to `policy.max_attempts` times. Stops early when
/// `should_retry` rejects the error. `on_retry(attempt, err)` runs before each
/// wait. The last error is returned once the budget is spent.
pub async fn retry_if<T, E, F, Fut, P, R>(
    mut operation: F,
    policy: &RetryPolicy,
    mut should_retry: P,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    R: FnMut(u32, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                on_retry(attempt, &err);
                let delay = policy.next_delay(attempt);
                debug!(attempt, ?delay, "retrying after failure");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`retry_if`] that also watches `cancel`: before each attempt, while it is
/// in flight and during the wait. A cancelled run ends with a cancelled
/// error and is never retried.
pub async fn retry_cancellable<T, F, Fut, P, R>(
    mut operation: F,
    policy: &RetryPolicy,
    mut should_retry: P,
    mut on_retry: R,
    cancel: &CancellationToken,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
    P: FnMut(&AppError) -> bool,
    R: FnMut(u32, &AppError),
{
    let cancelled = |attempt: u32| {
        debug!(attempt, "retry loop cancelled");
        classify(&RawError::cancelled(format!("cancelled at attempt {attempt}")), None)
    };
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(attempt));
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(attempt)),
            outcome = operation() => outcome,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= max_attempts || err.is_cancelled() || !should_retry(&err) {
            return Err(err);
        }
        on_retry(attempt, &err);
        let delay = policy.next_delay(attempt);
        debug!(attempt, ?delay, "retrying after failure");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(attempt)),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{classify, RawError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error(n: u32) -> AppError {
        classify(&RawError::new(format!("failure {n}")).with_status(503), None)
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let mut retries = Vec::new();
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: Result<(), AppError> = retry(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(server_error(n))
            },
            &policy,
            |attempt, _| retries.push(attempt),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, vec![1, 2]);
        assert_eq!(result.unwrap_err().details.cause, "failure 3");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let result: Result<(), AppError> = retry(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(classify(&RawError::new("denied").with_status(401), None))
            },
            &policy,
            |_, _| {},
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!result.unwrap_err().retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failure() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result = retry(
            move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(server_error(1)),
                    _ => Ok("done"),
                }
            },
            &policy,
            |_, _| {},
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_controls_retries() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(5));

        let result: Result<(), &str> = retry_if(
            move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("transient"),
                    _ => Err("fatal"),
                }
            },
            &policy,
            |err| *err == "transient",
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_the_loop() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result: Result<(), AppError> = retry_cancellable(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(server_error(1))
            },
            &policy,
            |err| err.retryable,
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_an_attempt_in_flight() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: Result<(), AppError> = retry_cancellable(
            || async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            &policy,
            |err| err.retryable,
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_never_calls() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), AppError> = retry_cancellable(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &RetryPolicy::default(),
            |err| err.retryable,
            |_, _| {},
            &cancel,
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 1, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 4, max), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 5, max), max);
        assert_eq!(backoff_delay(base, 60, max), max);

        let flat = RetryPolicy {
            exponential: false,
            ..RetryPolicy::new(3, base)
        };
        assert_eq!(flat.delay_for(4), base);
    }

    #[test]
    fn jitter_factor_stays_in_band() {
        let delay = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = with_jitter_factor(delay);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= Duration::from_millis(1500));
        }
    }
}
