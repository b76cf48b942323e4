//! Retry-with-backoff executor for fallible external invocations.
//!
//! Every agent run goes through [`retry`]: failed attempts are retried after an
//! exponentially growing, capped delay, and an optional exhaustion hook may
//! substitute a recovery value once all attempts are spent.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Hook invoked after the backoff wait, right before the next attempt.
pub type OnRetry<E> = Box<dyn Fn(u32, &E) + Send + Sync>;

/// Hook invoked once after the final attempt fails; `Some` recovers the session.
pub type OnExhausted<T, E> = Box<dyn Fn(&E) -> BoxFuture<'static, Option<T>> + Send + Sync>;

/// Options for one retry session.
pub struct RetryOptions<T, E> {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub on_retry: Option<OnRetry<E>>,
    pub on_exhausted: Option<OnExhausted<T, E>>,
}

impl<T, E> RetryOptions<T, E> {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            on_retry: None,
            on_exhausted: None,
        }
    }

    /// Set the backoff parameters.
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the hook called once the backoff wait is over.
    pub fn on_retry(mut self, hook: impl Fn(u32, &E) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    /// Set the hook called when all attempts are exhausted.
    pub fn on_exhausted(
        mut self,
        hook: impl Fn(&E) -> BoxFuture<'static, Option<T>> + Send + Sync + 'static,
    ) -> Self {
        self.on_exhausted = Some(Box::new(hook));
        self
    }
}

/// Terminal record of one retry session.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// Final value, either from a successful attempt or from recovery
    pub value: Option<T>,
    /// Last error when the session failed without recovery
    pub error: Option<E>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Whether the value came from the exhaustion hook
    pub recovered: bool,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Convert into a plain `Result`, dropping the attempt metadata.
    pub fn into_result(self) -> Result<T, E> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => unreachable!("retry session finished with neither value nor error"),
        }
    }
}

/// Backoff before the retry that follows failed attempt `attempt` (1-based).
///
/// Formula: base * 2^(attempt-1), capped at max.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(multiplier).min(max)
}

/// Run `operation` until it succeeds or `options.max_attempts` is reached.
pub async fn retry<T, E, F, Fut>(mut operation: F, options: RetryOptions<T, E>) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    value: Some(value),
                    error: None,
                    attempts: attempt,
                    recovered: false,
                };
            }
            Err(error) => error,
        };

        if attempt < max_attempts {
            tokio::time::sleep(calculate_backoff(attempt, options.base_delay, options.max_delay))
                .await;
            if let Some(hook) = &options.on_retry {
                hook(attempt, &error);
            }
            continue;
        }

        if let Some(hook) = &options.on_exhausted
            && let Some(value) = hook(&error).await
        {
            return RetryResult {
                value: Some(value),
                error: None,
                attempts: attempt,
                recovered: true,
            };
        }

        return RetryResult {
            value: None,
            error: Some(error),
            attempts: attempt,
            recovered: false,
        };
    }
}

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Retry settings as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Build session options with no hooks attached.
    pub fn to_options<T, E>(&self) -> RetryOptions<T, E> {
        RetryOptions::new(self.max_attempts).with_backoff(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast<T, E>(attempts: u32) -> RetryOptions<T, E> {
        RetryOptions::new(attempts).with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);
        assert_eq!(calculate_backoff(1, base, max), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_secs(60));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_secs(120));
        assert_eq!(calculate_backoff(4, base, max), Duration::from_secs(240));
        assert_eq!(calculate_backoff(5, base, max), Duration::from_secs(300));
        assert_eq!(calculate_backoff(60, base, max), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_always_failing_invokes_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: RetryResult<(), String> = retry(
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                }
            },
            fast(4),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.attempts, 4);
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_recovery_value_turns_exhaustion_into_success() {
        let options = fast::<String, String>(3)
            .on_exhausted(|err: &String| {
                let recovered = format!("partial after {err}");
                async move { Some(recovered) }.boxed()
            });

        let result = retry(|_| async { Err::<String, _>("timeout".to_string()) }, options).await;

        assert!(result.is_success());
        assert!(result.recovered);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.value.as_deref(), Some("partial after timeout"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_exhaustion_hook_returning_none_propagates_error() {
        let options = fast::<u32, String>(2).on_exhausted(|_| async { None }.boxed());
        let result = retry(|_| async { Err::<u32, _>("nope".to_string()) }, options).await;
        assert_eq!(result.into_result(), Err("nope".to_string()));
    }

    #[tokio::test]
    async fn test_on_retry_fires_after_backoff() {
        let started = std::time::Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = RetryOptions::<u32, String>::new(2)
            .with_backoff(Duration::from_millis(80), Duration::from_millis(80))
            .on_retry(move |_, _| {
                sink.lock().unwrap().push(started.elapsed());
            });

        let result = retry(
            |attempt| async move {
                if attempt == 1 {
                    Err("first".to_string())
                } else {
                    Ok(attempt)
                }
            },
            options,
        )
        .await;

        assert_eq!(result.value, Some(2));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0] >= Duration::from_millis(80), "hook ran after {:?}", seen[0]);
    }

    #[tokio::test]
    async fn test_on_retry_sees_each_failed_attempt_but_not_the_last() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = fast::<u32, String>(3).on_retry(move |attempt, err: &String| {
            sink.lock().unwrap().push((attempt, err.clone()));
        });

        let result = retry(
            |attempt| async move {
                if attempt < 3 {
                    Err(format!("fail {attempt}"))
                } else {
                    Ok(attempt)
                }
            },
            options,
        )
        .await;

        assert_eq!(result.value, Some(3));
        assert_eq!(result.attempts, 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "fail 1".to_string()), (2, "fail 2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_zero_attempts_is_clamped_to_one() {
        let options = RetryOptions::<u32, String>::new(0);
        let result = retry(|_| async { Ok::<_, String>(7) }, options).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.value, Some(7));
    }

    #[test]
    fn test_policy_defaults_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }
}
