//! Transient-error classification and backoff for provider calls.
//!
//! Every provider round-trip in this crate goes through [`with_retries`]:
//! transient failures (connection resets, timeouts, 5xx) and rate limits are
//! retried with exponential backoff, everything else propagates immediately.
//! Rate limits use a longer backoff base than other transients because the
//! provider's throttling windows are measured in tens of seconds.

use std::error::Error;
use std::future::Future;
use std::time::Duration;

/// Outcome of classifying an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider throttling (HTTP 429, "rate limit", "throttling", …).
    RateLimit,
    /// Other transient failures: timeouts, resets, 5xx.
    Transient,
    /// Everything else; never retried.
    Permanent,
}

/// Substrings that indicate provider throttling.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "throttling",
    "ratequota",
];

/// Substrings that indicate other transient failures.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "reset",
    "network",
    "broken pipe",
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "internalerror",
    "service unavailable",
    "serviceunavailable",
    "bad gateway",
];

/// Classify an error by its rendered message.
///
/// Classification is textual on purpose: the engine sees errors from
/// `reqwest`, from provider JSON bodies, and from tool handlers, and the
/// only shared surface is the message.
pub fn classify(error: &(dyn Error + 'static)) -> ErrorClass {
    classify_message(&error.to_string())
}

/// Classify a rendered error message. See [`classify`].
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    for pattern in RATE_LIMIT_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClass::RateLimit;
        }
    }
    for pattern in TRANSIENT_PATTERNS {
        if lower.contains(pattern) {
            return ErrorClass::Transient;
        }
    }
    ErrorClass::Permanent
}

/// Backoff delay before retry number `attempt` (0-based).
///
/// Rate limits: 5 s doubling, capped at 60 s. Other transients: 2 s
/// doubling, capped at 16 s.
pub fn backoff_delay(class: ErrorClass, attempt: u32) -> Duration {
    let (base_secs, cap_secs) = match class {
        ErrorClass::RateLimit => (5u64, 60u64),
        _ => (2u64, 16u64),
    };
    let factor = 1u64 << attempt.min(10);
    Duration::from_secs((base_secs.saturating_mul(factor)).min(cap_secs))
}

/// Run `op` with transparent retry of transient failures.
///
/// `attempts` is the total number of tries (minimum 1). The operation
/// receives the 0-based attempt index so callers can log it. The last error
/// is returned once the budget is exhausted or a permanent error is seen.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    mut op: F,
) -> Result<T, Box<dyn Error + Send + Sync>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Box<dyn Error + Send + Sync>>>,
{
    let attempts = attempts.max(1);
    let mut last_error: Option<Box<dyn Error + Send + Sync>> = None;

    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify_message(&err.to_string());
                if class == ErrorClass::Permanent {
                    return Err(err);
                }
                if attempt + 1 < attempts {
                    let delay = backoff_delay(class, attempt);
                    log::warn!(
                        "transient provider failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| "retry budget exhausted with no recorded error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classification_buckets() {
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify_message("Throttling.RateQuota exceeded"), ErrorClass::RateLimit);
        assert_eq!(classify_message("connection reset by peer"), ErrorClass::Transient);
        assert_eq!(classify_message("operation timed out"), ErrorClass::Transient);
        assert_eq!(classify_message("HTTP 503 Service Unavailable"), ErrorClass::Transient);
        assert_eq!(classify_message("invalid api key"), ErrorClass::Permanent);
        assert_eq!(classify_message("model not found"), ErrorClass::Permanent);
    }

    #[test]
    fn backoff_respects_caps() {
        assert_eq!(backoff_delay(ErrorClass::Transient, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(ErrorClass::Transient, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(ErrorClass::Transient, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(ErrorClass::RateLimit, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(ErrorClass::RateLimit, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(ErrorClass::RateLimit, 6), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        tokio::time::pause();
        let calls = AtomicU32::new(0);
        let fut = with_retries(5, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err::<u32, _>("connection reset".into())
                } else {
                    Ok(42)
                }
            }
        });
        // Paused clock: sleeps auto-advance.
        let result = fut.await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(5, |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("invalid api key".into()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        tokio::time::pause();
        let result: Result<(), _> = with_retries(3, |_attempt| async {
            Err("HTTP 503 Service Unavailable".into())
        })
        .await;
        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("503"));
    }
}
