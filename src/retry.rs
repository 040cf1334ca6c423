//! # Retry Policy
//!
//! Decides whether a failed remote call is worth another attempt and how long to wait.
//!
//! ## Classification (first match wins):
//! 1. Errors that are terminal by construction (a failed job, a missing local file) never retry
//! 2. Messages containing a known business code (suspended account, bad app key,
//!    bad signature, missing permission) never retry
//! 3. HTTP 4xx other than 429 never retries
//! 4. Everything else (429, 5xx, transport errors, timeouts) retries until the attempt ceiling
//!
//! When the ceiling is reached the last error is returned as-is, never wrapped.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Error signatures that mean "fix your configuration", not "try again".
pub const NON_RETRYABLE_CODES: &[&str] = &[
    "BRK.OverdueTenant",
    "BRK.InvalidAppKey",
    "BRK.NoPermission",
    "InvalidAccessKeyId.NotFound",
    "SignatureDoesNotMatch",
];

/// What the retry classifier needs to know about an error.
pub trait Retryable: Display {
    /// HTTP status of the failed response, if the failure came from one.
    fn http_status(&self) -> Option<u16> {
        None
    }

    /// True for errors that must never be retried whatever they say.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Exponential backoff with a capped delay and an attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// Same backoff curve, different ceiling.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed with `error`.
    pub fn should_retry<E: Retryable>(&self, error: &E, attempt: u32) -> RetryDecision {
        if !is_retryable(error) || attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff(attempt))
    }

    /// Run `operation` until it succeeds or the policy gives up.
    ///
    /// ## Returns:
    /// - **Ok(T)**: the first successful result
    /// - **Err(E)**: the last error observed, unchanged
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => match self.should_retry(&error, attempt) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            operation = operation_name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying failed call"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => return Err(error),
                },
            }
        }
    }
}

/// Classification independent of the attempt count.
pub fn is_retryable<E: Retryable>(error: &E) -> bool {
    if error.is_terminal() {
        return false;
    }

    let message = error.to_string();
    if NON_RETRYABLE_CODES.iter().any(|code| message.contains(code)) {
        return false;
    }

    match error.http_status() {
        Some(429) => true,
        Some(status) if (400..500).contains(&status) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct FakeError {
        status: Option<u16>,
        message: String,
        terminal: bool,
    }

    impl FakeError {
        fn status(status: u16) -> Self {
            Self {
                status: Some(status),
                message: format!("HTTP Status: {}", status),
                terminal: false,
            }
        }

        fn message(message: &str) -> Self {
            Self {
                status: None,
                message: message.to_string(),
                terminal: false,
            }
        }
    }

    impl Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl Retryable for FakeError {
        fn http_status(&self) -> Option<u16> {
            self.status
        }

        fn is_terminal(&self) -> bool {
            self.terminal
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_non_retryable_code_never_retries() {
        let policy = RetryPolicy::default();
        let error = FakeError::message("HTTP Status: 403 Error:BRK.InvalidAppKey app key invalid");
        for attempt in 1..=5 {
            assert_eq!(policy.should_retry(&error, attempt), RetryDecision::GiveUp);
        }

        let error = FakeError::message("SignatureDoesNotMatch: computed signature differs");
        assert_eq!(policy.should_retry(&error, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_429_retries_up_to_ceiling() {
        let policy = RetryPolicy::default();
        let error = FakeError::status(429);
        assert!(matches!(policy.should_retry(&error, 1), RetryDecision::Retry(_)));
        assert!(matches!(policy.should_retry(&error, 3), RetryDecision::Retry(_)));
        assert_eq!(policy.should_retry(&error, 4), RetryDecision::GiveUp);
    }

    #[test]
    fn test_client_errors_are_final_server_errors_are_not() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.should_retry(&FakeError::status(400), 1), RetryDecision::GiveUp);
        assert_eq!(policy.should_retry(&FakeError::status(404), 1), RetryDecision::GiveUp);
        assert!(matches!(
            policy.should_retry(&FakeError::status(503), 1),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.should_retry(&FakeError::message("connection reset"), 2),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn test_terminal_errors_never_retry() {
        let mut error = FakeError::message("job failed");
        error.terminal = true;
        assert_eq!(RetryPolicy::default().should_retry(&error, 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6).map(|a| policy.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.backoff(200), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_run_returns_last_error_unchanged() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> = fast_policy(2)
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(FakeError::message(&format!("failure {}", n))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), FakeError::message("failure 3"));
    }

    #[tokio::test]
    async fn test_run_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FakeError::status(502))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FakeError> = fast_policy(3)
            .run("submit", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError::message("BRK.OverdueTenant")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
