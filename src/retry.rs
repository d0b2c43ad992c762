//! Support utilities for [`keen_retry`]'s retry API.

use std::time::Duration;

use keen_retry::RetryResult;
use reqwest::StatusCode;

/// The result of one attempt to call a cloud provider.
pub type ProviderRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// How hard to retry transient provider failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Shortest and longest backoff, in milliseconds.
    pub backoff_range_millis: (u32, u32),
    /// How many times to try again after the first attempt.
    pub re_attempts: u8,
}

impl RetryPolicy {
    /// Worst-case time spent sleeping between attempts.
    pub fn max_total_backoff(&self) -> Duration {
        Duration::from_millis(
            u64::from(self.backoff_range_millis.1) * u64::from(self.re_attempts),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_range_millis: (1_000, 10_000),
            re_attempts: 2,
        }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, timeouts and the like. `reqwest` doesn't
            // expose enough detail to be more precise.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_known_statuses_are_transient() {
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::FORBIDDEN.is_known_transient());
    }

    #[test]
    fn default_policy_retries_twice() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.re_attempts, 2);
        assert_eq!(policy.max_total_backoff(), Duration::from_secs(20));
    }
}
