//! Shared retry policy for the outbound HTTP clients.
//!
//! Transient failures (rate limits, server errors, transport problems) are
//! retried with an explicit bounded loop and exponential backoff; everything
//! else surfaces immediately.

use std::time::Duration;

use reqwest::StatusCode;

pub(crate) fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub(crate) fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
}

pub(crate) fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_rate_limits_and_server_errors() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry(StatusCode::BAD_GATEWAY));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn backoff_grows_then_caps() {
        assert!(retry_backoff(1) < retry_backoff(2));
        assert!(retry_backoff(2) < retry_backoff(5));
        assert_eq!(retry_backoff(5), retry_backoff(9));
    }
}
