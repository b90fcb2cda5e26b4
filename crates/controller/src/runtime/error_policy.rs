//! # Error Policy
//!
//! Classification and backoff for watch stream errors.
//!
//! Reconcile failures never reach this module: the dispatcher retries those
//! per resource. A watch error only decides whether the stream is restarted.

use crate::controller::backoff::FibonacciBackoff;
use std::time::Duration;
use tracing::{error, warn};

/// Kind of failure reported by the `PkiSecret` watch stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401: RBAC revoked or service account token expired
    Unauthorized,
    /// 410: resource version too old, normal after API server restarts
    Expired,
    /// 429: API server storage reinitializing
    Throttled,
    /// 404: CRD missing or resource already gone
    NotFound,
    Other,
}

impl WatchErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchErrorClass::Unauthorized => "401",
            WatchErrorClass::Expired => "410",
            WatchErrorClass::Throttled => "429",
            WatchErrorClass::NotFound => "404",
            WatchErrorClass::Other => "other",
        }
    }
}

/// Classify a watch error from its debug rendering
pub fn classify_watch_error(error_string: &str) -> WatchErrorClass {
    // 404 first: a plain-text 404 body surfaces as a serde error that also mentions "WatchFailed"
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    let is_401 =
        (error_string.contains("401") || error_string.contains("Unauthorized")) && !is_not_found;
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");

    if is_401 {
        WatchErrorClass::Unauthorized
    } else if is_410 {
        WatchErrorClass::Expired
    } else if is_429 {
        WatchErrorClass::Throttled
    } else if is_not_found {
        WatchErrorClass::NotFound
    } else {
        WatchErrorClass::Other
    }
}

/// Handle a watch stream error, sleeping where the class calls for it.
///
/// Returns `true` when the current stream can keep going and `false` when the
/// watch should be restarted.
pub async fn handle_watch_stream_error(
    error_string: &str,
    throttle_backoff: &mut FibonacciBackoff,
    restart_delay: Duration,
) -> bool {
    let class = classify_watch_error(error_string);
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error_type = class.as_str(),
    );
    let _error_guard = error_span.enter();

    match class {
        WatchErrorClass::Unauthorized => {
            error!(
                error = %error_string,
                "Watch authentication failed (401 Unauthorized); check the controller's ClusterRole, ClusterRoleBinding and ServiceAccount"
            );
            warn!(
                delay_secs = restart_delay.as_secs(),
                "Waiting before retrying watch (RBAC may need time to propagate)"
            );
            tokio::time::sleep(restart_delay).await;
            false
        }
        WatchErrorClass::Expired => {
            warn!("Watch resource version expired (410), restarting watch");
            false
        }
        WatchErrorClass::Throttled => {
            let delay = throttle_backoff.next_backoff();
            warn!(
                delay_secs = delay.as_secs(),
                "API server storage reinitializing (429), backing off before restart"
            );
            tokio::time::sleep(delay).await;
            false
        }
        WatchErrorClass::NotFound => {
            warn!(
                error = %error_string,
                "PkiSecret not found (404); the CRD may be missing or the resource was deleted"
            );
            true
        }
        WatchErrorClass::Other => {
            error!(error = %error_string, "Controller stream error");
            tokio::time::sleep(restart_delay).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            classify_watch_error("Api(ErrorResponse { code: 401, reason: \"Unauthorized\" })"),
            WatchErrorClass::Unauthorized
        );
        assert_eq!(
            classify_watch_error("WatchError(ErrorResponse { code: 410, reason: \"Expired\" })"),
            WatchErrorClass::Expired
        );
        assert_eq!(
            classify_watch_error("storage is (re)initializing"),
            WatchErrorClass::Throttled
        );
        assert_eq!(
            classify_watch_error("InitialListFailed(Api(ErrorResponse { code: 404 }))"),
            WatchErrorClass::NotFound
        );
        assert_eq!(
            classify_watch_error("connection reset by peer"),
            WatchErrorClass::Other
        );
    }

    #[test]
    fn test_not_found_wins_over_unauthorized_text() {
        assert_eq!(
            classify_watch_error("WatchFailed: invalid type: integer `404`, Unauthorized"),
            WatchErrorClass::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_restart_uses_backoff() {
        let mut backoff = FibonacciBackoff::new(2, 10);
        let started = tokio::time::Instant::now();

        let keep_going =
            handle_watch_stream_error("429 TooManyRequests", &mut backoff, Duration::from_secs(5))
                .await;

        assert!(!keep_going);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_keeps_stream_without_sleeping() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let started = tokio::time::Instant::now();

        assert!(
            handle_watch_stream_error("ObjectNotFound", &mut backoff, Duration::from_secs(5)).await
        );
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
