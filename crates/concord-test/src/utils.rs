//! Test utilities.

use std::time::Duration;

use concord_common::config::TimeoutConfig;

/// Timeouts short enough for tests, long enough for a loaded CI machine.
pub fn fast_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        prepare_timeout_ms: 500,
        commit_timeout_ms: 300,
        execute_timeout_ms: 1000,
        lock_timeout_ms: 200,
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 200,
        retry_initial_backoff_ms: 10,
        retry_max_backoff_ms: 100,
        outcome_query_interval_ms: 100,
        active_idle_timeout_ms: 2_000,
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` expires.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
