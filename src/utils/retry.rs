//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between reconnect attempts of a failing log consumer.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 20 (callers keep retrying at the max delay afterwards)
/// - Jitter enabled
pub fn poll_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(20)
        .with_jitter()
}
