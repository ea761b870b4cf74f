//! Wall-clock budget helpers for the run loop.

use std::time::{Duration, Instant};

/// Elapsed time since `started` when it has reached `timeout`, else `None`.
///
/// A `None` timeout never expires.
pub fn budget_exhausted(started: Instant, timeout: Option<Duration>) -> Option<Duration> {
    let limit = timeout?;
    let elapsed = started.elapsed();
    (elapsed >= limit).then_some(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_timeout_never_expires() {
        assert_eq!(budget_exhausted(Instant::now(), None), None);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        assert!(budget_exhausted(Instant::now(), Some(Duration::ZERO)).is_some());
    }

    #[test]
    fn generous_timeout_has_budget_left() {
        assert_eq!(
            budget_exhausted(Instant::now(), Some(Duration::from_secs(3600))),
            None
        );
    }
}
