//! Redial backoff for connected dealers.

use crate::options::EndpointOptions;
use std::time::Duration;

/// Doubling delay between redial attempts, capped at `reconnect_ivl_max`.
///
/// ```rust
/// use lettuce_core::options::EndpointOptions;
/// use lettuce_core::reconnect::Backoff;
/// use std::time::Duration;
///
/// let opts = EndpointOptions::default()
///     .with_reconnect_ivl(Duration::from_millis(100))
///     .with_reconnect_ivl_max(Duration::from_millis(300));
/// let mut backoff = Backoff::new(&opts);
///
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(300));
/// backoff.reset();
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub const fn new(options: &EndpointOptions) -> Self {
        Self {
            base: options.reconnect_ivl,
            max: options.reconnect_ivl_max,
            attempt: 0,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(1_u32 << self.attempt.min(16))
            .min(self.max.max(self.base));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[inline]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max_and_keeps_counting() {
        let opts = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(10))
            .with_reconnect_ivl_max(Duration::from_millis(35));
        let mut backoff = Backoff::new(&opts);

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [10, 20, 35, 35, 35].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn max_below_base_uses_base() {
        let opts = EndpointOptions::default()
            .with_reconnect_ivl(Duration::from_millis(50))
            .with_reconnect_ivl_max(Duration::ZERO);
        let mut backoff = Backoff::new(&opts);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn survives_many_attempts() {
        let opts = EndpointOptions::default();
        let mut backoff = Backoff::new(&opts);
        for _ in 0..100 {
            assert!(backoff.next_delay() <= opts.reconnect_ivl_max);
        }
    }
}
