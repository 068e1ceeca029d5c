//! Adaptive batch size shared by the workers of one executor.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Default time that must pass after a change before the size may grow.
pub const DEFAULT_GROWTH_COOLDOWN: Duration = Duration::from_secs(120);

#[derive(Debug)]
struct SizeState {
    current: usize,
    last_change: Instant,
}

/// Batch size that halves on transient failures and slowly grows back.
///
/// The size never exceeds the configured maximum and never drops below 1.
/// A failure only halves the size if the batch that failed was cut at the
/// current size: when several workers fail on batches of the same size, only
/// the first report takes effect.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    max: usize,
    cooldown: Duration,
    state: Mutex<SizeState>,
}

impl AdaptiveBatchSize {
    /// Start at `max` (clamped to at least 1).
    #[must_use]
    pub fn new(max: usize, cooldown: Duration) -> Self {
        let max = max.max(1);
        Self {
            max,
            cooldown,
            state: Mutex::new(SizeState {
                current: max,
                last_change: Instant::now(),
            }),
        }
    }

    /// Size the next batch should be cut at.
    #[must_use]
    pub fn current(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    /// Configured ceiling.
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Record a transient failure of a batch cut at `observed` items.
    ///
    /// Returns the size in effect afterwards.
    pub fn on_failure(&self, observed: usize) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.current == observed && state.current > 1 {
            state.current = (observed / 2).max(1);
            state.last_change = Instant::now();
            info!(from = observed, to = state.current, "Batch size decreased");
        }
        state.current
    }

    /// Record a successful batch; doubles the size once the cooldown passed.
    pub fn on_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.current < self.max && state.last_change.elapsed() >= self.cooldown {
            let grown = state.current.saturating_mul(2).min(self.max);
            debug!(from = state.current, to = grown, "Batch size increased");
            state.current = grown;
            state.last_change = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failure_halves_once_per_observed_size() {
        let size = AdaptiveBatchSize::new(100, DEFAULT_GROWTH_COOLDOWN);

        assert_eq!(size.on_failure(100), 50);
        // A second worker that also cut a batch of 100 must not halve again.
        assert_eq!(size.on_failure(100), 50);
        assert_eq!(size.on_failure(50), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_below_one() {
        let size = AdaptiveBatchSize::new(2, DEFAULT_GROWTH_COOLDOWN);
        assert_eq!(size.on_failure(2), 1);
        assert_eq!(size.on_failure(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_growth_waits_for_cooldown_and_caps_at_max() {
        let size = AdaptiveBatchSize::new(100, Duration::from_secs(120));
        size.on_failure(100);
        size.on_failure(50);
        assert_eq!(size.current(), 25);

        size.on_success();
        assert_eq!(size.current(), 25);

        tokio::time::advance(Duration::from_secs(121)).await;
        size.on_success();
        assert_eq!(size.current(), 50);

        tokio::time::advance(Duration::from_secs(121)).await;
        size.on_success();
        tokio::time::advance(Duration::from_secs(121)).await;
        size.on_success();
        assert_eq!(size.current(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_is_clamped() {
        let size = AdaptiveBatchSize::new(0, DEFAULT_GROWTH_COOLDOWN);
        assert_eq!(size.current(), 1);
        assert_eq!(size.max(), 1);
    }
}
