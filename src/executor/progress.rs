//! Throughput logging for long-running executions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Logs processed item counts at most once per interval.
#[derive(Debug)]
pub struct ProgressLogger {
    name: String,
    total: Option<usize>,
    processed: AtomicUsize,
    started: Instant,
    interval: Duration,
    last_logged: Mutex<Instant>,
}

impl ProgressLogger {
    /// Start tracking `total` items (if known) under `name`.
    pub fn new(name: impl Into<String>, total: Option<usize>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            total,
            processed: AtomicUsize::new(0),
            started: now,
            interval,
            last_logged: Mutex::new(now),
        }
    }

    /// Add `count` processed items, logging if the interval elapsed.
    pub fn track(&self, count: usize) {
        let processed = self.processed.fetch_add(count, Ordering::Relaxed) + count;
        let mut last = self.last_logged.lock().unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() >= self.interval {
            *last = Instant::now();
            drop(last);
            self.log(processed, "progress");
        }
    }

    /// Items processed so far.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Log the final tally.
    pub fn finish(&self) {
        self.log(self.processed(), "finished");
    }

    #[allow(clippy::cast_precision_loss)]
    fn log(&self, processed: usize, stage: &str) {
        let elapsed = self.started.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = processed as f64 / elapsed;
        match self.total {
            Some(total) => info!(
                work = %self.name,
                stage,
                processed,
                total,
                items_per_sec = format!("{rate:.1}"),
                "Executor {stage}"
            ),
            None => info!(
                work = %self.name,
                stage,
                processed,
                items_per_sec = format!("{rate:.1}"),
                "Executor {stage}"
            ),
        }
    }
}
