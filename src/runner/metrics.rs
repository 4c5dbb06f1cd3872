//! Per-audit metrics collection and emission.
//!
//! Counters for processed chunks, retries, and token usage, with a derived
//! chunks-per-minute rate. Emission is a structured log event only, every
//! 60 seconds of wall-clock and once at terminal transition.

use std::time::{Duration, Instant};

use tracing::info;

/// Interval between periodic emissions.
const EMISSION_INTERVAL: Duration = Duration::from_secs(60);

/// Collects and emits metrics for one audit execution.
#[derive(Debug)]
pub struct MetricsCollector {
    chunks_processed: u64,
    retry_count: u64,
    token_usage: u64,
    start: Instant,
    last_emission: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Creates a collector; the throughput clock starts now.
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            chunks_processed: 0,
            retry_count: 0,
            token_usage: 0,
            start: now,
            last_emission: now,
        }
    }

    /// Records a processed chunk, emitting if the interval has passed.
    pub fn record_chunk_processed(&mut self, tokens_used: u64) {
        self.chunks_processed += 1;
        self.token_usage += tokens_used;
        if self.last_emission.elapsed() >= EMISSION_INTERVAL {
            self.emit();
        }
    }

    /// Records a retry attempt.
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Chunks processed so far.
    #[must_use]
    pub const fn chunks_processed(&self) -> u64 {
        self.chunks_processed
    }

    /// Derived throughput in chunks per minute.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn chunks_per_minute(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.chunks_processed as f64 / elapsed) * 60.0
    }

    /// Emits current counters as a structured log event.
    pub fn emit(&mut self) {
        info!(
            chunks_processed = self.chunks_processed,
            chunks_per_minute = format!("{:.2}", self.chunks_per_minute()),
            retry_count = self.retry_count,
            token_usage = self.token_usage,
            elapsed_seconds = format!("{:.2}", self.start.elapsed().as_secs_f64()),
            "metrics"
        );
        self.last_emission = Instant::now();
    }
}
