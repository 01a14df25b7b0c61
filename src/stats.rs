//! Statistics tracking for the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Rejected,
    Hosts,
    Literal,
    Cache,
    Primary,
    Alternative,
    Failure,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Rejected => "rejected",
            Source::Hosts => "hosts",
            Source::Literal => "literal",
            Source::Cache => "cache",
            Source::Primary => "primary",
            Source::Alternative => "alternative",
            Source::Failure => "failure",
        }
    }
}

/// Atomic per-source counters.
#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    rejected: AtomicU64,
    hosts: AtomicU64,
    literal: AtomicU64,
    cached: AtomicU64,
    primary: AtomicU64,
    alternative: AtomicU64,
    failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: Source, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match source {
            Source::Rejected => &self.rejected,
            Source::Hosts => &self.hosts,
            Source::Literal => &self.literal,
            Source::Cache => &self.cached,
            Source::Primary => &self.primary,
            Source::Alternative => &self.alternative,
            Source::Failure => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            hosts: self.hosts.swap(0, Ordering::Relaxed),
            literal: self.literal.swap(0, Ordering::Relaxed),
            cached: self.cached.swap(0, Ordering::Relaxed),
            primary: self.primary.swap(0, Ordering::Relaxed),
            alternative: self.alternative.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub rejected: u64,
    pub hosts: u64,
    pub literal: u64,
    pub cached: u64,
    pub primary: u64,
    pub alternative: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}
