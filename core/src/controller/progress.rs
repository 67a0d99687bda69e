//! Dump progress sampling

use std::time::{Duration, Instant};

/// One throttled progress report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Bytes per second since the previous sample
    pub rate: f64,
    /// Remaining time at the average rate so far
    pub eta: Option<Duration>,
}

impl ProgressSample {
    /// Completed fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.bytes_total as f64
    }
}

/// Turns per-chunk callbacks into at most one sample per interval
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    interval: Duration,
    started: Instant,
    last_at: Instant,
    last_done: u64,
}

impl ProgressMeter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            started: now,
            last_at: now,
            last_done: 0,
        }
    }

    pub fn sample(&mut self, done: u64, total: u64) -> Option<ProgressSample> {
        self.sample_at(Instant::now(), done, total)
    }

    /// Sample at `now`, or `None` if the previous sample is too recent
    pub fn sample_at(&mut self, now: Instant, done: u64, total: u64) -> Option<ProgressSample> {
        let since_last = now.saturating_duration_since(self.last_at);
        if since_last < self.interval {
            return None;
        }

        let rate = per_second(done.saturating_sub(self.last_done), since_last);
        let average = per_second(done, now.saturating_duration_since(self.started));
        let eta = (average > 0.0)
            .then(|| Duration::from_secs_f64(total.saturating_sub(done) as f64 / average));

        self.last_at = now;
        self.last_done = done;
        Some(ProgressSample {
            bytes_done: done,
            bytes_total: total,
            rate,
            eta,
        })
    }
}

fn per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}
