use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

const WINDOW_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub count: usize,
}

/// Rolling batch timings: scoring time and window-close to publish time.
pub struct LatencyTracker {
    scoring: VecDeque<u64>,
    close_to_publish: VecDeque<u64>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            scoring: VecDeque::with_capacity(WINDOW_SIZE),
            close_to_publish: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    pub fn record_scoring(&mut self, elapsed: Duration) {
        push_capped(&mut self.scoring, elapsed.as_micros() as u64);
    }

    pub fn record_publish(&mut self, since_close: Duration) {
        push_capped(&mut self.close_to_publish, since_close.as_micros() as u64);
    }

    pub fn scoring_stats(&self) -> LatencyStats {
        compute_stats(&self.scoring)
    }

    pub fn publish_stats(&self) -> LatencyStats {
        compute_stats(&self.close_to_publish)
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_capped(q: &mut VecDeque<u64>, val: u64) {
    if q.len() >= WINDOW_SIZE {
        q.pop_front();
    }
    q.push_back(val);
}

fn compute_stats(q: &VecDeque<u64>) -> LatencyStats {
    if q.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted: Vec<u64> = q.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();
    LatencyStats {
        p50_us: sorted[n * 50 / 100],
        p95_us: sorted[n * 95 / 100],
        p99_us: sorted[(n * 99 / 100).min(n - 1)],
        min_us: sorted[0],
        max_us: sorted[n - 1],
        count: n,
    }
}
