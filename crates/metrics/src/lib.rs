//! Rolling-window operation metrics.
//!
//! Events are retained only inside a trailing time window; snapshots
//! aggregate per operation and a periodic sweep bounds memory. Operations
//! with no in-window events disappear from the snapshot entirely.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// One recorded operation outcome.
#[derive(Clone, Debug)]
struct MetricEvent {
    at: Instant,
    duration: Duration,
    success: bool,
    error_code: Option<String>,
}

/// Aggregated view of a single operation over the window.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct OperationStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub error_codes: BTreeMap<String, u64>,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: u64,
}

/// Collector holding per-operation event queues.
pub struct MetricsHub {
    window: Duration,
    events: Mutex<HashMap<String, VecDeque<MetricEvent>>>,
}

impl MetricsHub {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an outcome timestamped at call time.
    pub fn record(
        &self,
        operation: &str,
        duration: Duration,
        success: bool,
        error_code: Option<&str>,
    ) {
        let event = MetricEvent {
            at: Instant::now(),
            duration,
            success,
            error_code: error_code.map(|code| code.to_string()),
        };
        let mut guard = self.events.lock();
        guard
            .entry(operation.to_string())
            .or_default()
            .push_back(event);
    }

    /// Aggregate everything inside the trailing window.
    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        let cutoff = Instant::now()
            .checked_sub(self.window)
            .unwrap_or_else(Instant::now);
        let guard = self.events.lock();

        let mut out = BTreeMap::new();
        for (operation, queue) in guard.iter() {
            let recent: Vec<&MetricEvent> = queue.iter().filter(|e| e.at >= cutoff).collect();
            if recent.is_empty() {
                continue;
            }

            let mut stats = OperationStats {
                calls: recent.len() as u64,
                ..Default::default()
            };
            let mut durations: Vec<u64> = Vec::with_capacity(recent.len());
            let mut total_ms = 0u64;
            for event in &recent {
                let ms = event.duration.as_millis() as u64;
                durations.push(ms);
                total_ms += ms;
                if event.success {
                    stats.successes += 1;
                } else {
                    stats.failures += 1;
                    if let Some(code) = &event.error_code {
                        *stats.error_codes.entry(code.clone()).or_insert(0) += 1;
                    }
                }
            }
            stats.avg_duration_ms = total_ms as f64 / recent.len() as f64;
            durations.sort_unstable();
            stats.p95_duration_ms = nearest_rank(&durations, 95);
            out.insert(operation.clone(), stats);
        }

        out
    }

    /// Drop events older than the window; empty operations are removed from
    /// the map so the snapshot never resurrects them.
    pub fn sweep(&self) -> usize {
        let cutoff = match Instant::now().checked_sub(self.window) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut guard = self.events.lock();
        let mut dropped = 0;
        guard.retain(|_, queue| {
            while queue.front().map(|e| e.at < cutoff).unwrap_or(false) {
                queue.pop_front();
                dropped += 1;
            }
            !queue.is_empty()
        });
        dropped
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn nearest_rank(sorted: &[u64], percentile: u32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (percentile as f64 / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn snapshot_aggregates_per_operation() {
        let hub = MetricsHub::new(Duration::from_secs(3600));
        hub.record("tab.navigate", ms(100), true, None);
        hub.record("tab.navigate", ms(300), false, Some("TIMEOUT"));
        hub.record("screenshot", ms(50), true, None);

        let snap = hub.snapshot();
        let nav = &snap["tab.navigate"];
        assert_eq!(nav.calls, 2);
        assert_eq!(nav.successes, 1);
        assert_eq!(nav.failures, 1);
        assert_eq!(nav.error_codes["TIMEOUT"], 1);
        assert!((nav.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(snap["screenshot"].calls, 1);
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let hub = MetricsHub::new(Duration::from_secs(3600));
        for v in 1..=100u64 {
            hub.record("op", ms(v), true, None);
        }
        let snap = hub.snapshot();
        assert_eq!(snap["op"].p95_duration_ms, 95);

        // Small samples: rank rounds up, so 20 events -> 19th value.
        let hub = MetricsHub::new(Duration::from_secs(3600));
        for v in 1..=20u64 {
            hub.record("op", ms(v * 10), true, None);
        }
        assert_eq!(hub.snapshot()["op"].p95_duration_ms, 190);
    }

    #[test]
    fn window_excludes_old_events_and_sweep_drops_them() {
        let hub = MetricsHub::new(ms(30));
        hub.record("op", ms(1), true, None);
        sleep(ms(60));
        assert!(hub.snapshot().get("op").is_none());

        let dropped = hub.sweep();
        assert_eq!(dropped, 1);
        // Operation entry itself is gone after the sweep.
        assert!(hub.events.lock().is_empty());
    }

    #[test]
    fn nearest_rank_edge_cases() {
        assert_eq!(nearest_rank(&[], 95), 0);
        assert_eq!(nearest_rank(&[42], 95), 42);
        assert_eq!(nearest_rank(&[1, 2], 95), 2);
    }
}
