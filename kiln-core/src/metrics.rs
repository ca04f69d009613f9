//! Inference performance tracking

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

/// Number of generations kept before the oldest is evicted.
pub const MAX_RECORDED: usize = 100;

/// Window used by [`PerformanceMonitor::summary`] for the recent speed.
pub const RECENT_WINDOW: usize = 10;

/// Statistics for one generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceStats {
    pub tokens_per_second: f64,
    pub total_tokens: usize,
    pub duration_ms: u64,
    pub backend: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Aggregated view of the recorded history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub total_inferences: usize,
    pub average_speed: f64,
    pub recent_speed: f64,
    pub fastest: Option<f64>,
    pub slowest: Option<f64>,
}

/// Bounded, thread-safe history of generation speeds.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    stats: Mutex<VecDeque<InferenceStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_inference(&self, tokens: usize, duration: Duration, backend: &str) {
        let secs = duration.as_secs_f64();
        let tokens_per_second = if secs > 0.0 { tokens as f64 / secs } else { 0.0 };
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut stats = self.stats.lock();
        stats.push_back(InferenceStats {
            tokens_per_second,
            total_tokens: tokens,
            duration_ms: duration.as_millis() as u64,
            backend: backend.to_string(),
            timestamp_ms,
        });
        while stats.len() > MAX_RECORDED {
            stats.pop_front();
        }
    }

    pub fn total_inferences(&self) -> usize {
        self.stats.lock().len()
    }

    /// Mean tokens per second over the whole history, 0 when empty.
    pub fn average_speed(&self) -> f64 {
        mean(self.stats.lock().iter())
    }

    /// Mean tokens per second over the last `count` generations.
    pub fn recent_speed(&self, count: usize) -> f64 {
        let stats = self.stats.lock();
        let skip = stats.len().saturating_sub(count);
        mean(stats.iter().skip(skip))
    }

    pub fn fastest(&self) -> Option<f64> {
        self.stats
            .lock()
            .iter()
            .map(|s| s.tokens_per_second)
            .reduce(f64::max)
    }

    pub fn slowest(&self) -> Option<f64> {
        self.stats
            .lock()
            .iter()
            .map(|s| s.tokens_per_second)
            .reduce(f64::min)
    }

    /// Copy of the recorded history, oldest first.
    pub fn history(&self) -> Vec<InferenceStats> {
        self.stats.lock().iter().cloned().collect()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            total_inferences: self.total_inferences(),
            average_speed: self.average_speed(),
            recent_speed: self.recent_speed(RECENT_WINDOW),
            fastest: self.fastest(),
            slowest: self.slowest(),
        }
    }

    /// Human readable summary for logs.
    pub fn summary(&self, backend: &str) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(out, "=== Inference Performance ===");
        let _ = writeln!(out, "Backend: {backend}");
        let _ = writeln!(out, "Total inferences: {}", snap.total_inferences);
        if snap.total_inferences > 0 {
            let _ = writeln!(out, "Average speed: {:.2} tok/s", snap.average_speed);
            let _ = writeln!(
                out,
                "Recent speed ({RECENT_WINDOW}): {:.2} tok/s",
                snap.recent_speed
            );
            let _ = writeln!(out, "Fastest: {:.2} tok/s", snap.fastest.unwrap_or(0.0));
            let _ = writeln!(out, "Slowest: {:.2} tok/s", snap.slowest.unwrap_or(0.0));
        }
        out.push_str("=============================");
        out
    }

    pub fn clear(&self) {
        self.stats.lock().clear();
    }
}

fn mean<'a>(stats: impl Iterator<Item = &'a InferenceStats>) -> f64 {
    let (sum, n) = stats.fold((0.0, 0usize), |(sum, n), s| (sum + s.tokens_per_second, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_monitor() {
        let monitor = PerformanceMonitor::new();
        assert_eq!(monitor.total_inferences(), 0);
        assert_eq!(monitor.average_speed(), 0.0);
        assert_eq!(monitor.recent_speed(10), 0.0);
        assert_eq!(monitor.fastest(), None);
        assert!(!monitor.summary("cpu").contains("Average"));
    }

    #[test]
    fn test_speed_aggregates() {
        let monitor = PerformanceMonitor::new();
        monitor.record_inference(10, Duration::from_secs(1), "cpu");
        monitor.record_inference(40, Duration::from_secs(2), "cpu");

        assert_eq!(monitor.total_inferences(), 2);
        assert!((monitor.average_speed() - 15.0).abs() < 1e-9);
        assert!((monitor.recent_speed(1) - 20.0).abs() < 1e-9);
        assert_eq!(monitor.fastest(), Some(20.0));
        assert_eq!(monitor.slowest(), Some(10.0));
    }

    #[test]
    fn test_zero_duration_records_zero_speed() {
        let monitor = PerformanceMonitor::new();
        monitor.record_inference(5, Duration::ZERO, "cpu");
        assert_eq!(monitor.history()[0].tokens_per_second, 0.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::new();
        for i in 0..(MAX_RECORDED + 5) {
            monitor.record_inference(i, Duration::from_secs(1), "cpu");
        }
        let history = monitor.history();
        assert_eq!(history.len(), MAX_RECORDED);
        assert_eq!(history[0].total_tokens, 5);
    }

    #[test]
    fn test_summary_mentions_backend() {
        let monitor = PerformanceMonitor::new();
        monitor.record_inference(8, Duration::from_millis(500), "candle-cpu");
        let summary = monitor.summary("candle-cpu");
        assert!(summary.contains("Backend: candle-cpu"));
        assert!(summary.contains("Average speed: 16.00 tok/s"));
    }
}
