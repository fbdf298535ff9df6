//! In-memory request telemetry for the model client.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Retained request count. Old entries roll off.
const WINDOW_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct RequestStat {
    at: Instant,
    duration: Duration,
    success: bool,
    hit_timeout: bool,
    payload_bytes: usize,
}

/// Aggregated view over the retained window.
#[derive(Debug, Clone, Default)]
pub struct MonitorSummary {
    pub total_requests: usize,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub average_duration_ms: f64,
    pub average_payload_bytes: f64,
}

/// Sliding-window statistics over model requests.
///
/// Purely in-memory; recording a request performs no I/O.
#[derive(Default)]
pub struct RequestMonitor {
    stats: Mutex<VecDeque<RequestStat>>,
}

impl RequestMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        duration: Duration,
        success: bool,
        hit_timeout: bool,
        payload_bytes: usize,
    ) {
        let mut stats = self.stats.lock();
        if stats.len() >= WINDOW_CAPACITY {
            stats.pop_front();
        }
        stats.push_back(RequestStat {
            at: Instant::now(),
            duration,
            success,
            hit_timeout,
            payload_bytes,
        });
    }

    /// Fraction of requests in the last `horizon` that timed out.
    pub fn timeout_rate(&self, horizon: Duration) -> f64 {
        let stats = self.stats.lock();
        let recent: Vec<_> = stats.iter().filter(|s| s.at.elapsed() <= horizon).collect();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().filter(|s| s.hit_timeout).count() as f64 / recent.len() as f64
    }

    /// Mean duration of successful requests in the last `horizon`.
    pub fn average_latency(&self, horizon: Duration) -> Option<Duration> {
        let stats = self.stats.lock();
        let durations: Vec<Duration> = stats
            .iter()
            .filter(|s| s.success && s.at.elapsed() <= horizon)
            .map(|s| s.duration)
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<Duration>() / durations.len() as u32)
    }

    pub fn summary(&self) -> MonitorSummary {
        let stats = self.stats.lock();
        let total = stats.len();
        if total == 0 {
            return MonitorSummary::default();
        }
        let successes = stats.iter().filter(|s| s.success).count();
        let timeouts = stats.iter().filter(|s| s.hit_timeout).count();
        let duration_ms: f64 = stats
            .iter()
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .sum();
        let payload: f64 = stats.iter().map(|s| s.payload_bytes as f64).sum();
        MonitorSummary {
            total_requests: total,
            success_rate: successes as f64 / total as f64,
            timeout_rate: timeouts as f64 / total as f64,
            average_duration_ms: duration_ms / total as f64,
            average_payload_bytes: payload / total as f64,
        }
    }
}
