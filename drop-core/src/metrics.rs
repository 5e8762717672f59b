use chrono::Utc;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub requests: RequestMetrics,
    pub latency: LatencyMetrics,
    pub queue_length: usize,
    pub in_flight: usize,
    pub fee_baseline: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Submissions sent across all requests, retries included.
    pub attempts: u64,
    /// Fraction of terminal requests that confirmed, in `[0, 1]`.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyMetrics {
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

#[derive(Debug)]
struct Counters {
    successful: u64,
    failed: u64,
    attempts: u64,
    latency_sum_ms: u64,
    latency_min_ms: u64,
    latency_max_ms: u64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            successful: 0,
            failed: 0,
            attempts: 0,
            latency_sum_ms: 0,
            latency_min_ms: u64::MAX,
            latency_max_ms: 0,
        }
    }
}

/// Mint outcome counters.
///
/// A terminal outcome updates every counter under one lock so a snapshot
/// never sees a success counted without its latency.
#[derive(Debug)]
pub struct MintMetrics {
    counters: Mutex<Counters>,
    start_time: Instant,
}

impl Default for MintMetrics {
    fn default() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            start_time: Instant::now(),
        }
    }
}

impl MintMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that reached a terminal state after `attempts`
    /// submissions.
    pub fn record_outcome(&self, success: bool, attempts: u32, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        if success {
            c.successful += 1;
        } else {
            c.failed += 1;
        }
        c.attempts += attempts as u64;
        c.latency_sum_ms += latency_ms;
        c.latency_min_ms = c.latency_min_ms.min(latency_ms);
        c.latency_max_ms = c.latency_max_ms.max(latency_ms);
    }

    /// `(successful, total)` terminal outcomes so far.
    pub fn outcome_counts(&self) -> (u64, u64) {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        (c.successful, c.successful + c.failed)
    }

    /// Snapshot combined with the live queue and fee state of a session.
    pub fn snapshot(&self, queue_length: usize, in_flight: usize, fee_baseline: f64) -> MetricsSnapshot {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let total = c.successful + c.failed;

        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            requests: RequestMetrics {
                total,
                successful: c.successful,
                failed: c.failed,
                attempts: c.attempts,
                success_rate: if total > 0 {
                    c.successful as f64 / total as f64
                } else {
                    0.0
                },
            },
            latency: LatencyMetrics {
                average_ms: if total > 0 {
                    c.latency_sum_ms as f64 / total as f64
                } else {
                    0.0
                },
                min_ms: if c.latency_min_ms == u64::MAX {
                    0
                } else {
                    c.latency_min_ms
                },
                max_ms: c.latency_max_ms,
            },
            queue_length,
            in_flight,
            fee_baseline,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub async fn export_to_file(&self, path: &str) -> std::io::Result<()> {
        tokio::fs::write(path, self.to_json()).await
    }
}
