//! Latency sample aggregation.
//!
//! Each provider session accumulates transcript latencies; at socket close
//! the session manager folds them into one [`LatencySummary`] per provider
//! and persists it. Sessions with no samples persist nothing.

use serde::{Deserialize, Serialize};

/// Aggregate statistics over one provider session's latency samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencyStats {
    /// Computes stats over the samples, `None` when empty.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count,
            avg: sum / count as f64,
            p50: percentile(&sorted, 0.5),
            p95: percentile(&sorted, 0.95),
            min: sorted[0],
            max: sorted[count - 1],
        })
    }
}

/// Linear-interpolated percentile over a sorted slice.
///
/// `p(q)` interpolates between index `⌊(n-1)q⌋` and the next one.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = (n - 1) as f64 * q;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Per-(session, provider) latency summary persisted at socket close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub session_id: String,
    pub provider: String,
    pub lang: String,
    #[serde(flatten)]
    pub stats: LatencyStats,
    /// Session start (ms since epoch).
    pub started_at: u64,
    /// Persist time (ms since epoch).
    pub ended_at: u64,
}
