//! Detection statistics (§4.4): a rolling window of processing-time
//! samples plus lifetime counters, guarded by a single mutex (§5).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

const ROLLING_WINDOW: usize = 1_000;

#[derive(Debug, Default)]
struct Inner {
    processing_times_ms: VecDeque<f64>,
    attack_type_counts: HashMap<String, u64>,
    total_attacks: u64,
    total_benign: u64,
    false_positives: u64,
    dropped_flows: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DetectionStatsSnapshot {
    pub total_attacks: u64,
    pub total_benign: u64,
    pub false_positives: u64,
    pub dropped_flows: u64,
    pub attack_type_counts: HashMap<String, u64>,
    pub avg_processing_time_ms: f64,
    pub sample_count: usize,
}

#[derive(Default)]
pub struct DetectionStats {
    inner: Mutex<Inner>,
}

impl DetectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processing_time(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        if inner.processing_times_ms.len() == ROLLING_WINDOW {
            inner.processing_times_ms.pop_front();
        }
        inner.processing_times_ms.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_attack(&self, attack_type: &str) {
        let mut inner = self.inner.lock();
        inner.total_attacks += 1;
        *inner.attack_type_counts.entry(attack_type.to_string()).or_insert(0) += 1;
    }

    pub fn record_benign(&self) {
        self.inner.lock().total_benign += 1;
    }

    pub fn record_false_positive(&self) {
        self.inner.lock().false_positives += 1;
    }

    pub fn record_dropped_flow(&self) {
        self.inner.lock().dropped_flows += 1;
    }

    /// Adds `n` to the dropped-flow counter in one lock acquisition, for
    /// callers that reconcile against a separately-maintained counter
    /// (e.g. `FlowQueue::dropped_flows`) instead of observing each drop.
    pub fn record_dropped_flows(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.inner.lock().dropped_flows += n;
    }

    /// `GetDetectionStats` (§6).
    pub fn snapshot(&self) -> DetectionStatsSnapshot {
        let inner = self.inner.lock();
        let sample_count = inner.processing_times_ms.len();
        let avg = if sample_count == 0 {
            0.0
        } else {
            inner.processing_times_ms.iter().sum::<f64>() / sample_count as f64
        };
        DetectionStatsSnapshot {
            total_attacks: inner.total_attacks,
            total_benign: inner.total_benign,
            false_positives: inner.false_positives,
            dropped_flows: inner.dropped_flows,
            attack_type_counts: inner.attack_type_counts.clone(),
            avg_processing_time_ms: avg,
            sample_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_window_caps_at_one_thousand_samples() {
        let stats = DetectionStats::new();
        for _ in 0..1500 {
            stats.record_processing_time(Duration::from_millis(1));
        }
        assert_eq!(stats.snapshot().sample_count, ROLLING_WINDOW);
    }

    #[test]
    fn attack_type_histogram_tallies_by_name() {
        let stats = DetectionStats::new();
        stats.record_attack("SYN Flood");
        stats.record_attack("SYN Flood");
        stats.record_attack("UDP Flood");
        let snap = stats.snapshot();
        assert_eq!(snap.attack_type_counts.get("SYN Flood"), Some(&2));
        assert_eq!(snap.attack_type_counts.get("UDP Flood"), Some(&1));
        assert_eq!(snap.total_attacks, 3);
    }
}
