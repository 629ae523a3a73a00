//! Recovery metrics: per-message timings and aggregate counters.
//!
//! Completed samples are retained for a short window so percentile queries
//! stay cheap and memory stays bounded; aggregate counters and the running
//! average survive pruning.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use super::classifier::ErrorType;
use crate::queue::QueueKind;
use crate::types::UnixMillis;

/// Terminal disposition of one recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDisposition {
    Succeeded,
    Failed,
    Requeued,
}

#[derive(Debug, Clone)]
struct Sample {
    completed_at: UnixMillis,
    duration: Duration,
}

#[derive(Default)]
struct MetricsState {
    inflight: HashMap<String, UnixMillis>,
    samples: Vec<Sample>,
    received: u64,
    processed: u64,
    succeeded: u64,
    failed: u64,
    requeued: u64,
    per_queue: HashMap<QueueKind, u64>,
    per_error: HashMap<ErrorType, u64>,
    retry_histogram: HashMap<u32, u64>,
    duration_sum_ms: f64,
}

/// Aggregated view of recovery processing.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub requeued: u64,
    pub per_queue: HashMap<QueueKind, u64>,
    pub per_error: HashMap<ErrorType, u64>,
    pub retry_histogram: HashMap<u32, u64>,
    pub average_ms: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Collector owned by the recovery engine.
pub struct MetricsCollector {
    state: StdMutex<MetricsState>,
    retention: Duration,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl MetricsCollector {
    pub fn new(retention: Duration) -> Self {
        Self {
            state: StdMutex::new(MetricsState::default()),
            retention,
        }
    }

    /// A DLQ message entered processing.
    pub fn record_received(&self, id: &str, origin: QueueKind) {
        let mut state = self.state.lock().expect("metrics lock");
        state.received += 1;
        *state.per_queue.entry(origin).or_insert(0) += 1;
        state.inflight.insert(id.to_string(), UnixMillis::now());
    }

    /// A message finished one processing pass.
    pub fn record_completed(
        &self,
        id: &str,
        disposition: RecoveryDisposition,
        error_type: ErrorType,
        retry_count: u32,
    ) {
        let now = UnixMillis::now();
        let mut state = self.state.lock().expect("metrics lock");
        let started = state.inflight.remove(id).unwrap_or(now);
        let duration = Duration::from_millis(now.0.saturating_sub(started.0));
        state.processed += 1;
        match disposition {
            RecoveryDisposition::Succeeded => state.succeeded += 1,
            RecoveryDisposition::Failed => state.failed += 1,
            RecoveryDisposition::Requeued => state.requeued += 1,
        }
        *state.per_error.entry(error_type).or_insert(0) += 1;
        *state.retry_histogram.entry(retry_count).or_insert(0) += 1;
        state.duration_sum_ms += duration.as_millis() as f64;
        state.samples.push(Sample {
            completed_at: now,
            duration,
        });
        Self::prune(&mut state, now, self.retention);
    }

    fn prune(state: &mut MetricsState, now: UnixMillis, retention: Duration) {
        let cutoff = now.0.saturating_sub(retention.as_millis() as u64);
        state.samples.retain(|s| s.completed_at.0 >= cutoff);
    }

    /// Current counters plus percentiles over the retained samples.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut state = self.state.lock().expect("metrics lock");
        let now = UnixMillis::now();
        Self::prune(&mut state, now, self.retention);
        let mut durations: Vec<u64> = state
            .samples
            .iter()
            .map(|s| s.duration.as_millis() as u64)
            .collect();
        durations.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if durations.is_empty() {
                return 0;
            }
            let rank = ((p / 100.0) * durations.len() as f64).ceil() as usize;
            durations[rank.clamp(1, durations.len()) - 1]
        };
        MetricsSnapshot {
            received: state.received,
            processed: state.processed,
            succeeded: state.succeeded,
            failed: state.failed,
            requeued: state.requeued,
            per_queue: state.per_queue.clone(),
            per_error: state.per_error.clone(),
            retry_histogram: state.retry_histogram.clone(),
            average_ms: if state.processed == 0 {
                0.0
            } else {
                state.duration_sum_ms / state.processed as f64
            },
            p50_ms: percentile(50.0),
            p95_ms: percentile(95.0),
            p99_ms: percentile(99.0),
        }
    }
}
