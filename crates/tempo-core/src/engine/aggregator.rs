use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Bound on the latency reservoir (§4.3, §8 invariant 3).
const RESERVOIR_CAPACITY: usize = 10_000;
/// Bound on the rolling time-series ring (§4.3, §8 invariant 3).
const RING_CAPACITY: usize = 3_600;
/// Trailing window used by the sampler to compute a rolling average latency.
const SAMPLER_AVG_WINDOW: usize = 100;

// ---------------------------------------------------------------------------
// AggregatorSnapshot
// ---------------------------------------------------------------------------

/// A point-in-time, internally consistent read of the aggregator (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AggregatorSnapshot {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate: f64,
    pub instantaneous_rps: f64,
    pub rolling_avg_rps: f64,
    pub elapsed_seconds: f64,
}

/// A single point on the rolling time series (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeSeriesPoint {
    pub second: u64,
    pub rps: f64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Reservoir — bounded sliding window of raw latencies
// ---------------------------------------------------------------------------

struct Reservoir {
    samples: std::collections::VecDeque<f64>,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(RESERVOIR_CAPACITY),
        }
    }

    fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == RESERVOIR_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }
}

// ---------------------------------------------------------------------------
// Ring — bounded sliding window of time-series points
// ---------------------------------------------------------------------------

struct Ring {
    points: std::collections::VecDeque<TimeSeriesPoint>,
}

impl Ring {
    fn new() -> Self {
        Self {
            points: std::collections::VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    fn push(&mut self, point: TimeSeriesPoint) {
        if self.points.len() == RING_CAPACITY {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Lock-free counters plus a reservoir/ring pair guarded by one read-write
/// lock (§4.3). Held behind an `Arc` and shared by every virtual user, the
/// rolling-series sampler, and the circuit supervisor for a single run.
pub struct Aggregator {
    total: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    start: Instant,
    window: RwLock<AggregatorWindow>,
}

struct AggregatorWindow {
    reservoir: Reservoir,
    ring: Ring,
    prev_total: u64,
    prev_tick: Instant,
}

impl Aggregator {
    pub fn new() -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            error: AtomicU64::new(0),
            start: now,
            window: RwLock::new(AggregatorWindow {
                reservoir: Reservoir::new(),
                ring: Ring::new(),
                prev_total: 0,
                prev_tick: now,
            }),
        })
    }

    /// Records a single completed request's outcome (§4.3 record contract).
    /// `status` is accepted per the public operation's signature but, per
    /// §4.3 ("status code is not aggregated by the core beyond the success
    /// flag"), is not folded into any counter.
    pub async fn record(&self, latency_ms: f64, success: bool, _status: u16) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = self.window.write().await;
        window.reservoir.push(latency_ms);
    }

    /// Starts the once-per-second rolling-series sampler. Returns the task
    /// handle; the caller is responsible for aborting it via `cancel`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let agg = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        agg.sample_tick().await;
                    }
                }
            }
        })
    }

    async fn sample_tick(&self) {
        let now = Instant::now();
        let total_now = self.total.load(Ordering::Relaxed);
        let success_now = self.success.load(Ordering::Relaxed);

        let mut window = self.window.write().await;
        let elapsed_since_last = now.duration_since(window.prev_tick).as_secs_f64();
        if elapsed_since_last <= 0.0 {
            return;
        }

        let rps = (total_now.saturating_sub(window.prev_total)) as f64 / elapsed_since_last;
        let avg_latency_ms = {
            let n = window.reservoir.samples.len().min(SAMPLER_AVG_WINDOW);
            if n == 0 {
                0.0
            } else {
                let sum: f64 = window.reservoir.samples.iter().rev().take(n).sum();
                sum / n as f64
            }
        };
        let success_rate = if total_now > 0 {
            100.0 * success_now as f64 / total_now as f64
        } else {
            0.0
        };

        let second = self.start.elapsed().as_secs();
        window.ring.push(TimeSeriesPoint {
            second,
            rps,
            avg_latency_ms,
            success_rate,
        });
        window.prev_total = total_now;
        window.prev_tick = now;
    }

    /// Returns a consistent snapshot (§4.3). Percentiles are computed fresh
    /// from a copied-and-sorted reservoir; nothing is cached.
    pub async fn snapshot(&self) -> AggregatorSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let error = self.error.load(Ordering::Relaxed);

        let sorted = {
            let window = self.window.read().await;
            let mut v: Vec<f64> = window.reservoir.samples.iter().copied().collect();
            v.sort_by(|a, b| a.partial_cmp(b).unwrap());
            v
        };

        let (min_ms, max_ms, avg_ms) = if sorted.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = sorted.iter().sum();
            (
                sorted[0],
                sorted[sorted.len() - 1],
                sum / sorted.len() as f64,
            )
        };

        let elapsed_seconds = self.start.elapsed().as_secs_f64();
        let instantaneous_rps = {
            let window = self.window.read().await;
            window.ring.points.back().map(|p| p.rps).unwrap_or(0.0)
        };
        let rolling_avg_rps = if elapsed_seconds > 0.0 {
            total as f64 / elapsed_seconds
        } else {
            0.0
        };
        let error_rate = if total > 0 {
            100.0 * error as f64 / total as f64
        } else {
            0.0
        };

        AggregatorSnapshot {
            total,
            success,
            error,
            min_ms,
            max_ms,
            avg_ms,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            error_rate,
            instantaneous_rps,
            rolling_avg_rps,
            elapsed_seconds,
        }
    }

    /// Returns a copy of the rolling time series (§4.3).
    pub async fn timeseries(&self) -> Vec<TimeSeriesPoint> {
        let window = self.window.read().await;
        window.ring.points.iter().cloned().collect()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// `floor(len × P/100)`, clamped into range, per §4.3. `sorted` must already
/// be sorted ascending.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * (p / 100.0)).floor() as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_updates_counters() {
        let agg = Aggregator::new();
        agg.record(10.0, true, 200).await;
        agg.record(20.0, false, 500).await;
        let snap = agg.snapshot().await;
        assert_eq!(snap.total, 2);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.error, 1);
    }

    #[tokio::test]
    async fn snapshot_min_avg_max_ordering_holds() {
        let agg = Aggregator::new();
        for ms in [5.0, 50.0, 100.0, 10.0] {
            agg.record(ms, true, 200).await;
        }
        let snap = agg.snapshot().await;
        assert!(snap.min_ms <= snap.avg_ms);
        assert!(snap.avg_ms <= snap.max_ms);
        assert_eq!(snap.min_ms, 5.0);
        assert_eq!(snap.max_ms, 100.0);
    }

    #[tokio::test]
    async fn percentile_monotonicity_holds() {
        let agg = Aggregator::new();
        for ms in 1..=100 {
            agg.record(ms as f64, true, 200).await;
        }
        let snap = agg.snapshot().await;
        assert!(snap.p50_ms <= snap.p95_ms);
        assert!(snap.p95_ms <= snap.p99_ms);
    }

    #[tokio::test]
    async fn percentile_empty_reservoir_is_zero() {
        let agg = Aggregator::new();
        let snap = agg.snapshot().await;
        assert_eq!(snap.p50_ms, 0.0);
        assert_eq!(snap.p99_ms, 0.0);
    }

    #[test]
    fn percentile_uses_floor_index() {
        let sorted: Vec<f64> = (1..=10).map(|n| n as f64).collect();
        // floor(10 * 0.5) = 5 -> index 5 -> value 6
        assert_eq!(percentile(&sorted, 50.0), 6.0);
        // floor(10 * 0.99) = 9 -> index 9 -> value 10
        assert_eq!(percentile(&sorted, 99.0), 10.0);
    }

    #[tokio::test]
    async fn reservoir_respects_capacity_bound() {
        let agg = Aggregator::new();
        for i in 0..(RESERVOIR_CAPACITY + 100) {
            agg.record(i as f64, true, 200).await;
        }
        let window = agg.window.read().await;
        assert_eq!(window.reservoir.samples.len(), RESERVOIR_CAPACITY);
    }

    #[tokio::test]
    async fn error_rate_zero_when_no_requests() {
        let agg = Aggregator::new();
        let snap = agg.snapshot().await;
        assert_eq!(snap.error_rate, 0.0);
    }

    #[tokio::test]
    async fn error_rate_reflects_failures() {
        let agg = Aggregator::new();
        for _ in 0..5 {
            agg.record(1.0, true, 200).await;
        }
        for _ in 0..5 {
            agg.record(1.0, false, 500).await;
        }
        let snap = agg.snapshot().await;
        assert_eq!(snap.error_rate, 50.0);
    }

    #[tokio::test]
    async fn sampler_stops_on_cancellation() {
        let agg = Aggregator::new();
        let cancel = CancellationToken::new();
        let handle = agg.start(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("sampler task should exit promptly after cancellation")
            .unwrap();
    }
}
