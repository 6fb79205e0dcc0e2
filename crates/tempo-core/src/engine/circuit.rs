use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::aggregator::Aggregator;

/// Requests required before the circuit breaker evaluates the error rate,
/// suppressing noise from a handful of early transport errors (§4.6).
const WARMUP_FLOOR: u64 = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Shared flag set when the circuit breaker trips, read by the supervisor
/// at finalization to populate `stopped_by_circuit`.
#[derive(Default)]
pub struct CircuitFlag(AtomicBool);

impl CircuitFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(false)))
    }

    pub fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn trip(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Polls `aggregator` every two seconds and, once `threshold_pct > 0`,
/// cancels `cancel` and trips `flag` the first time the observed error rate
/// reaches `threshold_pct` after the warm-up floor (§4.6). Inactive when
/// `threshold_pct == 0`.
pub fn run_circuit_supervisor(
    aggregator: Arc<Aggregator>,
    threshold_pct: f64,
    flag: Arc<CircuitFlag>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if threshold_pct <= 0.0 {
            return;
        }
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let snap = aggregator.snapshot().await;
                    if snap.total >= WARMUP_FLOOR && snap.error_rate >= threshold_pct {
                        flag.trip();
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    })
}
