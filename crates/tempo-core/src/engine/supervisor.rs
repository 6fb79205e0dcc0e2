use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::engine::aggregator::Aggregator;
use crate::engine::circuit::{run_circuit_supervisor, CircuitFlag};
use crate::engine::ramp::run_ramp;
use crate::engine::virtual_user::RequestTemplate;
use crate::error::TempoError;
use crate::http::{build_client, ClientConfig};
use crate::model::{RunDescriptor, RunStatus};
use crate::registry::ActiveRunRegistry;
use crate::store::Store;

/// A live run's cooperative handle, held by the registry so an external
/// stop request can cancel it and live metrics queries can read it (§4.7).
pub struct RunHandle {
    pub cancel: CancellationToken,
    pub aggregator: Arc<Aggregator>,
    pub circuit_flag: Arc<CircuitFlag>,
}

/// Starts a validated, admitted run: persists the descriptor, then drives
/// its full lifecycle on a detached task (§4.7). Returns immediately once
/// the descriptor is durably written; the run itself proceeds in the
/// background.
pub async fn start_run(
    mut descriptor: RunDescriptor,
    store: Arc<Store>,
    registry: Arc<ActiveRunRegistry>,
    admission: Arc<AdmissionController>,
    caller: String,
) -> Result<RunDescriptor, TempoError> {
    let run_key = store.insert_run(&descriptor).await?;
    descriptor.internal_key = Some(run_key);

    let cancel = CancellationToken::new();
    let aggregator = Aggregator::new();
    let circuit_flag = CircuitFlag::new();
    registry
        .insert(
            descriptor.id,
            RunHandle {
                cancel: cancel.clone(),
                aggregator: Arc::clone(&aggregator),
                circuit_flag: Arc::clone(&circuit_flag),
            },
        )
        .await;

    let client = build_client(&ClientConfig::default())?;
    let template = Arc::new(RequestTemplate {
        target: descriptor.target.clone(),
        method: descriptor.method,
        body: descriptor.body.clone(),
        headers: descriptor.headers.clone(),
        auth: descriptor.auth.clone(),
    });

    let run_id = descriptor.id;
    let users = descriptor.users;
    let ramp_up_secs = descriptor.ramp_up_secs;
    let duration_secs = descriptor.duration_secs;
    // M: per-user request start-rate, requests/second (§3, §4.4).
    let rate_per_sec = descriptor.max_concurrent_requests;
    let error_threshold_pct = descriptor.error_threshold_pct;

    tokio::spawn(drive_run(
        run_id,
        run_key,
        users,
        ramp_up_secs,
        duration_secs,
        rate_per_sec,
        error_threshold_pct,
        Arc::new(client),
        template,
        aggregator,
        circuit_flag,
        store,
        registry,
        admission,
        caller,
        cancel,
    ));

    Ok(descriptor)
}

#[allow(clippy::too_many_arguments)]
async fn drive_run(
    run_id: uuid::Uuid,
    run_key: i64,
    users: u32,
    ramp_up_secs: u32,
    duration_secs: u32,
    rate_per_sec: u32,
    error_threshold_pct: f64,
    client: Arc<reqwest::Client>,
    template: Arc<RequestTemplate>,
    aggregator: Arc<Aggregator>,
    circuit_flag: Arc<CircuitFlag>,
    store: Arc<Store>,
    registry: Arc<ActiveRunRegistry>,
    admission: Arc<AdmissionController>,
    caller: String,
    cancel: CancellationToken,
) {
    let sampler = aggregator.start(cancel.clone());
    let circuit = run_circuit_supervisor(
        Arc::clone(&aggregator),
        error_threshold_pct,
        Arc::clone(&circuit_flag),
        cancel.clone(),
    );

    let user_handles = run_ramp(
        users,
        ramp_up_secs,
        rate_per_sec,
        run_key,
        Arc::clone(&client),
        template,
        Arc::clone(&aggregator),
        Arc::clone(&store),
        cancel.clone(),
    )
    .await;

    let deadline = tokio::time::sleep(Duration::from_secs(duration_secs as u64));
    tokio::pin!(deadline);

    let stopped_externally = tokio::select! {
        _ = &mut deadline => false,
        _ = cancel.cancelled() => true,
    };
    cancel.cancel();

    // Bounded drain: virtual users honor cancellation within one request
    // timeout at most.
    let _ = tokio::time::timeout(
        Duration::from_secs(31),
        futures_join_all(user_handles),
    )
    .await;
    let _ = sampler.await;
    let _ = circuit.await;

    let snapshot = aggregator.snapshot().await;
    let elapsed = aggregator.elapsed_seconds().max(0.001);
    let rps = snapshot.total as f64 / elapsed;
    let stopped_by_circuit = circuit_flag.is_tripped();
    let status = if stopped_by_circuit || !stopped_externally {
        RunStatus::Completed
    } else {
        RunStatus::Stopped
    };

    if let Err(err) = store
        .finalize_run(
            run_key,
            status,
            Utc::now(),
            snapshot.total,
            snapshot.success,
            snapshot.error,
            snapshot.avg_ms,
            snapshot.min_ms,
            snapshot.max_ms,
            rps,
            stopped_by_circuit,
        )
        .await
    {
        warn!(error = %err, run_id = %run_id, "failed to persist run finalization");
    } else {
        info!(run_id = %run_id, total = snapshot.total, status = %status, "run finalized");
    }

    registry.remove(run_id).await;
    admission.release(&caller).await;
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Upper bound on how long `stop_run` waits for `drive_run`'s finalization
/// to land before giving up (§4.7's ~31s bounded drain, plus margin).
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(35);
/// Poll interval while waiting for finalization to be persisted.
const FINALIZE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Requests cancellation of a running run and waits for `drive_run` to
/// finalize it, returning the finalized descriptor (§4.7, §6 "stop
/// returns the finalized descriptor"). Idempotent once finalized, since
/// the registry no longer holds a handle after finalization.
pub async fn stop_run(
    store: &Store,
    registry: &ActiveRunRegistry,
    run_id: uuid::Uuid,
) -> Result<RunDescriptor, TempoError> {
    match registry.get(run_id).await {
        Some(handle) => handle.cancel.cancel(),
        None => return Err(TempoError::NotFound(run_id.to_string())),
    }

    let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
    loop {
        let descriptor = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| TempoError::NotFound(run_id.to_string()))?;
        if descriptor.status != RunStatus::Running {
            return Ok(descriptor);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(descriptor);
        }
        tokio::time::sleep(FINALIZE_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_descriptor(target: &str, duration: u32, threshold: f64) -> RunDescriptor {
        RunDescriptor::new_running(
            target.to_string(),
            false,
            1,
            0,
            duration,
            crate::model::HttpMethod::Get,
            None,
            Map::new(),
            10,
            threshold,
            None,
        )
    }

    #[tokio::test]
    async fn start_run_persists_descriptor_and_registers_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = sample_descriptor("https://example.invalid", 1, 0.0);
        let run_id = descriptor.id;
        let started = start_run(
            descriptor,
            Arc::clone(&store),
            Arc::clone(&registry),
            admission,
            "caller-a".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(started.id, run_id);
        assert!(started.internal_key.is_some());
        assert!(registry.get(run_id).await.is_some());
    }

    #[tokio::test]
    async fn stop_run_on_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("t.db")).await.unwrap();
        let registry = ActiveRunRegistry::new();
        let result = stop_run(&store, &registry, uuid::Uuid::new_v4()).await;
        assert!(matches!(result, Err(TempoError::NotFound(_))));
    }

    #[tokio::test]
    async fn stop_run_waits_for_finalized_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = sample_descriptor("https://example.invalid", 60, 0.0);
        let run_id = descriptor.id;
        start_run(
            descriptor,
            Arc::clone(&store),
            Arc::clone(&registry),
            admission,
            "caller-a".to_string(),
        )
        .await
        .unwrap();

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            stop_run(&store, &registry, run_id),
        )
        .await
        .expect("stop_run should not hang")
        .unwrap();

        assert_ne!(stopped.status, RunStatus::Running);
        assert!(registry.get(run_id).await.is_none());
    }

    async fn await_finalized(store: &Store, run_id: uuid::Uuid, timeout: Duration) -> RunDescriptor {
        tokio::time::timeout(timeout, async {
            loop {
                let descriptor = store.get_run(run_id).await.unwrap().unwrap();
                if descriptor.status != RunStatus::Running {
                    return descriptor;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("run should finalize before the test timeout")
    }

    // S1 — small happy path: total ≈ 100 ± 10, success == total, error == 0.
    #[tokio::test]
    async fn scenario_s1_happy_path_throughput() {
        let (addr, server) = crate::engine::test_support::spawn_http_stub(200).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = RunDescriptor::new_running(
            format!("http://{addr}"),
            false,
            5,
            0,
            2,
            crate::model::HttpMethod::Get,
            None,
            Map::new(),
            10,
            0.0,
            None,
        );
        let run_id = descriptor.id;
        start_run(descriptor, Arc::clone(&store), Arc::clone(&registry), admission, "s1".to_string())
            .await
            .unwrap();

        let finalized = await_finalized(&store, run_id, Duration::from_secs(10)).await;
        server.abort();

        assert_eq!(finalized.status, RunStatus::Completed);
        assert!(!finalized.stopped_by_circuit);
        assert_eq!(finalized.success_requests, finalized.total_requests);
        assert_eq!(finalized.error_requests, 0);
        assert!(
            (90..=110).contains(&finalized.total_requests),
            "expected ~100 requests, got {}",
            finalized.total_requests
        );
    }

    // S2 — ramp correctness: final total within the triangular-area bound.
    #[tokio::test]
    async fn scenario_s2_ramp_correctness() {
        let (addr, server) = crate::engine::test_support::spawn_http_stub(200).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = RunDescriptor::new_running(
            format!("http://{addr}"),
            false,
            10,
            5,
            5,
            crate::model::HttpMethod::Get,
            None,
            Map::new(),
            1,
            0.0,
            None,
        );
        let run_id = descriptor.id;
        start_run(descriptor, Arc::clone(&store), Arc::clone(&registry), admission, "s2".to_string())
            .await
            .unwrap();

        let finalized = await_finalized(&store, run_id, Duration::from_secs(15)).await;
        server.abort();

        assert_eq!(finalized.status, RunStatus::Completed);
        assert!(
            (20..=35).contains(&finalized.total_requests),
            "expected total in [20, 35], got {}",
            finalized.total_requests
        );
    }

    // S3 — circuit trip: every call fails, breaker must trip well before
    // the nominal 60s duration elapses.
    #[tokio::test]
    async fn scenario_s3_circuit_trip() {
        let (addr, server) = crate::engine::test_support::spawn_http_stub(500).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = RunDescriptor::new_running(
            format!("http://{addr}"),
            false,
            10,
            0,
            60,
            crate::model::HttpMethod::Get,
            None,
            Map::new(),
            10,
            50.0,
            None,
        );
        let run_id = descriptor.id;
        let started_at = tokio::time::Instant::now();
        start_run(descriptor, Arc::clone(&store), Arc::clone(&registry), admission, "s3".to_string())
            .await
            .unwrap();

        let finalized = await_finalized(&store, run_id, Duration::from_secs(15)).await;
        server.abort();

        assert!(
            started_at.elapsed() < Duration::from_secs(15),
            "circuit should trip well before the nominal 60s duration"
        );
        assert!(finalized.stopped_by_circuit);
        assert_eq!(finalized.status, RunStatus::Completed);
        assert!(finalized.total_requests > 0);
        let error_rate = 100.0 * finalized.error_requests as f64 / finalized.total_requests as f64;
        assert!(error_rate >= 50.0, "expected error_rate >= 50, got {error_rate}");
    }

    // S6 — resume visibility: two live snapshots one second apart must
    // both be internally consistent (non-decreasing counters, percentile
    // monotonicity).
    #[tokio::test]
    async fn scenario_s6_snapshot_consistency() {
        let (addr, server) = crate::engine::test_support::spawn_http_stub(200).await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("t.db")).await.unwrap());
        let registry = Arc::new(ActiveRunRegistry::new());
        let admission = Arc::new(AdmissionController::new());

        let descriptor = RunDescriptor::new_running(
            format!("http://{addr}"),
            false,
            5,
            0,
            5,
            crate::model::HttpMethod::Get,
            None,
            Map::new(),
            10,
            0.0,
            None,
        );
        let run_id = descriptor.id;
        start_run(descriptor, Arc::clone(&store), Arc::clone(&registry), admission, "s6".to_string())
            .await
            .unwrap();

        let handle = registry.get(run_id).await.expect("run should be live");
        let first = handle.aggregator.snapshot().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = handle.aggregator.snapshot().await;

        assert!(second.total >= first.total);
        assert!(second.success >= first.success);
        assert!(second.p50_ms <= second.p95_ms);
        assert!(second.p95_ms <= second.p99_ms);

        let _ = await_finalized(&store, run_id, Duration::from_secs(10)).await;
        server.abort();
    }
}
