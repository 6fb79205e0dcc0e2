//! External interface surface (§6): the operations an adapter such as
//! `tempo-server` exposes over HTTP. Every function here takes the shared
//! collaborators directly rather than bundling them into an app-state
//! type, since that bundling is the adapter's concern, not the engine's.
use std::sync::Arc;

use uuid::Uuid;

use crate::admission::{AdmissionController, StartParams};
use crate::engine::supervisor::{start_run, stop_run};
use crate::engine::{AggregatorSnapshot, TimeSeriesPoint};
use crate::error::TempoError;
use crate::model::RunDescriptor;
use crate::registry::ActiveRunRegistry;
use crate::results::{self, HistoricalMetrics, ReportData};
use crate::store::Store;

/// Number of most-recent runs returned by [`history`] (§6).
const HISTORY_LIMIT: u32 = 10;

/// Starts a new run: validates and admits `params`, persists the
/// descriptor, and spawns it in the background. Returns the descriptor
/// with its opaque `id` and durable `internal_key` populated.
pub async fn start(
    caller: &str,
    params: StartParams,
    store: Arc<Store>,
    registry: Arc<ActiveRunRegistry>,
    admission: Arc<AdmissionController>,
) -> Result<RunDescriptor, TempoError> {
    let descriptor = admission.admit(caller, params, &registry).await?;
    start_run(
        descriptor,
        store,
        Arc::clone(&registry),
        admission,
        caller.to_string(),
    )
    .await
}

/// Requests that a live run stop and waits for it to finalize, returning
/// the finalized descriptor. Idempotent after the run has already
/// finalized, which returns [`TempoError::NotFound`].
pub async fn stop(store: &Store, registry: &ActiveRunRegistry, run_id: Uuid) -> Result<RunDescriptor, TempoError> {
    stop_run(store, registry, run_id).await
}

/// Fetches a run's durable descriptor, live or historical.
pub async fn status(store: &Store, run_id: Uuid) -> Result<RunDescriptor, TempoError> {
    store
        .get_run(run_id)
        .await?
        .ok_or_else(|| TempoError::NotFound(run_id.to_string()))
}

/// Reads a live run's in-flight aggregate snapshot directly from the
/// registry, without touching durable storage.
pub async fn live_metrics(
    registry: &ActiveRunRegistry,
    run_id: Uuid,
) -> Result<AggregatorSnapshot, TempoError> {
    let handle = registry
        .get(run_id)
        .await
        .ok_or_else(|| TempoError::NotFound(run_id.to_string()))?;
    Ok(handle.aggregator.snapshot().await)
}

/// Reads a live run's in-flight per-second time series.
pub async fn live_timeseries(
    registry: &ActiveRunRegistry,
    run_id: Uuid,
) -> Result<Vec<TimeSeriesPoint>, TempoError> {
    let handle = registry
        .get(run_id)
        .await
        .ok_or_else(|| TempoError::NotFound(run_id.to_string()))?;
    Ok(handle.aggregator.timeseries().await)
}

/// Lists every currently active run, newest first.
pub async fn list_running(store: &Store) -> Result<Vec<RunDescriptor>, TempoError> {
    store.list_running().await
}

/// Lists the most recent finished runs (§6).
pub async fn history(store: &Store) -> Result<Vec<RunDescriptor>, TempoError> {
    store.list_history(HISTORY_LIMIT).await
}

/// Reconstructs historical metrics — full-sample percentiles and a
/// per-second series — for a finished (or in-flight) run.
pub async fn historical_metrics(store: &Store, run_id: Uuid) -> Result<HistoricalMetrics, TempoError> {
    results::historical_metrics(store, run_id).await
}

/// Builds the structured report artifact for a run; rendering it into a
/// document is left to the adapter.
pub async fn generate_report(store: &Store, run_id: Uuid) -> Result<ReportData, TempoError> {
    results::generate_report(store, run_id).await
}
