//! Admission control (C8, §4.8): caller rate limiting, capacity caps, and
//! parameter validation ahead of every run start.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::TempoError;
use crate::host::validate_target;
use crate::model::{HttpMethod, RunDescriptor};
use crate::registry::ActiveRunRegistry;

/// Minimum interval between successful starts from the same caller.
const START_RATE_SECS: u64 = 5;
/// Global cap on concurrently active runs.
const GLOBAL_CAP: usize = 50;
/// Per-caller cap on concurrently active runs.
const PER_CALLER_CAP: usize = 3;
/// How often the prune task sweeps stale per-caller entries.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);
/// Entries older than this are pruned.
const STALE_AFTER: Duration = Duration::from_secs(3600);

const USERS_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
const DURATION_RANGE: std::ops::RangeInclusive<u32> = 1..=300;
const RAMP_MAX: u32 = 300;
const CONCURRENCY_RANGE: std::ops::RangeInclusive<u32> = 1..=100;
const DEFAULT_CONCURRENCY: u32 = 10;

/// Caller-supplied parameters for a start request, pre-validation.
#[derive(Debug, Clone)]
pub struct StartParams {
    pub target: String,
    pub users: u32,
    pub ramp_up_secs: u32,
    pub duration_secs: u32,
    pub method: HttpMethod,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub max_concurrent_requests: Option<u32>,
    pub error_threshold_pct: Option<f64>,
    pub auth: Option<crate::model::AuthConfig>,
}

struct CallerState {
    last_start: Instant,
    run_ids: Vec<Uuid>,
}

/// Tracks per-caller start times and active run ids, plus the global cap.
pub struct AdmissionController {
    callers: Mutex<HashMap<String, CallerState>>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            callers: Mutex::new(HashMap::new()),
        }
    }

    /// Validates and admits a start request, returning a running descriptor
    /// ready for persistence. Does not mutate the registry; the caller
    /// (the supervisor) inserts the descriptor and the handle atomically
    /// once storage confirms the write.
    pub async fn admit(
        &self,
        caller: &str,
        params: StartParams,
        registry: &ActiveRunRegistry,
    ) -> Result<RunDescriptor, TempoError> {
        self.check_rate_limit(caller).await?;
        self.check_capacity(caller, registry).await?;

        let users = params.users;
        if !USERS_RANGE.contains(&users) {
            return Err(TempoError::Validation(format!(
                "users must be in [{}, {}]",
                USERS_RANGE.start(),
                USERS_RANGE.end()
            )));
        }
        if !DURATION_RANGE.contains(&params.duration_secs) {
            return Err(TempoError::Validation(format!(
                "duration must be in [{}, {}]",
                DURATION_RANGE.start(),
                DURATION_RANGE.end()
            )));
        }
        if params.ramp_up_secs > RAMP_MAX || params.ramp_up_secs > params.duration_secs {
            return Err(TempoError::Validation(
                "ramp must be <= 300 and <= duration".to_string(),
            ));
        }
        if params.body.is_some() && !params.method.allows_body() {
            return Err(TempoError::Validation(format!(
                "{} does not permit a request body",
                params.method
            )));
        }

        let max_concurrent_requests = params
            .max_concurrent_requests
            .unwrap_or(DEFAULT_CONCURRENCY)
            .clamp(*CONCURRENCY_RANGE.start(), *CONCURRENCY_RANGE.end());
        let error_threshold_pct = params.error_threshold_pct.unwrap_or(0.0).clamp(0.0, 100.0);

        let normalized_target = validate_target(&params.target)?;

        let descriptor = RunDescriptor::new_running(
            normalized_target,
            false,
            users,
            params.ramp_up_secs,
            params.duration_secs,
            params.method,
            params.body,
            params.headers,
            max_concurrent_requests,
            error_threshold_pct,
            params.auth,
        );

        self.record_start(caller, descriptor.id).await;
        Ok(descriptor)
    }

    async fn check_rate_limit(&self, caller: &str) -> Result<(), TempoError> {
        let callers = self.callers.lock().await;
        if let Some(state) = callers.get(caller) {
            let elapsed = state.last_start.elapsed();
            if elapsed < Duration::from_secs(START_RATE_SECS) {
                return Err(TempoError::RateLimited {
                    retry_after_secs: START_RATE_SECS - elapsed.as_secs(),
                });
            }
        }
        Ok(())
    }

    async fn check_capacity(
        &self,
        caller: &str,
        registry: &ActiveRunRegistry,
    ) -> Result<(), TempoError> {
        if registry.len().await >= GLOBAL_CAP {
            return Err(TempoError::Admission(
                "global active-run capacity reached".to_string(),
            ));
        }
        let callers = self.callers.lock().await;
        if let Some(state) = callers.get(caller) {
            let active = registry.count_matching(&state.run_ids).await;
            if active >= PER_CALLER_CAP {
                return Err(TempoError::Admission(
                    "per-caller active-run capacity reached".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn record_start(&self, caller: &str, run_id: Uuid) {
        let mut callers = self.callers.lock().await;
        let state = callers.entry(caller.to_string()).or_insert_with(|| CallerState {
            last_start: Instant::now(),
            run_ids: Vec::new(),
        });
        state.last_start = Instant::now();
        state.run_ids.push(run_id);
    }

    /// Releases bookkeeping for a finished run so its slot no longer
    /// counts against the caller's cap.
    pub async fn release(&self, caller: &str) {
        let mut callers = self.callers.lock().await;
        if let Some(state) = callers.get_mut(caller) {
            // Finished runs are pruned lazily via registry membership checks,
            // but dropping obviously-stale entries here keeps the vec short.
            if state.run_ids.len() > PER_CALLER_CAP * 4 {
                state.run_ids.clear();
            }
        }
    }

    /// Spawns the background task that prunes per-caller entries whose
    /// last start was over an hour ago (§4.8).
    pub fn spawn_pruner(self: &std::sync::Arc<Self>, cancel: CancellationToken) {
        let controller = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut callers = controller.callers.lock().await;
                        let before = callers.len();
                        callers.retain(|_, state| state.last_start.elapsed() < STALE_AFTER);
                        debug!(pruned = before - callers.len(), "pruned stale caller entries");
                    }
                }
            }
        });
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}
