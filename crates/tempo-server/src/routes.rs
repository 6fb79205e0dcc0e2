//! HTTP routing: the thin adapter wiring `tempo_core::control` to JSON
//! over HTTP. Route paths are our own invention; only the request and
//! response shapes are fixed by the external interface contract.
use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tempo_core::admission::StartParams;
use tempo_core::control;
use tempo_core::model::{AuthConfig, HttpMethod, RunDescriptor};
use tempo_core::TempoError;

use crate::state::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CALLER_HEADER: &str = "x-caller-id";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(start_run).get(list_running))
        .route("/runs/:id", get(get_status))
        .route("/runs/:id/stop", post(stop_run))
        .route("/runs/:id/metrics", get(get_live_metrics))
        .route("/runs/:id/timeseries", get(get_live_timeseries))
        .route("/runs/:id/historical", get(get_historical_metrics))
        .route("/runs/:id/report", get(get_report))
        .route("/history", get(get_history))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// A thin wrapper so [`TempoError`] (foreign to this crate) can implement
/// [`IntoResponse`] via a local newtype, mapping each variant to the HTTP
/// status class named in §6.
struct ApiError(TempoError);

impl From<TempoError> for ApiError {
    fn from(err: TempoError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TempoError::Validation(_) => StatusCode::BAD_REQUEST,
            TempoError::Admission(_) => StatusCode::FORBIDDEN,
            TempoError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            TempoError::NotFound(_) => StatusCode::NOT_FOUND,
            TempoError::Storage(_) | TempoError::Io(_) | TempoError::Serde(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            TempoError::Http(_) | TempoError::Engine(_) | TempoError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(&self.0)).into_response()
    }
}

fn caller_id(headers: &HeaderMap) -> String {
    headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Echoes the caller's `X-Request-ID`, generating one if absent (§6).
fn with_request_id(headers: &HeaderMap, mut response: Response) -> Response {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap());
    response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    response
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    target: String,
    users: u32,
    ramp_up_secs: u32,
    duration_secs: u32,
    #[serde(default)]
    method: Option<HttpMethod>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    max_concurrent_requests: Option<u32>,
    #[serde(default)]
    error_threshold_pct: Option<f64>,
    #[serde(default)]
    auth: Option<AuthConfig>,
}

#[derive(Debug, Serialize)]
struct StartRunResponse {
    opaque_id: Uuid,
    internal_key: Option<i64>,
    status: &'static str,
}

async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartRunRequest>,
) -> Response {
    let caller = caller_id(&headers);
    let params = StartParams {
        target: body.target,
        users: body.users,
        ramp_up_secs: body.ramp_up_secs,
        duration_secs: body.duration_secs,
        method: body.method.unwrap_or_default(),
        body: body.body,
        headers: body.headers,
        max_concurrent_requests: body.max_concurrent_requests,
        error_threshold_pct: body.error_threshold_pct,
        auth: body.auth,
    };

    let result = control::start(
        &caller,
        params,
        state.store,
        state.registry,
        state.admission,
    )
    .await
    .map(|descriptor| {
        Json(StartRunResponse {
            opaque_id: descriptor.id,
            internal_key: descriptor.internal_key,
            status: "started",
        })
        .into_response()
    })
    .map_err(ApiError::from)
    .unwrap_or_else(IntoResponse::into_response);

    with_request_id(&headers, result)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    is_running: bool,
    descriptor: RunDescriptor,
}

async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::status(&state.store, id)
        .await
        .map(|descriptor| {
            Json(StatusResponse {
                is_running: descriptor.status == tempo_core::model::RunStatus::Running,
                descriptor,
            })
            .into_response()
        })
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn get_live_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::live_metrics(&state.registry, id)
        .await
        .map(|snapshot| Json(snapshot).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn get_live_timeseries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::live_timeseries(&state.registry, id)
        .await
        .map(|series| Json(series).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn list_running(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let response = control::list_running(&state.store)
        .await
        .map(|runs| Json(runs).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn stop_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::stop(&state.store, &state.registry, id)
        .await
        .map(|descriptor| Json(descriptor).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn get_history(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let response = control::history(&state.store)
        .await
        .map(|runs| Json(runs).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn get_historical_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::historical_metrics(&state.store, id)
        .await
        .map(|metrics| Json(metrics).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

async fn get_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    let response = control::generate_report(&state.store, id)
        .await
        .map(|report| Json(report).into_response())
        .map_err(ApiError::from)
        .unwrap_or_else(IntoResponse::into_response);
    with_request_id(&headers, response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_id_defaults_to_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(caller_id(&headers), "anonymous");
    }

    #[test]
    fn caller_id_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CALLER_HEADER, HeaderValue::from_static("team-a"));
        assert_eq!(caller_id(&headers), "team-a");
    }

    #[test]
    fn validation_error_maps_to_bad_request() {
        let err = ApiError(TempoError::Validation("bad input".to_string()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_error_maps_to_404() {
        let err = ApiError(TempoError::NotFound("abc".to_string()));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err = ApiError(TempoError::RateLimited {
            retry_after_secs: 5,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
