//! The run descriptor, request sample, and supporting value types (§3).
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// HttpMethod
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

impl HttpMethod {
    /// Methods that MAY carry a request body, per §4.4.
    pub fn allows_body(self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Head)
    }

    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Authentication variants applied to every outbound request (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`, applied only when `token` is non-empty.
    Jwt { token: String },
    /// `Authorization: Basic base64(user:pass)`, applied only when both are present.
    Basic { username: String, password: String },
    /// Set header `name` to `value`, plus any auxiliary headers.
    Header {
        name: String,
        value: String,
        #[serde(default)]
        extra: HashMap<String, String>,
    },
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// RunDescriptor
// ---------------------------------------------------------------------------

/// A single load-test run, identified by an opaque caller-visible `id` and
/// an internal sequential `internal_key` assigned on durable insert.
///
/// Invariants (§3): status transitions are monotonic
/// `running -> (completed | stopped)`; `completed_at` is set iff
/// `status != Running`; aggregate totals are zero until finalization and
/// never decrease during a run; `id` is unique across the store's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunDescriptor {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_key: Option<i64>,

    pub target: String,
    pub mask: bool,

    pub users: u32,
    pub ramp_up_secs: u32,
    pub duration_secs: u32,
    pub method: HttpMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub max_concurrent_requests: u32,
    /// 0 disables the circuit breaker.
    pub error_threshold_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub rps: f64,
    pub stopped_by_circuit: bool,
}

impl RunDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new_running(
        target: String,
        mask: bool,
        users: u32,
        ramp_up_secs: u32,
        duration_secs: u32,
        method: HttpMethod,
        body: Option<String>,
        headers: HashMap<String, String>,
        max_concurrent_requests: u32,
        error_threshold_pct: f64,
        auth: Option<AuthConfig>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            internal_key: None,
            target,
            mask,
            users,
            ramp_up_secs,
            duration_secs,
            method,
            body,
            headers,
            max_concurrent_requests,
            error_threshold_pct,
            auth,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            total_requests: 0,
            success_requests: 0,
            error_requests: 0,
            avg_latency_ms: 0.0,
            min_latency_ms: 0.0,
            max_latency_ms: 0.0,
            rps: 0.0,
            stopped_by_circuit: false,
        }
    }
}

// ---------------------------------------------------------------------------
// RequestSample
// ---------------------------------------------------------------------------

/// A single, append-only per-request outcome (§3). Never mutated once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RequestSample {
    pub run_key: i64,
    pub completed_at: DateTime<Utc>,
    pub latency_ms: f64,
    pub success: bool,
    pub status_code: u16,
}
