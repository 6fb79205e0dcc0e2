//! Historical reconstruction from durable samples: percentiles over the
//! complete stored stream (distinct from the live reservoir's recency
//! bias) and per-second time-series buckets (§6, §8 invariant 10, §9).
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TempoError;
use crate::model::RunDescriptor;
use crate::store::Store;

/// A single whole-second bucket reconstructed from stored samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeBucket {
    pub second: u64,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

/// Historical metrics for a completed (or in-flight) run, computed over
/// every sample in durable storage rather than the live reservoir.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HistoricalMetrics {
    pub descriptor: RunDescriptor,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate: f64,
    pub series: Vec<TimeBucket>,
}

/// A report artifact for a completed run; rendering (PDF/HTML/etc.) is an
/// external concern, so this carries the structured data a renderer needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReportData {
    pub descriptor: RunDescriptor,
    pub metrics: HistoricalMetrics,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Reconstructs historical metrics for `run_id` from every stored sample.
pub async fn historical_metrics(store: &Store, run_id: Uuid) -> Result<HistoricalMetrics, TempoError> {
    let descriptor = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| TempoError::NotFound(run_id.to_string()))?;
    let run_key = descriptor
        .internal_key
        .ok_or_else(|| TempoError::Internal("run missing internal key".to_string()))?;
    let samples = store.query_samples(run_key).await?;

    let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let errors = samples.iter().filter(|s| !s.success).count() as u64;
    let total = samples.len() as u64;
    let error_rate = if total > 0 {
        100.0 * errors as f64 / total as f64
    } else {
        0.0
    };

    let series = reconstruct_series(&samples, descriptor.started_at);

    Ok(HistoricalMetrics {
        descriptor,
        p50_ms: percentile(&latencies, 50.0),
        p95_ms: percentile(&latencies, 95.0),
        p99_ms: percentile(&latencies, 99.0),
        error_rate,
        series,
    })
}

/// Generates the structured report artifact for a completed run.
pub async fn generate_report(store: &Store, run_id: Uuid) -> Result<ReportData, TempoError> {
    let metrics = historical_metrics(store, run_id).await?;
    Ok(ReportData {
        descriptor: metrics.descriptor.clone(),
        metrics,
        generated_at: chrono::Utc::now(),
    })
}

/// Groups samples by whole-second offset from `started_at`, producing at
/// most `duration + 1` non-empty buckets, sorted by second (§8 invariant
/// 10).
fn reconstruct_series(
    samples: &[crate::model::RequestSample],
    started_at: chrono::DateTime<chrono::Utc>,
) -> Vec<TimeBucket> {
    use std::collections::BTreeMap;

    let mut buckets: BTreeMap<u64, (u64, u64, f64)> = BTreeMap::new();
    for sample in samples {
        let offset_ms = (sample.completed_at - started_at).num_milliseconds().max(0);
        let second = (offset_ms / 1000) as u64;
        let entry = buckets.entry(second).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if !sample.success {
            entry.1 += 1;
        }
        entry.2 += sample.latency_ms;
    }

    buckets
        .into_iter()
        .map(|(second, (requests, errors, sum_ms))| TimeBucket {
            second,
            requests,
            errors,
            avg_latency_ms: if requests > 0 {
                sum_ms / requests as f64
            } else {
                0.0
            },
        })
        .collect()
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * (p / 100.0)).floor() as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}
