use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::aggregator::Aggregator;
use crate::model::{AuthConfig, HttpMethod, RequestSample};
use crate::store::Store;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The static, per-run request template every virtual user repeats.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub target: String,
    pub method: HttpMethod,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub auth: Option<AuthConfig>,
}

/// Runs a single virtual user until `cancel` fires: issue the run's
/// templated request at a paced rate of `rate_per_sec` requests/second
/// (§4.4), recording each completion into `aggregator` and `store`.
pub async fn run_virtual_user(
    client: Arc<reqwest::Client>,
    template: Arc<RequestTemplate>,
    rate_per_sec: u32,
    run_key: i64,
    aggregator: Arc<Aggregator>,
    store: Arc<Store>,
    cancel: CancellationToken,
) {
    let period_ms = (1000 / rate_per_sec.max(1)) as u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if cancel.is_cancelled() {
                    return;
                }
                let sample = execute_once(&client, &template, run_key, &cancel).await;
                if let Some(sample) = sample {
                    aggregator.record(sample.latency_ms, sample.success, sample.status_code).await;
                    if let Err(err) = store.append_sample(sample).await {
                        debug!(error = %err, "failed to persist sample");
                    }
                }
            }
        }
    }
}

/// Executes a single request and returns the resulting sample, or `None`
/// if cancellation raced with dispatch.
async fn execute_once(
    client: &reqwest::Client,
    template: &RequestTemplate,
    run_key: i64,
    cancel: &CancellationToken,
) -> Option<RequestSample> {
    if cancel.is_cancelled() {
        return None;
    }

    let start = Instant::now();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return None,
        result = tokio::time::timeout(REQUEST_TIMEOUT, send(client, template)) => result,
    };
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (success, status_code) = match outcome {
        Ok(Ok(status)) => (status < 400, status),
        Ok(Err(_)) | Err(_) => (false, 0),
    };

    Some(RequestSample {
        run_key,
        completed_at: Utc::now(),
        latency_ms,
        success,
        status_code,
    })
}

/// Builds and sends the templated request, draining the body regardless of
/// outcome to release the connection, and returns the status code.
async fn send(client: &reqwest::Client, template: &RequestTemplate) -> Result<u16, reqwest::Error> {
    let mut builder = client.request(template.method.as_reqwest(), &template.target);

    let has_explicit_content_type = template
        .headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("content-type"));

    for (key, value) in &template.headers {
        builder = builder.header(key, value);
    }

    if let Some(body) = &template.body {
        if !has_explicit_content_type && defaults_to_json_body(template.method) {
            builder = builder.header("Content-Type", "application/json");
        }
        builder = builder.body(body.clone());
    }

    builder = apply_auth(builder, template.auth.as_ref());

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let _ = response.bytes().await;
    Ok(status)
}

/// Whether a body-bearing request gets an implicit `application/json`
/// content type: only POST/PUT/PATCH default it (§4.4); DELETE and
/// OPTIONS may carry a body but never get the implicit header.
fn defaults_to_json_body(method: HttpMethod) -> bool {
    matches!(method, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
}

/// Applies the run's auth configuration to an outbound request (§6).
fn apply_auth(
    mut builder: reqwest::RequestBuilder,
    auth: Option<&AuthConfig>,
) -> reqwest::RequestBuilder {
    match auth {
        Some(AuthConfig::Jwt { token }) if !token.is_empty() => {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        Some(AuthConfig::Basic { username, password })
            if !username.is_empty() && !password.is_empty() =>
        {
            use base64::Engine as _;
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            builder = builder.header("Authorization", format!("Basic {encoded}"));
        }
        Some(AuthConfig::Header { name, value, extra }) => {
            builder = builder.header(name, value);
            for (k, v) in extra {
                builder = builder.header(k, v);
            }
        }
        _ => {}
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(method: HttpMethod, body: Option<&str>) -> RequestTemplate {
        RequestTemplate {
            target: "https://example.com".to_string(),
            method,
            body: body.map(|s| s.to_string()),
            headers: HashMap::new(),
            auth: None,
        }
    }

    #[test]
    fn jwt_auth_applies_bearer_header() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let built = apply_auth(
            builder,
            Some(&AuthConfig::Jwt {
                token: "tok123".to_string(),
            }),
        )
        .build()
        .unwrap();
        assert_eq!(
            built.headers().get("Authorization").unwrap(),
            "Bearer tok123"
        );
    }

    #[test]
    fn empty_jwt_token_is_not_applied() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let built = apply_auth(
            builder,
            Some(&AuthConfig::Jwt {
                token: String::new(),
            }),
        )
        .build()
        .unwrap();
        assert!(built.headers().get("Authorization").is_none());
    }

    #[test]
    fn basic_auth_encodes_credentials() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let built = apply_auth(
            builder,
            Some(&AuthConfig::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        )
        .build()
        .unwrap();
        let header = built.headers().get("Authorization").unwrap();
        assert!(header.to_str().unwrap().starts_with("Basic "));
    }

    #[test]
    fn header_auth_sets_named_header_and_extras() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let mut extra = HashMap::new();
        extra.insert("X-Trace".to_string(), "abc".to_string());
        let built = apply_auth(
            builder,
            Some(&AuthConfig::Header {
                name: "X-Api-Key".to_string(),
                value: "secret".to_string(),
                extra,
            }),
        )
        .build()
        .unwrap();
        assert_eq!(built.headers().get("X-Api-Key").unwrap(), "secret");
        assert_eq!(built.headers().get("X-Trace").unwrap(), "abc");
    }

    #[test]
    fn no_auth_leaves_headers_untouched() {
        let client = reqwest::Client::new();
        let builder = client.get("https://example.com");
        let built = apply_auth(builder, None).build().unwrap();
        assert!(built.headers().get("Authorization").is_none());
    }

    #[tokio::test]
    async fn request_template_round_trips_through_builder() {
        let _ = template(HttpMethod::Post, Some("{}"));
    }

    #[test]
    fn json_body_default_applies_only_to_post_put_patch() {
        assert!(defaults_to_json_body(HttpMethod::Post));
        assert!(defaults_to_json_body(HttpMethod::Put));
        assert!(defaults_to_json_body(HttpMethod::Patch));
        assert!(!defaults_to_json_body(HttpMethod::Delete));
        assert!(!defaults_to_json_body(HttpMethod::Options));
        assert!(!defaults_to_json_body(HttpMethod::Get));
        assert!(!defaults_to_json_body(HttpMethod::Head));
    }
}
