use std::time::Duration;

use crate::error::TempoError;

/// Connection-pool and timeout configuration shared by every virtual user
/// in a run; one [`reqwest::Client`] is built per run and cloned cheaply
/// (it is reference-counted internally) across its virtual users.
pub struct ClientConfig {
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("tempo/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Builds the shared [`reqwest::Client`] for a run from `config`.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, TempoError> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .gzip(true)
        .brotli(true)
        .build()?;
    Ok(client)
}
