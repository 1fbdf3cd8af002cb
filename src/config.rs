use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Bounds the whole request, body included.
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "feed-ingest/0.1".to_string(),
            timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Upper bound on feeds being processed at once.
    pub max_concurrent_fetches: usize,
    /// Extra attempts for timeouts and connection failures.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}
