// src/http.rs
// Shared HTTP client for all network operations

use std::time::Duration;

/// Default request timeout for scraping institutional pages
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create the shared HTTP client with appropriate defaults.
///
/// This client should be created once at startup and passed to all modules
/// that need HTTP access. Uses connection pooling internally. Callers that
/// need a different per-request timeout pass it via `RequestBuilder::timeout`.
pub fn create_shared_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
