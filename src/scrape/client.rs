// scrape/client.rs
// Polite HTTP client: timeouts, jittered backoff, mirror failover

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::sites::Site;
use crate::config::ScraperConfig;
use crate::error::{BotError, Result};
use crate::metrics::Metrics;

/// Backoff base for the first retry.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Hard cap on simultaneous upstream requests across all sites.
const MAX_INFLIGHT: usize = 8;

/// Shared scrape client. Never touches the store; per-entity adapters
/// consume it and turn HTML into records.
pub struct ScrapeClient {
    http: reqwest::Client,
    base_urls: HashMap<Site, Vec<String>>,
    config: ScraperConfig,
    inflight: Semaphore,
    /// Per-site timestamp of the last request, for the politeness delay.
    last_request: Mutex<HashMap<Site, Instant>>,
    metrics: Arc<Metrics>,
}

impl ScrapeClient {
    pub fn new(
        http: reqwest::Client,
        base_urls: HashMap<Site, Vec<String>>,
        config: ScraperConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            http,
            base_urls,
            config,
            inflight: Semaphore::new(MAX_INFLIGHT),
            last_request: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Mirror base URLs for a site, failover order.
    pub fn base_urls(&self, site: Site) -> &[String] {
        self.base_urls.get(&site).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fetch `path` from `site`, walking the mirror list. Each mirror gets
    /// `max_retries + 1` attempts with jittered exponential backoff; the
    /// retry counter resets on failover. Fails only when the last mirror is
    /// exhausted.
    pub async fn get(&self, ctx: &CancellationToken, site: Site, path: &str) -> Result<String> {
        let mirrors = self.base_urls(site);
        if mirrors.is_empty() {
            return Err(BotError::Config(format!("no base URLs for site {site}")));
        }

        let mut last_error = None;
        for base in mirrors {
            let url = format!("{base}{path}");
            match self.get_with_retries(ctx, site, &url).await {
                Ok(body) => return Ok(body),
                Err(BotError::Cancelled) => return Err(BotError::Cancelled),
                Err(e) => {
                    tracing::warn!(site = %site, url, error = %e, "mirror exhausted, failing over");
                    last_error = Some(e);
                }
            }
        }
        self.metrics
            .scrape_failures
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(last_error.unwrap_or_else(|| BotError::Upstream("all mirrors exhausted".into())))
    }

    /// Fetch an absolute URL and parse it as an HTML document.
    ///
    /// The parsed DOM is not `Send`; consume it before the next await point.
    pub async fn get_document(
        &self,
        ctx: &CancellationToken,
        site: Site,
        url: &str,
    ) -> Result<scraper::Html> {
        let body = self.get_with_retries(ctx, site, url).await?;
        Ok(scraper::Html::parse_document(&body))
    }

    /// One mirror's retry loop.
    async fn get_with_retries(
        &self,
        ctx: &CancellationToken,
        site: Site,
        url: &str,
    ) -> Result<String> {
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt, self.config.max_delay);
                tracing::debug!(url, attempt, ?delay, "retrying after backoff");
                sleep_or_cancel(ctx, delay).await?;
            }

            match self.attempt(ctx, site, url).await {
                Ok(body) => {
                    self.metrics
                        .scrape_success
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(body);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    if attempt == self.config.max_retries {
                        return Err(e);
                    }
                    tracing::debug!(url, attempt, error = %e, "transient upstream failure");
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    /// One HTTP attempt: politeness delay, concurrency cap, request, and
    /// retryability classification.
    async fn attempt(
        &self,
        ctx: &CancellationToken,
        site: Site,
        url: &str,
    ) -> std::result::Result<String, AttemptError> {
        self.polite_wait(ctx, site).await.map_err(AttemptError::Fatal)?;

        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| AttemptError::Fatal(BotError::Cancelled))?;

        self.metrics
            .scrape_attempts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let request = self.http.get(url).timeout(self.config.timeout).send();
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(AttemptError::Fatal(BotError::Cancelled)),
            r = request => r,
        };

        let response = match response {
            Ok(r) => r,
            // Transport errors (refused, reset, timeout) are retryable
            Err(e) => return Err(AttemptError::Transient(BotError::Upstream(e.to_string()))),
        };

        let status = response.status();
        if status.is_success() {
            let body = tokio::select! {
                _ = ctx.cancelled() => return Err(AttemptError::Fatal(BotError::Cancelled)),
                b = response.text() => b,
            };
            return body
                .map_err(|e| AttemptError::Transient(BotError::Upstream(e.to_string())));
        }

        if is_retryable_status(status) {
            Err(AttemptError::Transient(BotError::Upstream(format!(
                "upstream returned {status}"
            ))))
        } else {
            // 4xx other than 429: the request itself is wrong, retrying
            // cannot help.
            Err(AttemptError::Fatal(BotError::Upstream(format!(
                "upstream rejected request: {status}"
            ))))
        }
    }

    /// Enforce the minimum inter-request delay per site. The per-site lock
    /// is held across the sleep, which also serializes request spacing.
    async fn polite_wait(&self, ctx: &CancellationToken, site: Site) -> Result<()> {
        if self.config.min_delay.is_zero() {
            return Ok(());
        }
        let mut last = self.last_request.lock().await;
        if let Some(&prev) = last.get(&site) {
            let since = prev.elapsed();
            if since < self.config.min_delay {
                sleep_or_cancel(ctx, self.config.min_delay - since).await?;
            }
        }
        last.insert(site, Instant::now());
        Ok(())
    }
}

enum AttemptError {
    /// Retry with backoff
    Transient(BotError),
    /// Abort this mirror immediately
    Fatal(BotError),
}

/// Retry on 5xx and 429 only.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Jittered exponential backoff: base 1s doubling per attempt, capped, with
/// up to 50% random jitter added.
fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
    let capped = exp.min(cap);
    let jitter = capped.mul_f64(rand::rng().random_range(0.0..0.5));
    (capped + jitter).min(cap)
}

/// Sleep that aborts immediately when the token fires.
async fn sleep_or_cancel(ctx: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(BotError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
