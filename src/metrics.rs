// src/metrics.rs
// Process-local counters and gauges, rendered in text exposition format

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// The counters and gauges the core reports. Created once in the
/// composition root; components hold a reference.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_errors: AtomicU64,
    pub not_found: AtomicU64,
    pub rate_limited: AtomicU64,
    pub client_errors: AtomicU64,
    pub handler_errors: AtomicU64,
    pub scrape_attempts: AtomicU64,
    pub scrape_success: AtomicU64,
    pub scrape_failures: AtomicU64,
    pub warmup_units_ok: AtomicU64,
    pub warmup_units_failed: AtomicU64,
    pub webhook_events: AtomicU64,
    pub log_drops: AtomicU64,
    pub integrity_failures: AtomicU64,
    pub index_docs: AtomicI64,
    pub limiter_active_keys: AtomicI64,
}

/// Cache outcome of one handler invocation, for per-request accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Error,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Error => "error",
        }
    }
}

impl Metrics {
    pub fn record_cache(&self, outcome: CacheOutcome) {
        match outcome {
            CacheOutcome::Hit => self.cache_hits.fetch_add(1, Ordering::Relaxed),
            CacheOutcome::Miss => self.cache_misses.fetch_add(1, Ordering::Relaxed),
            CacheOutcome::Error => self.cache_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Render every metric as `name value` lines with HELP/TYPE headers.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &AtomicU64, &str); 14] = [
            ("bot_cache_hits_total", &self.cache_hits, "Cache lookups served from the store"),
            ("bot_cache_misses_total", &self.cache_misses, "Cache lookups that went upstream"),
            ("bot_cache_errors_total", &self.cache_errors, "Store failures during lookups"),
            ("bot_not_found_total", &self.not_found, "Valid queries with no upstream data"),
            ("bot_rate_limited_total", &self.rate_limited, "Requests denied by the rate limiter"),
            ("bot_client_errors_total", &self.client_errors, "Invalid input or missing parameters"),
            ("bot_handler_errors_total", &self.handler_errors, "Handler failures surfaced to users"),
            ("bot_scrape_attempts_total", &self.scrape_attempts, "Upstream HTTP attempts"),
            ("bot_scrape_success_total", &self.scrape_success, "Upstream fetches that succeeded"),
            ("bot_scrape_failures_total", &self.scrape_failures, "Upstream fetches that exhausted every mirror"),
            ("bot_warmup_units_ok_total", &self.warmup_units_ok, "Warmup units refreshed"),
            ("bot_warmup_units_failed_total", &self.warmup_units_failed, "Warmup units that failed"),
            ("bot_webhook_events_total", &self.webhook_events, "Webhook events received"),
            ("bot_integrity_failures_total", &self.integrity_failures, "Store integrity check failures"),
        ];
        for (name, value, help) in counters {
            render_metric(&mut out, name, "counter", help, value.load(Ordering::Relaxed) as i64);
        }

        let gauges: [(&str, &AtomicI64, &str); 2] = [
            ("bot_index_docs", &self.index_docs, "Documents in the lexical index"),
            ("bot_limiter_active_keys", &self.limiter_active_keys, "Keys tracked by the rate limiter"),
        ];
        for (name, value, help) in gauges {
            render_metric(&mut out, name, "gauge", help, value.load(Ordering::Relaxed));
        }

        // log_drops is sourced from the sink at scrape time by the caller
        render_metric(
            &mut out,
            "bot_log_drops_total",
            "counter",
            "Log records dropped on a full queue",
            self.log_drops.load(Ordering::Relaxed) as i64,
        );
        out
    }
}

fn render_metric(out: &mut String, name: &str, kind: &str, help: &str, value: i64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_all_series() {
        let metrics = Metrics::default();
        metrics.record_cache(CacheOutcome::Hit);
        metrics.record_cache(CacheOutcome::Miss);
        metrics.rate_limited.fetch_add(2, Ordering::Relaxed);
        metrics.index_docs.store(42, Ordering::Relaxed);

        let text = metrics.render();
        assert!(text.contains("bot_cache_hits_total 1"));
        assert!(text.contains("bot_cache_misses_total 1"));
        assert!(text.contains("bot_rate_limited_total 2"));
        assert!(text.contains("bot_index_docs 42"));
        assert!(text.contains("# TYPE bot_index_docs gauge"));
    }

    #[test]
    fn test_cache_outcome_labels() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Miss.as_str(), "miss");
        assert_eq!(CacheOutcome::Error.as_str(), "error");
    }
}
