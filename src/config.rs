// src/config.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default cache TTL: 7 days. Records older than this are stale; the same
/// bound doubles as the hard deletion bound (no archival tier).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Chat-platform credentials loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct PlatformKeys {
    /// Channel secret used for webhook signature verification (LINE_CHANNEL_SECRET)
    pub channel_secret: Option<String>,
    /// Channel access token used by the reply client (LINE_CHANNEL_TOKEN)
    pub channel_token: Option<String>,
    /// Optional LLM API key; enables intent parsing and query expansion (LLM_API_KEY)
    pub llm: Option<String>,
}

impl PlatformKeys {
    /// Load credentials from environment variables (single source of truth)
    pub fn from_env() -> Self {
        let keys = Self {
            channel_secret: read_key("LINE_CHANNEL_SECRET"),
            channel_token: read_key("LINE_CHANNEL_TOKEN"),
            llm: read_key("LLM_API_KEY"),
        };
        keys.log_status();
        keys
    }

    pub fn has_platform(&self) -> bool {
        self.channel_secret.is_some() && self.channel_token.is_some()
    }

    /// LLM features degrade silently when this is false
    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Log which credentials are available (without exposing values)
    fn log_status(&self) {
        if !self.has_platform() {
            warn!("Chat platform credentials missing - webhook replies disabled");
        }
        if self.llm.is_none() {
            debug!("No LLM API key - intent parsing and query expansion disabled");
        }
    }
}

/// Scraper tuning knobs
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Per-request timeout (SCRAPER_TIMEOUT, default 10s)
    pub timeout: Duration,
    /// Maximum retries per mirror before failover (SCRAPER_MAX_RETRIES, default 3)
    pub max_retries: u32,
    /// Minimum delay between requests to the same site (SCRAPER_MIN_DELAY, default 200ms)
    pub min_delay: Duration,
    /// Backoff cap (SCRAPER_MAX_DELAY, default 30s)
    pub max_delay: Duration,
    /// Warmup worker pool size (SCRAPER_WORKERS, default 4)
    pub workers: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            workers: 4,
        }
    }
}

impl ScraperConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout: parse_duration_env("SCRAPER_TIMEOUT").unwrap_or(d.timeout),
            max_retries: parse_env("SCRAPER_MAX_RETRIES").unwrap_or(d.max_retries),
            min_delay: parse_duration_env("SCRAPER_MIN_DELAY").unwrap_or(d.min_delay),
            max_delay: parse_duration_env("SCRAPER_MAX_DELAY").unwrap_or(d.max_delay),
            workers: parse_env("SCRAPER_WORKERS").unwrap_or(d.workers).max(1),
        }
    }
}

/// Rate limiter tuning knobs
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Token bucket burst (USER_RATE_LIMIT_TOKENS, default 5)
    pub burst: f64,
    /// Token refill rate per second (USER_RATE_LIMIT_REFILL_RATE, default 0.5)
    pub refill_rate: f64,
    /// Rolling 24h cap; 0 disables the window layer (USER_DAILY_LIMIT, default 200)
    pub daily_limit: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            burst: 5.0,
            refill_rate: 0.5,
            daily_limit: 200,
        }
    }
}

impl LimiterConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            burst: parse_env("USER_RATE_LIMIT_TOKENS").unwrap_or(d.burst),
            refill_rate: parse_env("USER_RATE_LIMIT_REFILL_RATE").unwrap_or(d.refill_rate),
            daily_limit: parse_env("USER_DAILY_LIMIT").unwrap_or(d.daily_limit),
        }
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }
        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for w in &self.warnings {
                lines.push(format!("  - {}", w));
            }
        }
        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Process configuration - all env vars in one place
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (PORT, default 8080)
    pub port: u16,
    /// Store file path (SQLITE_PATH, default ./data/cache.db)
    pub sqlite_path: PathBuf,
    /// Freshness and deletion bound (CACHE_TTL, default 168h)
    pub cache_ttl: Duration,
    pub scraper: ScraperConfig,
    pub limiter: LimiterConfig,
    /// Enabled warmup modules (WARMUP_MODULES, comma separated; default all)
    pub warmup_modules: Vec<String>,
    /// Local hour for the daily warmup run (WARMUP_HOUR, default 3)
    pub warmup_hour: u32,
    /// Webhook handler deadline (WEBHOOK_TIMEOUT, default 25s). Must stay
    /// below the HTTP write timeout and the platform reply window.
    pub webhook_timeout: Duration,
    /// Bounded wait for in-flight work on shutdown (SHUTDOWN_TIMEOUT, default 10s)
    pub shutdown_timeout: Duration,
    /// LOG_LEVEL in {debug, info, warn, error}
    pub log_level: String,
    pub keys: PlatformKeys,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            sqlite_path: PathBuf::from("./data/cache.db"),
            cache_ttl: DEFAULT_CACHE_TTL,
            scraper: ScraperConfig::default(),
            limiter: LimiterConfig::default(),
            warmup_modules: ALL_WARMUP_MODULES.iter().map(|s| s.to_string()).collect(),
            warmup_hour: 3,
            webhook_timeout: Duration::from_secs(25),
            shutdown_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
            keys: PlatformKeys::default(),
        }
    }
}

/// Modules the warmup pipeline knows about, in run order.
pub const ALL_WARMUP_MODULES: [&str; 4] = ["students", "contacts", "courses", "stickers"];

impl Config {
    /// Load all environment configuration (call once at startup)
    pub fn load() -> Self {
        info!("Loading environment configuration");
        let d = Self::default();

        let warmup_modules = std::env::var("WARMUP_MODULES")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.split(',')
                    .map(|m| m.trim().to_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect()
            })
            .unwrap_or(d.warmup_modules);

        Self {
            port: parse_env("PORT").unwrap_or(d.port),
            sqlite_path: std::env::var("SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.sqlite_path),
            cache_ttl: parse_duration_env("CACHE_TTL").unwrap_or(d.cache_ttl),
            scraper: ScraperConfig::from_env(),
            limiter: LimiterConfig::from_env(),
            warmup_modules,
            warmup_hour: parse_env("WARMUP_HOUR").unwrap_or(d.warmup_hour).min(23),
            webhook_timeout: parse_duration_env("WEBHOOK_TIMEOUT").unwrap_or(d.webhook_timeout),
            shutdown_timeout: parse_duration_env("SHUTDOWN_TIMEOUT").unwrap_or(d.shutdown_timeout),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(d.log_level),
            keys: PlatformKeys::from_env(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::default();

        if !self.keys.has_platform() {
            v.add_warning(
                "Chat platform credentials missing. Set LINE_CHANNEL_SECRET and LINE_CHANNEL_TOKEN.",
            );
        }
        if !self.keys.has_llm() {
            v.add_warning("No LLM_API_KEY - free-form queries fall back to keyword matchers only.");
        }
        if self.scraper.timeout >= self.webhook_timeout {
            v.add_error(format!(
                "SCRAPER_TIMEOUT ({:?}) must be strictly less than WEBHOOK_TIMEOUT ({:?})",
                self.scraper.timeout, self.webhook_timeout
            ));
        }
        for m in &self.warmup_modules {
            if !ALL_WARMUP_MODULES.contains(&m.as_str()) {
                v.add_warning(format!(
                    "Unknown warmup module '{}'. Valid: {}",
                    m,
                    ALL_WARMUP_MODULES.join(", ")
                ));
            }
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            v.add_warning(format!("Unknown LOG_LEVEL '{}', using info", self.log_level));
        }
        v
    }
}

fn read_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a duration env var. Accepts "168h", "30m", "10s", "200ms", or a
/// bare number of seconds.
fn parse_duration_env(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    parse_duration(raw).or_else(|| {
        warn!(value = raw, "Unparseable duration in {}, using default", name);
        None
    })
}

fn parse_duration(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (num, unit) = raw.split_at(raw.find(|c: char| c.is_ascii_alphabetic())?);
    let value: f64 = num.trim().parse().ok()?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        "d" => value * 86400.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}
