// src/limiter.rs
// Per-key rate limiting: token bucket layered with a rolling 24h window
//
// Both layers must pass before either is debited. The per-entry mutex makes
// the check-all-then-consume-all sequence atomic, so the classic race (the
// bucket passes and is debited while the window rejects) cannot happen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::LimiterConfig;

/// Window length for the daily cap.
const WINDOW: Duration = Duration::from_secs(24 * 3600);

/// The outcome of an `allow` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    /// Denied, with the seconds until the bucket next admits a request.
    Denied { retry_after: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Per-key limiter state. The bucket refills continuously; the window is a
/// weighted pair of fixed 24h buckets, the previous one contributing
/// proportionally to the time still overlapping the rolling day.
struct Entry {
    tokens: f64,
    last_refill: Instant,
    /// Index of the 24h bucket `window_current` counts.
    window_bucket: u64,
    window_current: u32,
    window_previous: u32,
    last_seen: Instant,
}

impl Entry {
    fn new(burst: f64, now: Instant, bucket: u64) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            window_bucket: bucket,
            window_current: 0,
            window_previous: 0,
            last_seen: now,
        }
    }

    fn refill(&mut self, burst: f64, rate: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    /// Roll the window buckets forward to `bucket`.
    fn roll_window(&mut self, bucket: u64) {
        if bucket == self.window_bucket {
            return;
        }
        if bucket == self.window_bucket + 1 {
            self.window_previous = self.window_current;
        } else {
            self.window_previous = 0;
        }
        self.window_current = 0;
        self.window_bucket = bucket;
    }

    /// Weighted rolling count: the previous complete bucket contributes
    /// proportionally to how much of it still overlaps the trailing 24h.
    fn window_count(&self, elapsed_fraction: f64) -> f64 {
        f64::from(self.window_previous) * (1.0 - elapsed_fraction)
            + f64::from(self.window_current)
    }

    fn is_idle(&self, burst: f64) -> bool {
        self.tokens >= burst && self.window_current == 0 && self.window_previous == 0
    }
}

/// Keyed rate limiter protecting the chat platform and the LLM.
///
/// `allow` never blocks and never suspends; it is safe on the webhook hot
/// path. Idle keys are evicted by [`KeyedLimiter::sweep_idle`], which the
/// composition root runs on a background period.
pub struct KeyedLimiter {
    burst: f64,
    rate: f64,
    /// 0 disables the window layer.
    daily_limit: u32,
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
    drops: AtomicU64,
}

impl KeyedLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            burst: config.burst.max(1.0),
            rate: config.refill_rate.max(0.0),
            daily_limit: config.daily_limit,
            entries: RwLock::new(HashMap::new()),
            drops: AtomicU64::new(0),
        }
    }

    /// Allow or deny a request for `key`. Atomic across both layers.
    pub fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.allow_at(key, now, epoch)
    }

    /// Testable core: `epoch` drives the window buckets, `now` the refill.
    fn allow_at(&self, key: &str, now: Instant, epoch: u64) -> Decision {
        let entry = self.entry_for(key, now, epoch);
        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.last_seen = now;

        entry.refill(self.burst, self.rate, now);
        let bucket = epoch / WINDOW.as_secs();
        entry.roll_window(bucket);

        // Check both layers before consuming either
        let bucket_ok = entry.tokens >= 1.0;
        let elapsed_fraction =
            (epoch % WINDOW.as_secs()) as f64 / WINDOW.as_secs() as f64;
        let window_ok = self.daily_limit == 0
            || entry.window_count(elapsed_fraction) + 1.0 <= f64::from(self.daily_limit);

        if bucket_ok && window_ok {
            entry.tokens -= 1.0;
            if self.daily_limit > 0 {
                entry.window_current += 1;
            }
            return Decision::Allowed;
        }

        self.drops.fetch_add(1, Ordering::Relaxed);
        let retry_after = if !bucket_ok && self.rate > 0.0 {
            ((1.0 - entry.tokens) / self.rate).ceil() as u64
        } else {
            // Window exhausted; the earliest relief is the next bucket roll
            WINDOW.as_secs() - (epoch % WINDOW.as_secs())
        };
        Decision::Denied { retry_after }
    }

    fn entry_for(&self, key: &str, now: Instant, epoch: u64) -> Arc<Mutex<Entry>> {
        {
            let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get(key) {
                return entry.clone();
            }
        }
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Entry::new(
                    self.burst,
                    now,
                    epoch / WINDOW.as_secs(),
                )))
            })
            .clone()
    }

    /// Evict keys whose bucket is full and whose window is empty. Returns
    /// the number of keys evicted.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| {
            let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
            entry.refill(self.burst, self.rate, now);
            !entry.is_idle(self.burst)
        });
        before - map.len()
    }

    /// Number of keys currently tracked.
    pub fn active_keys(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cumulative denied requests.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Spawn the idle-key sweeper. Exits when the token is cancelled.
pub fn spawn_sweeper(
    limiter: Arc<KeyedLimiter>,
    period: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let evicted = limiter.sweep_idle();
            if evicted > 0 {
                tracing::debug!(evicted, active = limiter.active_keys(), "limiter sweep");
            }
        }
    })
}
