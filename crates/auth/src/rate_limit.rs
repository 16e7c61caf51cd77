//! In-memory rate limiting
//!
//! Fixed-duration counting windows per client key. A window starts on the
//! first request for a key and is replaced by a fresh one once it has elapsed.
//! Expired windows are swept by a background task, not on every request.
//!
//! Preset limits are configurable via environment variables:
//! - `RATE_LIMIT_CREDENTIALS_PER_MINUTE`: credential endpoints (default: 5 per minute)
//! - `RATE_LIMIT_READ_ONLY_PER_WINDOW`: read-only traffic (default: 300 per 15 minutes)
//! - `RATE_LIMIT_AUTH_FAILURES_PER_HOUR`: failed sign-ins per identity (default: 3 per hour)

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

fn env_limit(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get configurable credential-endpoint limit per minute
fn get_credentials_limit() -> u32 {
    static LIMIT: OnceLock<u32> = OnceLock::new();
    *LIMIT.get_or_init(|| env_limit("RATE_LIMIT_CREDENTIALS_PER_MINUTE", 5))
}

/// Get configurable read-only limit per 15 minute window
fn get_read_only_limit() -> u32 {
    static LIMIT: OnceLock<u32> = OnceLock::new();
    *LIMIT.get_or_init(|| env_limit("RATE_LIMIT_READ_ONLY_PER_WINDOW", 300))
}

/// Get configurable authentication-failure limit per hour
fn get_auth_failure_limit() -> u32 {
    static LIMIT: OnceLock<u32> = OnceLock::new();
    *LIMIT.get_or_init(|| env_limit("RATE_LIMIT_AUTH_FAILURES_PER_HOUR", 3))
}

/// Rate limit configuration. Presets differ only in these two parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Short strict window for credential endpoints
    pub fn credentials() -> Self {
        Self::new(get_credentials_limit(), Duration::from_secs(60))
    }

    /// Longer relaxed window for read-only traffic
    pub fn read_only() -> Self {
        Self::new(get_read_only_limit(), Duration::from_secs(15 * 60))
    }

    /// Very strict long window for repeated authentication failures
    pub fn auth_failure() -> Self {
        Self::new(get_auth_failure_limit(), Duration::from_secs(60 * 60))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(60))
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    /// Standard throttling response headers
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset_at.unix_timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after_seconds {
            headers.push(("retry-after", retry_after.to_string()));
        }
        headers
    }
}

/// Rounds up so a client never retries a fraction of a second early
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    resets_at: Instant,
}

impl WindowEntry {
    fn fresh(window: Duration, now: Instant) -> Self {
        Self {
            count: 0,
            resets_at: now + window,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.resets_at
    }

    fn decision(&self, config: &RateLimitConfig, now: Instant) -> RateLimitDecision {
        let until_reset = self.resets_at.saturating_duration_since(now);
        let allowed = self.count <= config.max_requests;
        RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining: config.max_requests.saturating_sub(self.count),
            reset_at: OffsetDateTime::now_utc()
                + time::Duration::try_from(until_reset).unwrap_or(time::Duration::ZERO),
            retry_after_seconds: (!allowed).then(|| ceil_secs(until_reset)),
        }
    }
}

/// Process-local window store
pub struct InMemoryRateLimiter {
    /// Store: key -> current window
    windows: RwLock<HashMap<String, WindowEntry>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Count a request against `key` and decide whether it may proceed
    pub async fn check_rate_limit(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::fresh(config.window, now));

        if entry.is_expired(now) {
            *entry = WindowEntry::fresh(config.window, now);
        }

        entry.count = entry.count.saturating_add(1);
        entry.decision(config, now)
    }

    /// Current state of `key` without counting a request
    pub async fn peek(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = Instant::now();
        let windows = self.windows.read().await;

        match windows.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.decision(config, now),
            _ => WindowEntry::fresh(config.window, now).decision(config, now),
        }
    }

    /// Time until `key` regains capacity, if its budget is used up
    pub async fn exhausted(&self, key: &str, config: &RateLimitConfig) -> Option<Duration> {
        let now = Instant::now();
        let windows = self.windows.read().await;
        windows
            .get(key)
            .filter(|entry| !entry.is_expired(now) && entry.count >= config.max_requests)
            .map(|entry| entry.resets_at.saturating_duration_since(now))
    }

    /// Remove `key` (e.g. after a successful sign-in clears its failures)
    pub async fn reset(&self, key: &str) {
        self.windows.write().await.remove(key);
    }

    /// Drop expired windows, returning how many were removed
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let before = windows.len();
        windows.retain(|_, entry| !entry.is_expired(now));
        before - windows.len()
    }

    pub async fn len(&self) -> usize {
        self.windows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.windows.read().await.is_empty()
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a client key from the network origin and the bearer credential.
///
/// Anonymous traffic is keyed by origin alone. The credential is hashed so raw
/// tokens never sit in the window store.
pub fn client_key(origin: Option<&str>, bearer: Option<&str>) -> String {
    let origin = origin.filter(|o| !o.is_empty()).unwrap_or("unknown");
    match bearer.filter(|b| !b.is_empty()) {
        Some(token) => {
            let digest = Sha256::digest(token.as_bytes());
            format!("{}:{}", origin, &hex::encode(digest)[..16])
        }
        None => origin.to_string(),
    }
}

/// Rate limiter service, cheap to clone and shared process-wide
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<InMemoryRateLimiter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryRateLimiter::new()),
        }
    }

    /// Count a request for `key` under `config`
    pub async fn allow(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let decision = self.inner.check_rate_limit(key, config).await;
        if !decision.allowed {
            tracing::warn!(
                key = %key,
                limit = decision.limit,
                retry_after = ?decision.retry_after_seconds,
                "Rate limit exceeded"
            );
        }
        decision
    }

    pub async fn peek(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.inner.peek(key, config).await
    }

    /// Check a credential endpoint request (sign-in, OTP, MFA verify)
    pub async fn check_credentials(&self, client: &str) -> RateLimitDecision {
        let key = format!("ratelimit:credentials:{}", client);
        self.allow(&key, &RateLimitConfig::credentials()).await
    }

    /// Check a read-only request
    pub async fn check_read_only(&self, client: &str) -> RateLimitDecision {
        let key = format!("ratelimit:read:{}", client);
        self.allow(&key, &RateLimitConfig::read_only()).await
    }

    /// Record a failed authentication for `identifier`
    pub async fn record_auth_failure(&self, identifier: &str) -> RateLimitDecision {
        let key = format!("ratelimit:auth_failure:{}", identifier);
        self.allow(&key, &RateLimitConfig::auth_failure()).await
    }

    /// Whether `identifier` has used up its failure budget
    pub async fn auth_failures_exhausted(&self, identifier: &str) -> Option<u64> {
        let key = format!("ratelimit:auth_failure:{}", identifier);
        self.inner
            .exhausted(&key, &RateLimitConfig::auth_failure())
            .await
            .map(ceil_secs)
    }

    /// Forget recorded failures for `identifier`
    pub async fn clear_auth_failures(&self, identifier: &str) {
        let key = format!("ratelimit:auth_failure:{}", identifier);
        self.inner.reset(&key).await;
    }

    /// Clean up expired rate limit windows
    pub async fn cleanup(&self) -> usize {
        self.inner.cleanup().await
    }

    /// Sweep expired windows every `interval` until the handle is aborted
    pub fn spawn_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate limit windows");
                }
            }
        })
    }

    pub async fn tracked_keys(&self) -> usize {
        self.inner.len().await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
