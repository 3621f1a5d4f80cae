//! Per-identity rate limiting for the rendezvous surface

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a bucket may sit idle before the janitor removes it
pub const DEFAULT_SWEEP_IDLE: Duration = Duration::from_secs(3 * 60);

/// Token-bucket state for one identity
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// A refilling token-bucket limiter keyed by caller identity.
///
/// `allow` finds or creates the bucket and takes one token in a single
/// critical section, so concurrent callers and the sweep never race.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate_per_sec: f64,
    burst: f64,
    sweep_idle: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `rate_per_sec` sustained requests with
    /// `burst` capacity
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec,
            burst: burst as f64,
            sweep_idle: DEFAULT_SWEEP_IDLE,
        }
    }

    /// Override the idle horizon after which buckets are swept
    pub fn with_sweep_idle(mut self, idle: Duration) -> Self {
        self.sweep_idle = idle;
        self
    }

    /// Check whether a request from `identity` is allowed right now,
    /// consuming one token when it is
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let bucket = buckets.entry(identity.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Remove buckets idle longer than the sweep horizon
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_seen) < self.sweep_idle);
        let removed = before - buckets.len();
        if removed > 0 {
            debug!("Rate limiter swept {} idle buckets", removed);
        }
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Whether no buckets are tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.lock().is_empty()
    }
}

/// Separate limiters for the two rendezvous operation classes.
///
/// Session creation is the scarcer resource, so it gets the lower rate
/// and smaller burst.
pub struct OpLimiter {
    create: RateLimiter,
    join: RateLimiter,
}

impl OpLimiter {
    /// Build limiters from per-minute rates
    pub fn new(
        create_per_min: f64,
        create_burst: u32,
        join_per_min: f64,
        join_burst: u32,
    ) -> Self {
        Self {
            create: RateLimiter::new(create_per_min / 60.0, create_burst),
            join: RateLimiter::new(join_per_min / 60.0, join_burst),
        }
    }

    /// Check a session-create request
    pub fn allow_create(&self, identity: &str) -> bool {
        self.create.allow(identity)
    }

    /// Check a session-join request
    pub fn allow_join(&self, identity: &str) -> bool {
        self.join.allow(identity)
    }

    /// Spawn the periodic janitor, stopping when `cancel` fires
    pub fn spawn_janitor(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let limiter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.create.sweep();
                        limiter.join.sweep();
                    }
                }
            }
        });
    }
}

impl Default for OpLimiter {
    fn default() -> Self {
        Self::new(10.0, 3, 30.0, 10)
    }
}

// ============================================================================
// TESTS
// ============================================================================
