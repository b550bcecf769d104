//! Two-level token bucket rate limiting
//!
//! Every entry must take one token from the global bucket and one from its
//! session's bucket. Both levels live behind a single mutex so the check and
//! the decrement happen together.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, rate: f64, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

#[derive(Debug)]
struct Buckets {
    global: TokenBucket,
    sessions: HashMap<String, TokenBucket>,
}

/// Token counts at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    /// Tokens left in the global bucket
    pub global_tokens: f64,
    /// Number of live session buckets
    pub session_buckets: usize,
    /// Tokens left per session
    pub sessions: HashMap<String, f64>,
}

/// Global plus per-session token bucket limiter
#[derive(Debug)]
pub struct RateLimiter {
    global_rate: f64,
    session_rate: f64,
    global_capacity: f64,
    session_capacity: f64,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// Create a limiter; capacity is `rate * burst_multiplier` at both levels
    pub fn new(global_rate: f64, session_rate: f64, burst_multiplier: f64) -> Self {
        let global_capacity = global_rate * burst_multiplier;
        Self {
            global_rate,
            session_rate,
            global_capacity,
            session_capacity: session_rate * burst_multiplier,
            buckets: Mutex::new(Buckets {
                global: TokenBucket::full(global_capacity, Instant::now()),
                sessions: HashMap::new(),
            }),
        }
    }

    /// Take one token for `session_id`, returning whether the entry may pass
    pub fn try_consume(&self, session_id: &str) -> bool {
        self.try_consume_at(session_id, Instant::now())
    }

    /// [`try_consume`](Self::try_consume) at an explicit instant
    pub fn try_consume_at(&self, session_id: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();

        buckets.global.refill(self.global_rate, self.global_capacity, now);
        if buckets.global.tokens < 1.0 {
            return false;
        }

        let session = buckets
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| TokenBucket::full(self.session_capacity, now));
        session.refill(self.session_rate, self.session_capacity, now);
        if session.tokens < 1.0 {
            return false;
        }

        session.tokens -= 1.0;
        buckets.global.tokens -= 1.0;
        true
    }

    /// Drop session buckets that have not been touched for `max_idle`.
    ///
    /// A pruned session gets a fresh full bucket on its next entry.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        self.prune_idle_at(max_idle, Instant::now())
    }

    /// [`prune_idle`](Self::prune_idle) at an explicit instant
    pub fn prune_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.sessions.len();
        buckets
            .sessions
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
        before - buckets.sessions.len()
    }

    /// Current token counts
    pub fn stats(&self) -> RateLimiterStats {
        let buckets = self.buckets.lock();
        RateLimiterStats {
            global_tokens: buckets.global.tokens,
            session_buckets: buckets.sessions.len(),
            sessions: buckets
                .sessions
                .iter()
                .map(|(id, bucket)| (id.clone(), bucket.tokens))
                .collect(),
        }
    }
}
