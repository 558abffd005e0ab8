//! Per-replica read/write admission control.
//!
//! Token-bucket throttling with two soft levels: past the delay rate a
//! request is held back and retried (no reply is sent yet); past the
//! reject rate it is refused with `BUSY` immediately. Reads and writes
//! have independent limits. Time is passed in by the caller, so
//! admission decisions are deterministic under test.

/// Outcome of an admission check.
///
/// A rejected request is answered with [`Busy`](crate::ReplicaError::Busy);
/// a delayed one gets no reply until the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allow,
    /// Hold the request and retry at `until_ms`, when a token will have
    /// accrued; the throttler owns the response until then. A delayed
    /// read re-enters with `ignore_throttling` set, a delayed write
    /// simply re-enters.
    Delay { until_ms: u64 },
    /// Reply [`Busy`](crate::ReplicaError::Busy) now.
    Reject,
}

/// Classic token bucket: `rate_per_sec` tokens accrue per second up to
/// `burst`.
#[derive(Debug, Clone)]
struct TokenBucket {
    rate_per_sec: u64,
    burst: u64,
    tokens: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(rate_per_sec: u64, burst: u64) -> Self {
        Self {
            rate_per_sec,
            burst: burst.max(1),
            tokens: burst.max(1) as f64,
            last_refill_ms: 0,
        }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        self.last_refill_ms = now_ms;
        let gained = (elapsed as f64 / 1000.0) * self.rate_per_sec as f64;
        self.tokens = (self.tokens + gained).min(self.burst as f64);
    }

    fn try_take(&mut self, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Milliseconds until one token is available (0 if available now).
    fn wait_ms(&self) -> u64 {
        if self.tokens >= 1.0 || self.rate_per_sec == 0 {
            return 0;
        }
        let missing = 1.0 - self.tokens;
        (missing * 1000.0 / self.rate_per_sec as f64).ceil() as u64
    }
}

/// Limits for one request class (reads or writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLimit {
    /// Sustained rate past which requests are delayed.
    pub delay_qps: u64,
    /// Sustained rate past which requests are rejected outright.
    pub reject_qps: u64,
    /// Token burst allowance.
    pub burst: u64,
}

#[derive(Debug, Clone)]
struct ClassThrottle {
    delay: TokenBucket,
    reject: TokenBucket,
}

impl ClassThrottle {
    fn new(limit: ThrottleLimit) -> Self {
        // The reject bucket's burst keeps the delay/reject rate ratio, so
        // the delay band is reachable before the reject band under bursts.
        let reject_burst = if limit.delay_qps == 0 {
            limit.burst
        } else {
            limit.burst.saturating_mul(limit.reject_qps) / limit.delay_qps.max(1)
        };
        Self {
            delay: TokenBucket::new(limit.delay_qps, limit.burst),
            reject: TokenBucket::new(limit.reject_qps, reject_burst.max(limit.burst)),
        }
    }

    fn admit(&mut self, now_ms: u64) -> ThrottleDecision {
        if !self.reject.try_take(now_ms) {
            return ThrottleDecision::Reject;
        }
        if self.delay.try_take(now_ms) {
            return ThrottleDecision::Allow;
        }
        ThrottleDecision::Delay {
            until_ms: now_ms + self.delay.wait_ms().max(1),
        }
    }
}

/// Read/write admission throttler for one replica.
#[derive(Debug, Clone, Default)]
pub struct Throttler {
    read: Option<ClassThrottle>,
    write: Option<ClassThrottle>,
}

impl Throttler {
    /// A throttler with no limits configured; everything is allowed.
    pub fn unlimited() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_read_limit(mut self, limit: ThrottleLimit) -> Self {
        self.read = Some(ClassThrottle::new(limit));
        self
    }

    #[must_use]
    pub fn with_write_limit(mut self, limit: ThrottleLimit) -> Self {
        self.write = Some(ClassThrottle::new(limit));
        self
    }

    pub fn admit_read(&mut self, now_ms: u64) -> ThrottleDecision {
        match &mut self.read {
            Some(class) => class.admit(now_ms),
            None => ThrottleDecision::Allow,
        }
    }

    pub fn admit_write(&mut self, now_ms: u64) -> ThrottleDecision {
        match &mut self.write {
            Some(class) => class.admit(now_ms),
            None => ThrottleDecision::Allow,
        }
    }
}
