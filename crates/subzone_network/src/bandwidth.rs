//! Pluggable per-connection bandwidth limiting.

use std::time::Instant;

/// Send priority classes, highest first. Acks must flow even when a
/// connection is saturated, or the reliable stream collapses into
/// retransmit storms.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Priority {
    Ack,
    Urgent,
    High,
    Default,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Ack,
        Priority::Urgent,
        Priority::High,
        Priority::Default,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Ack => 0,
            Self::Urgent => 1,
            Self::High => 2,
            Self::Default => 3,
            Self::Low => 4,
        }
    }
}

/// Per-connection send budget. One limiter per connection, driven from the
/// send ticker while the connection mutex is held.
pub trait BandwidthLimiter: Send {
    /// Asks to send `bytes` at priority `pri`. Returning `true` consumes the
    /// budget; on `false` the caller keeps the packet queued and retries
    /// next cycle.
    fn check(&mut self, bytes: usize, pri: Priority) -> bool;

    /// Sets aside budget for a pending transfer (sized-data chunks that are
    /// being read on a worker). Returns `false` if nothing could be set
    /// aside.
    fn reserve(&mut self, bytes: usize) -> bool;

    /// Returns unused reservation made with [`reserve`](Self::reserve).
    fn unreserve(&mut self, bytes: usize);

    /// Called once per scheduling cycle before any `check`.
    fn tick(&mut self, now: Instant);

    /// Feedback: a reliable was acked on the first transmission.
    fn on_ack(&mut self) {}

    /// Feedback: a reliable had to be retransmitted.
    fn on_retry(&mut self) {}
}

/// Produces limiters for new connections.
pub trait BandwidthLimiterProvider: Send + Sync {
    fn new_limiter(&self) -> Box<dyn BandwidthLimiter>;
}

/// Configuration for the default token-bucket limiter. All rates are in
/// bytes per second; `class_weights` splits the rate across priority
/// classes in percent.
#[derive(Copy, Clone, Debug)]
pub struct TokenBucketConfig {
    pub rate: u32,
    /// Percent share per class, indexed by [`Priority::index`]. Shares may
    /// sum past 100; each class is simply capped at its own share.
    pub class_weights: [u32; 5],
    /// How many seconds of budget a class may accumulate while idle.
    pub burst_seconds: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            rate: 3500,
            class_weights: [140, 100, 60, 40, 20],
            burst_seconds: 2,
        }
    }
}

/// The default limiter: one token bucket per priority class, refilled in
/// proportion to the class weight.
pub struct TokenBucketLimiter {
    cfg: TokenBucketConfig,
    buckets: [f64; 5],
    reserved: f64,
    last_tick: Option<Instant>,
}

impl TokenBucketLimiter {
    pub fn new(cfg: TokenBucketConfig) -> Self {
        // Start with one second of budget so a fresh connection can
        // handshake without waiting for refill.
        let mut buckets = [0.0; 5];
        for (i, b) in buckets.iter_mut().enumerate() {
            *b = class_rate(&cfg, i);
        }
        Self {
            cfg,
            buckets,
            reserved: 0.0,
            last_tick: None,
        }
    }
}

fn class_rate(cfg: &TokenBucketConfig, class: usize) -> f64 {
    f64::from(cfg.rate) * f64::from(cfg.class_weights[class]) / 100.0
}

impl BandwidthLimiter for TokenBucketLimiter {
    fn check(&mut self, bytes: usize, pri: Priority) -> bool {
        let bucket = &mut self.buckets[pri.index()];
        if *bucket >= bytes as f64 {
            *bucket -= bytes as f64;
            true
        } else {
            false
        }
    }

    fn reserve(&mut self, bytes: usize) -> bool {
        // Reservations draw from the Default class.
        if self.check(bytes, Priority::Default) {
            self.reserved += bytes as f64;
            true
        } else {
            false
        }
    }

    fn unreserve(&mut self, bytes: usize) {
        let returned = (bytes as f64).min(self.reserved);
        self.reserved -= returned;
        self.buckets[Priority::Default.index()] += returned;
    }

    fn tick(&mut self, now: Instant) {
        let Some(last) = self.last_tick.replace(now) else {
            return;
        };
        let dt = now.saturating_duration_since(last).as_secs_f64();
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            let rate = class_rate(&self.cfg, i);
            *bucket = (*bucket + rate * dt).min(rate * f64::from(self.cfg.burst_seconds));
        }
    }
}

/// Provider for [`TokenBucketLimiter`].
pub struct TokenBucketProvider {
    cfg: TokenBucketConfig,
}

impl TokenBucketProvider {
    pub fn new(cfg: TokenBucketConfig) -> Self {
        Self { cfg }
    }
}

impl BandwidthLimiterProvider for TokenBucketProvider {
    fn new_limiter(&self) -> Box<dyn BandwidthLimiter> {
        Box::new(TokenBucketLimiter::new(self.cfg))
    }
}

/// A limiter that always says yes. Used by tests and local loopback
/// connections.
pub struct UnlimitedProvider;

impl BandwidthLimiterProvider for UnlimitedProvider {
    fn new_limiter(&self) -> Box<dyn BandwidthLimiter> {
        struct Unlimited;
        impl BandwidthLimiter for Unlimited {
            fn check(&mut self, _bytes: usize, _pri: Priority) -> bool {
                true
            }
            fn reserve(&mut self, _bytes: usize) -> bool {
                true
            }
            fn unreserve(&mut self, _bytes: usize) {}
            fn tick(&mut self, _now: Instant) {}
        }
        Box::new(Unlimited)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn budget_is_consumed_and_refilled() {
        let cfg = TokenBucketConfig {
            rate: 1000,
            class_weights: [100, 100, 100, 100, 100],
            burst_seconds: 1,
        };
        let mut lim = TokenBucketLimiter::new(cfg);

        // Initial budget: one second at the class rate.
        assert!(lim.check(1000, Priority::Default));
        assert!(!lim.check(1, Priority::Default));

        // Other classes are unaffected.
        assert!(lim.check(500, Priority::Ack));

        let t0 = Instant::now();
        lim.tick(t0);
        lim.tick(t0 + Duration::from_millis(500));
        assert!(lim.check(400, Priority::Default));
        assert!(!lim.check(400, Priority::Default));
    }

    #[test]
    fn burst_is_capped() {
        let cfg = TokenBucketConfig {
            rate: 1000,
            class_weights: [100; 5],
            burst_seconds: 2,
        };
        let mut lim = TokenBucketLimiter::new(cfg);
        let t0 = Instant::now();
        lim.tick(t0);
        lim.tick(t0 + Duration::from_secs(60));
        assert!(lim.check(2000, Priority::Low));
        assert!(!lim.check(100, Priority::Low));
    }

    #[test]
    fn unreserve_returns_budget() {
        let cfg = TokenBucketConfig {
            rate: 1000,
            class_weights: [100; 5],
            burst_seconds: 1,
        };
        let mut lim = TokenBucketLimiter::new(cfg);
        assert!(lim.reserve(600));
        assert!(!lim.check(600, Priority::Default));
        lim.unreserve(600);
        assert!(lim.check(600, Priority::Default));
    }
}
