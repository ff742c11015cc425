//! Per-channel token buckets and per-provider circuit breakers.
//!
//! Both structures are process-local and mutated under short mutex sections.
//! `try_acquire` never blocks: a refused acquisition is signalled back to the
//! worker, which defers the notification without charging its retry budget.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{BreakerConfig, ChannelConfig};
use crate::db::models::Channel;

/// Token bucket with linear refill.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_minute: u32, burst: u32, now: Instant) -> Self {
        Self {
            capacity: burst as f64,
            tokens: burst as f64,
            refill_per_second: rate_per_minute as f64 / 60.0,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Non-blocking per-channel rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<Channel, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: &ChannelConfig) -> Self {
        let now = Instant::now();
        let mut buckets = HashMap::new();
        for channel in Channel::ALL {
            let settings = config.settings(channel);
            buckets.insert(
                channel,
                TokenBucket::new(settings.rate_per_minute, settings.burst, now),
            );
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    pub fn try_acquire(&self, channel: Channel) -> bool {
        self.try_acquire_at(channel, Instant::now())
    }

    fn try_acquire_at(&self, channel: Channel, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        buckets
            .get_mut(&channel)
            .map(|b| b.try_acquire(now))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }
}

/// Per-provider failure isolation: Closed -> Open after `failure_threshold`
/// consecutive failures, Open -> HalfOpen after `recovery_timeout`, HalfOpen
/// closes on one success and reopens on one failure.
pub struct BreakerRegistry {
    threshold: u32,
    recovery: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl BreakerRegistry {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            recovery: Duration::from_secs(config.recovery_seconds),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a dispatch to this provider may proceed. An Open breaker past
    /// its recovery timeout moves to HalfOpen and admits one probe call.
    pub fn allows(&self, provider: &str) -> bool {
        self.allows_at(provider, Instant::now())
    }

    fn allows_at(&self, provider: &str, now: Instant) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.recovery {
                    breaker.state = BreakerState::HalfOpen;
                    tracing::info!("Circuit breaker for {} moved to half-open", provider);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, provider: &str) {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);
        if breaker.state != BreakerState::Closed {
            tracing::info!("Circuit breaker for {} closed after success", provider);
        }
        breaker.state = BreakerState::Closed;
        breaker.failure_count = 0;
        breaker.opened_at = None;
    }

    pub fn record_failure(&self, provider: &str) {
        self.record_failure_at(provider, Instant::now())
    }

    fn record_failure_at(&self, provider: &str, now: Instant) {
        let mut breakers = self.breakers.lock().expect("breaker registry poisoned");
        let breaker = breakers.entry(provider.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                tracing::warn!("Circuit breaker for {} reopened after failed probe", provider);
            }
            BreakerState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= self.threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    tracing::warn!(
                        "Circuit breaker for {} opened after {} consecutive failures",
                        provider,
                        breaker.failure_count
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        let breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .get(provider)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Snapshot of every known provider's breaker state, for health output.
    pub fn snapshot(&self) -> Vec<(String, BreakerState, u32)> {
        let breakers = self.breakers.lock().expect("breaker registry poisoned");
        breakers
            .iter()
            .map(|(name, b)| (name.clone(), b.state, b.failure_count))
            .collect()
    }
}
