// src/llm/fallback.rs
// Resilience primitives: per-tier circuit breakers and retry backoff.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::routing::ModelTier;

/// Circuit breaker configuration, shared by all cloud tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
        }
    }
}

/// Counters surfaced for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub consecutive_failures: u32,
    pub tripped: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
}

#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    tripped: bool,
    tripped_at: Option<Instant>,
    total_requests: u64,
    failed_requests: u64,
    blocked_requests: u64,
}

/// Per-backend failure tracker. Trips after a run of consecutive failures
/// and excludes the backend from routing until the cooldown elapses or a
/// call succeeds.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<RwLock<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(BreakerInner {
                consecutive_failures: 0,
                tripped: false,
                tripped_at: None,
                total_requests: 0,
                failed_requests: 0,
                blocked_requests: 0,
            })),
        }
    }

    /// Whether the backend may be attempted. A tripped breaker lets requests
    /// through again once the cooldown window has passed.
    pub async fn is_available(&self) -> bool {
        let inner = self.inner.read().await;
        if !inner.tripped {
            return true;
        }
        match inner.tripped_at {
            Some(at) => at.elapsed() >= self.config.cooldown,
            None => true,
        }
    }

    pub async fn record_attempt_blocked(&self) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        inner.blocked_requests += 1;
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        if inner.tripped {
            debug!("circuit breaker closed after successful call");
        }
        inner.consecutive_failures = 0;
        inner.tripped = false;
        inner.tripped_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.total_requests += 1;
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
        if !inner.tripped && inner.consecutive_failures >= self.config.failure_threshold {
            warn!(
                failures = inner.consecutive_failures,
                "circuit breaker tripped"
            );
            inner.tripped = true;
            inner.tripped_at = Some(Instant::now());
        }
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.read().await;
        BreakerMetrics {
            consecutive_failures: inner.consecutive_failures,
            tripped: inner.tripped,
            total_requests: inner.total_requests,
            failed_requests: inner.failed_requests,
            blocked_requests: inner.blocked_requests,
        }
    }
}

/// One breaker per cloud tier. The local tier never gets a breaker: it is
/// the fallback of last resort and must always be reachable.
pub struct BreakerSet {
    breakers: HashMap<ModelTier, CircuitBreaker>,
}

impl BreakerSet {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let breakers = ModelTier::cloud_tiers()
            .into_iter()
            .map(|tier| (tier, CircuitBreaker::new(config.clone())))
            .collect();
        Self { breakers }
    }

    pub fn breaker(&self, tier: ModelTier) -> Option<&CircuitBreaker> {
        self.breakers.get(&tier)
    }

    /// Local is always available; cloud tiers defer to their breaker.
    pub async fn tier_available(&self, tier: ModelTier) -> bool {
        match self.breakers.get(&tier) {
            Some(breaker) => breaker.is_available().await,
            None => true,
        }
    }

    pub async fn record_success(&self, tier: ModelTier) {
        if let Some(breaker) = self.breakers.get(&tier) {
            breaker.record_success().await;
        }
    }

    pub async fn record_failure(&self, tier: ModelTier) {
        if let Some(breaker) = self.breakers.get(&tier) {
            breaker.record_failure().await;
        }
    }
}

/// Retry configuration with exponential backoff, used by the model
/// downloader.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-based attempt, with up to 25% jitter to
    /// avoid thundering herds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self.initial_delay.as_secs_f32() * self.backoff_multiplier.powi(exponent as i32);
        let mut delay = Duration::from_secs_f32(base.min(self.max_delay.as_secs_f32()));
        if self.jitter {
            use rand::Rng;
            let factor = rand::rng().random_range(0.75..=1.25);
            delay = Duration::from_secs_f32((delay.as_secs_f32() * factor).min(self.max_delay.as_secs_f32()));
        }
        delay
    }
}
