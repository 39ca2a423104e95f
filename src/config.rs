//! Shared-resource policy (§5): per-provider token-bucket rate limiting and circuit breaking,
//! plus the top-level [`PipelineConfig`] that bundles enrichment and lot-matching policy so a
//! caller configures one thing instead of threading three configs through by hand.
//!
//! Grounded on `providers.rs`'s `RateLimitConfig`/`ProviderDefaultConfig` (the data a provider
//! already advertises per §6) and on the teacher's habit of keeping one small struct per concern
//! rather than a single catch-all settings blob.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::enrichment::EnrichmentConfig;
use crate::lotmatch::LotMatchConfig;
use crate::providers::RateLimitConfig;

/// Token-bucket limiter gating outgoing requests for one provider, process-wide (§5 "a
/// token-bucket limiter gates outgoing requests per provider name, process-wide").
///
/// Tracks remaining tokens plus a refill rate derived from `requestsPerSecond`; a 429/quota
/// response widens the refill interval until `cooldown_until` elapses, per §5's "on 429/quota
/// responses the limiter increases its interval until a cooldown expires".
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    cooldown_multiplier: f64,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.burst_limit.max(1) as f64,
            tokens: config.burst_limit.max(1) as f64,
            refill_per_sec: config.requests_per_second.max(1) as f64,
            last_refill: Instant::now(),
            cooldown_until: None,
            cooldown_multiplier: 1.0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let rate = self.refill_per_sec / self.cooldown_multiplier;
        self.tokens = (self.tokens + elapsed * rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Returns `true` and consumes one token if the caller may proceed now.
    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Called on a 429/quota response: widens the refill interval and opens a cooldown window.
    fn note_quota_exceeded(&mut self, cooldown: Duration) {
        self.cooldown_multiplier = (self.cooldown_multiplier * 2.0).min(32.0);
        self.cooldown_until = Some(Instant::now() + cooldown);
    }

    fn note_success(&mut self) {
        self.cooldown_multiplier = 1.0;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Opens after `failure_threshold` consecutive failures and fails the provider over to the
/// next-ranked provider for the same blockchain until `cooldown` elapses (§5 "circuit breaker").
struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn state(&mut self) -> BreakerState {
        match self.opened_at {
            Some(opened_at) if Instant::now().duration_since(opened_at) >= self.cooldown => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
            None => BreakerState::Closed,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            self.opened_at = Some(Instant::now());
        }
    }
}

/// Process-wide gate in front of one named provider: a rate limiter plus a circuit breaker,
/// the two §5 shared-resource policies a provider call must clear before it runs.
pub struct ProviderGate {
    bucket: Mutex<TokenBucket>,
    breaker: Mutex<CircuitBreaker>,
}

impl ProviderGate {
    pub fn new(rate_limit: RateLimitConfig, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(rate_limit)),
            breaker: Mutex::new(CircuitBreaker::new(failure_threshold, cooldown)),
        }
    }

    /// Whether a call may be attempted right now: the breaker isn't open and a rate-limit token
    /// is available. Does not itself retry or sleep; callers yield between batches (§5
    /// "suspension points... the runner yields between batches to allow rate-limiter tokens to
    /// accumulate").
    pub fn may_proceed(&self) -> bool {
        matches!(self.breaker.lock().state(), BreakerState::Closed | BreakerState::HalfOpen) && self.bucket.lock().try_acquire()
    }

    pub fn note_success(&self) {
        self.bucket.lock().note_success();
        self.breaker.lock().record_success();
    }

    pub fn note_failure(&self) {
        self.breaker.lock().record_failure();
    }

    pub fn note_quota_exceeded(&self, cooldown: Duration) {
        self.bucket.lock().note_quota_exceeded(cooldown);
    }
}

/// A process-wide, name-keyed set of [`ProviderGate`]s, one per provider name — "gates outgoing
/// requests per provider name, process-wide" (§5). On a persistently open breaker, callers look
/// up the next-ranked provider for the same blockchain from [`FailoverOrder`] instead.
#[derive(Default)]
pub struct ResourceGovernor {
    gates: Mutex<HashMap<String, std::sync::Arc<ProviderGate>>>,
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate_for(
        &self,
        provider_name: &str,
        rate_limit: RateLimitConfig,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> std::sync::Arc<ProviderGate> {
        self.gates
            .lock()
            .entry(provider_name.to_string())
            .or_insert_with(|| std::sync::Arc::new(ProviderGate::new(rate_limit, failure_threshold, cooldown)))
            .clone()
    }
}

/// Ranked failover order per blockchain/exchange: when a provider's breaker is open, the
/// provider manager fails over to the next entry for the same key (§5).
#[derive(Default)]
pub struct FailoverOrder {
    ranked: HashMap<String, Vec<String>>,
}

impl FailoverOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ranking(&mut self, chain_or_exchange: impl Into<String>, providers_best_first: Vec<String>) -> &mut Self {
        self.ranked.insert(chain_or_exchange.into(), providers_best_first);
        self
    }

    /// The provider name to try after `current` fails over, if any is configured.
    pub fn next_after(&self, chain_or_exchange: &str, current: &str) -> Option<&str> {
        let ranking = self.ranked.get(chain_or_exchange)?;
        let position = ranking.iter().position(|name| name == current)?;
        ranking.get(position + 1).map(String::as_str)
    }
}

/// Per-request timeout and batch-level retry policy (§5 "cancellation / timeouts").
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff delay before retry attempt `attempt` (0-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

/// Top-level pipeline configuration: one struct a caller builds once and threads through the
/// runner, process service, enrichment engine, and lot matcher, instead of each stage inventing
/// its own defaults.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub enrichment: EnrichmentConfig,
    pub lot_matching: LotMatchConfig,
    pub retry: RetryPolicyConfig,
}

/// `RetryPolicy` isn't `Default`-derivable the way the other two are (it owns no domain types,
/// just durations), but `PipelineConfig` wants one `#[derive(Default)]`; this newtype carries
/// the same fields and forwards to `RetryPolicy::default()`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicyConfig(pub RetryPolicy);

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limit(rps: u32, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rps,
            requests_per_minute: rps * 60,
            requests_per_hour: rps * 3600,
            burst_limit: burst,
        }
    }

    #[test]
    fn token_bucket_exhausts_then_refuses() {
        let mut bucket = TokenBucket::new(rate_limit(1, 2));
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn quota_exceeded_opens_a_cooldown_window() {
        let mut bucket = TokenBucket::new(rate_limit(100, 1));
        assert!(bucket.try_acquire());
        bucket.note_quota_exceeded(Duration::from_secs(60));
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_cooldown() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(0));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // cooldown is zero, so the very next check half-opens it
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn failover_order_returns_next_ranked_provider() {
        let mut order = FailoverOrder::new();
        order.set_ranking("bitcoin", vec!["esplora".to_string(), "blockstream".to_string(), "mempool".to_string()]);
        assert_eq!(order.next_after("bitcoin", "esplora"), Some("blockstream"));
        assert_eq!(order.next_after("bitcoin", "mempool"), None);
        assert_eq!(order.next_after("ethereum", "anything"), None);
    }

    #[test]
    fn retry_policy_backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), policy.backoff_base);
        assert_eq!(policy.backoff_for(1), policy.backoff_base * 2);
        assert_eq!(policy.backoff_for(2), policy.backoff_base * 4);
    }
}
