//! Sliding window rate limiting over an ordered chain of backends.

use crate::backend::{Backend, InMemoryBackend, RateLimitDecision, SlidingWindowInput, Unavailable};
use crate::clock::{Clock, SystemClock};
use crate::config::InstitutionConfigResolver;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(2);
pub const GLOBAL_SCOPE: &str = "global";

/// Per call options for [RateLimiter::check].
#[derive(Debug, Clone, Default)]
pub struct CheckOptions<'a> {
    /// Namespaces the window and selects the institution's configured limit.
    pub tenant_id: Option<&'a str>,
    /// Takes precedence over any configured limit.
    pub limit: Option<u64>,
    /// Takes precedence over any configured window.
    pub window_seconds: Option<u64>,
}

impl<'a> CheckOptions<'a> {
    pub fn tenant(tenant_id: &'a str) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }
}

/// The rate limit key for a caller, scoped by institution.
pub fn rate_limit_key(identifier: &str, tenant_id: Option<&str>) -> String {
    format!("ratelimit:{}:{identifier}", tenant_id.unwrap_or(GLOBAL_SCOPE))
}

/// Admits or denies callers using a sliding window log.
///
/// Backends are tried in the order they were added; the first one that produces a decision
/// wins. A backend that errors or exceeds the timeout is skipped for this call. When every
/// backend is unavailable the local [InMemoryBackend] decides, which only enforces the limit
/// per process.
#[derive(Clone)]
pub struct RateLimiter {
    backends: Arc<Vec<Arc<dyn Backend>>>,
    local: InMemoryBackend,
    resolver: InstitutionConfigResolver,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    /// # Arguments
    ///
    /// * `local`: The process-wide last resort store. Create it once and share it.
    /// * `resolver`: Supplies per institution limits.
    pub fn builder(local: InMemoryBackend, resolver: InstitutionConfigResolver) -> RateLimiterBuilder {
        RateLimiterBuilder {
            backends: Vec::new(),
            local,
            resolver,
            clock: Arc::new(SystemClock),
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub async fn check(&self, identifier: &str, options: CheckOptions<'_>) -> RateLimitDecision {
        let config = self.resolver.resolve(options.tenant_id).await;
        let input = SlidingWindowInput {
            interval: Duration::from_secs(options.window_seconds.unwrap_or(config.window_seconds)),
            max_requests: options.limit.unwrap_or(config.limit),
            key: rate_limit_key(identifier, options.tenant_id),
        };
        let now = self.clock.now_millis();

        for backend in self.backends.iter() {
            match self.attempt(backend.as_ref(), &input, now).await {
                Ok(decision) => {
                    log::debug!(
                        "Rate limit {} via {}: allowed={} remaining={}",
                        input.key,
                        backend.name(),
                        decision.allowed,
                        decision.remaining
                    );
                    return decision;
                }
                Err(e) => {
                    log::warn!(
                        "Rate limit backend {} unavailable: {e}, trying the next backend",
                        backend.name()
                    );
                }
            }
        }

        if !self.backends.is_empty() {
            log::warn!(
                "All shared rate limit backends unavailable, using the per-process store for {}",
                input.key
            );
        }
        self.local.check(&input, now)
    }

    /// The current time on this limiter's clock, in epoch milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    async fn attempt(
        &self,
        backend: &dyn Backend,
        input: &SlidingWindowInput,
        now: u64,
    ) -> Result<RateLimitDecision, Unavailable> {
        actix_web::rt::time::timeout(self.timeout, backend.request(input, now))
            .await
            .map_err(|_| Unavailable::Timeout(self.timeout))?
    }
}

pub struct RateLimiterBuilder {
    backends: Vec<Arc<dyn Backend>>,
    local: InMemoryBackend,
    resolver: InstitutionConfigResolver,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiterBuilder {
    /// Append a backend to the chain, ahead of the local store.
    pub fn backend<B: Backend + 'static>(mut self, backend: B) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    /// Upper bound on a single backend call.
    ///
    /// Default is 2 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            backends: Arc::new(self.backends),
            local: self.local,
            resolver: self.resolver,
            clock: self.clock,
            timeout: self.timeout,
        }
    }
}
