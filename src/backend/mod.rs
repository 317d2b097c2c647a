mod database;
mod memory;
mod rest;

#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;

pub use database::DatabaseBackend;
pub use memory::{InMemoryBackend, InMemoryBackendBuilder, DEFAULT_GC_INTERVAL_SECONDS};
pub use rest::RestCacheBackend;

use crate::store::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Atomic sliding window log step, shared by every backend that speaks the Redis command set.
///
/// `KEYS[1]` is the window key, `ARGV` is `now_ms, window_ms, limit, member`.
/// Returns `{allowed, count}` where `count` includes the request if it was admitted.
pub(crate) const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)
return {allowed, count}
"#;

/// Input for one sliding window check.
#[derive(Debug, Clone)]
pub struct SlidingWindowInput {
    /// The length of the trailing window.
    pub interval: Duration,
    /// The total requests to be allowed within the window.
    pub max_requests: u64,
    /// The namespaced rate limit key.
    pub key: String,
}

impl SlidingWindowInput {
    /// Saturates for windows that do not fit in a `u64` of milliseconds.
    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX)
    }

    /// The approximate end of a window starting now, saturating at the far future.
    pub(crate) fn window_end(&self, now_millis: u64) -> u64 {
        now_millis.saturating_add(self.window_millis())
    }

    /// The decision for a window that holds `count` entries after this request was considered.
    pub(crate) fn decide(&self, allowed: bool, count: u64, now_millis: u64) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            remaining: self.max_requests.saturating_sub(count),
            reset_at: self.window_end(now_millis),
            limit: self.max_requests,
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests still permitted in the current window.
    pub remaining: u64,
    /// Approximate end of the window, in epoch milliseconds.
    ///
    /// This is `now + window` rather than the expiry of the oldest entry.
    pub reset_at: u64,
    /// The limit applied to this check.
    pub limit: u64,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }

    /// Seconds from `now_millis` until the window resets, rounded upwards.
    pub fn seconds_until_reset(&self, now_millis: u64) -> u64 {
        self.reset_at.saturating_sub(now_millis).div_ceil(1000)
    }
}

/// Reason a backend could not produce a decision for this call.
#[derive(Debug, Error)]
pub enum Unavailable {
    #[error("HTTP error: {0}")]
    Http(
        #[source]
        #[from]
        reqwest::Error,
    ),
    #[error("Unexpected response status {0}")]
    Status(u16),
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),
    #[error("Malformed backend response: {0}")]
    Malformed(String),
    #[error("Backend returned an error: {0}")]
    Remote(String),
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(
        #[source]
        #[from]
        ::redis::RedisError,
    ),
}

impl From<StoreError> for Unavailable {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Http(e) => Unavailable::Http(e),
            StoreError::Status(status) => Unavailable::Status(status),
            StoreError::Malformed(msg) => Unavailable::Malformed(msg),
        }
    }
}

/// One tier of the rate limiting fallback chain.
///
/// Implementations must perform the prune, count, record and expire steps atomically for a key,
/// and must report any failure as [Unavailable] so the next tier can be tried.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &'static str;

    async fn request(
        &self,
        input: &SlidingWindowInput,
        now_millis: u64,
    ) -> Result<RateLimitDecision, Unavailable>;
}

static MEMBER_SEQ: AtomicU64 = AtomicU64::new(0);

/// A sorted-set member that is unique across concurrent instances writing the same millisecond.
pub(crate) fn window_member(now_millis: u64) -> String {
    let seq = MEMBER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{now_millis}-{}-{seq}", std::process::id())
}

/// Parses the `{allowed, count}` reply of [SLIDING_WINDOW_SCRIPT].
pub(crate) fn parse_script_reply(
    input: &SlidingWindowInput,
    reply: &[i64],
    now_millis: u64,
) -> Result<RateLimitDecision, Unavailable> {
    match reply {
        [allowed, count] if *count >= 0 => Ok(input.decide(*allowed == 1, *count as u64, now_millis)),
        other => Err(Unavailable::Malformed(format!(
            "expected [allowed, count], got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(max_requests: u64) -> SlidingWindowInput {
        SlidingWindowInput {
            interval: Duration::from_secs(60),
            max_requests,
            key: "ratelimit:global:dev-A".to_string(),
        }
    }

    #[test]
    fn test_seconds_until_reset_rounds_up() {
        let decision = input(1).decide(true, 1, 1_000);
        assert_eq!(decision.reset_at, 61_000);
        assert_eq!(decision.seconds_until_reset(30_900), 31);
        assert_eq!(decision.seconds_until_reset(61_000), 0);
        assert_eq!(decision.seconds_until_reset(90_000), 0);
    }

    #[test]
    fn test_huge_window_saturates() {
        let input = SlidingWindowInput {
            interval: Duration::from_secs(u64::MAX),
            max_requests: 1,
            key: "ratelimit:global:dev-A".to_string(),
        };
        assert_eq!(input.window_millis(), u64::MAX);
        let decision = input.decide(true, 1, 1_000);
        assert_eq!(decision.reset_at, u64::MAX);
        assert_eq!(decision.seconds_until_reset(1_000), (u64::MAX - 1_000).div_ceil(1000));
    }

    #[test]
    fn test_parse_script_reply() {
        let decision = parse_script_reply(&input(3), &[1, 1], 0).unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.limit, 3);

        let decision = parse_script_reply(&input(3), &[0, 3], 0).unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.remaining, 0);

        assert!(matches!(
            parse_script_reply(&input(3), &[1], 0),
            Err(Unavailable::Malformed(_))
        ));
        assert!(matches!(
            parse_script_reply(&input(3), &[1, -1], 0),
            Err(Unavailable::Malformed(_))
        ));
    }

    #[test]
    fn test_window_members_are_unique() {
        assert_ne!(window_member(5), window_member(5));
    }
}
