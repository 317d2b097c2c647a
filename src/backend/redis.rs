use crate::backend::{
    parse_script_reply, window_member, Backend, RateLimitDecision, SlidingWindowInput,
    Unavailable, SLIDING_WINDOW_SCRIPT,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::borrow::Cow;

/// A sliding window [Backend] that stores windows as sorted sets in Redis, using a native
/// connection instead of the REST endpoint.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    script: Script,
    key_prefix: Option<String>,
}

impl RedisBackend {
    /// # Examples
    ///
    /// ```no_run
    /// # use tenant_admission::backend::redis::RedisBackend;
    /// # use redis::aio::ConnectionManager;
    /// # async fn connect() -> redis::RedisResult<RedisBackend> {
    /// let client = redis::Client::open("redis://cache.internal:6379/")?;
    /// let backend = RedisBackend::builder(ConnectionManager::new(client).await?)
    ///     .key_prefix(Some("admission:"))
    ///     .build();
    /// # Ok(backend)
    /// # }
    /// ```
    pub fn builder(connection: ConnectionManager) -> RedisBackendBuilder {
        RedisBackendBuilder {
            connection,
            key_prefix: None,
        }
    }

    fn prefixed<'k>(&self, key: &'k str) -> Cow<'k, str> {
        self.key_prefix
            .as_deref()
            .map_or(Cow::Borrowed(key), |prefix| Cow::Owned(format!("{prefix}{key}")))
    }
}

pub struct RedisBackendBuilder {
    connection: ConnectionManager,
    key_prefix: Option<String>,
}

impl RedisBackendBuilder {
    /// Namespace for the sorted sets, for a Redis instance shared with other applications.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(str::to_owned);
        self
    }

    pub fn build(self) -> RedisBackend {
        RedisBackend {
            connection: self.connection,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            key_prefix: self.key_prefix,
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn request(
        &self,
        input: &SlidingWindowInput,
        now_millis: u64,
    ) -> Result<RateLimitDecision, Unavailable> {
        let key = self.prefixed(&input.key);
        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self
            .script
            .key(key.as_ref())
            .arg(now_millis)
            .arg(input.window_millis())
            .arg(input.max_requests)
            .arg(window_member(now_millis))
            .invoke_async(&mut connection)
            .await?;
        parse_script_reply(input, &reply, now_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000_000;

    /// Connects to the server named by `REDIS_HOST` and `REDIS_PORT`, starting from an empty key.
    /// Tests run concurrently, so every test owns a distinct key.
    async fn connect(stale_key: &str) -> ConnectionManager {
        let host = option_env!("REDIS_HOST").unwrap_or("127.0.0.1");
        let port = option_env!("REDIS_PORT").unwrap_or("6379");
        let client = redis::Client::open(format!("redis://{host}:{port}")).unwrap();
        let mut connection = ConnectionManager::new(client).await.unwrap();
        connection.del::<_, ()>(stale_key).await.unwrap();
        connection
    }

    fn window(key: &str, max_requests: u64) -> SlidingWindowInput {
        SlidingWindowInput {
            interval: Duration::from_secs(60),
            max_requests,
            key: key.to_string(),
        }
    }

    #[actix_web::test]
    async fn test_limit_then_deny() {
        let key = "ratelimit:t1:redis-limit";
        let backend = RedisBackend::builder(connect(key).await).build();
        let input = window(key, 3);
        let mut seen = Vec::new();
        for offset in 0..4 {
            let decision = backend.request(&input, NOW + offset).await.unwrap();
            seen.push((decision.allowed, decision.remaining));
        }
        assert_eq!(seen, vec![(true, 2), (true, 1), (true, 0), (false, 0)]);
    }

    #[actix_web::test]
    async fn test_denied_not_recorded() {
        let key = "ratelimit:t1:redis-slide";
        let backend = RedisBackend::builder(connect(key).await).build();
        let input = window(key, 1);
        assert!(backend.request(&input, NOW).await.unwrap().is_allowed());
        assert!(backend.request(&input, NOW + 30_000).await.unwrap().is_denied());
        let decision = backend.request(&input, NOW + 60_000).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.reset_at, NOW + 120_000);
    }

    #[actix_web::test]
    async fn test_prefixed_sorted_set() {
        let key = "ratelimit:global:redis-prefix";
        let mut connection = connect(&format!("admission:{key}")).await;
        let backend = RedisBackend::builder(connection.clone())
            .key_prefix(Some("admission:"))
            .build();
        backend.request(&window(key, 5), NOW).await.unwrap();
        let members: u64 = connection.zcard(format!("admission:{key}")).await.unwrap();
        assert_eq!(members, 1);
    }
}
