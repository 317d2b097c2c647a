use crate::backend::{
    parse_script_reply, window_member, Backend, RateLimitDecision, SlidingWindowInput,
    Unavailable, SLIDING_WINDOW_SCRIPT,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::time::Duration;

/// A sliding window [Backend] for a Redis compatible cache reached over HTTP.
///
/// Each check is a single `EVAL` command posted as a JSON array, so the prune, count, record and
/// expire steps run atomically on the cache server. This is the only tier that stays correct when
/// many instances check the same key concurrently.
#[derive(Clone, Debug)]
pub struct RestCacheBackend {
    client: reqwest::Client,
    url: String,
    key_prefix: Option<String>,
}

/// Reply envelope: either `{"result": ...}` or `{"error": "..."}`.
#[derive(Debug, Deserialize)]
struct CommandReply {
    result: Option<Value>,
    error: Option<String>,
}

impl RestCacheBackend {
    /// # Arguments
    ///
    /// * `url`: Base URL of the cache REST endpoint.
    /// * `token`: Bearer credential.
    /// * `timeout`: Applied to every request.
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, Unavailable> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Unavailable::Malformed(format!("invalid cache token: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            key_prefix: None,
        })
    }

    /// Apply an optional prefix to all rate limit keys given to this backend.
    ///
    /// The prefix is used as a namespace to avoid collision with other keys in the cache.
    pub fn key_prefix(mut self, key_prefix: Option<&str>) -> Self {
        self.key_prefix = key_prefix.map(ToOwned::to_owned);
        self
    }

    fn make_key<'t>(&self, key: &'t str) -> Cow<'t, str> {
        match &self.key_prefix {
            None => Cow::Borrowed(key),
            Some(prefix) => Cow::Owned(format!("{prefix}{key}")),
        }
    }
}

#[async_trait]
impl Backend for RestCacheBackend {
    fn name(&self) -> &'static str {
        "rest-cache"
    }

    async fn request(
        &self,
        input: &SlidingWindowInput,
        now_millis: u64,
    ) -> Result<RateLimitDecision, Unavailable> {
        let key = self.make_key(&input.key);
        let command = json!([
            "EVAL",
            SLIDING_WINDOW_SCRIPT,
            "1",
            &*key,
            now_millis.to_string(),
            input.window_millis().to_string(),
            input.max_requests.to_string(),
            window_member(now_millis),
        ]);
        let response = self.client.post(&self.url).json(&command).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Unavailable::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        let reply: CommandReply =
            serde_json::from_slice(&bytes).map_err(|e| Unavailable::Malformed(e.to_string()))?;
        if let Some(error) = reply.error {
            return Err(Unavailable::Remote(error));
        }
        let result = reply
            .result
            .ok_or_else(|| Unavailable::Malformed("missing result".to_string()))?;
        let values: Vec<i64> =
            serde_json::from_value(result).map_err(|e| Unavailable::Malformed(e.to_string()))?;
        parse_script_reply(input, &values, now_millis)
    }
}
