//! Client for the durable relational store, exposed over a PostgREST style HTTP API.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(
        #[source]
        #[from]
        reqwest::Error,
    ),
    #[error("Unexpected response status {0}")]
    Status(u16),
    #[error("Malformed store response: {0}")]
    Malformed(String),
}

/// A handle to the relational store.
///
/// Cheap to clone, the underlying [reqwest::Client] is reference counted.
#[derive(Clone, Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
}

impl RestStore {
    /// # Arguments
    ///
    /// * `base_url`: Project URL, e.g. `https://xyz.example.co`. The `/rest/v1` suffix is added.
    /// * `service_key`: Sent both as the `apikey` header and as a bearer token.
    /// * `timeout`: Applied to every request made through this store.
    pub fn new(base_url: &str, service_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(service_key)
            .map_err(|e| StoreError::Malformed(format!("invalid service key: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .map_err(|e| StoreError::Malformed(format!("invalid service key: {e}")))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
        })
    }

    /// Calls a stored procedure with named arguments.
    pub async fn rpc<B, T>(&self, function: &str, args: &B) -> Result<T, StoreError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/rpc/{function}", self.base_url);
        let response = self.client.post(url).json(args).send().await?;
        Self::parse(response).await
    }

    /// Selects rows from a table, `filters` are PostgREST query parameters such as
    /// `("institution_id", "eq.t1")`.
    pub async fn select<T>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let params = std::iter::once(("select", columns))
            .chain(filters.iter().map(|(name, value)| (*name, value.as_str())));
        let url = reqwest::Url::parse_with_params(&format!("{}/{table}", self.base_url), params)
            .map_err(|e| StoreError::Malformed(format!("invalid store URL: {e}")))?;
        let response = self.client.get(url).send().await?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}
