//! Process-wide configuration, read from the environment.

use crate::backend::{DatabaseBackend, InMemoryBackend, RestCacheBackend, Unavailable};
use crate::config::{ConfigSource, InstitutionConfigResolver, RateConfig};
use crate::ip::{IpAdmissionChecker, WhitelistSource};
use crate::limiter::{RateLimiter, DEFAULT_BACKEND_TIMEOUT};
use crate::store::{RestStore, StoreError};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const CACHE_URL_VAR: &str = "UPSTASH_REDIS_REST_URL";
pub const CACHE_TOKEN_VAR: &str = "UPSTASH_REDIS_REST_TOKEN";
pub const STORE_URL_VAR: &str = "SUPABASE_URL";
pub const STORE_KEY_VAR: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const ALLOWED_IPS_VAR: &str = "ALLOWED_IPS";
pub const DEFAULT_LIMIT_VAR: &str = "RATE_LIMIT_DEFAULT_LIMIT";
pub const DEFAULT_WINDOW_VAR: &str = "RATE_LIMIT_DEFAULT_WINDOW_SECONDS";
pub const TIMEOUT_VAR: &str = "ADMISSION_BACKEND_TIMEOUT_MS";
pub const KEY_PREFIX_VAR: &str = "RATE_LIMIT_KEY_PREFIX";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Unable to create relational store client: {0}")]
    Store(
        #[source]
        #[from]
        StoreError,
    ),
    #[error("Unable to create cache client: {0}")]
    Cache(
        #[source]
        #[from]
        Unavailable,
    ),
}

/// Credentials for a service reached over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// The shared counter cache, unset when not configured.
    pub cache: Option<ServiceCredentials>,
    /// The durable relational store, unset when not configured.
    pub store: Option<ServiceCredentials>,
    /// Comma separated global allow-list.
    pub allowed_ips: Option<String>,
    pub defaults: RateConfig,
    pub backend_timeout: Duration,
    pub key_prefix: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: None,
            store: None,
            allowed_ips: None,
            defaults: RateConfig::default(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            key_prefix: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`, which returns the raw value of a variable.
    ///
    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let credentials = |url: &str, token: &str| match (get(url), get(token)) {
            (Some(url), Some(token)) => Some(ServiceCredentials { url, token }),
            _ => None,
        };

        let defaults = RateConfig::default();
        Ok(Self {
            cache: credentials(CACHE_URL_VAR, CACHE_TOKEN_VAR),
            store: credentials(STORE_URL_VAR, STORE_KEY_VAR),
            allowed_ips: get(ALLOWED_IPS_VAR),
            defaults: RateConfig {
                limit: parse(DEFAULT_LIMIT_VAR, get(DEFAULT_LIMIT_VAR))?.unwrap_or(defaults.limit),
                window_seconds: parse(DEFAULT_WINDOW_VAR, get(DEFAULT_WINDOW_VAR))?
                    .unwrap_or(defaults.window_seconds),
            },
            backend_timeout: parse(TIMEOUT_VAR, get(TIMEOUT_VAR))?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BACKEND_TIMEOUT),
            key_prefix: get(KEY_PREFIX_VAR),
        })
    }

    pub fn rest_store(&self) -> Result<Option<RestStore>, SettingsError> {
        self.store
            .as_ref()
            .map(|c| RestStore::new(&c.url, &c.token, self.backend_timeout))
            .transpose()
            .map_err(Into::into)
    }

    /// Builds the rate limiter: shared cache first, then the relational store, then `local`.
    ///
    /// Backends whose credentials are missing are left out of the chain.
    pub fn rate_limiter(&self, local: InMemoryBackend) -> Result<RateLimiter, SettingsError> {
        let store = self.rest_store()?;
        let source = store
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn ConfigSource>);
        let resolver = InstitutionConfigResolver::new(source).with_defaults(self.defaults);
        let mut builder = RateLimiter::builder(local, resolver).timeout(self.backend_timeout);
        if let Some(cache) = &self.cache {
            let backend = RestCacheBackend::new(&cache.url, &cache.token, self.backend_timeout)?
                .key_prefix(self.key_prefix.as_deref());
            builder = builder.backend(backend);
        }
        if let Some(store) = store {
            builder = builder.backend(DatabaseBackend::new(store));
        }
        Ok(builder.build())
    }

    pub fn ip_checker(&self) -> Result<IpAdmissionChecker, SettingsError> {
        let source = self
            .rest_store()?
            .map(|store| Arc::new(store) as Arc<dyn WhitelistSource>);
        Ok(IpAdmissionChecker::new(source).with_environment_list(self.allowed_ips.as_deref()))
    }
}

fn parse<T: FromStr>(name: &'static str, value: Option<String>) -> Result<Option<T>, SettingsError> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| SettingsError::InvalidValue { name, value: v })
        })
        .transpose()
}
