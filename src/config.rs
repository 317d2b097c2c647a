//! Per-institution rate limit configuration.

use crate::store::{RestStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;

/// The limit and window applied to one institution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub limit: u64,
    pub window_seconds: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

/// An institution's override. Unset fields fall back to the resolver's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateOverride {
    pub limit: Option<u64>,
    pub window_seconds: Option<u64>,
}

impl RateOverride {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.window_seconds.is_none()
    }

    pub fn apply(&self, defaults: RateConfig) -> RateConfig {
        RateConfig {
            limit: self.limit.unwrap_or(defaults.limit),
            window_seconds: self.window_seconds.unwrap_or(defaults.window_seconds),
        }
    }
}

impl From<RateConfig> for RateOverride {
    fn from(config: RateConfig) -> Self {
        Self {
            limit: Some(config.limit),
            window_seconds: Some(config.window_seconds),
        }
    }
}

/// Where institution overrides are loaded from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// `Ok(None)` when the institution has no override configured.
    async fn fetch(&self, tenant_id: &str) -> Result<Option<RateOverride>, StoreError>;
}

#[derive(Debug, Deserialize)]
struct InstitutionSettingsRow {
    rate_limit: Option<i64>,
    rate_limit_window_seconds: Option<i64>,
}

/// Non-positive values are treated as unset.
fn positive(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok()).filter(|v| *v > 0)
}

#[async_trait]
impl ConfigSource for RestStore {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<RateOverride>, StoreError> {
        let rows: Vec<InstitutionSettingsRow> = self
            .select(
                "institution_settings",
                "rate_limit,rate_limit_window_seconds",
                &[
                    ("institution_id", format!("eq.{tenant_id}")),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let overrides = RateOverride {
            limit: positive(row.rate_limit),
            window_seconds: positive(row.rate_limit_window_seconds),
        };
        Ok((!overrides.is_empty()).then_some(overrides))
    }
}

/// Static overrides, keyed by tenant id.
#[async_trait]
impl ConfigSource for HashMap<String, RateConfig> {
    async fn fetch(&self, tenant_id: &str) -> Result<Option<RateOverride>, StoreError> {
        Ok(self.get(tenant_id).copied().map(RateOverride::from))
    }
}

/// Resolves the [RateConfig] for an institution.
///
/// Overrides are memoized for the lifetime of the process; there is no invalidation, so a
/// changed override only takes effect after a restart. Lookup failures and missing overrides
/// resolve to the defaults and are not cached. A partial override takes its missing field from
/// the defaults.
#[derive(Clone)]
pub struct InstitutionConfigResolver {
    source: Option<Arc<dyn ConfigSource>>,
    cache: Arc<DashMap<String, RateOverride>>,
    defaults: RateConfig,
}

impl InstitutionConfigResolver {
    pub fn new(source: Option<Arc<dyn ConfigSource>>) -> Self {
        Self {
            source,
            cache: Arc::new(DashMap::new()),
            defaults: RateConfig::default(),
        }
    }

    /// Override the global defaults.
    pub fn with_defaults(mut self, defaults: RateConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> RateConfig {
        self.defaults
    }

    pub async fn resolve(&self, tenant_id: Option<&str>) -> RateConfig {
        let Some(tenant_id) = tenant_id else {
            return self.defaults;
        };
        if let Some(overrides) = self.cache.get(tenant_id) {
            return overrides.apply(self.defaults);
        }
        let Some(source) = &self.source else {
            return self.defaults;
        };
        match source.fetch(tenant_id).await {
            Ok(Some(overrides)) => {
                self.cache.insert(tenant_id.to_owned(), overrides);
                overrides.apply(self.defaults)
            }
            Ok(None) => self.defaults,
            Err(e) => {
                log::error!("Failed to load rate limit config for institution {tenant_id}: {e}");
                self.defaults
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{authorized, serve, SERVICE_KEY};
    use actix_web::{web, App, HttpRequest, HttpResponse};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn fetch(&self, tenant_id: &str) -> Result<Option<RateOverride>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Status(503));
            }
            Ok((tenant_id == "t1").then_some(RateOverride {
                limit: Some(3),
                window_seconds: Some(60),
            }))
        }
    }

    #[actix_web::test]
    async fn test_no_tenant_uses_defaults() {
        let source = Arc::new(CountingSource::default());
        let resolver = InstitutionConfigResolver::new(Some(source.clone()));
        assert_eq!(resolver.resolve(None).await, RateConfig::default());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_override_is_cached() {
        let source = Arc::new(CountingSource::default());
        let resolver = InstitutionConfigResolver::new(Some(source.clone()));
        let expected = RateConfig {
            limit: 3,
            window_seconds: 60,
        };
        assert_eq!(resolver.resolve(Some("t1")).await, expected);
        assert_eq!(resolver.resolve(Some("t1")).await, expected);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_missing_override_is_not_cached() {
        let source = Arc::new(CountingSource::default());
        let resolver = InstitutionConfigResolver::new(Some(source.clone()));
        assert_eq!(resolver.resolve(Some("t2")).await, RateConfig::default());
        assert_eq!(resolver.resolve(Some("t2")).await, RateConfig::default());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn test_lookup_failure_uses_defaults() {
        let source = Arc::new(CountingSource {
            fail: true,
            ..Default::default()
        });
        let defaults = RateConfig {
            limit: 10,
            window_seconds: 5,
        };
        let resolver = InstitutionConfigResolver::new(Some(source)).with_defaults(defaults);
        assert_eq!(resolver.resolve(Some("t1")).await, defaults);
    }

    async fn settings(req: HttpRequest) -> HttpResponse {
        if !authorized(&req) {
            return HttpResponse::Unauthorized().finish();
        }
        let query = req.query_string();
        if query.contains("institution_id=eq.t1") {
            HttpResponse::Ok().json(json!([{ "rate_limit": 3, "rate_limit_window_seconds": 60 }]))
        } else if query.contains("institution_id=eq.t2") {
            HttpResponse::Ok().json(json!([{ "rate_limit": null, "rate_limit_window_seconds": null }]))
        } else if query.contains("institution_id=eq.t4") {
            HttpResponse::Ok().json(json!([{ "rate_limit": 7, "rate_limit_window_seconds": null }]))
        } else if query.contains("institution_id=eq.t5") {
            HttpResponse::Ok().json(json!([{ "rate_limit": -3, "rate_limit_window_seconds": 10 }]))
        } else {
            HttpResponse::Ok().json(json!([]))
        }
    }

    #[actix_web::test]
    async fn test_rest_store_source() {
        let url = serve!(|| App::new().route("/rest/v1/institution_settings", web::get().to(settings)));
        let store = RestStore::new(&url, SERVICE_KEY, Duration::from_secs(2)).unwrap();
        assert_eq!(
            store.fetch("t1").await.unwrap(),
            Some(RateOverride {
                limit: Some(3),
                window_seconds: Some(60)
            })
        );
        assert_eq!(store.fetch("t2").await.unwrap(), None);
        assert_eq!(store.fetch("t3").await.unwrap(), None);
    }

    #[actix_web::test]
    async fn test_partial_overrides_use_configured_defaults() {
        let url = serve!(|| App::new().route("/rest/v1/institution_settings", web::get().to(settings)));
        let store = RestStore::new(&url, SERVICE_KEY, Duration::from_secs(2)).unwrap();
        let defaults = RateConfig {
            limit: 20,
            window_seconds: 30,
        };
        let resolver = InstitutionConfigResolver::new(Some(Arc::new(store))).with_defaults(defaults);
        assert_eq!(
            resolver.resolve(Some("t4")).await,
            RateConfig {
                limit: 7,
                window_seconds: 30
            }
        );
        assert_eq!(
            resolver.resolve(Some("t5")).await,
            RateConfig {
                limit: 20,
                window_seconds: 10
            }
        );
        // Served from the cache the second time, still filled from the defaults
        assert_eq!(resolver.resolve(Some("t4")).await.window_seconds, 30);
    }

    #[test]
    fn test_positive() {
        assert_eq!(positive(Some(5)), Some(5));
        assert_eq!(positive(Some(0)), None);
        assert_eq!(positive(Some(-1)), None);
        assert_eq!(positive(None), None);
    }

    #[actix_web::test]
    async fn test_static_source() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "t1".to_string(),
            RateConfig {
                limit: 7,
                window_seconds: 30,
            },
        );
        let resolver = InstitutionConfigResolver::new(Some(Arc::new(overrides)));
        assert_eq!(resolver.resolve(Some("t1")).await.limit, 7);
        assert_eq!(resolver.resolve(Some("t9")).await, RateConfig::default());
    }
}
