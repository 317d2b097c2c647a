use crate::backend::RateLimitDecision;
use crate::clock::{Clock, SystemClock};
use crate::ip::{IpAdmissionChecker, IpAdmissionDecision};
use crate::limiter::RateLimiter;
use crate::middleware::{AdmissionGate, IpDeniedResponse, KeyFn, RateDeniedResponse};
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use serde_json::json;
use std::rc::Rc;

pub static X_RATELIMIT_LIMIT: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-limit"));

pub static X_RATELIMIT_REMAINING: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-remaining"));

pub static X_RATELIMIT_RESET: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-ratelimit-reset"));

/// Response headers describing a rate limit decision:
///
/// - `x-ratelimit-limit`
/// - `x-ratelimit-remaining`
/// - `x-ratelimit-reset` (epoch seconds)
/// - `retry-after` (`0` when allowed, otherwise seconds until the reset)
///
/// `retry-after` is measured against the system clock, use [rate_limit_headers_at] when the
/// decision came from a limiter with a different [Clock].
pub fn rate_limit_headers(decision: &RateLimitDecision) -> HeaderMap {
    rate_limit_headers_at(decision, SystemClock.now_millis())
}

/// [rate_limit_headers] with `retry-after` measured from `now_millis` (epoch milliseconds).
pub fn rate_limit_headers_at(decision: &RateLimitDecision, now_millis: u64) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    map.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    map.insert(
        X_RATELIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_at.div_ceil(1000)),
    );
    let retry_after = if decision.allowed {
        0
    } else {
        decision.seconds_until_reset(now_millis)
    };
    map.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    map
}

fn default_ip_denied_response(_: &IpAdmissionDecision) -> HttpResponse {
    HttpResponse::Forbidden().json(json!({ "error": "Forbidden" }))
}

pub(super) fn default_rate_denied_response(headers: &HeaderMap) -> HttpResponse {
    let mut response = HttpResponse::TooManyRequests().json(json!({
        "error": "Too many requests",
        "retry_after": headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()),
    }));
    let map = response.headers_mut();
    for (name, value) in headers {
        map.insert(name.clone(), value.clone());
    }
    response
}

pub struct AdmissionGateBuilder {
    limiter: Option<RateLimiter>,
    ip_checker: Option<IpAdmissionChecker>,
    identifier_fn: Option<Rc<KeyFn>>,
    tenant_fn: Option<Rc<KeyFn>>,
    add_headers: bool,
    ip_denied_response: Rc<IpDeniedResponse>,
    rate_denied_response: Option<Rc<RateDeniedResponse>>,
}

impl AdmissionGateBuilder {
    pub(super) fn new() -> Self {
        Self {
            limiter: None,
            ip_checker: None,
            identifier_fn: None,
            tenant_fn: None,
            add_headers: false,
            ip_denied_response: Rc::new(default_ip_denied_response),
            rate_denied_response: None,
        }
    }

    /// Rate limit requests with the given limiter.
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Check client IPs against the institution and environment allow-lists.
    pub fn ip_checker(mut self, checker: IpAdmissionChecker) -> Self {
        self.ip_checker = Some(checker);
        self
    }

    /// How to identify the caller for rate limiting, e.g. a device id or phone number.
    ///
    /// When unset, or when the function returns [None], the client IP is used.
    pub fn identifier_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.identifier_fn = Some(Rc::new(f));
        self
    }

    /// How to determine the institution a request belongs to.
    ///
    /// By default requests are not scoped to an institution.
    pub fn tenant_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Option<String> + 'static,
    {
        self.tenant_fn = Some(Rc::new(f));
        self
    }

    /// Add the [rate_limit_headers] to allowed responses.
    ///
    /// Denied responses carry them regardless, unless a custom denied response is set.
    pub fn add_headers(mut self) -> Self {
        self.add_headers = true;
        self
    }

    /// Configure the [HttpResponse] returned when the client IP is rejected.
    ///
    /// Defaults to a 403 that does not reveal the reason.
    pub fn ip_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&IpAdmissionDecision) -> HttpResponse + 'static,
    {
        self.ip_denied_response = Rc::new(denied_response);
        self
    }

    /// Configure the [HttpResponse] returned when the caller is over its limit.
    ///
    /// Defaults to a 429 with the rate limit headers and `retry-after`.
    pub fn rate_denied_response<R>(mut self, denied_response: R) -> Self
    where
        R: Fn(&RateLimitDecision) -> HttpResponse + 'static,
    {
        self.rate_denied_response = Some(Rc::new(denied_response));
        self
    }

    pub fn build(self) -> AdmissionGate {
        AdmissionGate {
            limiter: self.limiter,
            ip_checker: self.ip_checker,
            identifier_fn: self.identifier_fn,
            tenant_fn: self.tenant_fn,
            add_headers: self.add_headers,
            ip_denied_response: self.ip_denied_response,
            rate_denied_response: self.rate_denied_response,
        }
    }
}
