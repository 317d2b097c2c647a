pub mod builder;

use crate::backend::RateLimitDecision;
use crate::ip::{extract_client_ip, IpAdmissionChecker, IpAdmissionDecision};
use crate::limiter::{CheckOptions, RateLimiter};
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::HttpResponse;
use builder::{default_rate_denied_response, rate_limit_headers_at, AdmissionGateBuilder};
use futures::future::{ok, LocalBoxFuture, Ready};
use std::rc::Rc;

type KeyFn = dyn Fn(&ServiceRequest) -> Option<String>;
type IpDeniedResponse = dyn Fn(&IpAdmissionDecision) -> HttpResponse;
type RateDeniedResponse = dyn Fn(&RateLimitDecision) -> HttpResponse;

/// Admission control middleware.
///
/// Runs the IP allow-list check, then the rate limit check, before the wrapped service. Either
/// check may be left unconfigured, in which case it is skipped. Neither check can fail: backend
/// problems resolve to a decision inside the checkers.
pub struct AdmissionGate {
    limiter: Option<RateLimiter>,
    ip_checker: Option<IpAdmissionChecker>,
    identifier_fn: Option<Rc<KeyFn>>,
    tenant_fn: Option<Rc<KeyFn>>,
    add_headers: bool,
    ip_denied_response: Rc<IpDeniedResponse>,
    /// `None` sends the default 429 with the rate limit headers.
    rate_denied_response: Option<Rc<RateDeniedResponse>>,
}

impl Clone for AdmissionGate {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            ip_checker: self.ip_checker.clone(),
            identifier_fn: self.identifier_fn.clone(),
            tenant_fn: self.tenant_fn.clone(),
            add_headers: self.add_headers,
            ip_denied_response: self.ip_denied_response.clone(),
            rate_denied_response: self.rate_denied_response.clone(),
        }
    }
}

impl AdmissionGate {
    pub fn builder() -> AdmissionGateBuilder {
        AdmissionGateBuilder::new()
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdmissionGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Transform = AdmissionGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AdmissionGateMiddleware {
            service: Rc::new(service),
            gate: self.clone(),
        })
    }
}

pub struct AdmissionGateMiddleware<S> {
    service: Rc<S>,
    gate: AdmissionGate,
}

impl<S, B> Service<ServiceRequest> for AdmissionGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();

        Box::pin(async move {
            let client_ip = extract_client_ip(req.headers());
            let tenant_id = gate.tenant_fn.as_ref().and_then(|f| f(&req));

            if let Some(checker) = &gate.ip_checker {
                let decision = checker
                    .check(client_ip.as_deref(), tenant_id.as_deref())
                    .await;
                if !decision.allowed {
                    log::warn!(
                        "Rejected request from {} ({}): {}",
                        client_ip.as_deref().unwrap_or("unknown IP"),
                        decision.source,
                        decision.reason.as_deref().unwrap_or_default()
                    );
                    let response = (gate.ip_denied_response)(&decision);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            }

            let mut rate_headers = None;
            if let Some(limiter) = &gate.limiter {
                let identifier = gate
                    .identifier_fn
                    .as_ref()
                    .and_then(|f| f(&req))
                    .or(client_ip)
                    .or_else(|| req.connection_info().peer_addr().map(ToOwned::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned());
                let options = CheckOptions {
                    tenant_id: tenant_id.as_deref(),
                    ..Default::default()
                };
                let decision = limiter.check(&identifier, options).await;
                let headers = rate_limit_headers_at(&decision, limiter.now_millis());
                if decision.is_denied() {
                    log::info!("Rate limited {identifier}, limit {}", decision.limit);
                    let response = match &gate.rate_denied_response {
                        Some(denied_response) => denied_response(&decision),
                        None => default_rate_denied_response(&headers),
                    };
                    return Ok(req.into_response(response).map_into_right_body());
                }
                rate_headers = Some(headers);
            }

            let mut service_response = service.call(req).await?;

            if gate.add_headers {
                if let Some(headers) = rate_headers {
                    let map = service_response.headers_mut();
                    for (name, value) in headers {
                        map.insert(name, value);
                    }
                }
            }

            Ok(service_response.map_into_left_body())
        })
    }
}
