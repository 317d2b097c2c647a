#![cfg_attr(docsrs, feature(doc_cfg))]
//! Admission control for multi-tenant HTTP entry points.
//!
//! Two checks decide whether a request reaches business logic:
//!
//! - [RateLimiter]: a sliding window log per `(institution, caller)` pair, stored in the first
//!   available of a shared cache, the relational store, or process memory.
//! - [IpAdmissionChecker]: the client IP against the institution's allow-list, falling back to a
//!   process-wide allow-list.
//!
//! Both checks fail open. A missing configuration or an unreachable backend never blocks a
//! request on its own; it resolves to the defaults and is logged.
//!
//! [AdmissionGate] wires both checks into an actix-web application.

pub mod backend;
pub mod clock;
pub mod config;
pub mod ip;
pub mod limiter;
mod middleware;
pub mod settings;
pub mod store;

pub use backend::RateLimitDecision;
pub use config::{InstitutionConfigResolver, RateConfig, RateOverride};
pub use ip::{extract_client_ip, IpAdmissionChecker, IpAdmissionDecision};
pub use limiter::{CheckOptions, RateLimiter};
pub use middleware::builder::{
    rate_limit_headers, rate_limit_headers_at, AdmissionGateBuilder, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use middleware::{AdmissionGate, AdmissionGateMiddleware};
pub use settings::Settings;
