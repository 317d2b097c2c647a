use actix_web::http::header::HeaderMap;
use std::net::IpAddr;

/// Connecting IP as reported by the edge network.
pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Determines the client IP from proxy headers.
///
/// Sources, in priority order: the edge `cf-connecting-ip` header, the first address of the
/// `x-forwarded-for` chain, then `x-real-ip`. The first source holding a parseable address wins
/// and later sources are not consulted.
///
/// # Security
///
/// These headers are client controlled unless a proxy you trust overwrites them. Only rely on
/// this behind such a proxy.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &'static str| headers.get(name).and_then(|v| v.to_str().ok());

    let candidates = [
        header(CF_CONNECTING_IP),
        header(X_FORWARDED_FOR).and_then(|chain| chain.split(',').next()),
        header(X_REAL_IP),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| candidate.parse::<IpAddr>().is_ok())
        .map(ToOwned::to_owned)
}
