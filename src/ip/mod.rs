pub mod cidr;
mod extract;
mod whitelist;

pub use extract::{extract_client_ip, CF_CONNECTING_IP, X_FORWARDED_FOR, X_REAL_IP};
pub use whitelist::{
    DecisionSource, IpAdmissionChecker, IpAdmissionDecision, WhitelistEntry, WhitelistSource,
    REASON_NOT_IN_ENVIRONMENT, REASON_NOT_IN_INSTITUTION, REASON_NO_IP,
};

#[cfg(test)]
pub(crate) use whitelist::tests::static_source;
