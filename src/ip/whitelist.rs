use crate::ip::cidr::{ip_matches, matches_any};
use crate::store::{RestStore, StoreError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const REASON_NO_IP: &str = "no IP address provided";
pub const REASON_NOT_IN_INSTITUTION: &str = "IP not in institution whitelist";
pub const REASON_NOT_IN_ENVIRONMENT: &str = "IP not in environment whitelist";

/// One allow-list row of an institution.
///
/// Columns are read leniently: a row with a missing address or an out of range prefix is kept,
/// but never matches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WhitelistEntry {
    #[serde(rename = "institution_id", default)]
    pub tenant_id: String,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub cidr_prefix: Option<i64>,
    #[serde(default = "active_by_default")]
    pub is_active: bool,
}

fn active_by_default() -> bool {
    true
}

impl WhitelistEntry {
    pub fn new(tenant_id: &str, ip_address: &str, cidr_prefix: Option<u8>) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            ip_address: Some(ip_address.to_owned()),
            cidr_prefix: cidr_prefix.map(i64::from),
            is_active: true,
        }
    }

    /// A row that could not be read at all.
    fn unreadable(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_owned(),
            ip_address: None,
            cidr_prefix: None,
            is_active: true,
        }
    }

    /// Whether `ip` is covered by this entry.
    pub fn matches(&self, ip: &str) -> bool {
        let Some(address) = self.ip_address.as_deref() else {
            return false;
        };
        match self.cidr_prefix {
            Some(_) if address.contains('/') => ip_matches(ip, address),
            Some(prefix) => match u8::try_from(prefix) {
                Ok(prefix) => ip_matches(ip, &format!("{address}/{prefix}")),
                Err(_) => false,
            },
            None => ip_matches(ip, address),
        }
    }
}

/// Which layer produced an [IpAdmissionDecision].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    TenantStore,
    Environment,
    Default,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionSource::TenantStore => "tenant-store",
            DecisionSource::Environment => "environment",
            DecisionSource::Default => "default",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAdmissionDecision {
    pub allowed: bool,
    /// Why the request was denied, intended for operators.
    pub reason: Option<String>,
    pub source: DecisionSource,
}

impl IpAdmissionDecision {
    fn allow(source: DecisionSource) -> Self {
        Self {
            allowed: true,
            reason: None,
            source,
        }
    }

    fn deny(reason: &str, source: DecisionSource) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_owned()),
            source,
        }
    }
}

/// Where institution allow-lists are loaded from.
#[async_trait]
pub trait WhitelistSource: Send + Sync {
    /// Active entries of the institution, possibly none.
    async fn active_entries(&self, tenant_id: &str) -> Result<Vec<WhitelistEntry>, StoreError>;
}

#[async_trait]
impl WhitelistSource for RestStore {
    async fn active_entries(&self, tenant_id: &str) -> Result<Vec<WhitelistEntry>, StoreError> {
        // Rows are decoded one by one so that a single bad row cannot void the whole list
        let rows: Vec<Value> = self
            .select(
                "ip_whitelist",
                "institution_id,ip_address,cidr_prefix,is_active",
                &[
                    ("institution_id", format!("eq.{tenant_id}")),
                    ("is_active", "eq.true".to_string()),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(row).unwrap_or_else(|e| {
                    log::warn!("Unreadable IP whitelist row for institution {tenant_id}: {e}");
                    WhitelistEntry::unreadable(tenant_id)
                })
            })
            .collect())
    }
}

/// Static allow-lists, keyed by tenant id.
#[async_trait]
impl WhitelistSource for HashMap<String, Vec<WhitelistEntry>> {
    async fn active_entries(&self, tenant_id: &str) -> Result<Vec<WhitelistEntry>, StoreError> {
        Ok(self
            .get(tenant_id)
            .map(|entries| entries.iter().filter(|e| e.is_active).cloned().collect())
            .unwrap_or_default())
    }
}

/// Decides whether a client IP may reach an institution's endpoints.
///
/// The layers form a strict chain: a definitive answer from the institution's allow-list is
/// returned as-is, and only an inconclusive lookup (no tenant, or a failed query) reaches the
/// process-wide list. Absent configuration at either layer admits the request.
#[derive(Clone, Default)]
pub struct IpAdmissionChecker {
    source: Option<Arc<dyn WhitelistSource>>,
    environment: Option<Arc<Vec<String>>>,
}

impl IpAdmissionChecker {
    pub fn new(source: Option<Arc<dyn WhitelistSource>>) -> Self {
        Self {
            source,
            environment: None,
        }
    }

    /// Sets the process-wide allow-list from a comma separated string of addresses and CIDR
    /// blocks. `None` or a blank string leaves the list unset.
    pub fn with_environment_list(mut self, list: Option<&str>) -> Self {
        self.environment = list
            .map(parse_list)
            .filter(|entries| !entries.is_empty())
            .map(Arc::new);
        self
    }

    pub async fn check(&self, ip: Option<&str>, tenant_id: Option<&str>) -> IpAdmissionDecision {
        let Some(ip) = ip.map(str::trim).filter(|ip| !ip.is_empty()) else {
            return IpAdmissionDecision::deny(REASON_NO_IP, DecisionSource::Default);
        };

        if let (Some(tenant_id), Some(source)) = (tenant_id, &self.source) {
            match source.active_entries(tenant_id).await {
                Ok(entries) if entries.is_empty() => {
                    return IpAdmissionDecision::allow(DecisionSource::Default);
                }
                Ok(entries) => {
                    return if entries.iter().any(|entry| entry.matches(ip)) {
                        IpAdmissionDecision::allow(DecisionSource::TenantStore)
                    } else {
                        log::debug!("IP {ip} not in whitelist of institution {tenant_id}");
                        IpAdmissionDecision::deny(
                            REASON_NOT_IN_INSTITUTION,
                            DecisionSource::TenantStore,
                        )
                    };
                }
                Err(e) => {
                    log::error!(
                        "Failed to load IP whitelist for institution {tenant_id}: {e}, \
                         falling back to the environment whitelist"
                    );
                }
            }
        }

        match &self.environment {
            None => IpAdmissionDecision::allow(DecisionSource::Default),
            Some(entries) if matches_any(ip, entries.iter().map(String::as_str)) => {
                IpAdmissionDecision::allow(DecisionSource::Environment)
            }
            Some(_) => {
                log::debug!("IP {ip} not in environment whitelist");
                IpAdmissionDecision::deny(REASON_NOT_IN_ENVIRONMENT, DecisionSource::Environment)
            }
        }
    }
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
