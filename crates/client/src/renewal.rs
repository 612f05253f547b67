//! Renewal planning for an existing certificate
//!
//! Decides whether to issue, keep or renew by inspecting the current leaf
//! certificate. A renewal reuses the leaf's domain so the relay is not asked
//! for a new one.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;

use crate::errors::LocalcertError;

/// What to do about the current certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalPlan {
    /// No certificate yet; acquire a domain and issue
    Issue,
    /// Current certificate is good for longer than the renewal window
    Keep { domain: String, expires_in: Duration },
    /// Renew for the same domain
    Renew { domain: String, expired: bool },
}

impl RenewalPlan {
    /// Domain to reuse, if any
    pub fn domain(&self) -> Option<&str> {
        match self {
            RenewalPlan::Issue => None,
            RenewalPlan::Keep { domain, .. } | RenewalPlan::Renew { domain, .. } => Some(domain.as_str()),
        }
    }

    /// Whether the plan requires talking to the CA
    pub fn needs_issuance(&self) -> bool {
        !matches!(self, RenewalPlan::Keep { .. })
    }
}

/// Fields of a leaf certificate relevant to renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub not_after: DateTime<Utc>,
}

impl LeafInfo {
    /// Domain the certificate was issued for
    ///
    /// The subject common name, falling back to the first DNS name.
    pub fn domain(&self) -> Option<&str> {
        self.common_name
            .as_deref()
            .or_else(|| self.dns_names.first().map(String::as_str))
    }
}

/// Parse a DER leaf certificate
pub fn inspect_leaf(der: &[u8]) -> Result<LeafInfo, LocalcertError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| LocalcertError::Certificate(format!("failed to parse leaf: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let dns_names: Vec<String> = cert
        .subject_alternative_name()
        .map_err(|e| LocalcertError::Certificate(format!("invalid subjectAltName: {}", e)))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let not_after_secs = cert.validity().not_after.timestamp();
    let not_after = DateTime::<Utc>::from_timestamp(not_after_secs, 0).ok_or_else(|| {
        LocalcertError::Certificate(format!("notAfter out of range: {}", not_after_secs))
    })?;

    Ok(LeafInfo {
        common_name,
        dns_names,
        not_after,
    })
}

/// Decide what to do about the certificate whose leaf is `leaf_der`
///
/// Without `force`, a certificate expiring later than `renew_before` from
/// `now` is kept.
pub fn plan_renewal(
    leaf_der: Option<&[u8]>,
    renew_before: Duration,
    now: DateTime<Utc>,
    force: bool,
) -> Result<RenewalPlan, LocalcertError> {
    let Some(der) = leaf_der else {
        debug!("No existing certificate");
        return Ok(RenewalPlan::Issue);
    };

    let leaf = inspect_leaf(der)?;
    let domain = leaf
        .domain()
        .ok_or_else(|| LocalcertError::Certificate("leaf names no domain".to_string()))?
        .to_string();

    let expires_in = leaf.not_after - now;
    let expired = expires_in <= Duration::zero();

    if !force && expires_in > renew_before {
        info!(
            domain = %domain,
            expires = %leaf.not_after,
            "Existing certificate does not need renewal"
        );
        return Ok(RenewalPlan::Keep { domain, expires_in });
    }

    info!(
        domain = %domain,
        expires = %leaf.not_after,
        expired,
        forced = force,
        "Existing certificate will be renewed"
    );
    Ok(RenewalPlan::Renew { domain, expired })
}
