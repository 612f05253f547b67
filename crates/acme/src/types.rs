//! ACME (RFC 8555) resource objects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker separating the URN namespace from the error category in a
/// problem document `type`.
pub const ACME_ERROR_MARKER: &str = ":acme:error:";

/// Directory resource advertised by an ACME server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: DirectoryMeta,
}

impl Directory {
    /// Terms of service URI the server requires agreement to, if any
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta
            .terms_of_service
            .as_deref()
            .filter(|terms| !terms.is_empty())
    }
}

/// Optional directory metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
}

/// Payload of a new-account request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub only_return_existing: bool,
}

impl NewAccount {
    /// Registration that agrees to the server's terms of service
    pub fn agree_to_terms() -> Self {
        Self {
            terms_of_service_agreed: true,
            ..Self::default()
        }
    }

    /// Lookup of the account bound to the signing key, without creating one
    pub fn existing_only() -> Self {
        Self {
            only_return_existing: true,
            ..Self::default()
        }
    }
}

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            AccountStatus::Valid => "valid",
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Revoked => "revoked",
        };
        f.write_str(status)
    }
}

/// Account resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account URL, taken from the `Location` header. Used as the JWS `kid`.
    #[serde(skip)]
    pub uri: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

/// Order or authorization identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    /// DNS identifier for `domain`
    pub fn dns(domain: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: domain.into(),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// Whether polling can stop: the order is ready to finalize, issued, or failed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid
        )
    }
}

impl From<&instant_acme::OrderStatus> for OrderStatus {
    fn from(status: &instant_acme::OrderStatus) -> Self {
        match status {
            instant_acme::OrderStatus::Pending => OrderStatus::Pending,
            instant_acme::OrderStatus::Ready => OrderStatus::Ready,
            instant_acme::OrderStatus::Processing => OrderStatus::Processing,
            instant_acme::OrderStatus::Valid => OrderStatus::Valid,
            instant_acme::OrderStatus::Invalid => OrderStatus::Invalid,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        };
        f.write_str(status)
    }
}

/// Order resource
///
/// A snapshot of the engine's order in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order URL, taken from the `Location` header on creation.
    #[serde(skip)]
    pub url: String,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Challenge resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

/// RFC 7807 problem document
///
/// Returned by ACME servers and by the localcert relay on failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    /// Reserved; decoded when present but not interpreted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<serde_json::Value>,
}

impl Problem {
    /// Decode a problem document from an error response body
    ///
    /// A body that is not a problem document still yields a `Problem`, with
    /// the decode failure recorded in `detail`.
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(problem) => problem,
            Err(e) => Problem {
                detail: format!("<error decoding body: {}>", e),
                ..Problem::default()
            },
        }
    }

    /// Machine-readable error category
    ///
    /// The lower-cased suffix of `type` after `:acme:error:`, e.g.
    /// `malformed` for `urn:ietf:params:acme:error:malformed`.
    pub fn category(&self) -> Option<String> {
        let (_, suffix) = self.kind.split_once(ACME_ERROR_MARKER)?;
        if suffix.contains(ACME_ERROR_MARKER) {
            return None;
        }
        Some(suffix.to_ascii_lowercase())
    }

    /// Whether the server rejected the request's replay nonce
    pub fn is_bad_nonce(&self) -> bool {
        self.category().as_deref() == Some("badnonce")
    }
}

impl From<&instant_acme::Problem> for Problem {
    fn from(problem: &instant_acme::Problem) -> Self {
        Problem {
            kind: problem.r#type.clone().unwrap_or_default(),
            detail: problem.detail.clone().unwrap_or_default(),
            ..Problem::default()
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind.is_empty(), self.detail.is_empty()) {
            (true, true) => f.write_str("<no problem detail>"),
            (true, false) => write!(f, "{:?}", self.detail),
            (false, true) => f.write_str(&self.kind),
            (false, false) => write!(f, "{}: {:?}", self.kind, self.detail),
        }
    }
}
