//! Error types for the localcert client

use http::StatusCode;
use localcert_acme::{AccountStatus, AcmeError, CaptureError, Problem, TransportError};
use thiserror::Error;

use crate::orchestrator::OrderState;

/// Errors talking to the localcert relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("Relay returned {status}: {problem}")]
    Remote { status: StatusCode, problem: Problem },

    #[error("Failed to encode relay request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode relay response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RelayError {
    /// Machine-readable category of a remote error, e.g. `malformed`
    pub fn category(&self) -> Option<String> {
        match self {
            RelayError::Remote { problem, .. } => problem.category(),
            _ => None,
        }
    }

    /// Human-readable detail of a remote error
    pub fn detail(&self) -> Option<&str> {
        match self {
            RelayError::Remote { problem, .. } => Some(problem.detail.as_str()),
            _ => None,
        }
    }

    /// HTTP status of a remote error
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RelayError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Invalid client configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid {field} '{value}': {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("user_agent must not be empty")]
    EmptyUserAgent,
}

/// Top-level error of the localcert client
#[derive(Debug, Error)]
pub enum LocalcertError {
    /// An ACME engine call failed
    #[error("{context}: {source}")]
    Protocol {
        context: &'static str,
        #[source]
        source: AcmeError,
    },

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The directory requires agreement to terms that were not accepted
    ///
    /// Recoverable: accept `uri` and retry registration.
    #[error("Terms of service not accepted: {uri}")]
    TermsNotAccepted { uri: String },

    #[error("Account {uri} status is {status}")]
    StaleAccount { uri: String, status: AccountStatus },

    #[error("Order {url} is invalid: {}", describe_problem(.problem))]
    OrderInvalid { url: String, problem: Option<Problem> },

    #[error("Order {order} has no authorizations")]
    NoAuthorizations { order: String },

    #[error("Order {order} has no identifiers")]
    NoIdentifiers { order: String },

    #[error("Failed to create certificate request: {0}")]
    Csr(#[source] rcgen::Error),

    #[error("Invalid order state transition: {from} -> {to}")]
    InvalidTransition { from: OrderState, to: OrderState },

    #[error("Account identity does not match the engine's account key")]
    IdentityMismatch,

    #[error("Terms of service declined: {uri}")]
    TermsDeclined { uri: String },

    #[error("Invalid certificate: {0}")]
    Certificate(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP transport: {0}")]
    Transport(#[source] TransportError),
}

impl LocalcertError {
    /// Attach context to an engine error
    pub(crate) fn protocol(context: &'static str) -> impl FnOnce(AcmeError) -> Self {
        move |source| LocalcertError::Protocol { context, source }
    }

    /// Whether retrying after accepting new terms may succeed
    pub fn is_terms_not_accepted(&self) -> bool {
        matches!(self, LocalcertError::TermsNotAccepted { .. })
    }
}

fn describe_problem(problem: &Option<Problem>) -> String {
    match problem {
        Some(problem) => problem.to_string(),
        None => "no error recorded".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed() -> Problem {
        Problem {
            kind: "urn:ietf:params:acme:error:malformed".to_string(),
            detail: "bad csr".to_string(),
            ..Problem::default()
        }
    }

    #[test]
    fn test_remote_error_accessors() {
        let err = RelayError::Remote {
            status: StatusCode::BAD_REQUEST,
            problem: malformed(),
        };

        assert_eq!(err.category().as_deref(), Some("malformed"));
        assert_eq!(err.detail(), Some("bad csr"));
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_local_errors_have_no_category() {
        let err = RelayError::Encode(serde_json::from_str::<u8>("x").unwrap_err());
        assert_eq!(err.category(), None);
        assert_eq!(err.detail(), None);
    }

    #[test]
    fn test_order_invalid_message() {
        let err = LocalcertError::OrderInvalid {
            url: "https://ca/order/1".to_string(),
            problem: Some(malformed()),
        };
        assert!(err.to_string().contains("bad csr"));

        let err = LocalcertError::OrderInvalid {
            url: "https://ca/order/1".to_string(),
            problem: None,
        };
        assert!(err.to_string().contains("no error recorded"));
    }

    #[test]
    fn test_protocol_context() {
        let err = LocalcertError::protocol("discover")(AcmeError::NoAccount);
        assert!(err.to_string().starts_with("discover: "));
        assert!(!err.is_terms_not_accepted());
    }
}
