//! Error types for the ACME engine, request capture and envelope parsing.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::transport::CapturedRequest;
use crate::types::Problem;

/// Signed envelope parse and verification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Malformed signed request: {0}")]
    Malformed(String),

    #[error("Expected exactly one signature, found {found}")]
    ExactlyOneSignatureRequired { found: usize },

    #[error("Protected header has no string \"url\" claim")]
    MissingUrl,

    #[error("Invalid account public key: {0}")]
    InvalidKey(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),
}

/// Outcomes of a transport call that did not produce a response
///
/// `Captured` is the expected outcome while a capture session is active and
/// the request targets the capture URL. It is a distinct variant so that an
/// ordinary network failure can never be mistaken for a capture.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {} captured before transmission", .0.url)]
    Captured(Box<CapturedRequest>),

    #[error("Transport failure: {0}")]
    Failure(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Wrap an arbitrary transport failure
    pub fn failure(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TransportError::Failure(err.into())
    }

    /// Whether this is a capture rather than a failure
    pub fn is_captured(&self) -> bool {
        matches!(self, TransportError::Captured(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Failure(Box::new(err))
    }
}

/// Request capture errors
///
/// Every variant other than `SessionActive` means the ACME engine did not
/// behave the way the capture expected and is treated as fatal.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("A capture session is already active on this transport")]
    SessionActive,

    #[error("Request capture for {url} failed: {outcome}")]
    ExpectedCaptureFailed { url: String, outcome: String },

    #[error("Request content type {actual:?} != {expected:?}")]
    ContentTypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("Invalid captured request: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Captured envelope url {actual:?} != capture target {expected:?}")]
    UrlMismatch { expected: String, actual: String },
}

/// ACME engine errors
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("ACME server rejected the request: {problem}")]
    Api {
        status: Option<StatusCode>,
        problem: Problem,
    },

    #[error("ACME engine error: {0}")]
    Engine(#[source] instant_acme::Error),

    #[error(transparent)]
    Key(#[from] EnvelopeError),

    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode request payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Response missing {0} header")]
    MissingHeader(&'static str),

    #[error("No account key id; register or look up the account first")]
    NoAccount,

    #[error("Unsupported identifier type {0:?}")]
    UnsupportedIdentifier(String),

    #[error("No order in progress")]
    NoActiveOrder,

    #[error("Order {0} is not the order in progress")]
    UnknownOrder(String),

    #[error("Authorization {0} does not belong to the order in progress")]
    UnknownAuthorization(String),

    #[error("Timed out after {elapsed:?} waiting for order {url}")]
    Timeout { url: String, elapsed: Duration },

    #[error("Order {url} is invalid")]
    OrderInvalid {
        url: String,
        problem: Option<Problem>,
    },

    #[error("Order {0} is valid but has no certificate URL")]
    MissingCertificate(String),

    #[error("Failed to decode certificate chain: {0}")]
    Pem(#[source] std::io::Error),

    #[error("Certificate chain is empty")]
    EmptyChain,
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => AcmeError::Api {
                status: problem.status.and_then(|status| StatusCode::from_u16(status).ok()),
                problem: Problem::from(&problem),
            },
            // Transport outcomes, captures included, travel through the
            // engine boxed
            instant_acme::Error::Other(inner) => match inner.downcast::<TransportError>() {
                Ok(transport) => AcmeError::Transport(*transport),
                Err(inner) => AcmeError::Engine(instant_acme::Error::Other(inner)),
            },
            other => AcmeError::Engine(other),
        }
    }
}

impl AcmeError {
    /// Take the captured request out of a capture outcome
    ///
    /// Returns the original error unchanged when it is anything else.
    pub fn into_captured(self) -> Result<CapturedRequest, Self> {
        match self {
            AcmeError::Transport(TransportError::Captured(request)) => Ok(*request),
            other => Err(other),
        }
    }

    /// The problem document reported by the server, if any
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            AcmeError::Api { problem, .. } => Some(problem),
            AcmeError::OrderInvalid { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportRequest;
    use http::Method;

    #[test]
    fn test_captured_request_survives_the_engine() {
        let captured = TransportError::Captured(Box::new(TransportRequest::new(
            Method::POST,
            "https://ca/authz/1",
        )));
        let err = AcmeError::from(instant_acme::Error::Other(Box::new(captured)));

        let request = err.into_captured().unwrap();
        assert_eq!(request.url, "https://ca/authz/1");
    }

    #[test]
    fn test_other_engine_failures_are_not_captures() {
        let err = AcmeError::from(instant_acme::Error::Other("boom".into()));
        assert!(matches!(err, AcmeError::Engine(_)));
        assert!(err.into_captured().is_err());
    }
}
