//! ACME engine and signed-request capture for localcert
//!
//! Everything needed to sign ACME requests on behalf of an account and hand
//! selected signed requests to a relay instead of sending them.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - RFC 8555 protocol engine; orders run on `instant-acme`,
//!   account and challenge reads are signed with the account key directly
//! - [`AcmeHttpClient`] - `instant-acme` HTTP client backed by the transport
//! - [`AccountKey`] - ECDSA P-256 account key, exported as a JWK
//! - [`TransportHandle`] - Swappable HTTP transport every request goes through
//! - [`SignedEnvelope`] - Parser and verifier for captured JWS bodies
//!
//! # Capture Flow
//!
//! 1. A [`CaptureSession`] puts a [`CaptureTransport`] in front of the active
//!    transport for one exact URL
//! 2. An engine call signs and "sends" its request as usual
//! 3. The request to the target URL comes back as
//!    [`TransportError::Captured`] instead of being transmitted
//! 4. The session ends and the previous transport is restored
//! 5. The captured body is checked and returned as raw bytes
//!
//! See [`capture_account_request`] and [`capture_authorization_request`].

pub mod capture;
pub mod client;
pub mod envelope;
pub mod errors;
pub mod key;
pub mod transport;
pub mod types;

pub use instant_acme;

pub use capture::{capture_account_request, capture_authorization_request, capture_signed_request};
pub use client::{
    AcmeClient, DEFAULT_POLL_INTERVAL, DEFAULT_USER_AGENT, LETS_ENCRYPT_DIRECTORY_URL,
    LETS_ENCRYPT_STAGING_DIRECTORY_URL,
};
pub use envelope::{ProtectedHeader, SignedEnvelope};
pub use errors::{AcmeError, CaptureError, EnvelopeError, TransportError};
pub use key::{AccountKey, AccountPublicKey, ES256};
pub use transport::{
    AcmeHttpClient, CaptureSession, CaptureTransport, CapturedRequest, HttpTransport, ReqwestTransport,
    TransportHandle, TransportRequest, TransportResponse, JOSE_CONTENT_TYPE,
};
pub use types::{
    Account, AccountStatus, ChallengeStatus, Challenge, Directory,
    DirectoryMeta, Identifier, NewAccount, Order, OrderStatus, Problem,
};
