//! Signed request envelopes
//!
//! Structural parsing and verification of the JWS bodies the ACME engine
//! sends. Both the flattened and the general JSON serializations are
//! accepted, but an envelope must carry exactly one signature: a captured
//! request is only useful as proof if there is no ambiguity about who signed
//! it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::errors::EnvelopeError;
use crate::key::{AccountPublicKey, ES256};

/// JWS protected header used by ACME requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<AccountPublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub url: String,
}

/// Flattened JWS JSON serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Either JWS JSON serialization, before validation
#[derive(Debug, Deserialize)]
struct RawJws {
    payload: Option<String>,
    protected: Option<String>,
    signature: Option<String>,
    signatures: Option<Vec<RawSignature>>,
}

#[derive(Debug, Deserialize)]
struct RawSignature {
    protected: Option<String>,
    signature: Option<String>,
}

/// A parsed, structurally valid signed request body
///
/// Immutable after parsing. The signature has NOT been verified; call
/// [`SignedEnvelope::verify`] before trusting anything but the structure.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    raw: Bytes,
    header: ProtectedHeader,
    protected: String,
    payload: String,
    signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Parse and structurally validate a signed request body
    pub fn parse(body: impl Into<Bytes>) -> Result<Self, EnvelopeError> {
        let raw = body.into();
        let jws: RawJws = serde_json::from_slice(&raw)
            .map_err(|e| EnvelopeError::Malformed(format!("invalid JWS JSON: {}", e)))?;

        let payload = jws
            .payload
            .ok_or_else(|| EnvelopeError::Malformed("missing payload".to_string()))?;

        let (protected, signature) = match (jws.signatures, jws.signature) {
            (Some(signatures), top_level) => {
                let found = signatures.len() + usize::from(top_level.is_some());
                if found != 1 {
                    return Err(EnvelopeError::ExactlyOneSignatureRequired { found });
                }
                let only = signatures
                    .into_iter()
                    .next()
                    .ok_or(EnvelopeError::ExactlyOneSignatureRequired { found: 0 })?;
                (only.protected, only.signature)
            }
            (None, Some(signature)) => (jws.protected, Some(signature)),
            (None, None) => return Err(EnvelopeError::ExactlyOneSignatureRequired { found: 0 }),
        };

        let protected = protected
            .ok_or_else(|| EnvelopeError::Malformed("missing protected header".to_string()))?;
        let signature = signature
            .ok_or_else(|| EnvelopeError::Malformed("missing signature".to_string()))?;

        let header = decode_header(&protected)?;
        let signature = URL_SAFE_NO_PAD
            .decode(&signature)
            .map_err(|e| EnvelopeError::Malformed(format!("signature: {}", e)))?;
        URL_SAFE_NO_PAD
            .decode(&payload)
            .map_err(|e| EnvelopeError::Malformed(format!("payload: {}", e)))?;

        Ok(Self {
            raw,
            header,
            protected,
            payload,
            signature,
        })
    }

    /// The exact bytes that were parsed
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Consume the envelope, returning the exact bytes that were parsed
    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// Request URL from the protected header
    pub fn url(&self) -> &str {
        &self.header.url
    }

    /// Account key id (`kid`); absent on `jwk`-bound requests
    pub fn key_id(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// Embedded public key on `jwk`-bound requests
    pub fn jwk(&self) -> Option<&AccountPublicKey> {
        self.header.jwk.as_ref()
    }

    /// Replay nonce the request was signed with
    pub fn nonce(&self) -> Option<&str> {
        self.header.nonce.as_deref()
    }

    /// Signature algorithm
    pub fn algorithm(&self) -> &str {
        &self.header.alg
    }

    /// Always one; parsing rejects anything else
    pub fn signature_count(&self) -> usize {
        1
    }

    /// Decoded payload WITHOUT signature verification
    ///
    /// Do not trust the content unless [`SignedEnvelope::verify`] succeeded
    /// for the expected key. An empty payload is a POST-as-GET.
    pub fn unverified_payload(&self) -> Vec<u8> {
        // Validated as base64url during parsing
        URL_SAFE_NO_PAD.decode(&self.payload).unwrap_or_default()
    }

    /// Verify the signature against `key`
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), EnvelopeError> {
        if self.header.alg != ES256 {
            return Err(EnvelopeError::SignatureInvalid(format!(
                "unsupported algorithm {:?}",
                self.header.alg
            )));
        }
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| EnvelopeError::SignatureInvalid(e.to_string()))?;
        let signing_input = format!("{}.{}", self.protected, self.payload);
        key.verify(signing_input.as_bytes(), &signature)
            .map_err(|e| EnvelopeError::SignatureInvalid(e.to_string()))
    }
}

fn decode_header(protected: &str) -> Result<ProtectedHeader, EnvelopeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(protected)
        .map_err(|e| EnvelopeError::Malformed(format!("protected header: {}", e)))?;
    let header: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| EnvelopeError::Malformed(format!("protected header: {}", e)))?;

    if !header.get("url").is_some_and(|url| url.is_string()) {
        return Err(EnvelopeError::MissingUrl);
    }
    serde_json::from_value(header)
        .map_err(|e| EnvelopeError::Malformed(format!("protected header: {}", e)))
}
