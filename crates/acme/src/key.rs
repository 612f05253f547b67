//! ACME account key (ECDSA P-256, `ES256`)
//!
//! `instant-acme` signs order traffic with this key, handed over as PKCS#8.
//! The few account and challenge reads it has no API for are signed here.
//! Only the public half, as a JWK, ever leaves this process.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::EncodePrivateKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::EnvelopeError;

/// JWS algorithm name for ECDSA P-256 with SHA-256
pub const ES256: &str = "ES256";

/// P-256 coordinate length in bytes
const COORDINATE_LEN: usize = 32;

/// ECDSA P-256 account key
#[derive(Clone)]
pub struct AccountKey {
    signing_key: SigningKey,
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.public_key().thumbprint())
            .finish_non_exhaustive()
    }
}

impl AccountKey {
    /// Generate a new random account key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load an account key from its 32-byte secret scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() != COORDINATE_LEN {
            return Err(EnvelopeError::InvalidKey(format!(
                "expected {} byte secret scalar, got {}",
                COORDINATE_LEN,
                bytes.len()
            )));
        }
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|e| EnvelopeError::InvalidKey(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Secret scalar, for persistence by the caller
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// PKCS#8 DER encoding, as `instant-acme` account credentials carry it
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, EnvelopeError> {
        self.signing_key
            .to_pkcs8_der()
            .map(|document| document.as_bytes().to_vec())
            .map_err(|e| EnvelopeError::InvalidKey(e.to_string()))
    }

    /// Verifying half of the key
    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// Public key as a JWK
    pub fn public_key(&self) -> AccountPublicKey {
        AccountPublicKey::from_verifying_key(&self.verifying_key())
    }

    /// Sign `data`, returning the fixed-size `r || s` signature JWS expects
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(data);
        signature.to_bytes().to_vec()
    }

    /// Produce a flattened JWS JSON body
    ///
    /// A `None` payload yields the empty payload of a POST-as-GET request.
    pub(crate) fn sign_jws(
        &self,
        header: &crate::envelope::ProtectedHeader,
        payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let payload = payload
            .map(|payload| URL_SAFE_NO_PAD.encode(payload))
            .unwrap_or_default();

        let signing_input = format!("{}.{}", protected, payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes()));

        serde_json::to_vec(&crate::envelope::FlattenedJws {
            protected,
            payload,
            signature,
        })
    }
}

/// EC P-256 public key in JWK form
///
/// This is what the relay receives as `accountPublicKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPublicKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl AccountPublicKey {
    /// Build the JWK for a verifying key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // Uncompressed points always carry both coordinates
        let x = point.x().map(|x| x.to_vec()).unwrap_or_default();
        let y = point.y().map(|y| y.to_vec()).unwrap_or_default();
        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }
    }

    /// Recover the verifying key
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, EnvelopeError> {
        if self.kty != "EC" || self.crv != "P-256" {
            return Err(EnvelopeError::InvalidKey(format!(
                "unsupported key type {}/{}",
                self.kty, self.crv
            )));
        }
        // Uncompressed SEC1 point: 0x04 || x || y
        let mut point = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
        point.push(0x04);
        point.extend(decode_coordinate("x", &self.x)?);
        point.extend(decode_coordinate("y", &self.y)?);
        VerifyingKey::from_sec1_bytes(&point).map_err(|e| EnvelopeError::InvalidKey(e.to_string()))
    }

    /// RFC 7638 JWK thumbprint
    pub fn thumbprint(&self) -> String {
        // Required members in lexicographic order
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }
}

fn decode_coordinate(name: &str, value: &str) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| EnvelopeError::InvalidKey(format!("{}: {}", name, e)))?;
    if bytes.len() != COORDINATE_LEN {
        return Err(EnvelopeError::InvalidKey(format!(
            "{}: expected {} bytes, got {}",
            name,
            COORDINATE_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}
