//! Signed request capture
//!
//! Runs an ACME engine call with a capture session active so the engine
//! signs the request exactly as it would for the server, then takes the
//! signed body instead of sending it. The engine's own signing is reused; no
//! JWS is ever built here.

use std::future::Future;

use bytes::Bytes;
use tracing::debug;

use crate::client::AcmeClient;
use crate::envelope::SignedEnvelope;
use crate::errors::{AcmeError, CaptureError};
use crate::transport::{CapturedRequest, TransportHandle, JOSE_CONTENT_TYPE};
use crate::types::Directory;

/// Capture the signed request an engine call sends to `target_url`
///
/// `invoke` must issue exactly that request through `handle`. The call is
/// expected to fail with a capture; succeeding, or failing any other way,
/// means the engine did not behave as expected and is an error. The
/// previous transport is restored before this returns, and also if the
/// returned future is dropped mid-flight.
pub async fn capture_signed_request<F, Fut, T>(
    handle: &TransportHandle,
    target_url: &str,
    invoke: F,
) -> Result<Bytes, CaptureError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AcmeError>>,
{
    let session = handle.begin_capture(target_url)?;
    let outcome = invoke().await;
    session.end();

    let request = match outcome {
        Ok(_) => {
            return Err(CaptureError::ExpectedCaptureFailed {
                url: target_url.to_string(),
                outcome: "request completed without being captured".to_string(),
            })
        }
        Err(err) => err
            .into_captured()
            .map_err(|err| CaptureError::ExpectedCaptureFailed {
                url: target_url.to_string(),
                outcome: err.to_string(),
            })?,
    };

    verify_capture(target_url, request)
}

/// Check a captured request is a signed ACME request for `target_url`
fn verify_capture(target_url: &str, request: CapturedRequest) -> Result<Bytes, CaptureError> {
    let content_type = request.content_type().unwrap_or_default();
    if content_type != JOSE_CONTENT_TYPE {
        return Err(CaptureError::ContentTypeMismatch {
            expected: JOSE_CONTENT_TYPE,
            actual: content_type.to_string(),
        });
    }

    let envelope = SignedEnvelope::parse(request.body)?;
    if envelope.url() != target_url {
        return Err(CaptureError::UrlMismatch {
            expected: target_url.to_string(),
            actual: envelope.url().to_string(),
        });
    }

    debug!(
        url = %target_url,
        kid = ?envelope.key_id(),
        bytes = envelope.raw().len(),
        "Captured signed request"
    );
    Ok(envelope.into_bytes())
}

/// Capture the engine's "look up existing account" request
///
/// The envelope is signed with the account key's JWK and targets the
/// directory's new-account URL.
pub async fn capture_account_request(
    client: &AcmeClient,
    directory: &Directory,
) -> Result<Bytes, CaptureError> {
    capture_signed_request(client.transport(), &directory.new_account, || {
        client.lookup_account()
    })
    .await
}

/// Capture the engine's POST-as-GET fetch of an authorization
pub async fn capture_authorization_request(
    client: &AcmeClient,
    authorization_url: &str,
) -> Result<Bytes, CaptureError> {
    capture_signed_request(client.transport(), authorization_url, || {
        client.get_authorization(authorization_url)
    })
    .await
}
