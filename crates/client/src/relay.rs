//! Delegated relay client
//!
//! The localcert relay owns the DNS zone for issued subdomains. It never
//! sees the account key. Instead it receives requests the ACME engine has
//! already signed, captured before they reach the CA, and replays them:
//!
//! - `POST /domain` with the signed account lookup proves which account is
//!   asking and returns a subdomain bound to it
//! - `POST /provision` with the signed authorization fetch lets the relay
//!   read the DNS-01 challenge and publish the TXT record
//!
//! A captured envelope can only replay the one request it signs, so the
//! relay cannot act for the account beyond these two interactions.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use localcert_acme::{
    capture_account_request, capture_authorization_request, AccountPublicKey, AcmeClient,
    Identifier, Order, OrderStatus, Problem, TransportRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::{LocalcertError, RelayError};

const DOMAIN_PATH: &str = "/domain";
const PROVISION_PATH: &str = "/provision";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Body of `POST /domain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRequest {
    #[serde(rename = "signedAccountRequest", with = "base64_bytes")]
    pub signed_account_request: Bytes,
}

/// Response of `POST /domain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainResult {
    #[serde(rename = "localcertDomain")]
    pub domain: String,
}

/// Body of `POST /provision`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub account_public_key: AccountPublicKey,
    #[serde(with = "base64_bytes")]
    pub signed_authorization_request: Bytes,
}

/// Response of `POST /provision`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResult {
    #[serde(rename = "authorizationURL")]
    pub authorization_url: String,
    #[serde(rename = "provisionedChallengeURL")]
    pub provisioned_challenge_url: String,
}

/// Envelope bytes travel as standard base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// An order whose challenge the relay has set up
#[derive(Debug, Clone)]
pub struct ProvisionedOrder {
    pub domain: String,
    pub order: Order,
    pub authorization_url: String,
    pub challenge_url: String,
}

/// Client for the localcert relay
#[derive(Debug, Clone)]
pub struct RelayClient {
    engine: Arc<AcmeClient>,
    base_url: String,
    order_timeout: Duration,
}

impl RelayClient {
    /// Create a relay client at `base_url` signing through `engine`
    pub fn new(engine: Arc<AcmeClient>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            engine,
            base_url: base_url.trim_end_matches('/').to_string(),
            order_timeout: Duration::from_secs(120),
        }
    }

    /// Create a relay client from configuration
    pub fn from_config(engine: Arc<AcmeClient>, config: &ClientConfig) -> Self {
        Self::new(engine, config.relay_base()).with_order_timeout(config.order_timeout())
    }

    /// Set the deadline for a provisioned order to settle
    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn engine(&self) -> &Arc<AcmeClient> {
        &self.engine
    }

    /// Obtain a localcert subdomain bound to the engine's account
    pub async fn get_domain(&self) -> Result<String, LocalcertError> {
        let directory = self
            .engine
            .discover()
            .await
            .map_err(LocalcertError::protocol("discover"))?;
        let envelope = capture_account_request(&self.engine, &directory).await?;

        let result: DomainResult = self
            .post(
                DOMAIN_PATH,
                &DomainRequest {
                    signed_account_request: envelope,
                },
            )
            .await?;

        info!(domain = %result.domain, "Acquired localcert domain");
        Ok(result.domain)
    }

    /// Order a certificate for `domain` and drive its authorization
    ///
    /// Returns the order once it is ready for finalization.
    pub async fn provision_domain(&self, domain: &str) -> Result<Order, LocalcertError> {
        let provisioned = self.request_provisioning(domain).await?;
        self.accept_challenge(&provisioned).await?;
        self.await_order(&provisioned).await
    }

    /// Create an order for `domain` and have the relay set up its challenge
    pub async fn request_provisioning(&self, domain: &str) -> Result<ProvisionedOrder, LocalcertError> {
        let order = self
            .engine
            .authorize_order(&[Identifier::dns(domain)])
            .await
            .map_err(LocalcertError::protocol("new order"))?;

        let authorization_url = order
            .authorizations
            .first()
            .cloned()
            .ok_or_else(|| LocalcertError::NoAuthorizations {
                order: order.url.clone(),
            })?;

        let envelope = capture_authorization_request(&self.engine, &authorization_url).await?;

        let result: ProvisionResult = self
            .post(
                PROVISION_PATH,
                &ProvisionRequest {
                    account_public_key: self.engine.public_key(),
                    signed_authorization_request: envelope,
                },
            )
            .await?;

        if result.authorization_url != authorization_url {
            debug!(
                expected = %authorization_url,
                actual = %result.authorization_url,
                "Relay reported a different authorization URL"
            );
        }

        info!(
            domain = %domain,
            order = %order.url,
            challenge = %result.provisioned_challenge_url,
            "Domain provisioned"
        );

        Ok(ProvisionedOrder {
            domain: domain.to_string(),
            order,
            authorization_url,
            challenge_url: result.provisioned_challenge_url,
        })
    }

    /// Ask the CA to validate the provisioned challenge
    pub async fn accept_challenge(&self, provisioned: &ProvisionedOrder) -> Result<(), LocalcertError> {
        self.engine
            .accept_challenge(&provisioned.challenge_url)
            .await
            .map_err(LocalcertError::protocol("challenge accept"))?;
        Ok(())
    }

    /// Poll a provisioned order until it settles
    ///
    /// If polling fails or the order ends invalid, the challenge's recorded
    /// error is fetched and logged before the error is returned.
    pub async fn await_order(&self, provisioned: &ProvisionedOrder) -> Result<Order, LocalcertError> {
        let order = match self
            .engine
            .wait_for_order(&provisioned.order.url, self.order_timeout)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.log_challenge_error(&provisioned.challenge_url).await;
                return Err(LocalcertError::Protocol {
                    context: "order wait",
                    source: e,
                });
            }
        };

        if order.status == OrderStatus::Invalid {
            self.log_challenge_error(&provisioned.challenge_url).await;
            return Err(LocalcertError::OrderInvalid {
                url: order.url,
                problem: order.error,
            });
        }

        debug!(order = %order.url, status = %order.status, "Order authorized");
        Ok(order)
    }

    async fn log_challenge_error(&self, challenge_url: &str) {
        match self.engine.get_challenge(challenge_url).await {
            Ok(challenge) => warn!(
                challenge = %challenge_url,
                status = ?challenge.status,
                error = %challenge
                    .error
                    .as_ref()
                    .map(Problem::to_string)
                    .unwrap_or_default(),
                "Challenge error"
            ),
            Err(e) => warn!(
                challenge = %challenge_url,
                error = %e,
                "Failed to fetch challenge for diagnostics"
            ),
        }
    }

    async fn post<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, RelayError>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_vec(request).map_err(RelayError::Encode)?;

        let response = self
            .engine
            .transport()
            .send(
                TransportRequest::post(&url, JSON_CONTENT_TYPE, body),
                self.engine.user_agent(),
            )
            .await
            .map_err(|source| RelayError::Transport {
                url: url.clone(),
                source,
            })?;

        if !response.status.is_success() {
            let problem = Problem::from_body(&response.body);
            warn!(url = %url, status = %response.status, problem = %problem, "Relay request failed");
            return Err(RelayError::Remote {
                status: response.status,
                problem,
            });
        }

        serde_json::from_slice(&response.body).map_err(|source| RelayError::Decode { url, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localcert_acme::AccountKey;
    use serde_json::json;

    #[test]
    fn test_domain_request_wire_format() {
        let request = DomainRequest {
            signed_account_request: Bytes::from_static(b"{\"a\":1}"),
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value, json!({"signedAccountRequest": "eyJhIjoxfQ=="}));
        assert_eq!(
            serde_json::from_value::<DomainRequest>(value).unwrap(),
            request
        );
    }

    #[test]
    fn test_provision_request_wire_format() {
        let key = AccountKey::generate().public_key();
        let request = ProvisionRequest {
            account_public_key: key.clone(),
            signed_authorization_request: Bytes::from_static(b"jws"),
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["signedAuthorizationRequest"], json!("andz"));
        assert_eq!(value["accountPublicKey"]["kty"], json!("EC"));
        assert_eq!(value["accountPublicKey"]["crv"], json!("P-256"));
        assert_eq!(value["accountPublicKey"]["x"], json!(key.x));
    }

    #[test]
    fn test_result_field_names() {
        let domain: DomainResult =
            serde_json::from_str(r#"{"localcertDomain": "abc123.localcert.dev"}"#).unwrap();
        assert_eq!(domain.domain, "abc123.localcert.dev");

        let provision: ProvisionResult = serde_json::from_str(
            r#"{"authorizationURL": "https://ca/authz/1", "provisionedChallengeURL": "https://ca/chall/1"}"#,
        )
        .unwrap();
        assert_eq!(provision.authorization_url, "https://ca/authz/1");
        assert_eq!(provision.provisioned_challenge_url, "https://ca/chall/1");
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = serde_json::from_value::<DomainRequest>(json!({"signedAccountRequest": "@@@"}));
        assert!(result.is_err());
    }
}
