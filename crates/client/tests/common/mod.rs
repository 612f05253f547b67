//! Mock ACME CA and localcert relay on one wiremock server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use localcert::acme::{AccountKey, AcmeClient, SignedEnvelope, TransportHandle, DEFAULT_USER_AGENT};
use localcert::RelayClient;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub const DOMAIN: &str = "abc123.localcert.dev";
pub const TERMS: &str = "https://example/tos";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct MockAcme {
    pub server: MockServer,
    pub key: AccountKey,
}

impl MockAcme {
    /// Directory and nonce endpoints, optionally advertising terms
    pub async fn start(terms: Option<&str>) -> Self {
        init_tracing();
        let server = MockServer::start().await;
        let base = server.uri();

        let mut meta = json!({});
        if let Some(terms) = terms {
            meta["termsOfService"] = json!(terms);
        }

        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "newNonce": format!("{}/nonce", base),
                "newAccount": format!("{}/new-account", base),
                "newOrder": format!("{}/new-order", base),
                "meta": meta,
            })))
            .mount(&server)
            .await;

        Mock::given(method("HEAD"))
            .and(path("/nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "nonce"))
            .mount(&server)
            .await;

        Self {
            server,
            key: AccountKey::generate(),
        }
    }

    pub fn url(&self, suffix: &str) -> String {
        format!("{}{}", self.server.uri(), suffix)
    }

    pub fn engine(&self) -> Arc<AcmeClient> {
        let transport = TransportHandle::reqwest(Duration::from_secs(5), DEFAULT_USER_AGENT)
            .expect("reqwest transport");
        Arc::new(
            AcmeClient::new(self.url("/directory"), self.key.clone(), transport)
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    pub fn registered_engine(&self) -> Arc<AcmeClient> {
        let transport = TransportHandle::reqwest(Duration::from_secs(5), DEFAULT_USER_AGENT)
            .expect("reqwest transport");
        Arc::new(
            AcmeClient::new(self.url("/directory"), self.key.clone(), transport)
                .with_poll_interval(Duration::from_millis(10))
                .with_key_id(self.url("/acct/1")),
        )
    }

    pub fn relay(&self, engine: Arc<AcmeClient>) -> RelayClient {
        RelayClient::new(engine, self.server.uri()).with_order_timeout(Duration::from_secs(5))
    }

    pub fn order_body(&self, status: &str) -> Value {
        json!({
            "status": status,
            "identifiers": [{"type": "dns", "value": DOMAIN}],
            "authorizations": [self.url("/authz/1")],
            "finalize": self.url("/order/1/finalize"),
            "certificate": self.url("/cert/1"),
        })
    }

    pub async fn mount_new_account(&self) {
        Mock::given(method("POST"))
            .and(path("/new-account"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", self.url("/acct/1").as_str())
                    .set_body_json(json!({"status": "valid"})),
            )
            .mount(&self.server)
            .await;
    }

    /// The new-account URL must never be reached
    pub async fn forbid_new_account(&self) {
        Mock::given(method("POST"))
            .and(path("/new-account"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_account(&self, status: &str) {
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": status})))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_new_order(&self) {
        Mock::given(method("POST"))
            .and(path("/new-order"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", self.url("/order/1").as_str())
                    .set_body_json(self.order_body("pending")),
            )
            .mount(&self.server)
            .await;
    }

    /// The authorization is only ever fetched by the relay
    pub async fn forbid_authorization_fetch(&self) {
        Mock::given(method("POST"))
            .and(path("/authz/1"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_relay_domain(&self, domain: &str) {
        Mock::given(method("POST"))
            .and(path("/domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "localcertDomain": domain,
            })))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_relay_provision(&self) {
        Mock::given(method("POST"))
            .and(path("/provision"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorizationURL": self.url("/authz/1"),
                "provisionedChallengeURL": self.url("/chall/1"),
            })))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_challenge(&self, status: &str, error: Option<Value>) {
        let mut body = json!({
            "type": "dns-01",
            "url": self.url("/chall/1"),
            "status": status,
            "token": "token",
        });
        if let Some(error) = error {
            body["error"] = error;
        }
        Mock::given(method("POST"))
            .and(path("/chall/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    pub async fn mount_order(&self, status: &str) {
        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(self.order_body(status)))
            .mount(&self.server)
            .await;
    }

    /// Finalization that completes immediately, serving a two certificate
    /// chain whose leaf names `domain`
    pub async fn mount_issuance(&self, domain: &str) {
        Mock::given(method("POST"))
            .and(path("/order/1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(self.order_body("valid")))
            .mount(&self.server)
            .await;

        let chain = format!("{}{}", self_signed_pem(domain), self_signed_pem("Mock Issuer CA"));
        Mock::given(method("POST"))
            .and(path("/cert/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pem-certificate-chain")
                    .set_body_string(chain),
            )
            .mount(&self.server)
            .await;
    }

    pub async fn requests_to(&self, request_path: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == request_path)
            .collect()
    }
}

fn self_signed_pem(name: &str) -> String {
    let key = KeyPair::generate().expect("key pair");
    let mut params = CertificateParams::new(vec![name.replace(' ', "-").to_lowercase()])
        .expect("certificate params");
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, name.to_string());
    params.self_signed(&key).expect("self-signed").pem()
}

/// Decode a standard base64 envelope field from a relay request body
pub fn relay_envelope(request: &Request, field: &str) -> SignedEnvelope {
    let body: Value = serde_json::from_slice(&request.body).expect("relay request json");
    let encoded = body[field].as_str().expect("envelope field");
    SignedEnvelope::parse(STANDARD.decode(encoded).expect("standard base64")).expect("envelope")
}

/// The JSON payload signed into a captured request
pub fn envelope_payload(envelope: &SignedEnvelope) -> Value {
    serde_json::from_slice(&envelope.unverified_payload()).expect("payload json")
}

/// The DER CSR submitted in a finalize request
pub fn submitted_csr(request: &Request) -> Vec<u8> {
    let envelope = SignedEnvelope::parse(request.body.clone()).expect("finalize envelope");
    let payload = envelope_payload(&envelope);
    let csr = payload["csr"].as_str().expect("csr field");
    URL_SAFE_NO_PAD.decode(csr).expect("base64url csr")
}
