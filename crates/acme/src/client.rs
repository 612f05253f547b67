//! ACME protocol engine
//!
//! Orders are driven by `instant-acme`: creation, authorization fetches,
//! challenge readiness, polling, finalization and the certificate download.
//! Its HTTP client is the engine's [`TransportHandle`] (see
//! [`AcmeHttpClient`]), so any request it signs can be captured.
//!
//! `instant-acme` 0.7 only creates accounts for keys it generates itself and
//! has no call that reads an account or a single challenge. Those requests
//! are signed here with the caller's [`AccountKey`]:
//!
//! - new-account registration and `onlyReturnExisting` lookup, bound to the JWK
//! - POST-as-GET of the account and of a challenge, bound to the account URL
//!
//! # Order Flow
//!
//! 1. [`AcmeClient::authorize_order`] creates the order in progress
//! 2. Authorization fetches and challenge readiness go through that order
//! 3. [`AcmeClient::wait_for_order`] polls it until it settles
//! 4. [`AcmeClient::finalize_order`] submits the CSR and downloads the chain

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use http::Method;
use instant_acme::{AccountCredentials, NewOrder};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::envelope::ProtectedHeader;
use crate::errors::AcmeError;
use crate::key::{AccountKey, AccountPublicKey, ES256};
use crate::transport::{
    AcmeHttpClient, TransportHandle, TransportRequest, TransportResponse, JOSE_CONTENT_TYPE,
};
use crate::types::{
    Account, Challenge, Directory, Identifier, NewAccount, Order, OrderStatus, Problem,
};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING_DIRECTORY_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Default `User-Agent` sent with every request
pub const DEFAULT_USER_AGENT: &str = "localcert/1.0";

/// Default interval between order polls when the server sends no `Retry-After`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const REPLAY_NONCE: &str = "replay-nonce";
const LOCATION: &str = "location";

/// How a request's JWS identifies the signing key
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyBinding {
    /// Embed the public key (account creation and lookup)
    Jwk,
    /// Reference an existing account by URL
    Kid(String),
}

/// The order in progress and the identifiers it was created for
struct ActiveOrder {
    inner: instant_acme::Order,
    identifiers: Vec<Identifier>,
}

impl ActiveOrder {
    fn status(&mut self) -> OrderStatus {
        OrderStatus::from(&self.inner.state().status)
    }

    fn snapshot(&mut self) -> Order {
        let url = self.inner.url().to_string();
        let state = self.inner.state();
        Order {
            url,
            status: OrderStatus::from(&state.status),
            expires: None,
            identifiers: self.identifiers.clone(),
            authorizations: state.authorizations.clone(),
            finalize: state.finalize.clone(),
            certificate: state.certificate.clone(),
            error: state.error.as_ref().map(Problem::from),
        }
    }
}

/// ACME protocol engine
///
/// Handles one order at a time: the order created by the latest
/// [`AcmeClient::authorize_order`] call.
pub struct AcmeClient {
    directory_url: String,
    key: AccountKey,
    transport: TransportHandle,
    http: AcmeHttpClient,
    user_agent: String,
    poll_interval: Duration,
    directory: RwLock<Option<Directory>>,
    key_id: RwLock<Option<String>>,
    nonce: Mutex<Option<String>>,
    account: tokio::sync::Mutex<Option<(String, Arc<instant_acme::Account>)>>,
    order: tokio::sync::Mutex<Option<ActiveOrder>>,
}

impl AcmeClient {
    /// Create an engine for the directory at `directory_url`
    pub fn new(directory_url: impl Into<String>, key: AccountKey, transport: TransportHandle) -> Self {
        Self {
            directory_url: directory_url.into(),
            key,
            http: AcmeHttpClient::new(transport.clone(), DEFAULT_USER_AGENT),
            transport,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            directory: RwLock::new(None),
            key_id: RwLock::new(None),
            nonce: Mutex::new(None),
            account: tokio::sync::Mutex::new(None),
            order: tokio::sync::Mutex::new(None),
        }
    }

    /// Set the `User-Agent` header value
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self.http = AcmeHttpClient::new(self.transport.clone(), self.user_agent.clone());
        self
    }

    /// Set the fallback interval between order polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Use a previously registered account URL as the `kid`
    pub fn with_key_id(self, key_id: impl Into<String>) -> Self {
        *self.key_id.write() = Some(key_id.into());
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Public account key as a JWK
    pub fn public_key(&self) -> AccountPublicKey {
        self.key.public_key()
    }

    /// Transport every request goes through
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Account URL, once registered or looked up
    pub fn key_id(&self) -> Option<String> {
        self.key_id.read().clone()
    }

    // =========================================================================
    // Directory
    // =========================================================================

    /// Fetch (once) and return the server's directory
    pub async fn discover(&self) -> Result<Directory, AcmeError> {
        let cached = self.directory.read().clone();
        if let Some(directory) = cached {
            return Ok(directory);
        }

        let response = self
            .send(TransportRequest::new(Method::GET, &self.directory_url))
            .await?;
        let directory: Directory = decode(&check_status(response)?, "directory")?;

        debug!(
            directory = %self.directory_url,
            new_account = %directory.new_account,
            new_order = %directory.new_order,
            terms = ?directory.terms_of_service(),
            "ACME directory fetched"
        );

        *self.directory.write() = Some(directory.clone());
        Ok(directory)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Create an account for the signing key (or return the existing one)
    pub async fn register(&self, account: &NewAccount) -> Result<Account, AcmeError> {
        let directory = self.discover().await?;
        let response = self
            .post(&directory.new_account, Some(account), KeyBinding::Jwk)
            .await?;
        let account = self.account_from_response(&response)?;

        info!(account = %account.uri, status = %account.status, "ACME account registered");
        Ok(account)
    }

    /// Look up the account bound to the signing key without creating one
    pub async fn lookup_account(&self) -> Result<Account, AcmeError> {
        let directory = self.discover().await?;
        let response = self
            .post(
                &directory.new_account,
                Some(&NewAccount::existing_only()),
                KeyBinding::Jwk,
            )
            .await?;
        let account = self.account_from_response(&response)?;

        debug!(account = %account.uri, "ACME account found");
        Ok(account)
    }

    /// Fetch the account at `url`, adopting it as this engine's `kid`
    ///
    /// Reads with POST-as-GET. A server that rejects POST-as-GET on account
    /// URLs as `malformed` is asked again with an empty update, which also
    /// returns the account object.
    pub async fn get_account(&self, url: &str) -> Result<Account, AcmeError> {
        let binding = KeyBinding::Kid(url.to_string());
        let response = match self.post::<()>(url, None, binding.clone()).await {
            Err(AcmeError::Api { problem, .. })
                if problem.category().as_deref() == Some("malformed") =>
            {
                debug!(account = %url, "POST-as-GET refused, reading account with an empty update");
                self.post(url, Some(&json!({})), binding).await?
            }
            other => other?,
        };

        let mut account: Account = decode(&response, "account")?;
        account.uri = url.to_string();
        *self.key_id.write() = Some(url.to_string());

        debug!(account = %url, status = %account.status, "ACME account fetched");
        Ok(account)
    }

    fn account_from_response(&self, response: &TransportResponse) -> Result<Account, AcmeError> {
        let uri = location(response)?;
        let mut account: Account = decode(response, "account")?;
        account.uri = uri.clone();
        *self.key_id.write() = Some(uri);
        Ok(account)
    }

    /// The `instant-acme` account for the current `kid`
    async fn account(&self) -> Result<Arc<instant_acme::Account>, AcmeError> {
        let key_id = self.key_id().ok_or(AcmeError::NoAccount)?;

        let mut cached = self.account.lock().await;
        if let Some((id, account)) = cached.as_ref() {
            if *id == key_id {
                return Ok(Arc::clone(account));
            }
        }

        // Same shape as serialized credentials; the id is the account URL
        let credentials: AccountCredentials = serde_json::from_value(json!({
            "id": key_id,
            "key_pkcs8": URL_SAFE_NO_PAD.encode(self.key.to_pkcs8_der()?),
            "directory": self.directory_url,
        }))
        .map_err(|source| AcmeError::Decode {
            what: "account credentials",
            source,
        })?;

        let account = Arc::new(
            instant_acme::Account::from_credentials_and_http(
                credentials,
                Box::new(self.http.clone()),
            )
            .await?,
        );

        debug!(account = %key_id, "ACME account loaded");
        *cached = Some((key_id, Arc::clone(&account)));
        Ok(account)
    }

    // =========================================================================
    // Orders, authorizations and challenges
    // =========================================================================

    /// Create an order for `identifiers`, making it the order in progress
    pub async fn authorize_order(&self, identifiers: &[Identifier]) -> Result<Order, AcmeError> {
        let requested = identifiers
            .iter()
            .map(|identifier| match identifier.kind.as_str() {
                "dns" => Ok(instant_acme::Identifier::Dns(identifier.value.clone())),
                other => Err(AcmeError::UnsupportedIdentifier(other.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let account = self.account().await?;
        let order = account
            .new_order(&NewOrder {
                identifiers: &requested,
            })
            .await?;

        let mut active = ActiveOrder {
            inner: order,
            identifiers: identifiers.to_vec(),
        };
        let snapshot = active.snapshot();
        *self.order.lock().await = Some(active);

        debug!(
            order = %snapshot.url,
            status = %snapshot.status,
            authorizations = snapshot.authorizations.len(),
            "ACME order created"
        );
        Ok(snapshot)
    }

    /// Refresh and return the order in progress
    pub async fn get_order(&self, url: &str) -> Result<Order, AcmeError> {
        let mut slot = self.order.lock().await;
        let active = active_order(&mut slot, url)?;
        active.inner.refresh().await?;
        Ok(active.snapshot())
    }

    /// Fetch the authorization at `url` of the order in progress
    pub async fn get_authorization(
        &self,
        url: &str,
    ) -> Result<instant_acme::Authorization, AcmeError> {
        let mut slot = self.order.lock().await;
        let active = slot.as_mut().ok_or(AcmeError::NoActiveOrder)?;

        let index = active
            .inner
            .state()
            .authorizations
            .iter()
            .position(|authorization| authorization == url)
            .ok_or_else(|| AcmeError::UnknownAuthorization(url.to_string()))?;

        // Fetched in order; a capture of `url` stops at it
        let mut authorizations = active.inner.authorizations().await?;
        if index >= authorizations.len() {
            return Err(AcmeError::UnknownAuthorization(url.to_string()));
        }
        Ok(authorizations.swap_remove(index))
    }

    /// Tell the server the challenge at `url` is ready for validation
    pub async fn accept_challenge(&self, url: &str) -> Result<(), AcmeError> {
        let mut slot = self.order.lock().await;
        let active = slot.as_mut().ok_or(AcmeError::NoActiveOrder)?;
        active.inner.set_challenge_ready(url).await?;

        debug!(challenge = %url, order = %active.inner.url(), "ACME challenge accepted");
        Ok(())
    }

    /// Fetch the challenge at `url`
    pub async fn get_challenge(&self, url: &str) -> Result<Challenge, AcmeError> {
        let response = self.post::<()>(url, None, self.account_binding()?).await?;
        decode(&response, "challenge")
    }

    /// Poll the order at `url` until it is ready, valid or invalid
    ///
    /// Polls at the server's `Retry-After` interval when given, otherwise at
    /// the engine's poll interval. Fails with [`AcmeError::Timeout`] once
    /// `deadline` has elapsed.
    pub async fn wait_for_order(&self, url: &str, deadline: Duration) -> Result<Order, AcmeError> {
        let mut slot = self.order.lock().await;
        let active = active_order(&mut slot, url)?;
        self.poll(active, deadline, OrderStatus::is_terminal).await?;
        Ok(active.snapshot())
    }

    /// Submit a CSR for `order` and download the issued chain
    ///
    /// Returns DER certificates, leaf first.
    pub async fn finalize_order(
        &self,
        order: &Order,
        csr_der: &[u8],
        deadline: Duration,
    ) -> Result<Vec<Vec<u8>>, AcmeError> {
        let mut slot = self.order.lock().await;
        let active = active_order(&mut slot, &order.url)?;

        active.inner.finalize(csr_der).await?;
        let status = active.status();
        info!(order = %order.url, status = %status, "ACME order finalized");

        let status = match status {
            OrderStatus::Valid | OrderStatus::Invalid => status,
            _ => {
                self.poll(active, deadline, |status| {
                    matches!(status, OrderStatus::Valid | OrderStatus::Invalid)
                })
                .await?
            }
        };

        if status != OrderStatus::Valid {
            return Err(AcmeError::OrderInvalid {
                url: order.url.clone(),
                problem: active.inner.state().error.as_ref().map(Problem::from),
            });
        }

        let pem = active
            .inner
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::MissingCertificate(order.url.clone()))?;
        let chain = parse_chain(pem.as_bytes())?;

        info!(order = %order.url, chain_len = chain.len(), "Certificate downloaded");
        Ok(chain)
    }

    async fn poll(
        &self,
        order: &mut ActiveOrder,
        deadline: Duration,
        done: impl Fn(OrderStatus) -> bool,
    ) -> Result<OrderStatus, AcmeError> {
        let url = order.inner.url().to_string();
        let started = Instant::now();
        match tokio::time::timeout_at(started + deadline, self.poll_until(&mut order.inner, done))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(order = %url, deadline_secs = deadline.as_secs_f64(), "Timed out polling ACME order");
                Err(AcmeError::Timeout {
                    url,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    async fn poll_until(
        &self,
        order: &mut instant_acme::Order,
        done: impl Fn(OrderStatus) -> bool,
    ) -> Result<OrderStatus, AcmeError> {
        let mut polls: u32 = 0;
        loop {
            let status = OrderStatus::from(&order.refresh().await?.status);
            polls += 1;

            if done(status) {
                debug!(order = %order.url(), status = %status, polls, "ACME order settled");
                return Ok(status);
            }

            let wait = self.http.take_retry_after().unwrap_or(self.poll_interval);
            trace!(
                order = %order.url(),
                status = %status,
                wait_ms = wait.as_millis() as u64,
                "ACME order not settled yet"
            );
            tokio::time::sleep(wait).await;
        }
    }

    // =========================================================================
    // Requests signed with the account key
    // =========================================================================

    fn account_binding(&self) -> Result<KeyBinding, AcmeError> {
        self.key_id()
            .map(KeyBinding::Kid)
            .ok_or(AcmeError::NoAccount)
    }

    /// Signed POST; a `None` payload is a POST-as-GET
    async fn post<P: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: Option<&P>,
        binding: KeyBinding,
    ) -> Result<TransportResponse, AcmeError> {
        let payload = payload
            .map(|payload| serde_json::to_vec(payload))
            .transpose()
            .map_err(AcmeError::Encode)?;

        let mut retried = false;
        loop {
            let header = ProtectedHeader {
                alg: ES256.to_string(),
                kid: match &binding {
                    KeyBinding::Kid(kid) => Some(kid.clone()),
                    KeyBinding::Jwk => None,
                },
                jwk: match &binding {
                    KeyBinding::Jwk => Some(self.key.public_key()),
                    KeyBinding::Kid(_) => None,
                },
                nonce: Some(self.nonce().await?),
                url: url.to_string(),
            };
            let body = self
                .key
                .sign_jws(&header, payload.as_deref())
                .map_err(AcmeError::Encode)?;

            let response = self
                .send(TransportRequest::post(url, JOSE_CONTENT_TYPE, body))
                .await?;
            self.stash_nonce(&response);

            if response.status.is_success() {
                return Ok(response);
            }

            let problem = Problem::from_body(&response.body);
            if problem.is_bad_nonce() && !retried {
                debug!(url = %url, "Retrying ACME request after badNonce");
                retried = true;
                continue;
            }

            return Err(AcmeError::Api {
                status: Some(response.status),
                problem,
            });
        }
    }

    async fn nonce(&self) -> Result<String, AcmeError> {
        let stashed = self.nonce.lock().take();
        if let Some(nonce) = stashed {
            return Ok(nonce);
        }

        let directory = self.discover().await?;
        let response = self
            .send(TransportRequest::new(Method::HEAD, &directory.new_nonce))
            .await?;
        let response = check_status(response)?;

        response
            .header(REPLAY_NONCE)
            .map(str::to_string)
            .ok_or(AcmeError::MissingHeader("Replay-Nonce"))
    }

    fn stash_nonce(&self, response: &TransportResponse) {
        if let Some(nonce) = response.header(REPLAY_NONCE) {
            *self.nonce.lock() = Some(nonce.to_string());
        }
    }

    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, AcmeError> {
        Ok(self.transport.send(request, &self.user_agent).await?)
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("key_id", &self.key_id())
            .field("user_agent", &self.user_agent)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn active_order<'a>(
    slot: &'a mut Option<ActiveOrder>,
    url: &str,
) -> Result<&'a mut ActiveOrder, AcmeError> {
    match slot {
        Some(active) if active.inner.url() == url => Ok(active),
        Some(_) => Err(AcmeError::UnknownOrder(url.to_string())),
        None => Err(AcmeError::NoActiveOrder),
    }
}

/// DER certificates of a PEM chain, in order
fn parse_chain(mut pem: &[u8]) -> Result<Vec<Vec<u8>>, AcmeError> {
    let chain = rustls_pemfile::certs(&mut pem)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(AcmeError::Pem)?;

    if chain.is_empty() {
        return Err(AcmeError::EmptyChain);
    }
    Ok(chain)
}

fn check_status(response: TransportResponse) -> Result<TransportResponse, AcmeError> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(AcmeError::Api {
            status: Some(response.status),
            problem: Problem::from_body(&response.body),
        })
    }
}

fn decode<T: DeserializeOwned>(response: &TransportResponse, what: &'static str) -> Result<T, AcmeError> {
    serde_json::from_slice(&response.body).map_err(|source| AcmeError::Decode { what, source })
}

fn location(response: &TransportResponse) -> Result<String, AcmeError> {
    response
        .header(LOCATION)
        .map(str::to_string)
        .ok_or(AcmeError::MissingHeader("Location"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SignedEnvelope;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOMAIN: &str = "abc123.localcert.dev";

    async fn mock_ca() -> MockServer {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "newNonce": format!("{}/nonce", base),
                "newAccount": format!("{}/new-account", base),
                "newOrder": format!("{}/new-order", base),
                "meta": {"termsOfService": format!("{}/tos", base)},
            })))
            .mount(&server)
            .await;

        Mock::given(method("HEAD"))
            .and(path("/nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "fresh-nonce"))
            .mount(&server)
            .await;

        server
    }

    fn engine(server: &MockServer) -> AcmeClient {
        let transport =
            TransportHandle::reqwest(Duration::from_secs(5), DEFAULT_USER_AGENT).unwrap();
        AcmeClient::new(
            format!("{}/directory", server.uri()),
            AccountKey::generate(),
            transport,
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    fn registered(server: &MockServer) -> AcmeClient {
        engine(server).with_key_id(format!("{}/acct/1", server.uri()))
    }

    fn order_body(server: &MockServer, status: &str) -> serde_json::Value {
        json!({
            "status": status,
            "identifiers": [{"type": "dns", "value": DOMAIN}],
            "authorizations": [format!("{}/authz/1", server.uri())],
            "finalize": format!("{}/order/1/finalize", server.uri()),
            "certificate": format!("{}/cert/1", server.uri()),
        })
    }

    /// New-order endpoint creating `/order/1` with `status`
    async fn mount_new_order(server: &MockServer, status: &str) {
        Mock::given(method("POST"))
            .and(path("/new-order"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", format!("{}/order/1", server.uri()).as_str())
                    .set_body_json(order_body(server, status)),
            )
            .mount(server)
            .await;
    }

    async fn requests_to(server: &MockServer, request_path: &str) -> Vec<wiremock::Request> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == request_path)
            .collect()
    }

    fn payload(request: &wiremock::Request) -> Vec<u8> {
        SignedEnvelope::parse(request.body.clone())
            .unwrap()
            .unverified_payload()
            .to_vec()
    }

    #[tokio::test]
    async fn test_discover_is_cached() {
        let server = mock_ca().await;
        let engine = engine(&server);

        let first = engine.discover().await.unwrap();
        let second = engine.discover().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first.terms_of_service(),
            Some(format!("{}/tos", server.uri()).as_str())
        );
        assert_eq!(requests_to(&server, "/directory").await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_uses_jwk_and_sets_key_id() {
        let server = mock_ca().await;
        let account_url = format!("{}/acct/1", server.uri());
        Mock::given(method("POST"))
            .and(path("/new-account"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("Location", account_url.as_str())
                    .set_body_json(json!({"status": "valid"})),
            )
            .mount(&server)
            .await;

        let engine = engine(&server);
        let account = engine.register(&NewAccount::agree_to_terms()).await.unwrap();

        assert_eq!(account.uri, account_url);
        assert_eq!(engine.key_id(), Some(account_url));

        let requests = requests_to(&server, "/new-account").await;
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].headers.get("content-type").unwrap(),
            JOSE_CONTENT_TYPE
        );
        assert_eq!(
            requests[0].headers.get("user-agent").unwrap(),
            DEFAULT_USER_AGENT
        );

        let envelope = SignedEnvelope::parse(requests[0].body.clone()).unwrap();
        assert_eq!(envelope.key_id(), None);
        assert_eq!(envelope.jwk(), Some(&engine.public_key()));
        assert_eq!(envelope.nonce(), Some("fresh-nonce"));
        envelope.verify(&engine.key().verifying_key()).unwrap();

        let payload: serde_json::Value =
            serde_json::from_slice(&envelope.unverified_payload()).unwrap();
        assert_eq!(payload["termsOfServiceAgreed"], json!(true));
    }

    #[tokio::test]
    async fn test_get_account_uses_post_as_get() {
        let server = mock_ca().await;
        let account_url = format!("{}/acct/1", server.uri());
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "valid"})))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let account = engine.get_account(&account_url).await.unwrap();
        assert_eq!(account.uri, account_url);
        assert_eq!(engine.key_id(), Some(account_url.clone()));

        let requests = requests_to(&server, "/acct/1").await;
        assert_eq!(requests.len(), 1);
        let envelope = SignedEnvelope::parse(requests[0].body.clone()).unwrap();
        assert_eq!(envelope.key_id(), Some(account_url.as_str()));
        assert!(envelope.unverified_payload().is_empty());
    }

    #[tokio::test]
    async fn test_get_account_falls_back_to_empty_update() {
        let server = mock_ca().await;
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "type": "urn:ietf:params:acme:error:malformed",
                "detail": "POST-as-GET is not supported for accounts",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "valid"})))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let account = engine
            .get_account(&format!("{}/acct/1", server.uri()))
            .await
            .unwrap();
        assert_eq!(account.status, crate::types::AccountStatus::Valid);

        let requests = requests_to(&server, "/acct/1").await;
        assert_eq!(requests.len(), 2);
        assert!(payload(&requests[0]).is_empty());
        assert_eq!(payload(&requests[1]), b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_bad_nonce_is_retried_once() {
        let server = mock_ca().await;
        let account_url = format!("{}/acct/1", server.uri());

        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "type": "urn:ietf:params:acme:error:badNonce",
                "detail": "JWS has an invalid anti-replay nonce",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "valid"})))
            .mount(&server)
            .await;

        let engine = engine(&server);
        let account = engine.get_account(&account_url).await.unwrap();

        assert_eq!(account.uri, account_url);
        assert_eq!(requests_to(&server, "/acct/1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_kid_required_for_orders() {
        let server = mock_ca().await;
        let engine = engine(&server);

        let err = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::NoAccount));
    }

    #[tokio::test]
    async fn test_only_dns_identifiers() {
        let server = mock_ca().await;
        let engine = registered(&server);

        let identifier = Identifier {
            kind: "ip".to_string(),
            value: "127.0.0.1".to_string(),
        };
        let err = engine.authorize_order(&[identifier]).await.unwrap_err();
        assert!(matches!(err, AcmeError::UnsupportedIdentifier(ref kind) if kind == "ip"));
    }

    #[tokio::test]
    async fn test_orders_are_signed_with_account_key() {
        let server = mock_ca().await;
        mount_new_order(&server, "pending").await;

        let engine = registered(&server);
        let order = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();

        assert_eq!(order.url, format!("{}/order/1", server.uri()));
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.identifiers, vec![Identifier::dns(DOMAIN)]);
        assert_eq!(order.authorizations, vec![format!("{}/authz/1", server.uri())]);

        let requests = requests_to(&server, "/new-order").await;
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].headers.get("user-agent").unwrap(),
            DEFAULT_USER_AGENT
        );

        let envelope = SignedEnvelope::parse(requests[0].body.clone()).unwrap();
        assert_eq!(
            envelope.key_id(),
            Some(format!("{}/acct/1", server.uri()).as_str())
        );
        envelope.verify(&engine.key().verifying_key()).unwrap();

        let payload: serde_json::Value =
            serde_json::from_slice(&envelope.unverified_payload()).unwrap();
        assert_eq!(
            payload["identifiers"],
            json!([{"type": "dns", "value": DOMAIN}])
        );
    }

    #[tokio::test]
    async fn test_api_problem_is_surfaced() {
        let server = mock_ca().await;
        Mock::given(method("POST"))
            .and(path("/new-order"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": "account is not allowed",
            })))
            .mount(&server)
            .await;

        let engine = registered(&server);
        let err = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap_err();

        let problem = err.problem().expect("problem document");
        assert_eq!(problem.category().as_deref(), Some("unauthorized"));
        assert_eq!(problem.detail, "account is not allowed");
    }

    #[tokio::test]
    async fn test_get_authorization_of_order_in_progress() {
        let server = mock_ca().await;
        mount_new_order(&server, "pending").await;
        Mock::given(method("POST"))
            .and(path("/authz/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "pending",
                "identifier": {"type": "dns", "value": DOMAIN},
                "challenges": [{
                    "type": "dns-01",
                    "url": format!("{}/chall/1", server.uri()),
                    "token": "token",
                    "status": "pending",
                }],
            })))
            .mount(&server)
            .await;

        let engine = registered(&server);
        let authz_url = format!("{}/authz/1", server.uri());

        assert!(matches!(
            engine.get_authorization(&authz_url).await,
            Err(AcmeError::NoActiveOrder)
        ));

        engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();
        let authorization = engine.get_authorization(&authz_url).await.unwrap();
        assert_eq!(authorization.challenges.len(), 1);
        assert_eq!(
            authorization.challenges[0].url,
            format!("{}/chall/1", server.uri())
        );

        let err = engine
            .get_authorization(&format!("{}/authz/2", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::UnknownAuthorization(_)));
    }

    #[tokio::test]
    async fn test_wait_for_order_returns_terminal_status() {
        let server = mock_ca().await;
        mount_new_order(&server, "pending").await;

        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body(&server, "pending")))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body(&server, "ready")))
            .mount(&server)
            .await;

        let engine = registered(&server);
        let created = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();
        let order = engine
            .wait_for_order(&created.url, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Ready);
        assert_eq!(order.url, created.url);
        assert_eq!(requests_to(&server, "/order/1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_order_times_out() {
        let server = mock_ca().await;
        mount_new_order(&server, "pending").await;

        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(order_body(&server, "processing")),
            )
            .mount(&server)
            .await;

        let engine = registered(&server);
        let created = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();
        let err = engine
            .wait_for_order(&created.url, Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, AcmeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_other_orders_are_rejected() {
        let server = mock_ca().await;
        mount_new_order(&server, "pending").await;

        let engine = registered(&server);
        engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();

        let err = engine
            .get_order(&format!("{}/order/2", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn test_finalize_downloads_chain_in_order() {
        let server = mock_ca().await;
        mount_new_order(&server, "ready").await;

        Mock::given(method("POST"))
            .and(path("/order/1/finalize"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(order_body(&server, "processing")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body(&server, "valid")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cert/1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n\
                 -----BEGIN CERTIFICATE-----\nBAUG\n-----END CERTIFICATE-----\n",
            ))
            .mount(&server)
            .await;

        let engine = registered(&server);
        let order = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();

        let chain = engine
            .finalize_order(&order, b"csr", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(chain, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        let finalize = &requests_to(&server, "/order/1/finalize").await[0];
        let payload: serde_json::Value = serde_json::from_slice(&payload(finalize)).unwrap();
        assert_eq!(payload["csr"], json!(URL_SAFE_NO_PAD.encode(b"csr")));
    }

    #[tokio::test]
    async fn test_finalize_reports_invalid_order() {
        let server = mock_ca().await;
        mount_new_order(&server, "ready").await;

        let mut invalid = order_body(&server, "invalid");
        invalid["error"] = json!({
            "type": "urn:ietf:params:acme:error:badCSR",
            "detail": "CSR names do not match order",
        });
        Mock::given(method("POST"))
            .and(path("/order/1/finalize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(invalid))
            .mount(&server)
            .await;

        let engine = registered(&server);
        let order = engine
            .authorize_order(&[Identifier::dns(DOMAIN)])
            .await
            .unwrap();

        let err = engine
            .finalize_order(&order, b"csr", Duration::from_secs(5))
            .await
            .unwrap_err();
        let problem = err.problem().expect("order error");
        assert_eq!(problem.category().as_deref(), Some("badcsr"));
        assert!(requests_to(&server, "/cert/1").await.is_empty());
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(matches!(parse_chain(b"no pem here"), Err(AcmeError::EmptyChain)));
    }
}
