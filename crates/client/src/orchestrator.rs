//! Certificate order orchestration
//!
//! Sequences a complete issuance for a localcert domain:
//!
//! 1. Register (or re-check) the ACME account, retrying once after the
//!    caller accepts new terms of service
//! 2. Acquire a domain from the relay, unless renewing an existing one
//! 3. Have the relay provision the DNS-01 challenge
//! 4. Accept the challenge and poll the order until it settles
//! 5. Finalize with a CSR naming the domain and download the chain
//!
//! Progress is tracked by [`OrderState`]; every transition is checked and
//! logged.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use localcert_acme::{
    Account, AccountKey, AccountPublicKey, AccountStatus, AcmeClient, AcmeError, NewAccount,
    Order, TransportHandle,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::LocalcertError;
use crate::relay::RelayClient;
use crate::renewal::{inspect_leaf, LeafInfo};

/// Progress of one issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderState {
    NoAccount,
    Registering,
    Registered,
    DomainAcquired,
    Provisioning,
    ChallengeAccepted,
    Polling,
    Valid,
    Invalid,
    Finalizing,
    Issued,
}

impl OrderState {
    /// Whether `next` may follow this state
    ///
    /// `Registering -> Registering` is structurally allowed; the state
    /// machine permits it only once.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (NoAccount, Registering)
                | (Registering, Registering)
                | (Registering, Registered)
                | (Registered, DomainAcquired)
                | (DomainAcquired, Provisioning)
                | (Provisioning, ChallengeAccepted)
                | (ChallengeAccepted, Polling)
                | (Polling, Valid)
                | (Polling, Invalid)
                | (Valid, Finalizing)
                | (Finalizing, Issued)
        )
    }

    /// No transition leaves this state
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Invalid | OrderState::Issued)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderState::NoAccount => "no-account",
            OrderState::Registering => "registering",
            OrderState::Registered => "registered",
            OrderState::DomainAcquired => "domain-acquired",
            OrderState::Provisioning => "provisioning",
            OrderState::ChallengeAccepted => "challenge-accepted",
            OrderState::Polling => "polling",
            OrderState::Valid => "valid",
            OrderState::Invalid => "invalid",
            OrderState::Finalizing => "finalizing",
            OrderState::Issued => "issued",
        };
        f.write_str(name)
    }
}

/// Checked [`OrderState`] transitions
#[derive(Debug, Clone)]
pub struct OrderStateMachine {
    state: OrderState,
    registration_retried: bool,
}

impl Default for OrderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStateMachine {
    pub fn new() -> Self {
        Self {
            state: OrderState::NoAccount,
            registration_retried: false,
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    /// Whether registration has already been retried
    pub fn registration_retried(&self) -> bool {
        self.registration_retried
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: OrderState) -> Result<(), LocalcertError> {
        let from = self.state;
        let repeat_registration = from == OrderState::Registering && next == OrderState::Registering;

        if !from.can_transition_to(next) || (repeat_registration && self.registration_retried) {
            warn!(from = %from, to = %next, "Rejected order state transition");
            return Err(LocalcertError::InvalidTransition { from, to: next });
        }

        if repeat_registration {
            self.registration_retried = true;
        }
        self.state = next;
        debug!(from = %from, to = %next, "Order state transition");
        Ok(())
    }
}

/// Decides whether to accept a CA's terms of service
pub trait TermsAgreement {
    /// Return `true` to accept the terms at `terms_uri`
    fn agree(&self, terms_uri: &str) -> bool;
}

impl<F> TermsAgreement for F
where
    F: Fn(&str) -> bool,
{
    fn agree(&self, terms_uri: &str) -> bool {
        self(terms_uri)
    }
}

/// The ACME account an orchestrator acts for
///
/// Serializable so the caller can persist it between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountIdentity {
    pub public_key: AccountPublicKey,
    /// Account URL, assigned on registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Terms of service URI the account holder agreed to
    #[serde(default)]
    pub accepted_terms: String,
}

impl AccountIdentity {
    /// Identity for an account key that has not registered yet
    pub fn new(key: &AccountKey) -> Self {
        Self {
            public_key: key.public_key(),
            key_id: None,
            accepted_terms: String::new(),
        }
    }
}

/// Result of a complete issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub domain: String,
    pub account_url: String,
    /// DER certificates, leaf first
    pub chain: Vec<Vec<u8>>,
}

impl IssuedCertificate {
    /// Leaf certificate
    pub fn leaf(&self) -> Option<&[u8]> {
        self.chain.first().map(Vec::as_slice)
    }

    /// Parse the leaf certificate
    pub fn leaf_info(&self) -> Result<LeafInfo, LocalcertError> {
        let leaf = self
            .leaf()
            .ok_or_else(|| LocalcertError::Certificate("empty chain".to_string()))?;
        inspect_leaf(leaf)
    }
}

/// Drives registration, provisioning and issuance for one account
#[derive(Debug)]
pub struct Orchestrator {
    engine: Arc<AcmeClient>,
    relay: RelayClient,
    order_timeout: Duration,
    machine: OrderStateMachine,
}

impl Orchestrator {
    /// Create an orchestrator from an engine and relay client
    pub fn new(engine: Arc<AcmeClient>, relay: RelayClient) -> Self {
        Self {
            engine,
            relay,
            order_timeout: Duration::from_secs(120),
            machine: OrderStateMachine::new(),
        }
    }

    /// Build the engine and relay client described by `config`
    pub fn from_config(
        config: &ClientConfig,
        key: AccountKey,
        transport: TransportHandle,
    ) -> Result<Self, LocalcertError> {
        config.validate()?;
        let engine = Arc::new(config.engine(key, transport));
        let relay = RelayClient::from_config(Arc::clone(&engine), config);
        Ok(Self::new(engine, relay).with_order_timeout(config.order_timeout()))
    }

    /// Set the deadline for an order to settle, during polling and finalization
    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self.relay = self.relay.with_order_timeout(timeout);
        self
    }

    pub fn engine(&self) -> &Arc<AcmeClient> {
        &self.engine
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    /// Current state of the latest issuance
    pub fn state(&self) -> OrderState {
        self.machine.state()
    }

    /// Make sure the account is registered under the current terms
    ///
    /// Fails with [`LocalcertError::TermsNotAccepted`] when the directory
    /// advertises terms other than `accepted_terms`. Without an
    /// `existing_key_id` a new account is registered; otherwise the existing
    /// account must still be valid.
    pub async fn ensure_registration(
        &self,
        accepted_terms: &str,
        existing_key_id: Option<&str>,
    ) -> Result<Account, LocalcertError> {
        let directory = self
            .engine
            .discover()
            .await
            .map_err(LocalcertError::protocol("discover"))?;

        if let Some(terms) = directory.terms_of_service() {
            if terms != accepted_terms {
                info!(terms = %terms, "Terms of service acceptance required");
                return Err(LocalcertError::TermsNotAccepted {
                    uri: terms.to_string(),
                });
            }
        }

        match existing_key_id.filter(|key_id| !key_id.is_empty()) {
            None => self
                .engine
                .register(&NewAccount::agree_to_terms())
                .await
                .map_err(LocalcertError::protocol("register")),
            Some(key_id) => {
                let account = self
                    .engine
                    .get_account(key_id)
                    .await
                    .map_err(LocalcertError::protocol("account"))?;
                if account.status != AccountStatus::Valid {
                    warn!(account = %account.uri, status = %account.status, "Account is no longer valid");
                    return Err(LocalcertError::StaleAccount {
                        uri: account.uri,
                        status: account.status,
                    });
                }
                debug!(account = %account.uri, "Existing account is valid");
                Ok(account)
            }
        }
    }

    /// Finalize a ready order and download the certificate chain
    ///
    /// The CSR names the order's first identifier as both common name and
    /// sole DNS name. Returns DER certificates, leaf first.
    pub async fn get_certificate(
        &self,
        order: &Order,
        certificate_key: &KeyPair,
    ) -> Result<Vec<Vec<u8>>, LocalcertError> {
        let domain = order
            .identifiers
            .first()
            .map(|identifier| identifier.value.as_str())
            .ok_or_else(|| LocalcertError::NoIdentifiers {
                order: order.url.clone(),
            })?;

        let csr = certificate_request(domain, certificate_key)?;
        debug!(domain = %domain, order = %order.url, "Submitting certificate request");

        let chain = self
            .engine
            .finalize_order(order, &csr, self.order_timeout)
            .await
            .map_err(|e| match e {
                AcmeError::OrderInvalid { url, problem } => {
                    LocalcertError::OrderInvalid { url, problem }
                }
                other => LocalcertError::Protocol {
                    context: "finalize",
                    source: other,
                },
            })?;

        info!(domain = %domain, chain_len = chain.len(), "Certificate issued");
        Ok(chain)
    }

    /// Run a complete issuance
    ///
    /// Updates `identity` with the account URL and any newly accepted
    /// terms. Pass `domain` to renew an existing domain instead of asking
    /// the relay for a new one.
    pub async fn issue(
        &mut self,
        identity: &mut AccountIdentity,
        terms: &impl TermsAgreement,
        domain: Option<&str>,
        certificate_key: &KeyPair,
    ) -> Result<IssuedCertificate, LocalcertError> {
        if identity.public_key != self.engine.public_key() {
            return Err(LocalcertError::IdentityMismatch);
        }

        self.machine = OrderStateMachine::new();
        self.machine.transition(OrderState::Registering)?;

        let account = loop {
            match self
                .ensure_registration(&identity.accepted_terms, identity.key_id.as_deref())
                .await
            {
                Ok(account) => break account,
                Err(LocalcertError::TermsNotAccepted { uri })
                    if !self.machine.registration_retried() =>
                {
                    if !terms.agree(&uri) {
                        return Err(LocalcertError::TermsDeclined { uri });
                    }
                    info!(terms = %uri, "Terms of service accepted");
                    identity.accepted_terms = uri;
                    self.machine.transition(OrderState::Registering)?;
                }
                Err(e) => return Err(e),
            }
        };
        identity.key_id = Some(account.uri.clone());
        self.machine.transition(OrderState::Registered)?;

        let domain = match domain {
            Some(domain) => {
                debug!(domain = %domain, "Reusing existing domain");
                domain.to_string()
            }
            None => self.relay.get_domain().await?,
        };
        self.machine.transition(OrderState::DomainAcquired)?;

        self.machine.transition(OrderState::Provisioning)?;
        let provisioned = self.relay.request_provisioning(&domain).await?;

        self.relay.accept_challenge(&provisioned).await?;
        self.machine.transition(OrderState::ChallengeAccepted)?;

        self.machine.transition(OrderState::Polling)?;
        let order = match self.relay.await_order(&provisioned).await {
            Ok(order) => order,
            Err(e) => {
                if matches!(e, LocalcertError::OrderInvalid { .. }) {
                    self.machine.transition(OrderState::Invalid)?;
                }
                return Err(e);
            }
        };
        self.machine.transition(OrderState::Valid)?;

        self.machine.transition(OrderState::Finalizing)?;
        let chain = self.get_certificate(&order, certificate_key).await?;
        self.machine.transition(OrderState::Issued)?;

        Ok(IssuedCertificate {
            domain,
            account_url: account.uri,
            chain,
        })
    }
}

/// DER certificate request for `domain`, signed by `key`
pub fn certificate_request(domain: &str, key: &KeyPair) -> Result<Vec<u8>, LocalcertError> {
    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(LocalcertError::Csr)?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, domain.to_string());

    let csr = params.serialize_request(key).map_err(LocalcertError::Csr)?;
    Ok(csr.der().as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use x509_parser::certification_request::X509CertificationRequest;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::FromDer;

    const HAPPY_PATH: [OrderState; 10] = [
        OrderState::NoAccount,
        OrderState::Registering,
        OrderState::Registered,
        OrderState::DomainAcquired,
        OrderState::Provisioning,
        OrderState::ChallengeAccepted,
        OrderState::Polling,
        OrderState::Valid,
        OrderState::Finalizing,
        OrderState::Issued,
    ];

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = OrderStateMachine::new();
        for next in &HAPPY_PATH[1..] {
            machine.transition(*next).unwrap();
        }
        assert_eq!(machine.state(), OrderState::Issued);
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_registration_retry_allowed_once() {
        let mut machine = OrderStateMachine::new();
        machine.transition(OrderState::Registering).unwrap();
        machine.transition(OrderState::Registering).unwrap();
        assert!(machine.registration_retried());

        assert!(matches!(
            machine.transition(OrderState::Registering),
            Err(LocalcertError::InvalidTransition {
                from: OrderState::Registering,
                to: OrderState::Registering,
            })
        ));
        machine.transition(OrderState::Registered).unwrap();
    }

    #[test]
    fn test_invalid_is_terminal() {
        let mut machine = OrderStateMachine::new();
        for next in &HAPPY_PATH[1..7] {
            machine.transition(*next).unwrap();
        }
        machine.transition(OrderState::Invalid).unwrap();

        assert!(machine.state().is_terminal());
        assert!(machine.transition(OrderState::Finalizing).is_err());
        assert!(machine.transition(OrderState::Polling).is_err());
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut machine = OrderStateMachine::new();
        let err = machine.transition(OrderState::Provisioning).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid order state transition: no-account -> provisioning"
        );
        assert_eq!(machine.state(), OrderState::NoAccount);
    }

    #[test]
    fn test_closure_terms_agreement() {
        let accept_known = |uri: &str| uri == "https://example/tos";
        assert!(accept_known.agree("https://example/tos"));
        assert!(!accept_known.agree("https://example/tos-v2"));
    }

    #[test]
    fn test_identity_serialization() {
        let key = AccountKey::generate();
        let mut identity = AccountIdentity::new(&key);
        identity.key_id = Some("https://ca/acct/1".to_string());
        identity.accepted_terms = "https://example/tos".to_string();

        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["keyId"], "https://ca/acct/1");
        assert_eq!(json["acceptedTerms"], "https://example/tos");

        let restored: AccountIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(restored, identity);
    }

    #[test]
    fn test_certificate_request_names_domain() {
        let key = KeyPair::generate().unwrap();
        let der = certificate_request("abc123.localcert.dev", &key).unwrap();

        let (_, csr) = X509CertificationRequest::from_der(&der).unwrap();
        let info = &csr.certification_request_info;

        let common_names: Vec<&str> = info
            .subject
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok())
            .collect();
        assert_eq!(common_names, vec!["abc123.localcert.dev"]);

        let mut dns_names = Vec::new();
        for extension in csr.requested_extensions().into_iter().flatten() {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        dns_names.push(dns.to_string());
                    }
                }
            }
        }
        assert_eq!(dns_names, vec!["abc123.localcert.dev".to_string()]);
    }

    fn any_state() -> impl Strategy<Value = OrderState> {
        let mut states = HAPPY_PATH.to_vec();
        states.push(OrderState::Invalid);
        prop::sample::select(states)
    }

    proptest! {
        #[test]
        fn prop_machine_follows_allowed_edges(steps in prop::collection::vec(any_state(), 0..24)) {
            let mut machine = OrderStateMachine::new();
            let mut self_loops = 0;

            for next in steps {
                let from = machine.state();
                match machine.transition(next) {
                    Ok(()) => {
                        prop_assert!(from.can_transition_to(next));
                        prop_assert_eq!(machine.state(), next);
                        if from == next {
                            self_loops += 1;
                        }
                    }
                    Err(_) => prop_assert_eq!(machine.state(), from),
                }
            }

            prop_assert!(self_loops <= 1);
        }
    }
}
