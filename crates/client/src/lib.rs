//! localcert client
//!
//! Obtains a publicly trusted TLS certificate for a `*.localcert.dev`
//! subdomain. The localcert relay performs the DNS-01 challenge on the
//! account's behalf without ever seeing the account key: it only receives
//! signed ACME requests captured from the local engine.
//!
//! # Architecture
//!
//! - [`RelayClient`] - Domain acquisition and challenge provisioning through
//!   the relay, using captured signed requests as proof
//! - [`Orchestrator`] - Registration, provisioning, finalization and download,
//!   tracked by [`OrderState`]
//! - [`ClientConfig`] - CA directory, relay URL and timeouts
//! - [`plan_renewal`] - Keep, renew or issue based on the current leaf
//!
//! # Example
//!
//! ```no_run
//! use localcert::{AccountIdentity, ClientConfig, Orchestrator};
//! use localcert::acme::AccountKey;
//!
//! # async fn run() -> Result<(), localcert::LocalcertError> {
//! let config = ClientConfig::default();
//! let key = AccountKey::generate();
//! let mut identity = AccountIdentity::new(&key);
//!
//! let transport = config.transport()?;
//! let mut orchestrator = Orchestrator::from_config(&config, key, transport)?;
//!
//! let certificate_key = rcgen::KeyPair::generate().map_err(localcert::LocalcertError::Csr)?;
//! let issued = orchestrator
//!     .issue(&mut identity, &|_terms: &str| true, None, &certificate_key)
//!     .await?;
//! println!("issued {} ({} certificates)", issued.domain, issued.chain.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod relay;
pub mod renewal;

pub use localcert_acme as acme;

pub use config::{ClientConfig, DEFAULT_SERVER_URL};
pub use errors::{ConfigError, LocalcertError, RelayError};
pub use orchestrator::{
    certificate_request, AccountIdentity, IssuedCertificate, Orchestrator, OrderState,
    OrderStateMachine, TermsAgreement,
};
pub use relay::{
    DomainRequest, DomainResult, ProvisionRequest, ProvisionResult, ProvisionedOrder, RelayClient,
};
pub use renewal::{inspect_leaf, plan_renewal, LeafInfo, RenewalPlan};
