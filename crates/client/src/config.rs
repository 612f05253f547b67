//! Client configuration.

use std::time::Duration;

use localcert_acme::{
    AccountKey, AcmeClient, TransportHandle, DEFAULT_USER_AGENT, LETS_ENCRYPT_DIRECTORY_URL,
    LETS_ENCRYPT_STAGING_DIRECTORY_URL,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{ConfigError, LocalcertError};

/// Default localcert relay
pub const DEFAULT_SERVER_URL: &str = "https://api.localcert.dev";

/// Configuration for a localcert client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// ACME directory of the certificate authority
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Base URL of the localcert relay
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// `User-Agent` sent to both the CA and the relay
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Overall deadline for an order to settle
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,

    /// Order poll interval when the CA sends no `Retry-After`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Renew certificates expiring within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
}

fn default_directory_url() -> String { LETS_ENCRYPT_DIRECTORY_URL.to_string() }
fn default_server_url() -> String { DEFAULT_SERVER_URL.to_string() }
fn default_user_agent() -> String { DEFAULT_USER_AGENT.to_string() }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_order_timeout_ms() -> u64 { 120_000 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_renew_before_days() -> u32 { 30 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory_url: default_directory_url(),
            server_url: default_server_url(),
            user_agent: default_user_agent(),
            request_timeout_ms: default_request_timeout_ms(),
            order_timeout_ms: default_order_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

impl ClientConfig {
    /// Configuration against the Let's Encrypt staging environment.
    pub fn staging() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING_DIRECTORY_URL.to_string(),
            ..Default::default()
        }
    }

    pub fn with_directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout_ms = whole_millis(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = whole_millis(interval);
        self
    }

    pub fn with_renew_before_days(mut self, days: u32) -> Self {
        self.renew_before_days = days;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renew_before_days))
    }

    /// Check URLs parse and durations are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("directory_url", &self.directory_url)?;
        validate_url("server_url", &self.server_url)?;

        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::EmptyUserAgent);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "request_timeout_ms",
            });
        }
        if self.order_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "order_timeout_ms",
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "poll_interval_ms",
            });
        }
        Ok(())
    }

    /// Validate, then build the production transport.
    pub fn transport(&self) -> Result<TransportHandle, LocalcertError> {
        self.validate()?;
        TransportHandle::reqwest(self.request_timeout(), &self.user_agent)
            .map_err(LocalcertError::Transport)
    }

    /// Build an ACME engine for `key` on top of `transport`.
    pub fn engine(&self, key: AccountKey, transport: TransportHandle) -> AcmeClient {
        AcmeClient::new(&self.directory_url, key, transport)
            .with_user_agent(&self.user_agent)
            .with_poll_interval(self.poll_interval())
    }

    /// Relay base URL without a trailing slash.
    pub(crate) fn relay_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

/// Milliseconds in `duration`, rounded up so a non-zero duration stays non-zero
fn whole_millis(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}
