use crate::CredhubError;
use serde::{Deserialize, Serialize};

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for one CredHub deployment.
///
/// Authentication is either a static bearer `auth_token`, or UAA client
/// credentials (`client_id` + `client_secret`). Without `uaa_url` the UAA
/// endpoint is discovered from CredHub's `/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredhubConfig {
    pub url: String,
    #[serde(default)]
    pub uaa_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// PEM bundle trusted for both CredHub and UAA.
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CredhubConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_owned(),
            uaa_url: None,
            client_id: None,
            client_secret: None,
            ca_cert: None,
            auth_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_client_credentials(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_id = Some(client_id.to_owned());
        self.client_secret = Some(client_secret.to_owned());
        self
    }

    #[must_use]
    pub fn with_uaa_url(mut self, uaa_url: &str) -> Self {
        self.uaa_url = Some(uaa_url.trim_end_matches('/').to_owned());
        self
    }

    #[must_use]
    pub fn with_ca_cert(mut self, pem: &str) -> Self {
        self.ca_cert = Some(pem.to_owned());
        self
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), CredhubError> {
        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            return Err(CredhubError::Config(format!(
                "CredHub url must be http(s): '{}'",
                self.url
            )));
        }
        if self.auth_token.is_some() {
            return Ok(());
        }
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(_)) if !id.is_empty() => Ok(()),
            _ => Err(CredhubError::Config(
                "either auth_token or client_id and client_secret must be set".to_owned(),
            )),
        }
    }
}
