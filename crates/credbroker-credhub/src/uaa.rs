use crate::client::read_response;
use crate::CredhubError;
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Tokens are refreshed this long before UAA says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuthServer {
    url: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(rename = "auth-server")]
    auth_server: AuthServer,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials tokens from UAA, cached until shortly before expiry.
pub struct UaaTokenSource {
    credhub_url: String,
    client_id: String,
    client_secret: String,
    uaa_url: Mutex<Option<String>>,
    cached: Mutex<Option<CachedToken>>,
}

impl UaaTokenSource {
    pub fn new(
        credhub_url: &str,
        uaa_url: Option<&str>,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            credhub_url: credhub_url.trim_end_matches('/').to_owned(),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            uaa_url: Mutex::new(uaa_url.map(|u| u.trim_end_matches('/').to_owned())),
            cached: Mutex::new(None),
        }
    }

    /// A valid access token, fetching a new one if the cached one is stale.
    pub fn token(&self, agent: &ureq::Agent) -> Result<String, CredhubError> {
        let mut cached = lock(&self.cached);
        if let Some(ref token) = *cached {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let fresh = self.fetch(agent)?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token, e.g. after CredHub rejected it.
    pub fn invalidate(&self) {
        lock(&self.cached).take();
    }

    fn token_url(&self, agent: &ureq::Agent) -> Result<String, CredhubError> {
        let mut uaa_url = lock(&self.uaa_url);
        if let Some(ref url) = *uaa_url {
            return Ok(format!("{url}/oauth/token"));
        }
        let info_url = format!("{}/info", self.credhub_url);
        debug!("GET {info_url}");
        let body = read_response(&info_url, agent.get(&info_url).call())?;
        let info: InfoResponse = serde_json::from_slice(&body)?;
        let url = info.auth_server.url.trim_end_matches('/').to_owned();
        debug!("discovered UAA at {url}");
        let token_url = format!("{url}/oauth/token");
        *uaa_url = Some(url);
        Ok(token_url)
    }

    fn fetch(&self, agent: &ureq::Agent) -> Result<CachedToken, CredhubError> {
        let url = self.token_url(agent)?;
        debug!("POST {url} (client_credentials for {})", self.client_id);
        let result = agent
            .post(&url)
            .header("Accept", "application/json")
            .send_form([
                ("grant_type", "client_credentials"),
                ("response_type", "token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ]);
        let body = read_response(&url, result).map_err(|e| match e {
            CredhubError::Auth(msg) | CredhubError::Http(msg) => {
                CredhubError::Auth(format!("UAA token request failed: {msg}"))
            }
            other => other,
        })?;
        let response: TokenResponse = serde_json::from_slice(&body)?;
        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(0));
        Ok(CachedToken {
            value: response.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
