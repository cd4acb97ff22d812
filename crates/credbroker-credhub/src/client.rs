use crate::{CredhubConfig, CredhubError, UaaTokenSource};
use credbroker_store::{
    CredentialStore, JsonObject, Permission, PermissionHandle, PermissionOp, StoreError,
};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

type HttpResult = Result<ureq::http::Response<ureq::Body>, ureq::Error>;

/// Map a CredHub or UAA response to its body, or to the error its status means.
pub(crate) fn read_response(url: &str, result: HttpResult) -> Result<Vec<u8>, CredhubError> {
    let resp = result.map_err(|e| CredhubError::Http(format!("{url}: {e}")))?;
    let code = resp.status().as_u16();

    let mut body = Vec::new();
    resp.into_body()
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| CredhubError::Http(format!("{url}: reading body: {e}")))?;

    if code < 400 {
        return Ok(body);
    }
    let detail = error_detail(&body);
    let msg = format!("HTTP {code} for {url}{detail}");
    Err(match code {
        404 => CredhubError::NotFound(msg),
        409 => CredhubError::Conflict(msg),
        401 | 403 => CredhubError::Auth(msg),
        _ => CredhubError::Http(msg),
    })
}

/// CredHub reports failures as `{"error": "..."}`; UAA as `error_description`.
fn error_detail(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_description: Option<String>,
    }
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            error_description: Some(d),
            ..
        })
        | Ok(ErrorBody { error: Some(d), .. }) => format!(": {d}"),
        _ => String::new(),
    }
}

#[derive(Serialize)]
struct SetRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a JsonObject,
}

#[derive(Deserialize)]
struct DataVersion {
    #[serde(rename = "type", default)]
    kind: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct DataResponse {
    data: Vec<DataVersion>,
}

#[derive(Deserialize)]
struct V1Permission {
    actor: String,
    #[serde(default)]
    operations: Vec<PermissionOp>,
}

#[derive(Deserialize)]
struct V1Permissions {
    #[serde(default)]
    permissions: Vec<V1Permission>,
}

#[derive(Serialize)]
struct V2PermissionRequest<'a> {
    actor: &'a str,
    path: &'a str,
    operations: &'a [PermissionOp],
}

#[derive(Deserialize)]
struct V2Permission {
    uuid: String,
    actor: String,
    path: String,
}

impl From<V2Permission> for PermissionHandle {
    fn from(p: V2Permission) -> Self {
        PermissionHandle {
            uuid: p.uuid,
            actor: p.actor,
            path: p.path,
        }
    }
}

enum Auth {
    Static(String),
    Uaa(UaaTokenSource),
}

/// CredHub backend over HTTPS.
///
/// Endpoints used:
/// - `PUT    /api/v1/data`                          write a json credential
/// - `GET    /api/v1/data?name=&current=true`       latest version
/// - `DELETE /api/v1/data?name=`                    all versions
/// - `GET    /api/v1/permissions?credential_name=`  grants at a path (no ids)
/// - `GET    /api/v2/permissions?path=&actor=`      one grant, with its id
/// - `POST   /api/v2/permissions`                   add a grant
/// - `DELETE /api/v2/permissions/<uuid>`            revoke a grant
pub struct CredhubClient {
    config: CredhubConfig,
    agent: ureq::Agent,
    auth: Auth,
}

impl CredhubClient {
    pub fn new(config: CredhubConfig) -> Result<Self, CredhubError> {
        config.validate()?;
        let agent = build_agent(&config)?;
        let auth = match (&config.auth_token, &config.client_id, &config.client_secret) {
            (Some(token), _, _) => Auth::Static(token.clone()),
            (None, Some(id), Some(secret)) => Auth::Uaa(UaaTokenSource::new(
                config.base_url(),
                config.uaa_url.as_deref(),
                id,
                secret,
            )),
            _ => {
                return Err(CredhubError::Config(
                    "no CredHub credentials configured".to_owned(),
                ))
            }
        };
        Ok(Self {
            config,
            agent,
            auth,
        })
    }

    pub fn config(&self) -> &CredhubConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.config.base_url())
    }

    fn bearer(&self) -> Result<String, CredhubError> {
        let token = match self.auth {
            Auth::Static(ref token) => token.clone(),
            Auth::Uaa(ref source) => source.token(&self.agent)?,
        };
        Ok(format!("Bearer {token}"))
    }

    /// Forget a token CredHub rejected so the next call fetches a new one.
    fn on_result<T>(&self, result: Result<T, CredhubError>) -> Result<T, CredhubError> {
        if let (Err(CredhubError::Auth(_)), Auth::Uaa(ref source)) = (&result, &self.auth) {
            source.invalidate();
        }
        result
    }

    fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, CredhubError> {
        let url = self.url(endpoint);
        debug!("GET {url} {query:?}");
        let mut req = self
            .agent
            .get(&url)
            .header("Authorization", &self.bearer()?)
            .header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        self.on_result(read_response(&url, req.call()))
    }

    fn delete_at(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<(), CredhubError> {
        let url = self.url(endpoint);
        debug!("DELETE {url} {query:?}");
        let mut req = self
            .agent
            .delete(&url)
            .header("Authorization", &self.bearer()?);
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        self.on_result(read_response(&url, req.call())).map(|_| ())
    }

    fn send_json(
        &self,
        method: &str,
        endpoint: &str,
        body: &impl Serialize,
    ) -> Result<Vec<u8>, CredhubError> {
        let url = self.url(endpoint);
        let payload = serde_json::to_vec(body)?;
        debug!("{method} {url} ({} bytes)", payload.len());
        let req = match method {
            "PUT" => self.agent.put(&url),
            _ => self.agent.post(&url),
        };
        let result = req
            .header("Authorization", &self.bearer()?)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .send(&payload[..]);
        self.on_result(read_response(&url, result))
    }
}

fn build_agent(config: &CredhubConfig) -> Result<ureq::Agent, CredhubError> {
    let mut builder = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
        .http_status_as_error(false);

    if let Some(ref pem) = config.ca_cert {
        let mut certs = Vec::new();
        for item in ureq::tls::parse_pem(pem.as_bytes()) {
            match item.map_err(|e| CredhubError::Tls(e.to_string()))? {
                ureq::tls::PemItem::Certificate(cert) => certs.push(cert.to_owned()),
                _ => continue,
            }
        }
        if certs.is_empty() {
            return Err(CredhubError::Tls(
                "ca_cert contains no PEM certificates".to_owned(),
            ));
        }
        let tls = ureq::tls::TlsConfig::builder()
            .root_certs(ureq::tls::RootCerts::new_with_certs(&certs))
            .build();
        builder = builder.tls_config(tls);
    }

    Ok(builder.build().new_agent())
}

impl CredentialStore for CredhubClient {
    fn name(&self) -> &'static str {
        "credhub"
    }

    fn set_json(&self, path: &str, value: &JsonObject) -> Result<(), StoreError> {
        let request = SetRequest {
            name: path,
            kind: "json",
            value,
        };
        self.send_json("PUT", "/api/v1/data", &request)?;
        Ok(())
    }

    fn get_json(&self, path: &str) -> Result<JsonObject, StoreError> {
        let endpoint = "/api/v1/data";
        let body = self.get(endpoint, &[("name", path), ("current", "true")])?;
        let response: DataResponse = serde_json::from_slice(&body)?;
        let Some(latest) = response.data.into_iter().next() else {
            return Err(StoreError::NotFound(path.to_owned()));
        };
        match latest.value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(CredhubError::UnexpectedResponse {
                url: self.url(endpoint),
                reason: format!("credential {path} has type '{}', not json", latest.kind),
            }
            .into()),
        }
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.delete_at("/api/v1/data", &[("name", path)])?;
        Ok(())
    }

    fn list_permissions(&self, path: &str) -> Result<Vec<Permission>, StoreError> {
        let body = self.get("/api/v1/permissions", &[("credential_name", path)])?;
        let listed: V1Permissions = serde_json::from_slice(&body)?;
        Ok(listed
            .permissions
            .into_iter()
            .map(|p| Permission {
                actor: p.actor,
                path: path.to_owned(),
                operations: p.operations,
                uuid: None,
            })
            .collect())
    }

    fn find_permission(&self, path: &str, actor: &str) -> Result<PermissionHandle, StoreError> {
        let body = self.get("/api/v2/permissions", &[("path", path), ("actor", actor)])?;
        let found: V2Permission = serde_json::from_slice(&body)?;
        Ok(found.into())
    }

    fn add_permission(
        &self,
        path: &str,
        actor: &str,
        operations: &[PermissionOp],
    ) -> Result<PermissionHandle, StoreError> {
        let request = V2PermissionRequest {
            actor,
            path,
            operations,
        };
        let body = self.send_json("POST", "/api/v2/permissions", &request)?;
        let created: V2Permission = serde_json::from_slice(&body)?;
        Ok(created.into())
    }

    fn delete_permission(&self, handle: &PermissionHandle) -> Result<(), StoreError> {
        self.delete_at(&format!("/api/v2/permissions/{}", handle.uuid), &[])?;
        Ok(())
    }
}
