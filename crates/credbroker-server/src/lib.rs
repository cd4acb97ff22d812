//! Open Service Broker API v2 server for credbroker.
//!
//! Routes (all under HTTP basic auth and `X-Broker-API-Version: 2.x`):
//!
//! - `GET    /v2/catalog`
//! - `PUT    /v2/service_instances/{id}`                       provision (async)
//! - `PATCH  /v2/service_instances/{id}`                       update (async)
//! - `DELETE /v2/service_instances/{id}`                       deprovision
//! - `GET    /v2/service_instances/{id}/last_operation`
//! - `PUT    /v2/service_instances/{id}/service_bindings/{bid}` bind
//! - `DELETE /v2/service_instances/{id}/service_bindings/{bid}` unbind
//!
//! plus an unauthenticated `GET /health`.
//!
//! The [`TestServer`] helper starts a broker on a random port for integration testing.

pub mod config;

pub use config::{ApiConfig, BrokerConfig, Catalog, CredhubSection, PlanOffering, ServiceOffering};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use credbroker_core::{
    shutdown_requested, BindRequest, Completion, CoreError, InstanceRegistry, PlanTable,
    ProvisionRequest,
};
use credbroker_credhub::CredhubError;
use credbroker_model::{ModelError, StorePaths};
use credbroker_store::{CredentialStore, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

pub const MIN_API_VERSION: &str = "2.13";

/// How long a worker waits for a request before rechecking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Credhub(#[from] CredhubError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

/// An error answered to the platform as `{"error", "description"}`.
#[derive(Debug)]
struct ApiError {
    status: u16,
    code: &'static str,
    description: String,
}

impl ApiError {
    fn new(status: u16, code: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            code,
            description: description.into(),
        }
    }

    fn bad_request(description: impl Into<String>) -> Self {
        Self::new(400, "BadRequest", description)
    }

    fn body(&self) -> Value {
        json!({ "error": self.code, "description": self.description })
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let description = e.to_string();
        match e {
            CoreError::InstanceNotFound(_) => Self::new(404, "NotFound", description),
            CoreError::PathInUse { .. } => Self::new(409, "Conflict", description),
            CoreError::Persist { .. } => Self::new(500, "PersistFailed", description),
            e if e.is_client_error() => Self::bad_request(description),
            _ => Self::new(500, "InternalError", description),
        }
    }
}

type ApiResult = Result<(u16, Value), ApiError>;

enum Route<'a> {
    Catalog,
    Instance(&'a str),
    LastOperation(&'a str),
    Binding(&'a str, &'a str),
}

fn parse_route(path: &str) -> Option<Route<'_>> {
    if path == "/v2/catalog" {
        return Some(Route::Catalog);
    }
    let rest = path.strip_prefix("/v2/service_instances/")?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [id] if !id.is_empty() => Some(Route::Instance(id)),
        [id, "last_operation"] if !id.is_empty() => Some(Route::LastOperation(id)),
        [id, "service_bindings", bid] if !id.is_empty() && !bid.is_empty() => {
            Some(Route::Binding(id, bid))
        }
        _ => None,
    }
}

fn split_url(url: &str) -> (&str, &str) {
    url.split_once('?').unwrap_or((url, ""))
}

/// First value of `key` in a query string. Broker parameters are GUIDs and
/// booleans, so no percent-decoding is done.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn header<'a>(req: &'a Request, name: &'static str) -> Option<&'a str> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.as_str())
}

fn respond_json(req: Request, status: u16, body: &Value) {
    let mut response =
        Response::from_string(body.to_string()).with_status_code(StatusCode(status));
    if let Ok(h) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(h);
    }
    if let Err(e) = req.respond(response) {
        warn!("failed to send response: {e}");
    }
}

fn read_body(req: &mut Request) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    req.as_reader()
        .read_to_end(&mut body)
        .map_err(|e| ApiError::bad_request(format!("failed to read request body: {e}")))?;
    Ok(body)
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("malformed request body: {e}")))
}

/// `parameters` as raw bytes for the operator to decode; absent means empty.
fn raw_parameters(parameters: Option<&Value>) -> Vec<u8> {
    parameters.map(Value::to_string).unwrap_or_default().into_bytes()
}

fn require_async(query: &str) -> Result<(), ApiError> {
    if query_param(query, "accepts_incomplete") == Some("true") {
        Ok(())
    } else {
        Err(ApiError::new(
            422,
            "AsyncRequired",
            "This service plan requires client support for asynchronous service operations.",
        ))
    }
}

fn completion_status(completion: Completion, sync_status: u16) -> u16 {
    if completion.is_async() {
        202
    } else {
        sync_status
    }
}

#[derive(Deserialize)]
struct ProvisionBody {
    service_id: String,
    plan_id: String,
    organization_guid: String,
    space_guid: String,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Deserialize)]
struct UpdateBody {
    service_id: String,
    #[serde(default)]
    plan_id: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Deserialize)]
struct BindResource {
    #[serde(default)]
    app_guid: Option<String>,
    #[serde(default)]
    space_guid: Option<String>,
}

#[derive(Deserialize)]
struct BindBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    app_guid: Option<String>,
    #[serde(default)]
    bind_resource: Option<BindResource>,
}

/// The broker: configuration, the instance registry, and request handling.
pub struct Broker {
    config: BrokerConfig,
    registry: InstanceRegistry,
}

impl Broker {
    /// Build a broker over `store`. Every catalog plan must have an operator.
    pub fn new(config: BrokerConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ServerError> {
        config.validate()?;
        let paths = StorePaths::new(&config.credhub.prefix)?;
        let plans = PlanTable::standard(Arc::clone(&store), paths.clone());
        for plan in config.catalog.plans() {
            if !plans.contains(&plan.name) {
                return Err(ServerError::Config(format!(
                    "catalog plan '{}' ({}) has no operator; known plans: {}",
                    plan.name,
                    plan.id,
                    plans.plan_names().join(", ")
                )));
            }
        }
        info!(
            "broker ready: store={} prefix={} plans={}",
            store.name(),
            paths.prefix(),
            plans.plan_names().join(",")
        );
        Ok(Self {
            registry: InstanceRegistry::new(store, paths, plans),
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn authorized(&self, req: &Request) -> bool {
        let Some(value) = header(req, "Authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        credentials.split_once(':').is_some_and(|(user, pass)| {
            user == self.config.api.basic_auth_username
                && pass == self.config.api.basic_auth_password
        })
    }

    fn plan_name_for(&self, plan_id: &str) -> Result<&str, ApiError> {
        self.config
            .catalog
            .plan_name(plan_id)
            .ok_or_else(|| ApiError::bad_request(format!("unknown plan_id '{plan_id}'")))
    }

    fn check_service(&self, service_id: &str) -> Result<(), ApiError> {
        if self.config.catalog.services.iter().any(|s| s.id == service_id) {
            Ok(())
        } else {
            Err(ApiError::bad_request(format!("unknown service_id '{service_id}'")))
        }
    }

    fn catalog(&self) -> ApiResult {
        let services = serde_json::to_value(&self.config.catalog.services)
            .map_err(|e| ApiError::new(500, "InternalError", e.to_string()))?;
        Ok((200, json!({ "services": services })))
    }

    fn provision(&self, instance_id: &str, query: &str, body: &[u8]) -> ApiResult {
        require_async(query)?;
        let body: ProvisionBody = parse_body(body)?;
        self.check_service(&body.service_id)?;
        let plan_name = self.plan_name_for(&body.plan_id)?;
        let request = ProvisionRequest {
            instance_id: instance_id.into(),
            plan_name: plan_name.into(),
            space_id: body.space_guid,
            organization_id: body.organization_guid,
            parameters: raw_parameters(body.parameters.as_ref()),
        };
        let completion = self.registry.provision(&request)?;
        Ok((completion_status(completion, 201), json!({})))
    }

    fn update(&self, instance_id: &str, query: &str, body: &[u8]) -> ApiResult {
        require_async(query)?;
        let body: UpdateBody = parse_body(body)?;
        self.check_service(&body.service_id)?;
        let plan_name = match &body.plan_id {
            Some(plan_id) => Some(self.plan_name_for(plan_id)?),
            None => None,
        };
        let parameters = raw_parameters(body.parameters.as_ref());
        let completion = self.registry.update(instance_id, plan_name, &parameters)?;
        Ok((completion_status(completion, 200), json!({})))
    }

    fn deprovision(&self, instance_id: &str) -> ApiResult {
        match self.registry.deprovision(instance_id) {
            Ok(completion) => Ok((completion_status(completion, 200), json!({}))),
            Err(CoreError::InstanceNotFound(_)) => Ok((410, json!({}))),
            Err(e) => Err(e.into()),
        }
    }

    fn last_operation(&self, instance_id: &str) -> ApiResult {
        match self.registry.last_operation(instance_id) {
            Ok(status) => Ok((
                200,
                json!({ "state": status.state, "description": status.description }),
            )),
            Err(CoreError::InstanceNotFound(_)) => Ok((410, json!({}))),
            Err(e) => Err(e.into()),
        }
    }

    fn bind(&self, instance_id: &str, binding_id: &str, body: &[u8]) -> ApiResult {
        let body: BindBody = parse_body(body)?;
        self.check_service(&body.service_id)?;
        self.plan_name_for(&body.plan_id)?;
        let resource = body.bind_resource.as_ref();
        let app_guid = resource
            .and_then(|r| r.app_guid.clone())
            .or(body.app_guid)
            .ok_or_else(|| {
                ApiError::new(422, "RequiresApp", "This service supports generation of credentials through binding an application only.")
            })?;
        let request = BindRequest {
            binding_id: binding_id.into(),
            app_id: app_guid.into(),
            space_id: resource
                .and_then(|r| r.space_guid.clone())
                .unwrap_or_default(),
        };
        let bound = self.registry.bind(instance_id, &request)?;
        let status = if bound.existing { 200 } else { 201 };
        Ok((status, json!({ "credentials": bound.credentials })))
    }

    fn unbind(&self, instance_id: &str, binding_id: &str) -> ApiResult {
        match self.registry.unbind(instance_id, binding_id) {
            Ok(()) => Ok((200, json!({}))),
            Err(CoreError::InstanceNotFound(_)) => Ok((410, json!({}))),
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&self, method: &Method, route: Route<'_>, query: &str, body: &[u8]) -> ApiResult {
        match (method, route) {
            (Method::Get, Route::Catalog) => self.catalog(),
            (Method::Put, Route::Instance(id)) => self.provision(id, query, body),
            (Method::Patch, Route::Instance(id)) => self.update(id, query, body),
            (Method::Delete, Route::Instance(id)) => self.deprovision(id),
            (Method::Get, Route::LastOperation(id)) => self.last_operation(id),
            (Method::Put, Route::Binding(id, bid)) => self.bind(id, bid, body),
            (Method::Delete, Route::Binding(id, bid)) => self.unbind(id, bid),
            _ => Err(ApiError::new(405, "MethodNotAllowed", "method not allowed")),
        }
    }

    /// Handle a single HTTP request.
    pub fn handle(&self, mut req: Request) {
        let method = req.method().clone();
        let url = req.url().to_owned();
        let (path, query) = split_url(&url);
        debug!("{method} {path}");

        if path == "/health" && method == Method::Get {
            respond_json(req, 200, &json!({ "status": "ok" }));
            return;
        }
        let Some(route) = parse_route(path) else {
            respond_json(req, 404, &ApiError::new(404, "NotFound", "not found").body());
            return;
        };
        if !self.authorized(&req) {
            warn!("rejected unauthenticated {method} {path}");
            let body = ApiError::new(401, "Unauthorized", "invalid broker credentials").body();
            respond_json(req, 401, &body);
            return;
        }
        if !header(&req, "X-Broker-API-Version").is_some_and(|v| v.starts_with("2.")) {
            let body = ApiError::new(
                412,
                "PreconditionFailed",
                format!("X-Broker-API-Version {MIN_API_VERSION} or later 2.x is required"),
            )
            .body();
            respond_json(req, 412, &body);
            return;
        }

        let result = read_body(&mut req)
            .and_then(|body| self.dispatch(&method, route, query, &body));
        match result {
            Ok((status, body)) => {
                info!("{method} {path} -> {status}");
                respond_json(req, status, &body);
            }
            Err(e) => {
                if e.status >= 500 {
                    error!("{method} {path} -> {}: {}", e.status, e.description);
                } else {
                    warn!("{method} {path} -> {}: {}", e.status, e.description);
                }
                respond_json(req, e.status, &e.body());
            }
        }
    }
}

/// Serve requests with `workers` threads until shutdown is requested.
pub fn run_server(broker: &Arc<Broker>, addr: &str, workers: usize) -> Result<(), ServerError> {
    let server = Arc::new(Server::http(addr).map_err(|e| ServerError::Bind {
        addr: addr.to_owned(),
        reason: e.to_string(),
    })?);
    info!("listening on {addr} with {workers} workers");

    let handles: Vec<_> = (0..workers.max(1))
        .map(|n| {
            let server = Arc::clone(&server);
            let broker = Arc::clone(broker);
            std::thread::spawn(move || serve_until_shutdown(&server, &broker, n))
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            error!("a worker thread panicked");
        }
    }
    info!("server stopped");
    Ok(())
}

fn serve_until_shutdown(server: &Server, broker: &Broker, worker: usize) {
    while !shutdown_requested() {
        match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => broker.handle(request),
            Ok(None) => {}
            Err(e) => {
                error!("worker {worker}: accept failed: {e}");
                break;
            }
        }
    }
    debug!("worker {worker} exiting");
}

/// A broker on `127.0.0.1:{random port}` served by a background thread.
/// Dropping it stops the server.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub broker: Arc<Broker>,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: BrokerConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ServerError> {
        let broker = Arc::new(Broker::new(config, store)?);
        let server = Arc::new(Server::http("127.0.0.1:0").map_err(|e| ServerError::Bind {
            addr: "127.0.0.1:0".to_owned(),
            reason: e.to_string(),
        })?);
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| ServerError::Config("test server is not on an IP socket".to_owned()))?;

        let srv = Arc::clone(&server);
        let b = Arc::clone(&broker);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                b.handle(request);
            }
        });
        Ok(Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            broker,
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
