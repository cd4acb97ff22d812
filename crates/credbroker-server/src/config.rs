//! Broker configuration: listener and basic auth, CredHub connection, and the
//! service catalog advertised to the platform.
//!
//! Loaded from a TOML file; every section has defaults so a file only needs
//! the credentials it actually uses:
//!
//! ```toml
//! [api]
//! port = 8080
//! basic_auth_username = "broker"
//! basic_auth_password = "secret"
//!
//! [credhub]
//! prefix = "/credhub-service-broker"
//! url = "https://credhub.service.cf.internal:8844"
//! client_id = "credhub-service-broker"
//! client_secret = "..."
//! ```

use crate::ServerError;
use credbroker_credhub::CredhubConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PREFIX: &str = "/credhub-service-broker";

const SECRETS_SERVICE_ID: &str = "55a7382a-906a-4011-a1fd-6b440652cda4";
const SIMPLE_PLAN_ID: &str = "24efab31-8cbd-47c0-8513-a9345f3c512b";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub api: ApiConfig,
    pub credhub: CredhubSection,
    pub catalog: Catalog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    pub basic_auth_username: String,
    pub basic_auth_password: String,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Threads serving requests.
    pub workers: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            basic_auth_username: String::new(),
            basic_auth_password: String::new(),
            log_level: "info".to_owned(),
            workers: 4,
        }
    }
}

/// Where instances live in CredHub and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredhubSection {
    pub prefix: String,
    pub url: Option<String>,
    pub uaa_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Inline PEM bundle.
    pub ca_cert: Option<String>,
    pub auth_token: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for CredhubSection {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_owned(),
            url: None,
            uaa_url: None,
            client_id: None,
            client_secret: None,
            ca_cert: None,
            auth_token: None,
            timeout_secs: None,
        }
    }
}

impl CredhubSection {
    /// Client settings for the CredHub backend; only needed when it is used.
    pub fn client_config(&self) -> Result<CredhubConfig, ServerError> {
        let Some(url) = self.url.as_deref() else {
            return Err(ServerError::Config(
                "[credhub] url is required for the credhub store".to_owned(),
            ));
        };
        let mut config = CredhubConfig::new(url);
        if let (Some(id), Some(secret)) = (&self.client_id, &self.client_secret) {
            config = config.with_client_credentials(id, secret);
        }
        if let Some(token) = &self.auth_token {
            config = config.with_token(token);
        }
        if let Some(uaa) = &self.uaa_url {
            config = config.with_uaa_url(uaa);
        }
        if let Some(pem) = &self.ca_cert {
            config = config.with_ca_cert(pem);
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub services: Vec<ServiceOffering>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            services: vec![ServiceOffering {
                id: SECRETS_SERVICE_ID.to_owned(),
                name: "secrets".to_owned(),
                description: "Store secrets in CredHub and share them with bound apps".to_owned(),
                bindable: true,
                plan_updateable: false,
                tags: vec!["secrets".to_owned(), "credhub".to_owned()],
                plans: vec![PlanOffering {
                    id: SIMPLE_PLAN_ID.to_owned(),
                    name: "simple".to_owned(),
                    description: "A JSON object of secrets readable by bound apps".to_owned(),
                    free: true,
                }],
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updateable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plans: Vec<PlanOffering>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub free: bool,
}

fn default_true() -> bool {
    true
}

impl Catalog {
    /// Plan name for a platform plan id, searched across every service.
    pub fn plan_name(&self, plan_id: &str) -> Option<&str> {
        self.services
            .iter()
            .flat_map(|s| &s.plans)
            .find(|p| p.id == plan_id)
            .map(|p| p.name.as_str())
    }

    pub fn plans(&self) -> impl Iterator<Item = &PlanOffering> {
        self.services.iter().flat_map(|s| &s.plans)
    }
}

impl BrokerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.api.basic_auth_username.is_empty() || self.api.basic_auth_password.is_empty() {
            return Err(ServerError::Config(
                "[api] basic_auth_username and basic_auth_password must be set".to_owned(),
            ));
        }
        if self.api.workers == 0 {
            return Err(ServerError::Config("[api] workers must be at least 1".to_owned()));
        }
        let mut seen = std::collections::HashSet::new();
        for plan in self.catalog.plans() {
            if !seen.insert(plan.id.as_str()) {
                return Err(ServerError::Config(format!(
                    "plan id {} appears more than once in the catalog",
                    plan.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[api]
basic_auth_username = "broker"
basic_auth_password = "pw"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = BrokerConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.api.port, DEFAULT_PORT);
        assert_eq!(config.api.log_level, "info");
        assert_eq!(config.credhub.prefix, DEFAULT_PREFIX);
        assert_eq!(config.catalog.plan_name(SIMPLE_PLAN_ID), Some("simple"));
        assert!(config.catalog.services[0].bindable);
        assert!(!config.catalog.services[0].plan_updateable);
    }

    #[test]
    fn missing_basic_auth_is_rejected() {
        let err = BrokerConfig::from_toml_str("[api]\nport = 9000\n").unwrap_err();
        assert!(err.to_string().contains("basic_auth"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            BrokerConfig::from_toml_str("[api"),
            Err(ServerError::Toml(_))
        ));
    }

    #[test]
    fn custom_catalog_replaces_default() {
        let input = format!(
            "{MINIMAL}
[[catalog.services]]
id = \"svc\"
name = \"vault\"
description = \"d\"

[[catalog.services.plans]]
id = \"p-1\"
name = \"simple\"
description = \"d\"
"
        );
        let config = BrokerConfig::from_toml_str(&input).unwrap();
        assert_eq!(config.catalog.services.len(), 1);
        assert_eq!(config.catalog.plan_name("p-1"), Some("simple"));
        assert_eq!(config.catalog.plan_name(SIMPLE_PLAN_ID), None);
    }

    #[test]
    fn duplicate_plan_ids_are_rejected() {
        let input = format!(
            "{MINIMAL}
[[catalog.services]]
id = \"svc\"
name = \"vault\"
description = \"d\"

[[catalog.services.plans]]
id = \"p-1\"
name = \"simple\"
description = \"d\"

[[catalog.services.plans]]
id = \"p-1\"
name = \"other\"
description = \"d\"
"
        );
        assert!(BrokerConfig::from_toml_str(&input).is_err());
    }

    #[test]
    fn credhub_client_config_from_section() {
        let section = CredhubSection {
            url: Some("https://credhub.example:8844/".to_owned()),
            client_id: Some("broker".to_owned()),
            client_secret: Some("s3cret".to_owned()),
            timeout_secs: Some(5),
            ..CredhubSection::default()
        };
        let config = section.client_config().unwrap();
        assert_eq!(config.base_url(), "https://credhub.example:8844");
        assert_eq!(config.client_id.as_deref(), Some("broker"));
        assert_eq!(config.timeout_secs, 5);
    }

    #[test]
    fn credhub_section_without_url_or_auth_is_rejected() {
        assert!(CredhubSection::default().client_config().is_err());
        let no_auth = CredhubSection {
            url: Some("https://credhub.example".to_owned()),
            ..CredhubSection::default()
        };
        assert!(matches!(
            no_auth.client_config(),
            Err(ServerError::Credhub(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(BrokerConfig::load(&path).unwrap().api.basic_auth_username, "broker");
        assert!(BrokerConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
