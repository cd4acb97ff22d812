use crate::secrets::Secrets;
use crate::types::{AppId, BindingId, InstanceId, PlanName};
use crate::ModelError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const ACTOR_PREFIX: &str = "mtls-app:";

/// Credential-store actor identity for a consuming application.
pub fn actor_for(app_id: &str) -> String {
    format!("{ACTOR_PREFIX}{app_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePlan {
    pub name: PlanName,
}

/// One consuming application's read grant on an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    #[serde(rename = "binding_guid")]
    pub binding_id: BindingId,
    #[serde(rename = "app_guid")]
    pub app_id: AppId,
    #[serde(rename = "space_guid")]
    pub space_id: String,
}

impl Binding {
    pub fn new(
        binding_id: impl Into<BindingId>,
        app_id: impl Into<AppId>,
        space_id: impl Into<String>,
    ) -> Self {
        Self {
            binding_id: binding_id.into(),
            app_id: app_id.into(),
            space_id: space_id.into(),
        }
    }

    pub fn actor(&self) -> String {
        actor_for(&self.app_id)
    }
}

/// Durable metadata for one provisioned service instance.
///
/// The field names on the wire are the legacy `*_guid` names so records
/// written by earlier broker releases keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    #[serde(rename = "service_instance_guid")]
    pub instance_id: InstanceId,
    #[serde(rename = "resident_space_guid")]
    pub resident_space_id: String,
    #[serde(rename = "organization_guid")]
    pub organization_id: String,
    #[serde(rename = "service_plan")]
    pub plan: ServicePlan,
    #[serde(default, deserialize_with = "null_as_default")]
    pub app_bindings: BTreeMap<BindingId, Binding>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub secret_names: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// blake3 checksum for integrity verification. `None` for legacy records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<InstanceId>,
        resident_space_id: impl Into<String>,
        organization_id: impl Into<String>,
        plan: impl Into<PlanName>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            instance_id: instance_id.into(),
            resident_space_id: resident_space_id.into(),
            organization_id: organization_id.into(),
            plan: ServicePlan { name: plan.into() },
            app_bindings: BTreeMap::new(),
            secret_names: BTreeSet::new(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
            checksum: None,
        }
    }

    #[inline]
    pub fn plan_name(&self) -> &PlanName {
        &self.plan.name
    }

    /// Replace the stored secret names with the keys of `secrets`.
    pub fn update_secret_names(&mut self, secrets: &Secrets) {
        self.secret_names = secrets.keys().cloned().collect();
    }

    pub fn description_for_users(&self) -> String {
        let names: Vec<&str> = self.secret_names.iter().map(String::as_str).collect();
        format!("stored secrets: [{}]", names.join(", "))
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }

    /// Whether any binding other than `except` is held by `actor`.
    pub fn actor_in_use(&self, actor: &str, except: &BindingId) -> bool {
        self.app_bindings
            .values()
            .any(|b| b.binding_id != *except && b.actor() == actor)
    }

    /// Checksum over the record content, excluding the checksum field itself.
    pub fn compute_checksum(&self) -> Result<String, ModelError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    pub fn to_json_object(&self) -> Result<Map<String, Value>, ModelError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(ModelError::InvalidRecord(
                "instance record did not serialize to an object".to_owned(),
            )),
        }
    }

    pub fn from_json_object(object: Map<String, Value>) -> Result<Self, ModelError> {
        Ok(serde_json::from_value(Value::Object(object))?)
    }
}
