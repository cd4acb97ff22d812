use crate::CoreError;
use credbroker_model::{AppId, BindingId, InstanceId, InstanceRecord, PlanName};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub instance_id: InstanceId,
    pub plan_name: PlanName,
    pub space_id: String,
    pub organization_id: String,
    /// Raw request parameters; must decode to a JSON object of secrets.
    pub parameters: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub binding_id: BindingId,
    pub app_id: AppId,
    pub space_id: String,
}

/// How the platform should treat a finished call.
///
/// Provision and update report `Async` even though the work is done when
/// they return; the platform then polls last-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Sync,
    Async,
}

impl Completion {
    pub fn is_async(self) -> bool {
        self == Completion::Async
    }
}

/// What a binding hands the consuming application: a path, never the secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingCredentials {
    #[serde(rename = "credhub-ref")]
    pub credhub_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Succeeded,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::Succeeded => write!(f, "succeeded"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperation {
    pub state: OperationState,
    pub description: String,
}

/// Lifecycle policy for one service plan.
///
/// Operators act on the credential store and mutate the in-memory record they
/// are handed. They never persist records; the registry does that after a
/// call returns `Ok`, and discards the mutation otherwise.
pub trait Operator: Send + Sync {
    fn plan_name(&self) -> &str;

    /// Write the secret payload for a new instance and build its record.
    fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<(InstanceRecord, Completion), CoreError>;

    /// Revoke every grant on the instance path, then delete the payload.
    fn deprovision(&self, record: &InstanceRecord) -> Result<Completion, CoreError>;

    /// Replace the secret payload and the record's secret names.
    fn update(&self, record: &mut InstanceRecord, parameters: &[u8])
        -> Result<Completion, CoreError>;

    fn bind(
        &self,
        record: &mut InstanceRecord,
        request: &BindRequest,
    ) -> Result<BindingCredentials, CoreError>;

    /// Unknown binding ids are not an error.
    fn unbind(&self, record: &mut InstanceRecord, binding_id: &BindingId) -> Result<(), CoreError>;

    fn last_operation(&self, record: &InstanceRecord) -> LastOperation;
}
