//! Lifecycle orchestration for credbroker service instances.
//!
//! This crate holds the `Operator` trait and the `simple` plan's operator,
//! the `PlanTable` that maps plan names to operators, and the
//! `InstanceRegistry`: the dispatch layer that loads and persists instance
//! records around each operator call, serializes calls per instance, and
//! reconciles operations interrupted half-way through.

pub mod concurrency;
pub mod operator;
pub mod plans;
pub mod registry;
pub mod simple;

pub use concurrency::{install_signal_handler, shutdown_requested, InstanceGuard, InstanceLocks};
pub use operator::{
    BindRequest, BindingCredentials, Completion, LastOperation, OperationState, Operator,
    ProvisionRequest,
};
pub use plans::PlanTable;
pub use registry::{Bound, InstanceRegistry};
pub use simple::{SimpleOperator, SIMPLE_PLAN};

use credbroker_model::ModelError;
use credbroker_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no operator for plan '{0}'")]
    UnknownPlan(String),
    #[error("service instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance {instance_id} is on plan '{from}' and cannot move to '{to}'")]
    PlanChange {
        instance_id: String,
        from: String,
        to: String,
    },
    #[error("credential path {path} is already in use ({grants} existing permission grants)")]
    PathInUse { path: String, grants: usize },
    #[error("instance {instance_id} changed in the credential store but its record could not be saved: {source}")]
    Persist {
        instance_id: String,
        source: StoreError,
    },
}

impl CoreError {
    /// Whether the caller sent something unusable, as opposed to a backend failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::Model(
                ModelError::InvalidParameters(_) | ModelError::InvalidIdentifier(_)
            ) | CoreError::UnknownPlan(_)
                | CoreError::PathInUse { .. }
                | CoreError::PlanChange { .. }
        )
    }
}
