//! Instance records, bindings, path layout, and secrets decoding for credbroker.
//!
//! This crate defines the data model shared by every other crate: the
//! `InstanceRecord` persisted per provisioned instance, the `Binding` entries it
//! tracks, the `StorePaths` layout that keeps payloads, records and intent
//! markers apart under one prefix, and `decode_secrets` for request parameters.

pub mod paths;
pub mod record;
pub mod secrets;
pub mod types;

pub use paths::{validate_identifier, StorePaths};
pub use record::{actor_for, Binding, InstanceRecord, ServicePlan};
pub use secrets::{decode_secrets, Secrets};
pub use types::{AppId, BindingId, InstanceId, PlanName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("invalid credential-store prefix: {0}")]
    InvalidPrefix(String),
    #[error("invalid instance record: {0}")]
    InvalidRecord(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
