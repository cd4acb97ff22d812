//! Credential-store capability, local backends, instance records, and intent markers.
//!
//! This crate provides the storage layer: the `CredentialStore` trait every
//! backend implements (JSON values and permission grants keyed by path), an
//! in-process `MemoryStore` with fault injection, a directory-backed
//! `FileStore`, the `RecordStore` that persists `InstanceRecord`s at their
//! metadata path, and the `IntentLog` write-ahead markers used to detect
//! half-finished lifecycle operations.

pub mod file;
pub mod intent;
pub mod memory;
pub mod records;

pub use file::FileStore;
pub use intent::{Compensation, Intent, IntentKind, IntentLog};
pub use memory::{JournalEntry, MemoryStore, StoreCall};
pub use records::RecordStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// A JSON credential value.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Fsync a directory so a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("model error: {0}")]
    Model(#[from] credbroker_model::ModelError),
    #[error("injected fault: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Operations a permission grant can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOp {
    Read,
    Write,
    Delete,
    ReadAcl,
    WriteAcl,
}

impl fmt::Display for PermissionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionOp::Read => write!(f, "read"),
            PermissionOp::Write => write!(f, "write"),
            PermissionOp::Delete => write!(f, "delete"),
            PermissionOp::ReadAcl => write!(f, "read_acl"),
            PermissionOp::WriteAcl => write!(f, "write_acl"),
        }
    }
}

/// A permission grant as listed at a path.
///
/// Some stores list grants without their ids; `uuid` is `None` then and the
/// grant has to be resolved by actor before it can be revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub actor: String,
    pub path: String,
    pub operations: Vec<PermissionOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// A revocable reference to one permission grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionHandle {
    pub uuid: String,
    pub actor: String,
    pub path: String,
}

/// Client capability for the remote credential store.
///
/// Every call is a potential I/O failure; implementations report a missing
/// path, grant, or actor as [`StoreError::NotFound`].
pub trait CredentialStore: Send + Sync {
    /// Short backend name, for logs.
    fn name(&self) -> &'static str;

    /// Write `value` as the new current version at `path`.
    fn set_json(&self, path: &str, value: &JsonObject) -> Result<(), StoreError>;

    /// Read the current version at `path`.
    fn get_json(&self, path: &str) -> Result<JsonObject, StoreError>;

    /// Delete every version at `path`.
    fn delete(&self, path: &str) -> Result<(), StoreError>;

    fn list_permissions(&self, path: &str) -> Result<Vec<Permission>, StoreError>;

    fn find_permission(&self, path: &str, actor: &str) -> Result<PermissionHandle, StoreError>;

    fn add_permission(
        &self,
        path: &str,
        actor: &str,
        operations: &[PermissionOp],
    ) -> Result<PermissionHandle, StoreError>;

    fn delete_permission(&self, handle: &PermissionHandle) -> Result<(), StoreError>;

    /// Revocable handles for every grant at `path`.
    ///
    /// Listed grants that already carry an id are used as-is; the rest cost one
    /// lookup by actor each.
    fn permission_handles(&self, path: &str) -> Result<Vec<PermissionHandle>, StoreError> {
        self.list_permissions(path)?
            .into_iter()
            .map(|p| match p.uuid {
                Some(uuid) => Ok(PermissionHandle {
                    uuid,
                    actor: p.actor,
                    path: path.to_owned(),
                }),
                None => self.find_permission(path, &p.actor),
            })
            .collect()
    }
}
