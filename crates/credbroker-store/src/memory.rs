use crate::{CredentialStore, JsonObject, Permission, PermissionHandle, PermissionOp, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// The credential-store calls a [`MemoryStore`] records and can fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    SetJson,
    GetJson,
    Delete,
    ListPermissions,
    FindPermission,
    AddPermission,
    DeletePermission,
}

impl fmt::Display for StoreCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreCall::SetJson => write!(f, "set_json"),
            StoreCall::GetJson => write!(f, "get_json"),
            StoreCall::Delete => write!(f, "delete"),
            StoreCall::ListPermissions => write!(f, "list_permissions"),
            StoreCall::FindPermission => write!(f, "find_permission"),
            StoreCall::AddPermission => write!(f, "add_permission"),
            StoreCall::DeletePermission => write!(f, "delete_permission"),
        }
    }
}

/// One recorded call: which operation, against which path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub call: StoreCall,
    pub path: String,
}

#[derive(Debug)]
struct Fault {
    call: StoreCall,
    path_prefix: Option<String>,
    skip: usize,
}

#[derive(Debug, Default)]
struct Inner {
    /// path -> versions, oldest first
    credentials: HashMap<String, Vec<JsonObject>>,
    /// grant id -> grant
    permissions: BTreeMap<String, Permission>,
    faults: Vec<Fault>,
    journal: Vec<JournalEntry>,
}

/// In-process credential store.
///
/// Behaves like CredHub for the calls the broker makes (missing paths and
/// grants are `NotFound`, a second grant for the same actor and path is a
/// `Conflict`) and can be told to fail a specific call, which is how the
/// partial-failure paths of the lifecycle are exercised.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    listed_ids: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            listed_ids: false,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include grant ids in `list_permissions` results.
    #[must_use]
    pub fn with_listed_ids(mut self, listed: bool) -> Self {
        self.listed_ids = listed;
        self
    }

    /// Fail the next `call` after `skip` successful calls of the same kind.
    /// Each registered fault fires once.
    pub fn fail_on(&self, call: StoreCall, skip: usize) {
        self.lock().faults.push(Fault {
            call,
            path_prefix: None,
            skip,
        });
    }

    /// Like [`fail_on`](Self::fail_on), restricted to paths starting with `prefix`.
    pub fn fail_on_path(&self, call: StoreCall, prefix: &str, skip: usize) {
        self.lock().faults.push(Fault {
            call,
            path_prefix: Some(prefix.to_owned()),
            skip,
        });
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().credentials.contains_key(path)
    }

    /// Number of versions ever written at `path` (0 if deleted or never set).
    pub fn version_count(&self, path: &str) -> usize {
        self.lock().credentials.get(path).map_or(0, Vec::len)
    }

    /// All grants at `path`, with ids, sorted by actor.
    pub fn grants_at(&self, path: &str) -> Vec<Permission> {
        let mut grants: Vec<Permission> = self
            .lock()
            .permissions
            .values()
            .filter(|p| p.path == path)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.actor.cmp(&b.actor));
        grants
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge every other caller.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Journal the call and fire any matching fault.
    fn enter(&self, call: StoreCall, path: &str) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(JournalEntry {
            call,
            path: path.to_owned(),
        });
        let matching = inner.faults.iter().position(|f| {
            f.call == call
                && f.path_prefix
                    .as_deref()
                    .map_or(true, |prefix| path.starts_with(prefix))
        });
        if let Some(idx) = matching {
            if inner.faults[idx].skip == 0 {
                inner.faults.remove(idx);
                return Err(StoreError::Injected(format!("{call} {path}")));
            }
            inner.faults[idx].skip -= 1;
        }
        Ok(inner)
    }
}

impl CredentialStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set_json(&self, path: &str, value: &JsonObject) -> Result<(), StoreError> {
        let mut inner = self.enter(StoreCall::SetJson, path)?;
        inner
            .credentials
            .entry(path.to_owned())
            .or_default()
            .push(value.clone());
        Ok(())
    }

    fn get_json(&self, path: &str) -> Result<JsonObject, StoreError> {
        let inner = self.enter(StoreCall::GetJson, path)?;
        inner
            .credentials
            .get(path)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_owned()))
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.enter(StoreCall::Delete, path)?;
        inner
            .credentials
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_owned()))
    }

    fn list_permissions(&self, path: &str) -> Result<Vec<Permission>, StoreError> {
        let inner = self.enter(StoreCall::ListPermissions, path)?;
        Ok(inner
            .permissions
            .values()
            .filter(|p| p.path == path)
            .map(|p| Permission {
                uuid: if self.listed_ids { p.uuid.clone() } else { None },
                ..p.clone()
            })
            .collect())
    }

    fn find_permission(&self, path: &str, actor: &str) -> Result<PermissionHandle, StoreError> {
        let inner = self.enter(StoreCall::FindPermission, path)?;
        inner
            .permissions
            .iter()
            .find(|(_, p)| p.path == path && p.actor == actor)
            .map(|(uuid, p)| PermissionHandle {
                uuid: uuid.clone(),
                actor: p.actor.clone(),
                path: p.path.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(format!("permission for {actor} on {path}")))
    }

    fn add_permission(
        &self,
        path: &str,
        actor: &str,
        operations: &[PermissionOp],
    ) -> Result<PermissionHandle, StoreError> {
        let mut inner = self.enter(StoreCall::AddPermission, path)?;
        if inner
            .permissions
            .values()
            .any(|p| p.path == path && p.actor == actor)
        {
            return Err(StoreError::Conflict(format!(
                "permission for {actor} on {path} already exists"
            )));
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        inner.permissions.insert(
            uuid.clone(),
            Permission {
                actor: actor.to_owned(),
                path: path.to_owned(),
                operations: operations.to_vec(),
                uuid: Some(uuid.clone()),
            },
        );
        Ok(PermissionHandle {
            uuid,
            actor: actor.to_owned(),
            path: path.to_owned(),
        })
    }

    fn delete_permission(&self, handle: &PermissionHandle) -> Result<(), StoreError> {
        let mut inner = self.enter(StoreCall::DeletePermission, &handle.path)?;
        inner
            .permissions
            .remove(&handle.uuid)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("permission {}", handle.uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn set_get_returns_latest_version() {
        let store = MemoryStore::new();
        store.set_json("/p/a", &obj(json!({"v": 1}))).unwrap();
        store.set_json("/p/a", &obj(json!({"v": 2}))).unwrap();
        assert_eq!(store.get_json("/p/a").unwrap()["v"], 2);
        assert_eq!(store.version_count("/p/a"), 2);
    }

    #[test]
    fn missing_path_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.get_json("/nope").unwrap_err().is_not_found());
        assert!(store.delete("/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_grant_conflicts() {
        let store = MemoryStore::new();
        store.add_permission("/p/a", "x", &[PermissionOp::Read]).unwrap();
        let err = store
            .add_permission("/p/a", "x", &[PermissionOp::Read])
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // same actor on another path is fine
        store.add_permission("/p/b", "x", &[PermissionOp::Read]).unwrap();
    }

    #[test]
    fn find_and_delete_grant() {
        let store = MemoryStore::new();
        store.add_permission("/p/a", "x", &[PermissionOp::Read]).unwrap();
        let handle = store.find_permission("/p/a", "x").unwrap();
        store.delete_permission(&handle).unwrap();
        assert!(store.grants_at("/p/a").is_empty());
        assert!(store.delete_permission(&handle).unwrap_err().is_not_found());
    }

    #[test]
    fn fault_fires_once_after_skip() {
        let store = MemoryStore::new();
        store.fail_on(StoreCall::SetJson, 1);
        let v = obj(json!({}));
        store.set_json("/p/1", &v).unwrap();
        assert!(matches!(
            store.set_json("/p/2", &v),
            Err(StoreError::Injected(_))
        ));
        store.set_json("/p/3", &v).unwrap();
        assert!(!store.contains("/p/2"));
    }

    #[test]
    fn path_scoped_fault_ignores_other_paths() {
        let store = MemoryStore::new();
        store.fail_on_path(StoreCall::SetJson, "/p/meta/", 0);
        let v = obj(json!({}));
        store.set_json("/p/i", &v).unwrap();
        assert!(store.set_json("/p/meta/i", &v).is_err());
    }

    #[test]
    fn journal_records_calls_in_order() {
        let store = MemoryStore::new();
        let _ = store.get_json("/p/a");
        store.set_json("/p/a", &obj(json!({}))).unwrap();
        let calls: Vec<StoreCall> = store.journal().iter().map(|e| e.call).collect();
        assert_eq!(calls, vec![StoreCall::GetJson, StoreCall::SetJson]);
    }
}
