use crate::{CredentialStore, JsonObject, StoreError};
use credbroker_model::StorePaths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// The lifecycle operation an intent marker tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Provision,
    Update,
    Deprovision,
    Bind,
    Unbind,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentKind::Provision => write!(f, "provision"),
            IntentKind::Update => write!(f, "update"),
            IntentKind::Deprovision => write!(f, "deprovision"),
            IntentKind::Bind => write!(f, "bind"),
            IntentKind::Unbind => write!(f, "unbind"),
        }
    }
}

/// A cleanup step that undoes one side effect of an interrupted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Compensation {
    /// Delete a secret payload written before the record was persisted.
    DeletePayload { path: String },
    /// Revoke a grant added for a binding that was never recorded.
    RevokeActor {
        path: String,
        actor: String,
        binding_id: String,
    },
    /// Remove an instance record whose payload and grants are already gone.
    RemoveRecord { instance_id: String },
}

/// An in-flight operation marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub op_id: String,
    pub kind: IntentKind,
    pub instance_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub compensations: Vec<Compensation>,
}

/// Write-ahead intent markers kept in the credential store itself.
///
/// A mutating operation writes a marker at the instance's intent path before
/// its first side effect, appends compensations as side effects happen, and
/// deletes the marker once the instance record reflects the outcome. A marker
/// still present on the next access means the operation was interrupted.
///
/// There is at most one marker per instance; per-instance locking in the
/// registry keeps two operations from racing on it.
#[derive(Clone)]
pub struct IntentLog {
    store: Arc<dyn CredentialStore>,
    paths: StorePaths,
}

impl IntentLog {
    pub fn new(store: Arc<dyn CredentialStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub fn begin(&self, kind: IntentKind, instance_id: &str) -> Result<Intent, StoreError> {
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(instance_id.as_bytes()).to_hex()[..8]
        );
        let intent = Intent {
            op_id,
            kind,
            instance_id: instance_id.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            compensations: Vec::new(),
        };
        self.write(&intent)?;
        debug!("intent begin: {kind} for {instance_id} (op_id={})", intent.op_id);
        Ok(intent)
    }

    pub fn add_compensation(
        &self,
        intent: &mut Intent,
        step: Compensation,
    ) -> Result<(), StoreError> {
        intent.compensations.push(step);
        self.write(intent)
    }

    /// Remove the marker. A marker that is already gone is not an error.
    pub fn commit(&self, intent: &Intent) -> Result<(), StoreError> {
        self.clear(&intent.instance_id)?;
        debug!("intent commit: {} (op_id={})", intent.kind, intent.op_id);
        Ok(())
    }

    pub fn clear(&self, instance_id: &str) -> Result<(), StoreError> {
        match self.store.delete(&self.paths.intent_path(instance_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The interrupted operation on `instance_id`, if any.
    ///
    /// An unparseable marker carries nothing to act on; it is logged and
    /// removed.
    pub fn pending(&self, instance_id: &str) -> Result<Option<Intent>, StoreError> {
        let path = self.paths.intent_path(instance_id);
        let object = match self.store.get_json(&path) {
            Ok(object) => object,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_value::<Intent>(serde_json::Value::Object(object)) {
            Ok(intent) => Ok(Some(intent)),
            Err(e) => {
                warn!("corrupt intent marker {path}: {e}");
                self.clear(instance_id)?;
                Ok(None)
            }
        }
    }

    fn write(&self, intent: &Intent) -> Result<(), StoreError> {
        let object: JsonObject = serde_json::from_value(serde_json::to_value(intent)?)?;
        self.store
            .set_json(&self.paths.intent_path(&intent.instance_id), &object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, StoreCall};

    fn setup() -> (Arc<MemoryStore>, IntentLog) {
        let mem = Arc::new(MemoryStore::new());
        let log = IntentLog::new(mem.clone(), StorePaths::new("/broker").unwrap());
        (mem, log)
    }

    #[test]
    fn begin_writes_marker_and_commit_removes_it() {
        let (mem, log) = setup();
        let intent = log.begin(IntentKind::Provision, "i-1").unwrap();
        assert!(mem.contains("/broker/intent/i-1"));
        assert_eq!(log.pending("i-1").unwrap().unwrap().op_id, intent.op_id);

        log.commit(&intent).unwrap();
        assert!(!mem.contains("/broker/intent/i-1"));
        assert!(log.pending("i-1").unwrap().is_none());
        // second commit is a no-op
        log.commit(&intent).unwrap();
    }

    #[test]
    fn compensations_are_persisted_in_order() {
        let (_mem, log) = setup();
        let mut intent = log.begin(IntentKind::Bind, "i-1").unwrap();
        log.add_compensation(
            &mut intent,
            Compensation::RevokeActor {
                path: "/broker/i-1".to_owned(),
                actor: "mtls-app:a".to_owned(),
                binding_id: "b-1".to_owned(),
            },
        )
        .unwrap();
        log.add_compensation(
            &mut intent,
            Compensation::RemoveRecord {
                instance_id: "i-1".to_owned(),
            },
        )
        .unwrap();

        let pending = log.pending("i-1").unwrap().unwrap();
        assert_eq!(pending.kind, IntentKind::Bind);
        assert_eq!(pending.compensations, intent.compensations);
    }

    #[test]
    fn corrupt_marker_is_dropped() {
        let (mem, log) = setup();
        let junk = serde_json::json!({"kind": "explode"});
        mem.set_json("/broker/intent/i-1", junk.as_object().unwrap())
            .unwrap();
        assert!(log.pending("i-1").unwrap().is_none());
        assert!(!mem.contains("/broker/intent/i-1"));
    }

    #[test]
    fn begin_propagates_store_failure() {
        let (mem, log) = setup();
        mem.fail_on(StoreCall::SetJson, 0);
        assert!(matches!(
            log.begin(IntentKind::Update, "i-1"),
            Err(StoreError::Injected(_))
        ));
    }

    #[test]
    fn compensation_wire_format_is_tagged() {
        let json = serde_json::to_value(Compensation::DeletePayload {
            path: "/p/i".to_owned(),
        })
        .unwrap();
        assert_eq!(json["step"], "delete_payload");
        assert_eq!(json["path"], "/p/i");
    }
}
