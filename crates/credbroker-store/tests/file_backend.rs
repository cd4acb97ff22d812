//! Record and intent persistence over the directory-backed store.

use credbroker_model::{Binding, InstanceRecord, StorePaths};
use credbroker_store::{
    Compensation, CredentialStore, FileStore, IntentKind, IntentLog, PermissionOp, RecordStore,
};
use std::sync::Arc;

fn paths() -> StorePaths {
    StorePaths::new("/broker/secrets").unwrap()
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let records = RecordStore::new(store, paths());
        let mut record = InstanceRecord::new("i-1", "space", "org", "simple");
        record
            .app_bindings
            .insert("b-1".into(), Binding::new("b-1", "app-1", "space"));
        record.secret_names.insert("token".to_owned());
        records.save(&record).unwrap();
    }

    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let records = RecordStore::new(store, paths());
    let record = records.load("i-1").unwrap();
    assert_eq!(record.plan_name(), "simple");
    assert_eq!(record.app_bindings.len(), 1);
    assert_eq!(record.description_for_users(), "stored secrets: [token]");
}

#[test]
fn legacy_record_written_by_hand_loads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let legacy = serde_json::json!({
        "service_instance_guid": "old-1",
        "resident_space_guid": "s",
        "organization_guid": "o",
        "service_plan": {"name": "simple"},
        "app_bindings": {
            "b-9": {"binding_guid": "b-9", "app_guid": "app-9", "space_guid": "s"}
        },
        "secret_names": null
    });
    store
        .set_json("/broker/secrets/meta/old-1", legacy.as_object().unwrap())
        .unwrap();

    let records = RecordStore::new(store, paths());
    let record = records.load("old-1").unwrap();
    assert!(record.secret_names.is_empty());
    assert_eq!(record.app_bindings["b-9"].actor(), "mtls-app:app-9");
}

#[test]
fn interrupted_intent_is_visible_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let op_id = {
        let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let log = IntentLog::new(store, paths());
        let mut intent = log.begin(IntentKind::Provision, "i-2").unwrap();
        log.add_compensation(
            &mut intent,
            Compensation::DeletePayload {
                path: "/broker/secrets/i-2".to_owned(),
            },
        )
        .unwrap();
        intent.op_id
    };

    let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let log = IntentLog::new(store, paths());
    let pending = log.pending("i-2").unwrap().expect("marker must persist");
    assert_eq!(pending.op_id, op_id);
    assert_eq!(pending.kind, IntentKind::Provision);
    assert_eq!(pending.compensations.len(), 1);

    log.commit(&pending).unwrap();
    assert!(log.pending("i-2").unwrap().is_none());
}

#[test]
fn permission_handles_over_file_store_carry_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    store
        .add_permission("/broker/secrets/i-3", "mtls-app:a", &[PermissionOp::Read])
        .unwrap();
    store
        .add_permission("/broker/secrets/i-3", "mtls-app:b", &[PermissionOp::Read])
        .unwrap();
    store
        .add_permission("/broker/secrets/other", "mtls-app:a", &[PermissionOp::Read])
        .unwrap();

    let handles = store.permission_handles("/broker/secrets/i-3").unwrap();
    assert_eq!(handles.len(), 2);
    for handle in &handles {
        store.delete_permission(handle).unwrap();
    }
    assert!(store
        .list_permissions("/broker/secrets/i-3")
        .unwrap()
        .is_empty());
    assert_eq!(
        store.list_permissions("/broker/secrets/other").unwrap().len(),
        1
    );
}
