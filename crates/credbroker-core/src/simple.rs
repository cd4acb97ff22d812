use crate::operator::{
    BindRequest, BindingCredentials, Completion, LastOperation, OperationState, Operator,
    ProvisionRequest,
};
use crate::CoreError;
use credbroker_model::{actor_for, decode_secrets, Binding, BindingId, InstanceRecord, StorePaths};
use credbroker_store::{CredentialStore, PermissionHandle, PermissionOp, StoreError};
use std::sync::Arc;
use tracing::{debug, info};

pub const SIMPLE_PLAN: &str = "simple";

/// Operations granted to a bound application.
const READ_ONLY: &[PermissionOp] = &[PermissionOp::Read];

/// The `simple` plan: one JSON payload per instance, read grants per bound app.
pub struct SimpleOperator {
    store: Arc<dyn CredentialStore>,
    paths: StorePaths,
}

impl SimpleOperator {
    pub fn new(store: Arc<dyn CredentialStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Grants at `path`; a path the store has never seen has none.
    fn handles_at(&self, path: &str) -> Result<Vec<PermissionHandle>, StoreError> {
        match self.store.permission_handles(path) {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    fn ensure_unused(&self, path: &str) -> Result<(), CoreError> {
        let grants = match self.store.list_permissions(path) {
            Ok(grants) => grants.len(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e.into()),
        };
        if grants > 0 {
            return Err(CoreError::PathInUse {
                path: path.to_owned(),
                grants,
            });
        }
        Ok(())
    }

    /// Grant read to `actor` unless it already holds a grant at `path`.
    fn ensure_read_grant(&self, path: &str, actor: &str) -> Result<(), StoreError> {
        match self.store.find_permission(path, actor) {
            Ok(existing) => {
                debug!("{actor} already holds grant {} on {path}", existing.uuid);
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.store.add_permission(path, actor, READ_ONLY) {
            Ok(handle) => {
                debug!("granted read on {path} to {actor} ({})", handle.uuid);
                Ok(())
            }
            // lost a race with an identical grant
            Err(StoreError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn revoke(&self, path: &str, actor: &str) -> Result<(), StoreError> {
        let handle = self.store.find_permission(path, actor)?;
        self.store.delete_permission(&handle)?;
        debug!("revoked {actor} on {path} ({})", handle.uuid);
        Ok(())
    }
}

impl Operator for SimpleOperator {
    fn plan_name(&self) -> &str {
        SIMPLE_PLAN
    }

    fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<(InstanceRecord, Completion), CoreError> {
        let path = self.paths.payload_path(&request.instance_id);
        self.ensure_unused(&path)?;

        let secrets = decode_secrets(&request.parameters)?;
        self.store.set_json(&path, &secrets)?;

        let mut record = InstanceRecord::new(
            request.instance_id.clone(),
            request.space_id.as_str(),
            request.organization_id.as_str(),
            request.plan_name.clone(),
        );
        record.update_secret_names(&secrets);
        info!(
            "provisioned {} at {path} ({} secrets)",
            request.instance_id,
            secrets.len()
        );
        Ok((record, Completion::Async))
    }

    fn deprovision(&self, record: &InstanceRecord) -> Result<Completion, CoreError> {
        let path = self.paths.payload_path(&record.instance_id);

        // Grants first: a payload deleted ahead of its grants would leave
        // grants nothing can revoke through this instance any more.
        for handle in self.handles_at(&path)? {
            self.store.delete_permission(&handle)?;
            debug!("revoked {} on {path}", handle.actor);
        }

        match self.store.delete(&path) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("payload {path} already deleted"),
            Err(e) => return Err(e.into()),
        }
        info!("deprovisioned {}", record.instance_id);
        Ok(Completion::Sync)
    }

    fn update(
        &self,
        record: &mut InstanceRecord,
        parameters: &[u8],
    ) -> Result<Completion, CoreError> {
        let secrets = decode_secrets(parameters)?;
        let path = self.paths.payload_path(&record.instance_id);
        self.store.set_json(&path, &secrets)?;
        record.update_secret_names(&secrets);
        record.touch();
        info!("updated {} ({} secrets)", record.instance_id, secrets.len());
        Ok(Completion::Async)
    }

    fn bind(
        &self,
        record: &mut InstanceRecord,
        request: &BindRequest,
    ) -> Result<BindingCredentials, CoreError> {
        let path = self.paths.payload_path(&record.instance_id);
        let actor = actor_for(&request.app_id);
        self.ensure_read_grant(&path, &actor)?;

        let binding = Binding::new(
            request.binding_id.clone(),
            request.app_id.clone(),
            request.space_id.as_str(),
        );
        let replaced = record
            .app_bindings
            .insert(request.binding_id.clone(), binding);

        if let Some(previous) = replaced {
            let old_actor = previous.actor();
            if old_actor != actor && !record.actor_in_use(&old_actor, &request.binding_id) {
                match self.revoke(&path, &old_actor) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!("{old_actor} held no grant on {path}"),
                    Err(e) => return Err(e.into()),
                }
                info!(
                    "binding {} moved from {old_actor} to {actor}",
                    request.binding_id
                );
            }
        }
        record.touch();
        info!("bound {} to {actor}", record.instance_id);
        Ok(BindingCredentials { credhub_ref: path })
    }

    fn unbind(&self, record: &mut InstanceRecord, binding_id: &BindingId) -> Result<(), CoreError> {
        let Some(binding) = record.app_bindings.get(binding_id) else {
            info!(
                "binding {binding_id} not found on {}; treating as unbound",
                record.instance_id
            );
            return Ok(());
        };
        let actor = binding.actor();
        let path = self.paths.payload_path(&record.instance_id);

        if record.actor_in_use(&actor, binding_id) {
            debug!("{actor} still bound through another binding; keeping its grant");
        } else {
            self.revoke(&path, &actor)?;
        }
        record.app_bindings.remove(binding_id);
        record.touch();
        info!("unbound {binding_id} from {}", record.instance_id);
        Ok(())
    }

    fn last_operation(&self, record: &InstanceRecord) -> LastOperation {
        LastOperation {
            state: OperationState::Succeeded,
            description: record.description_for_users(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credbroker_store::{MemoryStore, StoreCall};

    fn setup() -> (Arc<MemoryStore>, SimpleOperator) {
        let mem = Arc::new(MemoryStore::new());
        let op = SimpleOperator::new(mem.clone(), StorePaths::new("/broker").unwrap());
        (mem, op)
    }

    fn provision_request(id: &str, params: &str) -> ProvisionRequest {
        ProvisionRequest {
            instance_id: id.into(),
            plan_name: SIMPLE_PLAN.into(),
            space_id: "space".to_owned(),
            organization_id: "org".to_owned(),
            parameters: params.as_bytes().to_vec(),
        }
    }

    fn bind_request(binding: &str, app: &str) -> BindRequest {
        BindRequest {
            binding_id: binding.into(),
            app_id: app.into(),
            space_id: "space".to_owned(),
        }
    }

    #[test]
    fn provision_writes_payload_and_names() {
        let (mem, op) = setup();
        let (record, completion) = op
            .provision(&provision_request("i-1", r#"{"user": "u", "pass": "p"}"#))
            .unwrap();
        assert!(completion.is_async());
        assert_eq!(mem.get_json("/broker/i-1").unwrap()["user"], "u");
        assert_eq!(record.description_for_users(), "stored secrets: [pass, user]");
        assert_eq!(record.plan_name(), SIMPLE_PLAN);
    }

    #[test]
    fn provision_with_bad_parameters_writes_nothing() {
        let (mem, op) = setup();
        let err = op.provision(&provision_request("i-1", "[1, 2]")).unwrap_err();
        assert!(err.is_client_error());
        assert!(!mem.contains("/broker/i-1"));
    }

    #[test]
    fn provision_propagates_listing_failures() {
        let (mem, op) = setup();
        mem.fail_on(StoreCall::ListPermissions, 0);
        assert!(matches!(
            op.provision(&provision_request("i-1", "{}")),
            Err(CoreError::Store(StoreError::Injected(_)))
        ));
        assert!(!mem.contains("/broker/i-1"));
    }

    #[test]
    fn bind_returns_path_reference_not_secrets() {
        let (_mem, op) = setup();
        let (mut record, _) = op
            .provision(&provision_request("i-1", r#"{"token": "t0p"}"#))
            .unwrap();
        let creds = op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        assert_eq!(creds.credhub_ref, "/broker/i-1");
        assert!(!serde_json::to_string(&creds).unwrap().contains("t0p"));
    }

    #[test]
    fn bind_failure_leaves_record_untouched() {
        let (mem, op) = setup();
        let (mut record, _) = op.provision(&provision_request("i-1", "{}")).unwrap();
        mem.fail_on(StoreCall::AddPermission, 0);
        assert!(op.bind(&mut record, &bind_request("b-1", "a1")).is_err());
        assert!(record.app_bindings.is_empty());
    }

    #[test]
    fn bind_is_idempotent_for_same_app() {
        let (mem, op) = setup();
        let (mut record, _) = op.provision(&provision_request("i-1", "{}")).unwrap();
        op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);
        assert_eq!(record.app_bindings.len(), 1);
    }

    #[test]
    fn shared_actor_keeps_grant_until_last_unbind() {
        let (mem, op) = setup();
        let (mut record, _) = op.provision(&provision_request("i-1", "{}")).unwrap();
        op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        op.bind(&mut record, &bind_request("b-2", "a1")).unwrap();
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);

        op.unbind(&mut record, &"b-1".into()).unwrap();
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);
        op.unbind(&mut record, &"b-2".into()).unwrap();
        assert!(mem.grants_at("/broker/i-1").is_empty());
        assert!(record.app_bindings.is_empty());
    }

    #[test]
    fn unbind_failure_keeps_binding() {
        let (mem, op) = setup();
        let (mut record, _) = op.provision(&provision_request("i-1", "{}")).unwrap();
        op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        mem.fail_on(StoreCall::DeletePermission, 0);
        assert!(op.unbind(&mut record, &"b-1".into()).is_err());
        assert!(record.app_bindings.contains_key("b-1"));
        // retry goes through
        op.unbind(&mut record, &"b-1".into()).unwrap();
        assert!(mem.grants_at("/broker/i-1").is_empty());
    }

    #[test]
    fn deprovision_stops_at_first_failed_revocation() {
        let (mem, op) = setup();
        let (mut record, _) = op.provision(&provision_request("i-1", "{}")).unwrap();
        op.bind(&mut record, &bind_request("b-1", "a1")).unwrap();
        op.bind(&mut record, &bind_request("b-2", "a2")).unwrap();
        mem.fail_on(StoreCall::DeletePermission, 1);

        assert!(op.deprovision(&record).is_err());
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);
        assert!(mem.contains("/broker/i-1"), "payload must outlive its grants");
    }

    #[test]
    fn deprovision_of_missing_payload_succeeds() {
        let (_mem, op) = setup();
        let record = InstanceRecord::new("ghost", "s", "o", SIMPLE_PLAN);
        assert_eq!(op.deprovision(&record).unwrap(), Completion::Sync);
    }

    #[test]
    fn last_operation_describes_secret_names() {
        let (_mem, op) = setup();
        let (record, _) = op
            .provision(&provision_request("i-1", r#"{"b": 1, "a": 2}"#))
            .unwrap();
        let status = op.last_operation(&record);
        assert_eq!(status.state, OperationState::Succeeded);
        assert_eq!(status.description, "stored secrets: [a, b]");
    }
}
