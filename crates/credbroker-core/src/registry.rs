use crate::concurrency::InstanceLocks;
use crate::operator::{BindRequest, BindingCredentials, Completion, LastOperation, ProvisionRequest};
use crate::plans::PlanTable;
use crate::CoreError;
use credbroker_model::{
    actor_for, validate_identifier, Binding, BindingId, InstanceRecord, StorePaths,
};
use credbroker_store::{
    Compensation, CredentialStore, Intent, IntentKind, IntentLog, PermissionOp, RecordStore,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`InstanceRegistry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub credentials: BindingCredentials,
    /// The binding id already belonged to the same app before this call.
    pub existing: bool,
}

/// Dispatch layer between the platform's lifecycle calls and the operators.
///
/// For every mutating call the registry:
/// 1. takes the instance's lock, so calls on one instance never overlap;
/// 2. reconciles any intent marker an earlier, interrupted call left behind;
/// 3. loads the instance record (except for provision) and picks the operator
///    by the record's plan;
/// 4. writes an intent marker, runs the operator, persists or removes the
///    record, and clears the marker.
///
/// If step 4 fails the marker is reconciled straight away; if that fails
/// too, the marker stays and the next mutating call on the instance picks it
/// up. `last_operation` only reads: it reports a pending marker but never acts
/// on it.
pub struct InstanceRegistry {
    store: Arc<dyn CredentialStore>,
    paths: StorePaths,
    records: RecordStore,
    intents: IntentLog,
    plans: PlanTable,
    locks: InstanceLocks,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn CredentialStore>, paths: StorePaths, plans: PlanTable) -> Self {
        Self {
            records: RecordStore::new(Arc::clone(&store), paths.clone()),
            intents: IntentLog::new(Arc::clone(&store), paths.clone()),
            store,
            paths,
            plans,
            locks: InstanceLocks::new(),
        }
    }

    #[inline]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    #[inline]
    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    pub fn provision(&self, request: &ProvisionRequest) -> Result<Completion, CoreError> {
        let id = request.instance_id.as_str();
        validate_identifier("instance id", id)?;
        let _guard = self.locks.acquire(id);
        self.reconcile_locked(id)?;

        let operator = self.plans.get(&request.plan_name)?;
        info!("provisioning {id} on plan {}", request.plan_name);

        let mut intent = self.intents.begin(IntentKind::Provision, id)?;
        self.intents.add_compensation(
            &mut intent,
            Compensation::DeletePayload {
                path: self.paths.payload_path(id),
            },
        )?;
        self.finish(&intent, || {
            let (record, completion) = operator.provision(request)?;
            self.persist(&record)?;
            Ok(completion)
        })
    }

    pub fn deprovision(&self, instance_id: &str) -> Result<Completion, CoreError> {
        validate_identifier("instance id", instance_id)?;
        let _guard = self.locks.acquire(instance_id);
        self.reconcile_locked(instance_id)?;

        let record = self.load(instance_id)?;
        let operator = self.plans.get(record.plan_name())?;
        info!("deprovisioning {instance_id}");

        let mut intent = self.intents.begin(IntentKind::Deprovision, instance_id)?;
        self.intents.add_compensation(
            &mut intent,
            Compensation::RemoveRecord {
                instance_id: instance_id.to_owned(),
            },
        )?;
        self.finish(&intent, || {
            let completion = operator.deprovision(&record)?;
            match self.records.remove(instance_id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(CoreError::Persist {
                        instance_id: instance_id.to_owned(),
                        source,
                    })
                }
            }
            Ok(completion)
        })
    }

    /// Replace the instance's secrets. `plan_name`, when given, must be the
    /// instance's current plan: plans cannot be changed.
    pub fn update(
        &self,
        instance_id: &str,
        plan_name: Option<&str>,
        parameters: &[u8],
    ) -> Result<Completion, CoreError> {
        validate_identifier("instance id", instance_id)?;
        let _guard = self.locks.acquire(instance_id);
        self.reconcile_locked(instance_id)?;

        let mut record = self.load(instance_id)?;
        if let Some(requested) = plan_name.filter(|p| *p != record.plan_name().as_str()) {
            return Err(CoreError::PlanChange {
                instance_id: instance_id.to_owned(),
                from: record.plan_name().to_string(),
                to: requested.to_owned(),
            });
        }
        let operator = self.plans.get(record.plan_name())?;
        info!("updating {instance_id}");

        let intent = self.intents.begin(IntentKind::Update, instance_id)?;
        self.finish(&intent, || {
            let completion = operator.update(&mut record, parameters)?;
            self.persist(&record)?;
            Ok(completion)
        })
    }

    pub fn bind(
        &self,
        instance_id: &str,
        request: &BindRequest,
    ) -> Result<Bound, CoreError> {
        validate_identifier("instance id", instance_id)?;
        validate_identifier("binding id", &request.binding_id)?;
        validate_identifier("app id", &request.app_id)?;
        let _guard = self.locks.acquire(instance_id);
        self.reconcile_locked(instance_id)?;

        let mut record = self.load(instance_id)?;
        let operator = self.plans.get(record.plan_name())?;
        info!(
            "binding {} on {instance_id} for app {}",
            request.binding_id, request.app_id
        );

        let path = self.paths.payload_path(instance_id);
        let actor = actor_for(&request.app_id);
        let previous = record.app_bindings.get(&request.binding_id);
        let existing = previous.is_some_and(|b| b.app_id == request.app_id);
        let replaced_actor = previous.map(Binding::actor).filter(|old| *old != actor);

        let mut intent = self.intents.begin(IntentKind::Bind, instance_id)?;
        for actor in std::iter::once(actor).chain(replaced_actor) {
            self.intents.add_compensation(
                &mut intent,
                Compensation::RevokeActor {
                    path: path.clone(),
                    actor,
                    binding_id: request.binding_id.to_string(),
                },
            )?;
        }
        self.finish(&intent, || {
            let credentials = operator.bind(&mut record, request)?;
            self.persist(&record)?;
            Ok(Bound {
                credentials,
                existing,
            })
        })
    }

    pub fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<(), CoreError> {
        validate_identifier("instance id", instance_id)?;
        validate_identifier("binding id", binding_id)?;
        let _guard = self.locks.acquire(instance_id);
        self.reconcile_locked(instance_id)?;

        let mut record = self.load(instance_id)?;
        let operator = self.plans.get(record.plan_name())?;
        let binding_id = BindingId::from(binding_id);

        let Some(actor) = record.app_bindings.get(&binding_id).map(Binding::actor) else {
            // Nothing to undo; the operator decides what an unknown id means.
            return operator.unbind(&mut record, &binding_id);
        };
        info!("unbinding {binding_id} from {instance_id}");

        let mut intent = self.intents.begin(IntentKind::Unbind, instance_id)?;
        self.intents.add_compensation(
            &mut intent,
            Compensation::RevokeActor {
                path: self.paths.payload_path(instance_id),
                actor,
                binding_id: binding_id.to_string(),
            },
        )?;
        self.finish(&intent, || {
            operator.unbind(&mut record, &binding_id)?;
            self.persist(&record)
        })
    }

    pub fn last_operation(&self, instance_id: &str) -> Result<LastOperation, CoreError> {
        validate_identifier("instance id", instance_id)?;
        let _guard = self.locks.acquire(instance_id);
        if self
            .store
            .get_json(&self.paths.intent_path(instance_id))
            .is_ok()
        {
            warn!("{instance_id} has an interrupted operation pending reconciliation");
        }

        let record = self.load(instance_id)?;
        let operator = self.plans.get(record.plan_name())?;
        Ok(operator.last_operation(&record))
    }

    /// Reconcile an interrupted operation on `instance_id`, if there is one.
    /// Returns whether a marker was found.
    pub fn reconcile(&self, instance_id: &str) -> Result<bool, CoreError> {
        validate_identifier("instance id", instance_id)?;
        let _guard = self.locks.acquire(instance_id);
        self.reconcile_locked(instance_id)
    }

    fn load(&self, instance_id: &str) -> Result<InstanceRecord, CoreError> {
        self.records.load(instance_id).map_err(|e| {
            if e.is_not_found() {
                CoreError::InstanceNotFound(instance_id.to_owned())
            } else {
                e.into()
            }
        })
    }

    fn load_optional(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        match self.load(instance_id) {
            Ok(record) => Ok(Some(record)),
            Err(CoreError::InstanceNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn persist(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        self.records
            .save(record)
            .map_err(|source| CoreError::Persist {
                instance_id: record.instance_id.to_string(),
                source,
            })
    }

    /// Run `op` under `intent`: clear the marker on success, reconcile on failure.
    fn finish<T>(
        &self,
        intent: &Intent,
        op: impl FnOnce() -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        match op() {
            Ok(value) => {
                if let Err(e) = self.intents.commit(intent) {
                    warn!(
                        "could not clear {} marker for {}: {e}",
                        intent.kind, intent.instance_id
                    );
                }
                Ok(value)
            }
            Err(e) => {
                warn!("{} of {} failed: {e}", intent.kind, intent.instance_id);
                if let Err(cleanup) = self.reconcile_intent(intent) {
                    warn!(
                        "cleanup after failed {} of {} deferred to next access: {cleanup}",
                        intent.kind, intent.instance_id
                    );
                }
                Err(e)
            }
        }
    }

    fn reconcile_locked(&self, instance_id: &str) -> Result<bool, CoreError> {
        let Some(intent) = self.intents.pending(instance_id)? else {
            return Ok(false);
        };
        warn!(
            "found interrupted {} of {instance_id} (op_id={}, started {})",
            intent.kind, intent.op_id, intent.timestamp
        );
        self.reconcile_intent(&intent)?;
        Ok(true)
    }

    /// Bring the credential store back in line with the stored record, then
    /// drop the marker.
    fn reconcile_intent(&self, intent: &Intent) -> Result<(), CoreError> {
        let instance_id = intent.instance_id.as_str();
        let record = self.load_optional(instance_id)?;

        match (intent.kind, record) {
            (IntentKind::Provision, None) => {
                for step in &intent.compensations {
                    if let Compensation::DeletePayload { path } = step {
                        self.remove_orphaned_payload(path)?;
                    }
                }
            }
            (IntentKind::Update, Some(mut record)) => {
                self.resync_secret_names(&mut record)?;
            }
            (IntentKind::Bind | IntentKind::Unbind, Some(record)) => {
                for step in &intent.compensations {
                    if let Compensation::RevokeActor {
                        path,
                        actor,
                        binding_id,
                    } = step
                    {
                        self.align_grant(&record, path, actor, binding_id)?;
                    }
                }
            }
            (IntentKind::Deprovision, Some(_)) => {
                for step in &intent.compensations {
                    if let Compensation::RemoveRecord { instance_id } = step {
                        self.complete_deprovision(instance_id)?;
                    }
                }
            }
            (kind, record) => debug!(
                "{kind} marker for {instance_id} needs no cleanup (record present: {})",
                record.is_some()
            ),
        }

        self.intents.commit(intent)?;
        Ok(())
    }

    /// A payload with no record is an interrupted provision, unless something
    /// holds a grant on it.
    fn remove_orphaned_payload(&self, path: &str) -> Result<(), CoreError> {
        let grants = match self.store.list_permissions(path) {
            Ok(grants) => grants.len(),
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e.into()),
        };
        if grants > 0 {
            warn!("payload {path} has no record but {grants} grants; leaving it in place");
            return Ok(());
        }
        match self.store.delete(path) {
            Ok(()) => warn!("removed orphaned payload {path}"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn resync_secret_names(&self, record: &mut InstanceRecord) -> Result<(), CoreError> {
        let path = self.paths.payload_path(&record.instance_id);
        let secrets = match self.store.get_json(&path) {
            Ok(secrets) => secrets,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let before = record.secret_names.clone();
        record.update_secret_names(&secrets);
        if record.secret_names != before {
            record.touch();
            self.persist(record)?;
            warn!("resynced secret names of {} with its payload", record.instance_id);
        }
        Ok(())
    }

    /// Make `actor`'s grant at `path` exist exactly when a recorded binding uses it.
    fn align_grant(
        &self,
        record: &InstanceRecord,
        path: &str,
        actor: &str,
        binding_id: &str,
    ) -> Result<(), CoreError> {
        let wanted = record.app_bindings.values().any(|b| b.actor() == actor);
        let held = match self.store.find_permission(path, actor) {
            Ok(handle) => Some(handle),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        match (wanted, held) {
            (false, Some(handle)) => {
                self.store.delete_permission(&handle)?;
                warn!("revoked unrecorded grant for {actor} on {path} (binding {binding_id})");
            }
            (true, None) => {
                self.store
                    .add_permission(path, actor, &[PermissionOp::Read])?;
                warn!("restored grant for {actor} on {path} (binding {binding_id})");
            }
            _ => debug!("grant for {actor} on {path} already matches the record"),
        }
        Ok(())
    }

    /// Payload gone means every grant was revoked before it; only the record
    /// removal is missing.
    fn complete_deprovision(&self, instance_id: &str) -> Result<(), CoreError> {
        let path = self.paths.payload_path(instance_id);
        match self.store.get_json(&path) {
            Ok(_) => {
                debug!("payload {path} still present; deprovision of {instance_id} can be retried");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                match self.records.remove(instance_id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                warn!("completed interrupted deprovision of {instance_id}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SIMPLE_PLAN;
    use credbroker_store::{MemoryStore, StoreCall};

    fn setup() -> (Arc<MemoryStore>, InstanceRegistry) {
        let mem = Arc::new(MemoryStore::new());
        let paths = StorePaths::new("/broker").unwrap();
        let plans = PlanTable::standard(mem.clone(), paths.clone());
        (mem.clone(), InstanceRegistry::new(mem, paths, plans))
    }

    fn provision(registry: &InstanceRegistry, id: &str, params: &str) {
        registry
            .provision(&ProvisionRequest {
                instance_id: id.into(),
                plan_name: SIMPLE_PLAN.into(),
                space_id: "space".to_owned(),
                organization_id: "org".to_owned(),
                parameters: params.as_bytes().to_vec(),
            })
            .unwrap();
    }

    fn bind_request(binding: &str, app: &str) -> BindRequest {
        BindRequest {
            binding_id: binding.into(),
            app_id: app.into(),
            space_id: "space".to_owned(),
        }
    }

    #[test]
    fn persist_failure_after_provision_is_distinct_and_cleaned_up() {
        let (mem, registry) = setup();
        mem.fail_on_path(StoreCall::SetJson, "/broker/meta/", 0);

        let err = registry
            .provision(&ProvisionRequest {
                instance_id: "i-1".into(),
                plan_name: SIMPLE_PLAN.into(),
                space_id: "s".to_owned(),
                organization_id: "o".to_owned(),
                parameters: br#"{"a": 1}"#.to_vec(),
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Persist { .. }));
        assert!(!mem.contains("/broker/i-1"), "orphaned payload removed");
        assert!(!mem.contains("/broker/intent/i-1"));
    }

    #[test]
    fn orphaned_payload_from_crash_is_removed_on_next_access() {
        let (mem, registry) = setup();
        // A provision that wrote its marker and payload, then died.
        let log = IntentLog::new(mem.clone(), registry.paths().clone());
        let mut intent = log.begin(IntentKind::Provision, "i-1").unwrap();
        log.add_compensation(
            &mut intent,
            Compensation::DeletePayload {
                path: "/broker/i-1".to_owned(),
            },
        )
        .unwrap();
        mem.set_json("/broker/i-1", &serde_json::Map::new()).unwrap();

        assert!(registry.reconcile("i-1").unwrap());
        assert!(!mem.contains("/broker/i-1"));
        assert!(matches!(
            registry.last_operation("i-1"),
            Err(CoreError::InstanceNotFound(_))
        ));
        assert!(!registry.reconcile("i-1").unwrap(), "marker cleared");
    }

    #[test]
    fn last_operation_leaves_pending_marker_alone() {
        let (mem, registry) = setup();
        provision(&registry, "i-1", r#"{"a": 1}"#);
        // A bind that granted X and died before recording the binding.
        mem.add_permission("/broker/i-1", "mtls-app:X", &[PermissionOp::Read])
            .unwrap();
        let log = IntentLog::new(mem.clone(), registry.paths().clone());
        let mut intent = log.begin(IntentKind::Bind, "i-1").unwrap();
        log.add_compensation(
            &mut intent,
            Compensation::RevokeActor {
                path: "/broker/i-1".to_owned(),
                actor: "mtls-app:X".to_owned(),
                binding_id: "b-1".to_owned(),
            },
        )
        .unwrap();
        mem.clear_journal();
        mem.fail_on(StoreCall::DeletePermission, 0);

        let status = registry.last_operation("i-1").unwrap();
        assert_eq!(status.description, "stored secrets: [a]");
        let mutations: Vec<_> = mem
            .journal()
            .into_iter()
            .filter(|e| {
                matches!(
                    e.call,
                    StoreCall::SetJson | StoreCall::Delete | StoreCall::DeletePermission
                )
            })
            .collect();
        assert!(mutations.is_empty(), "status query mutated: {mutations:?}");
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);
        assert!(mem.contains("/broker/intent/i-1"));
    }

    #[test]
    fn leaked_bind_grant_is_revoked_on_next_access() {
        let (mem, registry) = setup();
        provision(&registry, "i-1", "{}");
        // Grant written, record never updated.
        mem.fail_on_path(StoreCall::SetJson, "/broker/meta/", 0);
        mem.fail_on(StoreCall::FindPermission, 1);
        let err = registry.bind("i-1", &bind_request("b-1", "a1")).unwrap_err();
        assert!(matches!(err, CoreError::Persist { .. }));
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1, "cleanup deferred");

        assert!(registry.reconcile("i-1").unwrap());
        assert!(mem.grants_at("/broker/i-1").is_empty());
    }

    #[test]
    fn half_finished_unbind_restores_grant_for_recorded_binding() {
        let (mem, registry) = setup();
        provision(&registry, "i-1", "{}");
        registry.bind("i-1", &bind_request("b-1", "a1")).unwrap();

        // Grant revoked, record save and immediate cleanup both fail.
        mem.fail_on_path(StoreCall::SetJson, "/broker/meta/", 0);
        mem.fail_on(StoreCall::FindPermission, 1);
        assert!(registry.unbind("i-1", "b-1").is_err());
        assert!(mem.grants_at("/broker/i-1").is_empty());

        // The record still lists b-1, so its grant comes back and a retry works.
        assert!(registry.reconcile("i-1").unwrap());
        assert_eq!(mem.grants_at("/broker/i-1").len(), 1);
        registry.unbind("i-1", "b-1").unwrap();
        assert!(mem.grants_at("/broker/i-1").is_empty());
    }

    #[test]
    fn interrupted_deprovision_is_completed() {
        let (mem, registry) = setup();
        provision(&registry, "i-1", "{}");
        mem.fail_on_path(StoreCall::Delete, "/broker/meta/", 0);
        // Second record read is the immediate cleanup; make it fail too.
        mem.fail_on_path(StoreCall::GetJson, "/broker/meta/", 1);
        let err = registry.deprovision("i-1").unwrap_err();
        assert!(matches!(err, CoreError::Persist { .. }));
        assert!(mem.contains("/broker/meta/i-1"));

        assert!(registry.reconcile("i-1").unwrap());
        assert!(!mem.contains("/broker/meta/i-1"));
    }

    #[test]
    fn update_marker_resyncs_secret_names() {
        let (mem, registry) = setup();
        provision(&registry, "i-1", r#"{"a": 1}"#);
        // Payload rewritten, record not.
        mem.fail_on_path(StoreCall::SetJson, "/broker/meta/", 0);
        mem.fail_on_path(StoreCall::GetJson, "/broker/meta/", 1);
        assert!(registry.update("i-1", None, br#"{"z": 1}"#).is_err());

        assert!(registry.reconcile("i-1").unwrap());
        let status = registry.last_operation("i-1").unwrap();
        assert_eq!(status.description, "stored secrets: [z]");
    }

    #[test]
    fn invalid_identifiers_are_rejected_before_any_store_call() {
        let (mem, registry) = setup();
        let err = registry.last_operation("../etc").unwrap_err();
        assert!(err.is_client_error());
        assert!(registry
            .bind("i-1", &bind_request("b/1", "a1"))
            .unwrap_err()
            .is_client_error());
        assert!(mem.journal().is_empty());
    }

    #[test]
    fn unknown_plan_in_record_is_routing_error() {
        let (mem, registry) = setup();
        let records = RecordStore::new(mem.clone(), registry.paths().clone());
        records
            .save(&InstanceRecord::new("i-9", "s", "o", "gold"))
            .unwrap();
        assert!(matches!(
            registry.last_operation("i-9"),
            Err(CoreError::UnknownPlan(ref plan)) if plan == "gold"
        ));
    }
}
