use crate::{CredentialStore, StoreError};
use credbroker_model::{InstanceRecord, StorePaths};
use std::sync::Arc;
use tracing::debug;

/// Persists [`InstanceRecord`]s as JSON credentials at their metadata path.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn CredentialStore>,
    paths: StorePaths,
}

impl RecordStore {
    pub fn new(store: Arc<dyn CredentialStore>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    pub fn save(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        let path = self.paths.metadata_path(&record.instance_id);

        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(record.compute_checksum()?);
        let object = with_checksum.to_json_object()?;

        self.store.set_json(&path, &object)?;
        debug!("saved instance record {path}");
        Ok(())
    }

    pub fn load(&self, instance_id: &str) -> Result<InstanceRecord, StoreError> {
        let path = self.paths.metadata_path(instance_id);
        let object = self.store.get_json(&path)?;
        let record = InstanceRecord::from_json_object(object)?;

        // Records written before checksums existed carry none.
        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    path,
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if record.instance_id != instance_id {
            return Err(StoreError::IntegrityFailure {
                path,
                expected: instance_id.to_owned(),
                actual: record.instance_id.into_inner(),
            });
        }
        Ok(record)
    }

    pub fn remove(&self, instance_id: &str) -> Result<(), StoreError> {
        let path = self.paths.metadata_path(instance_id);
        self.store.delete(&path)?;
        debug!("removed instance record {path}");
        Ok(())
    }
}
