use crate::{
    fsync_dir, CredentialStore, JsonObject, Permission, PermissionHandle, PermissionOp, StoreError,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Exclusive advisory lock on the store directory, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", lock_path.display())))?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    name: String,
    version_created_at: String,
    value: JsonObject,
}

/// Directory-backed credential store for single-node deployments.
///
/// Layout under the root:
/// - `credentials/<blake3(path)>.json`  current value of one path
/// - `permissions/<uuid>.json`          one grant
/// - `.lock`                            held for every call
///
/// Only the current version of a credential is kept.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        fs::create_dir_all(store.credentials_dir())?;
        fs::create_dir_all(store.permissions_dir())?;
        Ok(store)
    }

    fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials")
    }

    fn permissions_dir(&self) -> PathBuf {
        self.root.join("permissions")
    }

    fn credential_file(&self, path: &str) -> PathBuf {
        let key = blake3::hash(path.as_bytes()).to_hex();
        self.credentials_dir().join(format!("{key}.json"))
    }

    fn lock(&self) -> Result<DirLock, StoreError> {
        DirLock::acquire(&self.root.join(".lock"))
    }

    fn write_atomic(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(dir)?;
        Ok(())
    }

    fn read_grants(&self) -> Result<Vec<Permission>, StoreError> {
        let mut grants = Vec::new();
        for entry in fs::read_dir(self.permissions_dir())? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|c| serde_json::from_str::<Permission>(&c).map_err(StoreError::from))
            {
                Ok(grant) => grants.push(grant),
                Err(e) => warn!("skipping unreadable grant {}: {e}", path.display()),
            }
        }
        grants.sort_by(|a, b| a.actor.cmp(&b.actor));
        Ok(grants)
    }
}

impl CredentialStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn set_json(&self, path: &str, value: &JsonObject) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let record = CredentialFile {
            name: path.to_owned(),
            version_created_at: chrono::Utc::now().to_rfc3339(),
            value: value.clone(),
        };
        let content = serde_json::to_vec_pretty(&record)?;
        Self::write_atomic(&self.credentials_dir(), &self.credential_file(path), &content)?;
        debug!("file store: wrote {path}");
        Ok(())
    }

    fn get_json(&self, path: &str) -> Result<JsonObject, StoreError> {
        let _lock = self.lock()?;
        let file = self.credential_file(path);
        if !file.exists() {
            return Err(StoreError::NotFound(path.to_owned()));
        }
        let record: CredentialFile = serde_json::from_str(&fs::read_to_string(&file)?)?;
        if record.name != path {
            return Err(StoreError::IntegrityFailure {
                path: path.to_owned(),
                expected: path.to_owned(),
                actual: record.name,
            });
        }
        Ok(record.value)
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        let file = self.credential_file(path);
        if !file.exists() {
            return Err(StoreError::NotFound(path.to_owned()));
        }
        fs::remove_file(&file)?;
        fsync_dir(&self.credentials_dir())?;
        debug!("file store: deleted {path}");
        Ok(())
    }

    fn list_permissions(&self, path: &str) -> Result<Vec<Permission>, StoreError> {
        let _lock = self.lock()?;
        Ok(self
            .read_grants()?
            .into_iter()
            .filter(|g| g.path == path)
            .collect())
    }

    fn find_permission(&self, path: &str, actor: &str) -> Result<PermissionHandle, StoreError> {
        let _lock = self.lock()?;
        self.read_grants()?
            .into_iter()
            .find(|g| g.path == path && g.actor == actor)
            .and_then(|g| {
                g.uuid.map(|uuid| PermissionHandle {
                    uuid,
                    actor: g.actor,
                    path: g.path,
                })
            })
            .ok_or_else(|| StoreError::NotFound(format!("permission for {actor} on {path}")))
    }

    fn add_permission(
        &self,
        path: &str,
        actor: &str,
        operations: &[PermissionOp],
    ) -> Result<PermissionHandle, StoreError> {
        let _lock = self.lock()?;
        if self
            .read_grants()?
            .iter()
            .any(|g| g.path == path && g.actor == actor)
        {
            return Err(StoreError::Conflict(format!(
                "permission for {actor} on {path} already exists"
            )));
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        let grant = Permission {
            actor: actor.to_owned(),
            path: path.to_owned(),
            operations: operations.to_vec(),
            uuid: Some(uuid.clone()),
        };
        let dir = self.permissions_dir();
        let content = serde_json::to_vec_pretty(&grant)?;
        Self::write_atomic(&dir, &dir.join(format!("{uuid}.json")), &content)?;
        debug!("file store: granted {actor} on {path} ({uuid})");
        Ok(PermissionHandle {
            uuid,
            actor: actor.to_owned(),
            path: path.to_owned(),
        })
    }

    fn delete_permission(&self, handle: &PermissionHandle) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        if uuid::Uuid::parse_str(&handle.uuid).is_err() {
            return Err(StoreError::NotFound(format!("permission {}", handle.uuid)));
        }
        let dir = self.permissions_dir();
        let file = dir.join(format!("{}.json", handle.uuid));
        if !file.exists() {
            return Err(StoreError::NotFound(format!("permission {}", handle.uuid)));
        }
        fs::remove_file(&file)?;
        fsync_dir(&dir)?;
        Ok(())
    }
}
