//! Credential persistence.
//!
//! One record per process lives at `<auth_dir>/creds.json`. Writes go to a
//! temp file in the same directory and are renamed over the record, so a
//! concurrent `load()` sees either the old or the new blob, never a mix.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use {
    async_trait::async_trait,
    chatgate_channels::Credentials,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

const CREDS_FILE: &str = "creds.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt credential record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

/// Durable home of the session credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credentials, or [`Credentials::empty`] when nothing is stored.
    async fn load(&self) -> Result<Credentials, StoreError>;

    /// Replace the stored blob entirely. Returns the stored record with its
    /// new revision.
    async fn save(&self, data: serde_json::Value) -> Result<Credentials, StoreError>;

    /// Forget the stored identity.
    async fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CredsRecord {
    revision: u64,
    updated_at: chrono::DateTime<chrono::Utc>,
    credentials: serde_json::Value,
}

/// File-backed store rooted at a dedicated directory.
#[derive(Debug)]
pub struct FileCredentialStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

fn read_record(path: &Path) -> Result<Option<CredsRecord>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record(dir: &Path, path: &Path, record: &CredsRecord) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let data = serde_json::to_vec_pretty(record)?;

    // NamedTempFile is created 0600 on Unix.
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Credentials, StoreError> {
        let dir = self.dir.clone();
        let path = self.record_path();
        blocking(move || {
            std::fs::create_dir_all(&dir)?;
            Ok(read_record(&path)?
                .map(|r| Credentials::new(r.revision, r.credentials))
                .unwrap_or_else(Credentials::empty))
        })
        .await
    }

    async fn save(&self, data: serde_json::Value) -> Result<Credentials, StoreError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.dir.clone();
        let path = self.record_path();
        let saved = blocking(move || {
            // A corrupt previous record must not block the replacement.
            let revision = read_record(&path).ok().flatten().map_or(0, |r| r.revision) + 1;
            let record = CredsRecord {
                revision,
                updated_at: chrono::Utc::now(),
                credentials: data,
            };
            write_record(&dir, &path, &record)?;
            Ok(Credentials::new(record.revision, record.credentials))
        })
        .await?;
        debug!(revision = saved.revision, dir = %self.dir.display(), "credentials persisted");
        Ok(saved)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path();
        blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

/// Process-local store, for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    current: Mutex<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(data: serde_json::Value) -> Self {
        Self {
            current: Mutex::new(Credentials::new(1, data)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Credentials, StoreError> {
        Ok(self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, data: serde_json::Value) -> Result<Credentials, StoreError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Credentials::new(current.revision + 1, data);
        Ok(current.clone())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Credentials::empty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[tokio::test]
    async fn load_creates_directory_and_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("auth_info");
        let store = FileCredentialStore::new(&dir);

        let creds = store.load().await.unwrap();
        assert!(creds.is_empty());
        assert_eq!(creds.revision, 0);
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn save_replaces_whole_blob_and_bumps_revision() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(tmp.path());

        let first = store
            .save(json!({"me": "123@s.whatsapp.net", "keys": {"a": 1}}))
            .await
            .unwrap();
        assert_eq!(first.revision, 1);

        let second = store.save(json!({"me": "123@s.whatsapp.net"})).await.unwrap();
        assert_eq!(second.revision, 2);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.data, json!({"me": "123@s.whatsapp.net"}));
    }

    #[tokio::test]
    async fn survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileCredentialStore::new(tmp.path());
            store.save(json!({"registrationId": 42})).await.unwrap();
        }
        let reopened = FileCredentialStore::new(tmp.path());
        let creds = reopened.load().await.unwrap();
        assert_eq!(creds.data, json!({"registrationId": 42}));
        assert_eq!(creds.revision, 1);
    }

    #[tokio::test]
    async fn corrupt_record_fails_load_but_not_save() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CREDS_FILE), b"{not json").unwrap();
        let store = FileCredentialStore::new(tmp.path());

        assert!(matches!(store.load().await, Err(StoreError::Corrupt(_))));

        let saved = store.save(json!({"fresh": true})).await.unwrap();
        assert_eq!(saved.revision, 1);
        assert_eq!(store.load().await.unwrap().data, json!({"fresh": true}));
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.save(json!({"x": 1})).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.save(json!({"x": 1})).await.unwrap();

        let mode = std::fs::metadata(tmp.path().join(CREDS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn memory_store_tracks_revisions() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().await.unwrap().is_empty());
        store.save(json!({"a": 1})).await.unwrap();
        let c = store.save(json!({"a": 2})).await.unwrap();
        assert_eq!(c.revision, 2);
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
