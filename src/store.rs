use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::Digest as _;
use tokio::fs;
use tokio::sync::Mutex;

/// An entity that can live in the [`ContentStore`], keyed by its URL.
pub trait Storable: Serialize + DeserializeOwned + Send + Sync {
    /// Discriminator separating entity types inside one provider.
    const KIND: &'static str;

    fn key(&self) -> &str;

    /// Restores derived state that is not trusted from the payload.
    fn after_decode(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("decode {kind} {key}")]
    Decode {
        kind: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode {kind} {key}")]
    Encode {
        kind: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("persistence backend: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    Overwritten,
}

/// Opaque key-value persistence. Payloads are namespaced by entity kind.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn get(&self, kind: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Returns `true` when the key did not exist before.
    async fn put(&self, kind: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<bool>;

    async fn list(&self, kind: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>>;

    /// Returns `true` when something was removed.
    async fn remove(&self, kind: &str, key: &str) -> anyhow::Result<bool>;
}

/// Serializes every operation on the backing provider through one lock.
pub struct ContentStore {
    provider: Arc<dyn PersistenceProvider>,
    gate: Mutex<()>,
}

impl ContentStore {
    pub fn new(provider: Arc<dyn PersistenceProvider>) -> Self {
        Self {
            provider,
            gate: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryProvider::default()))
    }

    pub async fn save<T: Storable>(&self, value: &T) -> Result<SaveOutcome, StoreError> {
        let key = value.key();
        let payload = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
            kind: T::KIND,
            key: key.to_owned(),
            source,
        })?;

        let _guard = self.gate.lock().await;
        let created = self
            .provider
            .put(T::KIND, key, payload)
            .await
            .with_context(|| format!("put {} {key}", T::KIND))?;

        Ok(if created {
            SaveOutcome::Created
        } else {
            SaveOutcome::Overwritten
        })
    }

    pub async fn fetch<T: Storable>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let payload = {
            let _guard = self.gate.lock().await;
            self.provider
                .get(T::KIND, key)
                .await
                .with_context(|| format!("get {} {key}", T::KIND))?
        };
        let Some(payload) = payload else {
            return Ok(None);
        };

        decode::<T>(key, &payload).map(Some)
    }

    /// Entries that fail to decode are logged and skipped.
    pub async fn fetch_all<T: Storable>(&self) -> Result<Vec<T>, StoreError> {
        let entries = {
            let _guard = self.gate.lock().await;
            self.provider
                .list(T::KIND)
                .await
                .with_context(|| format!("list {}", T::KIND))?
        };

        let mut out = Vec::with_capacity(entries.len());
        for (key, payload) in entries {
            match decode::<T>(&key, &payload) {
                Ok(value) => out.push(value),
                Err(err) => tracing::warn!(kind = T::KIND, %key, ?err, "skipping malformed entry"),
            }
        }
        Ok(out)
    }

    pub async fn delete<T: Storable>(&self, value: &T) -> Result<bool, StoreError> {
        self.delete_key::<T>(value.key()).await
    }

    pub async fn delete_key<T: Storable>(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.gate.lock().await;
        let removed = self
            .provider
            .remove(T::KIND, key)
            .await
            .with_context(|| format!("remove {} {key}", T::KIND))?;
        Ok(removed)
    }
}

fn decode<T: Storable>(key: &str, payload: &[u8]) -> Result<T, StoreError> {
    let mut value: T = serde_json::from_slice(payload).map_err(|source| StoreError::Decode {
        kind: T::KIND,
        key: key.to_owned(),
        source,
    })?;
    value.after_decode();
    Ok(value)
}

#[derive(Debug, Default)]
pub struct MemoryProvider {
    entries: std::sync::Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryProvider {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl PersistenceProvider for MemoryProvider {
    async fn get(&self, kind: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .entries()
            .get(&(kind.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn put(&self, kind: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<bool> {
        let previous = self
            .entries()
            .insert((kind.to_owned(), key.to_owned()), payload);
        Ok(previous.is_none())
    }

    async fn list(&self, kind: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries()
            .iter()
            .filter(|((entry_kind, _), _)| entry_kind == kind)
            .map(|((_, key), payload)| (key.clone(), payload.clone()))
            .collect())
    }

    async fn remove(&self, kind: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .entries()
            .remove(&(kind.to_owned(), key.to_owned()))
            .is_some())
    }
}

/// One JSON file per entry: `<base>/<kind>/<sha256(key)>.json`.
#[derive(Debug, Clone)]
pub struct LocalFsProvider {
    base_dir: PathBuf,
}

impl LocalFsProvider {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn kind_dir(&self, kind: &str) -> PathBuf {
        self.base_dir.join(kind)
    }

    fn entry_path(&self, kind: &str, key: &str) -> PathBuf {
        let digest = sha2::Sha256::digest(key.as_bytes());
        self.kind_dir(kind)
            .join(format!("{}.json", hex::encode(digest)))
    }

    fn key_path(&self, kind: &str, key: &str) -> PathBuf {
        self.entry_path(kind, key).with_extension("key")
    }
}

#[async_trait]
impl PersistenceProvider for LocalFsProvider {
    async fn get(&self, kind: &str, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.entry_path(kind, key);
        read_optional(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, kind: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<bool> {
        let path = self.entry_path(kind, key);
        let created = !fs::try_exists(&path)
            .await
            .with_context(|| format!("stat: {}", path.display()))?;

        // The key file goes first so a listed payload always has its key.
        let key_path = self.key_path(kind, key);
        let has_key = fs::try_exists(&key_path)
            .await
            .with_context(|| format!("stat: {}", key_path.display()))?;
        if !has_key {
            write_atomic(&key_path, key.as_bytes())
                .await
                .context("write entry key")?;
        }
        write_atomic(&path, &payload)
            .await
            .with_context(|| format!("write entry: {}", path.display()))?;
        Ok(created)
    }

    async fn list(&self, kind: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let dir = self.kind_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir: {}", dir.display()));
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key_path = path.with_extension("key");
            let Some(key) = read_optional(&key_path).await? else {
                tracing::debug!(path = %path.display(), "entry without key file; skipping");
                continue;
            };
            let Some(payload) = read_optional(&path).await? else {
                continue;
            };
            out.push((String::from_utf8_lossy(&key).into_owned(), payload));
        }
        Ok(out)
    }

    async fn remove(&self, kind: &str, key: &str) -> anyhow::Result<bool> {
        let path = self.entry_path(kind, key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err).with_context(|| format!("remove: {}", path.display())),
        }
        if let Err(err) = fs::remove_file(self.key_path(kind, key)).await {
            tracing::debug!(?err, "remove entry key file");
        }
        Ok(true)
    }
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
