//! Byte store used by the storage gateway.
//!
//! Keys are `/`-separated relative paths (`documents/reports/q1.txt`). Every
//! key is re-parsed with [`object_store::path::Path::parse`], which rejects
//! empty, `.` and `..` parts, so a malformed key can never address anything
//! outside the configured root.

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use metrics::{blob_storage, Timer};
use object_store::{
    local::LocalFileSystem,
    memory::InMemory,
    path::Path,
    ObjectStore,
    PutPayload,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default = "default_blob_store_path")]
    pub path: String,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
        }
    }

    pub fn in_memory() -> Self {
        BlobStorageConfig {
            path: "memory:///".to_string(),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        BlobStorageConfig {
            path: default_blob_store_path(),
        }
    }
}

fn default_blob_store_path() -> String {
    format!(
        "file://{}",
        env::current_dir()
            .expect("unable to get current directory")
            .join("public")
            .to_str()
            .expect("unable to get path as string")
    )
}

/// The key can't be stored on a local root because an ancestor of it is
/// already a file, or because the key itself is already a directory.
#[derive(Debug, thiserror::Error)]
#[error("blob key {key:?} clashes with an existing file or directory")]
pub struct HierarchyConflict {
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

/// The narrow byte store contract the gateway depends on.
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Returns `None` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, data: Bytes) -> Result<PutResult>;

    /// Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Keys stored below `prefix`, sorted.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Filesystem location of `key`, for stores that persist to a local
    /// directory.
    fn local_path(&self, key: &str) -> Option<PathBuf>;
}

/// [`ByteStore`] backed by `object_store`.
///
/// `file://` URLs map keys 1:1 onto files below one root directory,
/// `memory://` keeps everything in process (tests).
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    root: Option<PathBuf>,
    metrics: blob_storage::Metrics,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url: Url = config
            .path
            .parse()
            .with_context(|| format!("invalid blob storage url: {}", config.path))?;
        let (object_store, root): (Arc<dyn ObjectStore>, Option<PathBuf>) = match url.scheme() {
            "file" => {
                let root = url
                    .to_file_path()
                    .map_err(|_| anyhow!("blob storage url is not a local path: {}", url))?;
                std::fs::create_dir_all(&root).with_context(|| {
                    format!("failed to create storage root: {}", root.display())
                })?;
                let root = root.canonicalize()?;
                let store = LocalFileSystem::new_with_prefix(&root)?.with_automatic_cleanup(true);
                (Arc::new(store), Some(root))
            }
            "memory" => (Arc::new(InMemory::new()), None),
            scheme => return Err(anyhow!("unsupported blob storage scheme: {}", scheme)),
        };
        info!(url = %config.path, "using blob store");
        Ok(Self {
            object_store,
            root,
            metrics: blob_storage::Metrics::new(),
        })
    }

    pub fn root(&self) -> Option<&std::path::Path> {
        self.root.as_deref()
    }

    /// Whether `path` is unreachable on the local root because an ancestor
    /// is a file, or names an existing directory. Always false for stores
    /// without a root.
    async fn clashes_with_hierarchy(&self, path: &Path) -> bool {
        let Some(root) = &self.root else {
            return false;
        };
        let parts: Vec<_> = path.parts().collect();
        let mut location = root.clone();
        for (idx, part) in parts.iter().enumerate() {
            let part: &str = part.as_ref();
            location.push(part);
            match tokio::fs::metadata(&location).await {
                Ok(meta) if idx + 1 == parts.len() => return meta.is_dir(),
                Ok(meta) if meta.is_file() => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    fn parse_key(key: &str) -> Result<Path> {
        let path = Path::parse(key).with_context(|| format!("invalid blob key: {}", key))?;
        if path.parts().next().is_none() {
            return Err(anyhow!("blob key must not be empty"));
        }
        Ok(path)
    }
}

#[async_trait]
impl ByteStore for BlobStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let timer_kvs = &[KeyValue::new("op", "get")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);
        let path = Self::parse_key(key)?;
        match self.object_store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => {
                if self.clashes_with_hierarchy(&path).await {
                    return Ok(None);
                }
                Err(anyhow!("can't read blob {:?}: {}", key, e))
            }
        }
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<PutResult> {
        let timer_kvs = &[KeyValue::new("op", "put")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);
        let path = Self::parse_key(key)?;

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let size_bytes = data.len() as u64;

        if let Err(e) = self
            .object_store
            .put(&path, PutPayload::from_bytes(data))
            .await
        {
            if self.clashes_with_hierarchy(&path).await {
                return Err(HierarchyConflict {
                    key: key.to_string(),
                }
                .into());
            }
            return Err(anyhow!("can't write blob {:?}: {}", key, e));
        }

        let hash = format!("{:x}", hasher.finalize());
        debug!(key, size_bytes, "blob written");
        Ok(PutResult {
            key: path.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let timer_kvs = &[KeyValue::new("op", "delete")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);
        let path = Self::parse_key(key)?;
        match self.object_store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => {
                if self.clashes_with_hierarchy(&path).await {
                    return Ok(());
                }
                Err(anyhow!("can't delete blob {:?}: {}", key, e))
            }
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let timer_kvs = &[KeyValue::new("op", "head")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);
        let path = Self::parse_key(key)?;
        match self.object_store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => {
                if self.clashes_with_hierarchy(&path).await {
                    return Ok(false);
                }
                Err(anyhow!("can't stat blob {:?}: {}", key, e))
            }
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let timer_kvs = &[KeyValue::new("op", "list")];
        let _timer = Timer::start_with_labels(&self.metrics.operations, timer_kvs);
        let prefix = prefix.map(Self::parse_key).transpose()?;
        let mut keys: Vec<String> = self
            .object_store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| anyhow!("can't list blobs: {}", e))?;
        keys.sort();
        Ok(keys)
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let path = Self::parse_key(key).ok()?;
        Some(root.join(path.to_string()))
    }
}
