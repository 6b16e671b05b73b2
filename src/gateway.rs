use std::sync::Arc;

use blob_store::{ByteStore, HierarchyConflict, PutResult};
use bytes::Bytes;
use dashmap::DashMap;
use metrics::AutoIncrement;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::{
    auth::{AccessDecision, Authorizer, Operation},
    conversion::JobId,
    key_mapper::{map_key_to_path, InvalidKey, PathSegments},
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),

    #[error("no item stored at {0}")]
    NotFound(String),

    #[error("an item is already stored at {0}")]
    Conflict(String),

    #[error("{}", .0.as_deref().unwrap_or("operation not permitted"))]
    Unauthorized(Option<String>),

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl GatewayError {
    fn outcome(&self) -> &'static str {
        match self {
            GatewayError::InvalidKey(_) => "invalid_key",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Storage(_) => "storage_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub fail_if_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub key: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_job: Option<JobId>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Bytes,
    pub content_type: String,
}

/// Notified after every successful mutation while the key's critical section
/// is still held, so notifications for one key arrive in completion order.
pub trait WriteHook: Send + Sync {
    /// Returns the id of the job scheduled for this write, if any.
    fn on_write(&self, path: &PathSegments, result: &PutResult) -> Option<JobId>;

    fn on_remove(&self, path: &PathSegments);
}

/// Async mutex per mapped key. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default)]
struct KeyLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

struct KeyGuard {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self.locks.clone(),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct StorageGateway {
    store: Arc<dyn ByteStore>,
    authorizer: Arc<dyn Authorizer>,
    write_hook: Option<Arc<dyn WriteHook>>,
    locks: KeyLocks,
    metrics: metrics::gateway::Metrics,
}

impl StorageGateway {
    pub fn new(store: Arc<dyn ByteStore>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            store,
            authorizer,
            write_hook: None,
            locks: KeyLocks::default(),
            metrics: metrics::gateway::Metrics::new(),
        }
    }

    pub fn with_write_hook(mut self, hook: Arc<dyn WriteHook>) -> Self {
        self.write_hook = Some(hook);
        self
    }

    fn check_access(
        &self,
        operation: Operation,
        path: Option<&PathSegments>,
    ) -> Result<(), GatewayError> {
        match self.authorizer.authorize(operation, path) {
            AccessDecision::Permit => Ok(()),
            AccessDecision::Deny { reason } => {
                info!(
                    %operation,
                    key = path.map(|p| p.to_string()).unwrap_or_default(),
                    reason = reason.as_deref().unwrap_or(""),
                    "access denied"
                );
                Err(GatewayError::Unauthorized(reason))
            }
        }
    }

    fn resolve(&self, operation: Operation, key: &str) -> Result<PathSegments, GatewayError> {
        let path = map_key_to_path(key)?;
        self.check_access(operation, Some(&path))?;
        Ok(path)
    }

    fn record<T>(&self, operation: Operation, result: &Result<T, GatewayError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => err.outcome(),
        };
        self.metrics.operations.increment(&[
            KeyValue::new("op", operation.as_str()),
            KeyValue::new("outcome", outcome),
        ]);
    }

    #[tracing::instrument(skip(self))]
    pub async fn read(&self, key: &str) -> Result<StoredObject, GatewayError> {
        let result = self.read_inner(key).await;
        self.record(Operation::Read, &result);
        result
    }

    async fn read_inner(&self, key: &str) -> Result<StoredObject, GatewayError> {
        let path = self.resolve(Operation::Read, key)?;
        let mapped = path.to_string();
        let bytes = self
            .store
            .get(&mapped)
            .await?
            .ok_or_else(|| GatewayError::NotFound(mapped.clone()))?;
        let content_type = mime_guess::from_path(path.file_name())
            .first_or_octet_stream()
            .to_string();
        Ok(StoredObject {
            key: mapped,
            bytes,
            content_type,
        })
    }

    #[tracing::instrument(skip(self, data, content_type), fields(size = data.len()))]
    pub async fn write(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        options: WriteOptions,
    ) -> Result<WriteResult, GatewayError> {
        let result = self.write_inner(key, data, content_type, options).await;
        if let Ok(written) = &result {
            self.metrics.bytes_written.add(written.size_bytes, &[]);
        }
        self.record(Operation::Write, &result);
        result
    }

    async fn write_inner(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        options: WriteOptions,
    ) -> Result<WriteResult, GatewayError> {
        let path = self.resolve(Operation::Write, key)?;
        let mapped = path.to_string();

        let _guard = self.locks.lock(&mapped).await;
        let existed = self.store.has(&mapped).await?;
        if existed && options.fail_if_exists {
            return Err(GatewayError::Conflict(mapped));
        }
        let put = match self.store.set(&mapped, data).await {
            Ok(put) => put,
            Err(e) if e.is::<HierarchyConflict>() => {
                info!(key = %mapped, "write clashes with stored hierarchy");
                return Err(GatewayError::Conflict(mapped));
            }
            Err(e) => return Err(e.into()),
        };
        let conversion_job = self
            .write_hook
            .as_ref()
            .and_then(|hook| hook.on_write(&path, &put));

        info!(
            key = %mapped,
            size = put.size_bytes,
            created = !existed,
            job = conversion_job.as_ref().map(|j| j.to_string()).unwrap_or_default(),
            "item stored"
        );
        Ok(WriteResult {
            key: mapped,
            size_bytes: put.size_bytes,
            sha256: put.sha256_hash,
            created: !existed,
            content_type,
            conversion_job,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> Result<(), GatewayError> {
        let result = self.remove_inner(key).await;
        self.record(Operation::Remove, &result);
        result
    }

    async fn remove_inner(&self, key: &str) -> Result<(), GatewayError> {
        let path = self.resolve(Operation::Remove, key)?;
        let mapped = path.to_string();

        let _guard = self.locks.lock(&mapped).await;
        if !self.store.has(&mapped).await? {
            return Err(GatewayError::NotFound(mapped));
        }
        self.store.remove(&mapped).await?;
        if let Some(hook) = &self.write_hook {
            hook.on_remove(&path);
        }
        info!(key = %mapped, "item removed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn exists(&self, key: &str) -> Result<bool, GatewayError> {
        let result: Result<bool, GatewayError> = async {
            let path = self.resolve(Operation::Exists, key)?;
            Ok(self.store.has(&path.to_string()).await?)
        }
        .await;
        self.record(Operation::Exists, &result);
        result
    }

    /// Mapped keys stored below `prefix`. A prefix without any segment lists
    /// the whole store.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, GatewayError> {
        let result: Result<Vec<String>, GatewayError> = async {
            if prefix.split('/').all(|s| s.is_empty()) {
                self.check_access(Operation::List, None)?;
                return Ok(self.store.list(None).await?);
            }
            let path = self.resolve(Operation::List, prefix)?;
            let keys = self.store.list(Some(&path.to_string())).await?;
            debug!(prefix = %path, count = keys.len(), "listed items");
            Ok(keys)
        }
        .await;
        self.record(Operation::List, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use blob_store::{BlobStorage, BlobStorageConfig};

    use super::*;
    use crate::{
        auth::{AllowAll, AuthorizationRule, RuleAuthorizer},
        config::AuthorizationConfig,
    };

    fn local_gateway() -> (tempfile::TempDir, StorageGateway) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStorage::new(BlobStorageConfig::new(
            temp_dir.path().join("public").to_str().unwrap(),
        ))
        .unwrap();
        (temp_dir, StorageGateway::new(Arc::new(store), Arc::new(AllowAll)))
    }

    async fn put(gateway: &StorageGateway, key: &str) -> Result<WriteResult, GatewayError> {
        gateway
            .write(key, Bytes::from_static(b"x"), None, WriteOptions::default())
            .await
    }

    fn memory_gateway() -> StorageGateway {
        let store = BlobStorage::new(BlobStorageConfig::in_memory()).unwrap();
        StorageGateway::new(Arc::new(store), Arc::new(AllowAll))
    }

    #[derive(Default)]
    struct RecordingHook {
        events: StdMutex<Vec<String>>,
    }

    impl WriteHook for RecordingHook {
        fn on_write(&self, path: &PathSegments, _result: &PutResult) -> Option<JobId> {
            self.events.lock().unwrap().push(format!("write {path}"));
            None
        }

        fn on_remove(&self, path: &PathSegments) {
            self.events.lock().unwrap().push(format!("remove {path}"));
        }
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let gateway = memory_gateway();
        let result = gateway
            .write(
                "documents/reports/q1.txt",
                Bytes::from_static(b"hello"),
                Some("text/plain".to_string()),
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.key, "documents/reports/q1.txt");
        assert_eq!(result.size_bytes, 5);
        assert!(result.created);
        assert_eq!(result.content_type.as_deref(), Some("text/plain"));

        let object = gateway.read("documents/reports/q1.txt").await.unwrap();
        assert_eq!(object.bytes, Bytes::from_static(b"hello"));
        assert_eq!(object.content_type, "text/plain");
        assert!(gateway.exists("documents/reports/q1.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips() {
        let gateway = memory_gateway();
        gateway
            .write("a/empty.bin", Bytes::new(), None, WriteOptions::default())
            .await
            .unwrap();
        let object = gateway.read("a/empty.bin").await.unwrap();
        assert!(object.bytes.is_empty());
        assert_eq!(object.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_read_uses_mapped_key() {
        let gateway = memory_gateway();
        gateway
            .write(
                "Reports%202024/Q1%20Summary.TXT",
                Bytes::from_static(b"x"),
                None,
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let object = gateway.read("Reports-2024/Q1-Summary.txt").await.unwrap();
        assert_eq!(object.key, "Reports-2024/Q1-Summary.txt");
    }

    #[tokio::test]
    async fn test_fail_if_exists_conflict_leaves_bytes() {
        let gateway = memory_gateway();
        let options = WriteOptions {
            fail_if_exists: true,
        };
        gateway
            .write("docs/a.txt", Bytes::from_static(b"first"), None, options)
            .await
            .unwrap();
        let err = gateway
            .write("docs/a.txt", Bytes::from_static(b"second"), None, options)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(ref key) if key == "docs/a.txt"));
        assert_eq!(
            gateway.read("docs/a.txt").await.unwrap().bytes,
            Bytes::from_static(b"first")
        );

        let overwritten = gateway
            .write(
                "docs/a.txt",
                Bytes::from_static(b"third"),
                None,
                WriteOptions::default(),
            )
            .await
            .unwrap();
        assert!(!overwritten.created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fail_if_exists_writes() {
        let gateway = Arc::new(memory_gateway());
        let mut handles = Vec::new();
        for i in 0..16 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway
                    .write(
                        "docs/race.txt",
                        Bytes::from(format!("writer {i}")),
                        None,
                        WriteOptions {
                            fail_if_exists: true,
                        },
                    )
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(GatewayError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(succeeded, 1);
        assert_eq!(gateway.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let gateway = memory_gateway();
        assert!(matches!(
            gateway.remove("docs/missing.txt").await,
            Err(GatewayError::NotFound(_))
        ));

        gateway
            .write(
                "docs/a.txt",
                Bytes::from_static(b"x"),
                None,
                WriteOptions::default(),
            )
            .await
            .unwrap();
        gateway.remove("docs/a.txt").await.unwrap();
        assert!(matches!(
            gateway.read("docs/a.txt").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(!gateway.exists("docs/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_below_a_stored_file_are_absent() {
        let (_temp_dir, gateway) = local_gateway();
        put(&gateway, "misc/a").await.unwrap();

        assert!(!gateway.exists("misc/a/b.txt").await.unwrap());
        assert!(matches!(
            gateway.read("misc/a/b.txt").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            gateway.remove("misc/a/b.txt").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(gateway.exists("misc/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_clashing_with_hierarchy_is_conflict() {
        let (_temp_dir, gateway) = local_gateway();
        put(&gateway, "docs/a.txt").await.unwrap();
        put(&gateway, "misc/a").await.unwrap();

        assert!(matches!(
            put(&gateway, "docs").await,
            Err(GatewayError::Conflict(key)) if key == "docs"
        ));
        assert!(matches!(
            put(&gateway, "misc/a/b.txt").await,
            Err(GatewayError::Conflict(_))
        ));
        assert_eq!(gateway.read("docs/a.txt").await.unwrap().bytes, "x");
        assert_eq!(gateway.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let gateway = memory_gateway();
        assert!(matches!(
            gateway
                .write("///", Bytes::new(), None, WriteOptions::default())
                .await,
            Err(GatewayError::InvalidKey(_))
        ));
        assert!(matches!(
            gateway.exists("docs/!!!").await,
            Err(GatewayError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_list() {
        let gateway = memory_gateway();
        for key in ["docs/b.txt", "docs/a.txt", "img/c.png"] {
            gateway
                .write(key, Bytes::new(), None, WriteOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(
            gateway.list("docs/").await.unwrap(),
            vec!["docs/a.txt", "docs/b.txt"]
        );
        assert_eq!(gateway.list("").await.unwrap().len(), 3);
        assert!(gateway.list("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denied_before_io() {
        let store = Arc::new(BlobStorage::new(BlobStorageConfig::in_memory()).unwrap());
        let authorizer = RuleAuthorizer::new(&AuthorizationConfig {
            rules: vec![AuthorizationRule {
                operations: vec![Operation::Write],
                prefix: "locked".to_string(),
                reason: Some("locked area".to_string()),
            }],
        });
        let gateway = StorageGateway::new(store.clone(), Arc::new(authorizer));

        let err = gateway
            .write(
                "locked/a.txt",
                Bytes::from_static(b"x"),
                None,
                WriteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(Some(ref r)) if r == "locked area"));
        assert_eq!(err.to_string(), "locked area");
        assert!(!store.has("locked/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_hook_sees_writes_and_removes() {
        let hook = Arc::new(RecordingHook::default());
        let gateway = memory_gateway().with_write_hook(hook.clone());
        gateway
            .write(
                "docs/a.txt",
                Bytes::from_static(b"x"),
                None,
                WriteOptions::default(),
            )
            .await
            .unwrap();
        let _ = gateway
            .write(
                "docs/a.txt",
                Bytes::from_static(b"y"),
                None,
                WriteOptions {
                    fail_if_exists: true,
                },
            )
            .await;
        gateway.remove("docs/a.txt").await.unwrap();

        assert_eq!(
            *hook.events.lock().unwrap(),
            vec!["write docs/a.txt", "remove docs/a.txt"]
        );
    }
}
