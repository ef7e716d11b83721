use crate::config::StorageConfig;
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StorageEvent};
use crate::models::{Record, WriteOptions};
use crate::storage::file_io::FileStore;
use crate::storage::{validate_component, MetadataStore};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct MetadataRepository {
    dir: PathBuf,
    files: FileStore,
    write_options: WriteOptions,
    events: EventBus,
    initialized: AtomicBool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MetadataRepository {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.metadata_dir(),
            files: FileStore::new(config.transaction_log),
            write_options: config.write,
            events: EventBus::new(),
            initialized: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AppError::NotInitialized("metadata repository".to_string()));
        }
        Ok(())
    }

    fn metadata_path(&self, key: &str) -> AppResult<PathBuf> {
        validate_component("metadata key", key)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }

    /// Serializes work on one key; the map entry goes away once no task holds it.
    async fn with_key_lock<T>(&self, key: &str, action: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let result = {
            let _guard = lock.lock().await;
            action.await
        };
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        result
    }

    fn observe<T>(&self, operation: &str, result: AppResult<T>) -> AppResult<T> {
        if let Err(error) = &result {
            tracing::error!(operation, error = %error, "metadata operation failed");
            self.events.publish(StorageEvent::Error {
                operation: operation.to_string(),
                entity_type: None,
                message: error.to_string(),
            });
        }
        result
    }

    async fn write(&self, key: &str, value: &Value) -> AppResult<()> {
        let path = self.metadata_path(key)?;
        self.files
            .with_transaction(
                "storeMetadata",
                &path,
                None,
                self.files.write_json_file(&path, value, self.write_options),
            )
            .await
    }

    async fn store_inner(&self, key: &str, mut value: Value) -> AppResult<bool> {
        if let Value::Object(map) = &mut value {
            if !map.contains_key("updatedAt") {
                map.insert("updatedAt".to_string(), Value::String(timestamp()));
            }
        }
        self.with_key_lock(key, self.write(key, &value)).await?;
        self.events.publish(StorageEvent::MetadataStored {
            key: key.to_string(),
            metadata: value,
        });
        Ok(true)
    }

    async fn update_inner(&self, key: &str, partial: Record) -> AppResult<Record> {
        let path = self.metadata_path(key)?;
        let merged = self
            .with_key_lock(key, async {
                let mut merged = match self.files.read_json_file(&path, Value::Null).await {
                    Value::Object(existing) => existing,
                    _ => Record::new(),
                };
                merged.extend(partial);
                merged.insert("updatedAt".to_string(), Value::String(timestamp()));
                self.write(key, &Value::Object(merged.clone())).await?;
                Ok::<_, AppError>(merged)
            })
            .await?;

        self.events.publish(StorageEvent::MetadataUpdated {
            key: key.to_string(),
            metadata: Value::Object(merged.clone()),
        });
        Ok(merged)
    }

    async fn delete_inner(&self, key: &str) -> AppResult<bool> {
        let path = self.metadata_path(key)?;
        let removed = self.with_key_lock(key, self.files.delete_file(&path)).await?;
        if removed {
            self.events.publish(StorageEvent::MetadataDeleted { key: key.to_string() });
        }
        Ok(removed)
    }
}

#[async_trait]
impl MetadataStore for MetadataRepository {
    async fn initialize(&self) -> AppResult<()> {
        self.files.ensure_dir(&self.dir).await?;
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(dir = %self.dir.display(), "metadata repository initialized");
        self.events.publish(StorageEvent::Initialized);
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn get_metadata(&self, key: &str, default: Value) -> AppResult<Value> {
        self.ensure_initialized()?;
        let path = self.observe("getMetadata", self.metadata_path(key))?;
        Ok(self.files.read_json_file(&path, default).await)
    }

    async fn store_metadata(&self, key: &str, value: Value) -> AppResult<bool> {
        self.ensure_initialized()?;
        let result = self.store_inner(key, value).await;
        self.observe("storeMetadata", result)
    }

    async fn update_metadata(&self, key: &str, partial: Record) -> AppResult<Record> {
        self.ensure_initialized()?;
        let result = self.update_inner(key, partial).await;
        self.observe("updateMetadata", result)
    }

    async fn delete_metadata(&self, key: &str) -> AppResult<bool> {
        self.ensure_initialized()?;
        let result = self.delete_inner(key).await;
        self.observe("deleteMetadata", result)
    }

    async fn list_metadata_keys(&self) -> AppResult<Vec<String>> {
        self.ensure_initialized()?;
        let result = self.files.list_json_stems(&self.dir).await;
        self.observe("listMetadataKeys", result)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn repository(root: &std::path::Path) -> MetadataRepository {
        let mut config = StorageConfig::with_root(root);
        config.transaction_log = false;
        let repo = MetadataRepository::new(&config);
        repo.initialize().await.expect("initialize");
        repo
    }

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    #[tokio::test]
    async fn store_stamps_updated_at_once() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        assert!(repo.store_metadata("sync", json!({"lastSync": "2024-01-01"})).await.expect("store"));
        let stored = repo.get_metadata("sync", Value::Null).await.expect("get");
        assert_eq!(stored["lastSync"], "2024-01-01");
        assert!(stored["updatedAt"].is_string());

        repo.store_metadata("pinned", json!({"updatedAt": "fixed"})).await.expect("store");
        assert_eq!(repo.get_metadata("pinned", Value::Null).await.expect("get")["updatedAt"], "fixed");
    }

    #[tokio::test]
    async fn missing_key_returns_default() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        assert_eq!(repo.get_metadata("absent", json!({"n": 0})).await.expect("get"), json!({"n": 0}));
    }

    #[tokio::test]
    async fn update_merges_over_existing_fields() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        repo.store_metadata("window", json!({"width": 800, "height": 600})).await.expect("store");
        let merged = repo
            .update_metadata("window", record(json!({"height": 700, "maximized": false})))
            .await
            .expect("update");
        assert_eq!(merged["width"], 800);
        assert_eq!(merged["height"], 700);
        assert_eq!(merged["maximized"], false);

        let fresh = repo.update_metadata("fresh", record(json!({"a": 1}))).await.expect("update new");
        assert_eq!(fresh["a"], 1);
        assert!(fresh.contains_key("updatedAt"));
    }

    #[tokio::test]
    async fn concurrent_merges_on_one_key_are_all_kept() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        let (a, b, c) = tokio::join!(
            repo.update_metadata("window", record(json!({"width": 800}))),
            repo.update_metadata("window", record(json!({"height": 600}))),
            repo.update_metadata("window", record(json!({"maximized": true}))),
        );
        a.expect("width");
        b.expect("height");
        c.expect("maximized");

        let stored = repo.get_metadata("window", Value::Null).await.expect("get");
        assert_eq!(stored["width"], 800);
        assert_eq!(stored["height"], 600);
        assert_eq!(stored["maximized"], true);
        assert!(repo.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn keys_come_from_filenames() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        repo.store_metadata("b", json!({})).await.expect("b");
        repo.store_metadata("a", json!({})).await.expect("a");
        repo.store_metadata("a", json!({"again": true})).await.expect("a again");
        assert_eq!(repo.list_metadata_keys().await.expect("keys"), vec!["a", "b"]);

        assert!(repo.delete_metadata("a").await.expect("delete"));
        assert!(!repo.delete_metadata("a").await.expect("delete again"));
        assert_eq!(repo.list_metadata_keys().await.expect("keys"), vec!["b"]);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected_with_error_event() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(root.path()).await;
        let mut receiver = repo.events().subscribe();
        let error = repo.store_metadata("../outside", json!({})).await.expect_err("invalid");
        assert_eq!(error.code(), "INVALID_INPUT");
        assert!(matches!(receiver.recv().await.expect("event"), StorageEvent::Error { .. }));
    }
}
