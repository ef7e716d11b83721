use crate::config::StorageConfig;
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StorageEvent};
use crate::models::{ReloadPolicy, SealedValue, SettingOptions, SettingRecord, WriteOptions};
use crate::storage::crypto::EncryptionService;
use crate::storage::file_io::FileStore;
use crate::storage::SettingsStore;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

const SETTINGS_FILE: &str = "settings.json";

type SettingsCache = Option<SettingsDocument>;

/// Parsed settings file. Entries that do not read as a setting are carried
/// along verbatim so a rewrite never drops them.
#[derive(Debug, Clone)]
struct SettingsDocument {
    records: Vec<SettingRecord>,
    unreadable: Vec<Value>,
    writable: bool,
}

impl SettingsDocument {
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            unreadable: Vec::new(),
            writable: true,
        }
    }

    fn parse(path: &Path, document: Value) -> Self {
        let items = match document {
            Value::Null => return Self::empty(),
            Value::Array(items) => items,
            _ => {
                tracing::error!(path = %path.display(), "settings document is not an array; writes disabled");
                return Self {
                    writable: false,
                    ..Self::empty()
                };
            }
        };

        let mut parsed = Self::empty();
        for item in items {
            match serde_json::from_value::<SettingRecord>(item.clone()) {
                Ok(record) => parsed.records.push(record),
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "keeping unreadable settings entry as-is");
                    parsed.unreadable.push(item);
                }
            }
        }
        parsed
    }

    fn to_json(&self) -> AppResult<Value> {
        let mut items = Vec::with_capacity(self.records.len() + self.unreadable.len());
        for record in &self.records {
            items.push(serde_json::to_value(record)?);
        }
        items.extend(self.unreadable.iter().cloned());
        Ok(Value::Array(items))
    }
}

/// Key/value settings held in one JSON array document.
///
/// The in-memory copy is authoritative between writes. It is dropped by
/// `invalidate_cache` and reloaded lazily according to the reload policy; the
/// cache lock is held across every read-modify-write.
pub struct SettingsRepository {
    dir: PathBuf,
    files: FileStore,
    crypto: Arc<EncryptionService>,
    write_options: WriteOptions,
    reload: ReloadPolicy,
    events: EventBus,
    initialized: AtomicBool,
    cache: Mutex<SettingsCache>,
}

impl SettingsRepository {
    pub fn new(config: &StorageConfig, crypto: Arc<EncryptionService>) -> Self {
        Self {
            dir: config.settings_dir(),
            files: FileStore::new(config.transaction_log),
            crypto,
            write_options: config.write,
            reload: config.settings_reload,
            events: EventBus::new(),
            initialized: AtomicBool::new(false),
            cache: Mutex::new(None),
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    pub async fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().await;
        *cache = None;
    }

    /// Decrypted `key -> value` view of every setting.
    pub async fn get_settings_map(&self) -> AppResult<Map<String, Value>> {
        self.ensure_initialized()?;
        let records = {
            let mut cache = self.cache.lock().await;
            self.loaded(&mut cache).await.records.clone()
        };
        let mut map = Map::new();
        for record in &records {
            map.insert(record.key.clone(), self.plain_value(record).await?);
        }
        Ok(map)
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AppError::NotInitialized("settings repository".to_string()));
        }
        Ok(())
    }

    async fn load_from_disk(&self) -> SettingsDocument {
        let path = self.settings_path();
        let document = self.files.read_json_file(&path, Value::Null).await;
        SettingsDocument::parse(&path, document)
    }

    /// Returns the cached document, reloading from disk when the policy asks for it.
    async fn loaded<'a>(&self, cache: &'a mut MutexGuard<'_, SettingsCache>) -> &'a mut SettingsDocument {
        if cache.is_none() || self.reload == ReloadPolicy::Always {
            **cache = Some(self.load_from_disk().await);
        }
        cache.get_or_insert_with(SettingsDocument::empty)
    }

    async fn persist(&self, document: &SettingsDocument) -> AppResult<()> {
        let path = self.settings_path();
        if !document.writable {
            return Err(AppError::Io(format!(
                "refusing to overwrite {}: existing content is not a settings array",
                path.display()
            )));
        }
        let json = document.to_json()?;
        self.files
            .with_transaction(
                "saveSettings",
                &path,
                None,
                self.files.write_json_file(&path, &json, self.write_options),
            )
            .await
    }

    async fn plain_value(&self, record: &SettingRecord) -> AppResult<Value> {
        if !record.encrypted {
            return Ok(record.value.clone());
        }
        let payload = record
            .sealed_payload()
            .ok_or_else(|| AppError::Crypto(format!("encrypted setting '{}' is incomplete", record.key)))?;
        self.crypto.decrypt_data(&payload).await
    }

    fn observe<T>(&self, operation: &str, result: AppResult<T>) -> AppResult<T> {
        if let Err(error) = &result {
            tracing::error!(operation, error = %error, "settings operation failed");
            self.events.publish(StorageEvent::Error {
                operation: operation.to_string(),
                entity_type: None,
                message: error.to_string(),
            });
        }
        result
    }

    async fn get_inner(&self, key: &str, default: Value) -> AppResult<Value> {
        let record = {
            let mut cache = self.cache.lock().await;
            self.loaded(&mut cache)
                .await
                .records
                .iter()
                .find(|record| record.key == key)
                .cloned()
        };
        match record {
            Some(record) => self.plain_value(&record).await,
            None => Ok(default),
        }
    }

    async fn set_inner(&self, key: &str, value: Value, options: SettingOptions) -> AppResult<bool> {
        if key.is_empty() {
            return Err(AppError::InvalidInput("setting key must not be empty".to_string()));
        }
        let mut cache = self.cache.lock().await;
        let document = self.loaded(&mut cache).await;

        let sealed = if options.encrypted {
            self.crypto.encrypt_data(&value).await?
        } else {
            SealedValue::Plain { data: value.clone() }
        };
        let now = Utc::now();
        let mut next = SettingRecord {
            key: key.to_string(),
            value: Value::Null,
            encrypted: false,
            iv: None,
            salt: None,
            auth_tag: None,
            created_at: now,
            updated_at: now,
        };
        match sealed {
            SealedValue::Encrypted(payload) => {
                next.value = Value::String(payload.data);
                next.encrypted = true;
                next.iv = Some(payload.iv);
                next.salt = Some(payload.salt);
                next.auth_tag = Some(payload.auth_tag);
            }
            SealedValue::Plain { data } => next.value = data,
        }

        let position = document.records.iter().position(|record| record.key == key);
        let old_value = match position {
            Some(index) => {
                let previous = &document.records[index];
                next.created_at = previous.created_at;
                self.plain_value(previous).await.ok()
            }
            None => None,
        };

        let mut staged = document.clone();
        match position {
            Some(index) => staged.records[index] = next,
            None => staged.records.push(next),
        }
        self.persist(&staged).await?;
        *document = staged;
        drop(cache);

        self.events.publish(StorageEvent::SettingChanged {
            key: key.to_string(),
            value,
            old_value,
        });
        Ok(true)
    }

    async fn delete_inner(&self, key: &str) -> AppResult<bool> {
        let mut cache = self.cache.lock().await;
        let document = self.loaded(&mut cache).await;
        let Some(index) = document.records.iter().position(|record| record.key == key) else {
            return Ok(false);
        };

        let mut staged = document.clone();
        staged.records.remove(index);
        self.persist(&staged).await?;
        *document = staged;
        drop(cache);

        self.events.publish(StorageEvent::SettingDeleted { key: key.to_string() });
        Ok(true)
    }
}

#[async_trait]
impl SettingsStore for SettingsRepository {
    async fn initialize(&self) -> AppResult<()> {
        self.files.ensure_dir(&self.dir).await?;
        let path = self.settings_path();
        let document = if self.files.file_exists(&path).await {
            self.load_from_disk().await
        } else {
            self.files.write_json_file(&path, &Value::Array(Vec::new()), self.write_options).await?;
            SettingsDocument::empty()
        };
        *self.cache.lock().await = Some(document);
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(path = %path.display(), "settings repository initialized");
        self.events.publish(StorageEvent::Initialized);
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn get_setting(&self, key: &str, default: Value) -> AppResult<Value> {
        self.ensure_initialized()?;
        let result = self.get_inner(key, default).await;
        self.observe("getSetting", result)
    }

    async fn set_setting(&self, key: &str, value: Value, options: SettingOptions) -> AppResult<bool> {
        self.ensure_initialized()?;
        let result = self.set_inner(key, value, options).await;
        self.observe("setSetting", result)
    }

    async fn delete_setting(&self, key: &str) -> AppResult<bool> {
        self.ensure_initialized()?;
        let result = self.delete_inner(key).await;
        self.observe("deleteSetting", result)
    }

    /// Raw records, encryption markers included.
    async fn get_all_settings(&self) -> AppResult<Vec<SettingRecord>> {
        self.ensure_initialized()?;
        let mut cache = self.cache.lock().await;
        Ok(self.loaded(&mut cache).await.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use serde_json::json;

    fn test_config(root: &std::path::Path) -> StorageConfig {
        let mut config = StorageConfig::with_root(root);
        config.transaction_log = false;
        config.encryption = EncryptionConfig {
            enabled: true,
            secret: Some("test-secret".to_string()),
            iterations: 1_000,
        };
        config
    }

    async fn repository(config: &StorageConfig) -> SettingsRepository {
        let crypto = Arc::new(EncryptionService::new(&config.encryption).expect("crypto"));
        let repo = SettingsRepository::new(config, crypto);
        repo.initialize().await.expect("initialize");
        repo
    }

    fn raw_settings(root: &std::path::Path) -> Value {
        serde_json::from_slice(&std::fs::read(root.join("settings/settings.json")).expect("settings file"))
            .expect("settings json")
    }

    #[tokio::test]
    async fn initialize_creates_empty_document() {
        let root = tempfile::tempdir().expect("temp root");
        let _repo = repository(&test_config(root.path())).await;
        assert_eq!(raw_settings(root.path()), json!([]));
    }

    #[tokio::test]
    async fn uninitialized_calls_are_rejected() {
        let root = tempfile::tempdir().expect("temp root");
        let config = test_config(root.path());
        let repo = SettingsRepository::new(&config, Arc::new(EncryptionService::disabled()));
        let error = repo.get_setting("theme", Value::Null).await.expect_err("not initialized");
        assert_eq!(error.code(), "NOT_INITIALIZED");
    }

    #[tokio::test]
    async fn missing_key_returns_default() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(&test_config(root.path())).await;
        assert_eq!(repo.get_setting("theme", json!("light")).await.expect("get"), json!("light"));
    }

    #[tokio::test]
    async fn repeated_set_keeps_a_single_record() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(&test_config(root.path())).await;
        repo.set_setting("theme", json!("dark"), SettingOptions::default()).await.expect("first");
        let first = repo.get_all_settings().await.expect("all")[0].clone();
        repo.set_setting("theme", json!("dark"), SettingOptions::default()).await.expect("second");

        let all = repo.get_all_settings().await.expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, "theme");
        assert_eq!(all[0].value, json!("dark"));
        assert_eq!(all[0].created_at, first.created_at);
        assert_eq!(raw_settings(root.path()).as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn encrypted_setting_is_never_plaintext_on_disk() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(&test_config(root.path())).await;
        repo.set_setting("apiKey", json!("secret"), SettingOptions { encrypted: true })
            .await
            .expect("set");

        let raw = raw_settings(root.path());
        assert_eq!(raw[0]["encrypted"], true);
        assert!(raw[0]["iv"].is_string());
        assert_ne!(raw[0]["value"], "secret");
        assert!(!raw.to_string().contains("\"secret\""));
        assert_eq!(repo.get_setting("apiKey", Value::Null).await.expect("get"), json!("secret"));

        let map = repo.get_settings_map().await.expect("map");
        assert_eq!(map["apiKey"], "secret");
        assert!(repo.get_all_settings().await.expect("all")[0].encrypted);
    }

    #[tokio::test]
    async fn change_events_report_old_value() {
        let root = tempfile::tempdir().expect("temp root");
        let repo = repository(&test_config(root.path())).await;
        let mut receiver = repo.events().subscribe();
        repo.set_setting("volume", json!(3), SettingOptions::default()).await.expect("set");
        repo.set_setting("volume", json!(7), SettingOptions::default()).await.expect("set");
        assert!(repo.delete_setting("volume").await.expect("delete"));
        assert!(!repo.delete_setting("volume").await.expect("delete again"));

        assert_eq!(
            receiver.recv().await.expect("first"),
            StorageEvent::SettingChanged {
                key: "volume".into(),
                value: json!(3),
                old_value: None
            }
        );
        assert_eq!(
            receiver.recv().await.expect("second"),
            StorageEvent::SettingChanged {
                key: "volume".into(),
                value: json!(7),
                old_value: Some(json!(3))
            }
        );
        assert_eq!(
            receiver.recv().await.expect("third"),
            StorageEvent::SettingDeleted { key: "volume".into() }
        );
    }

    #[tokio::test]
    async fn invalidated_cache_reloads_from_disk() {
        let root = tempfile::tempdir().expect("temp root");
        let config = test_config(root.path());
        let repo = repository(&config).await;
        repo.set_setting("theme", json!("dark"), SettingOptions::default()).await.expect("set");

        let mut external = raw_settings(root.path());
        external[0]["value"] = json!("solarized");
        std::fs::write(root.path().join("settings/settings.json"), external.to_string()).expect("external edit");

        assert_eq!(repo.get_setting("theme", Value::Null).await.expect("cached"), json!("dark"));
        repo.invalidate_cache().await;
        assert_eq!(repo.get_setting("theme", Value::Null).await.expect("reloaded"), json!("solarized"));
    }

    #[tokio::test]
    async fn always_policy_rereads_every_call() {
        let root = tempfile::tempdir().expect("temp root");
        let mut config = test_config(root.path());
        config.settings_reload = ReloadPolicy::Always;
        let repo = repository(&config).await;
        repo.set_setting("theme", json!("dark"), SettingOptions::default()).await.expect("set");

        let mut external = raw_settings(root.path());
        external[0]["value"] = json!("light");
        std::fs::write(root.path().join("settings/settings.json"), external.to_string()).expect("external edit");
        assert_eq!(repo.get_setting("theme", Value::Null).await.expect("get"), json!("light"));
    }

    #[tokio::test]
    async fn partial_and_foreign_entries_survive_a_rewrite() {
        let root = tempfile::tempdir().expect("temp root");
        let config = test_config(root.path());
        std::fs::create_dir_all(root.path().join("settings")).expect("settings dir");
        std::fs::write(
            root.path().join("settings/settings.json"),
            json!([
                {"key": "theme", "value": "dark", "encrypted": false,
                 "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"},
                {"key": "volume", "value": 4},
                {"note": "written by another tool"}
            ])
            .to_string(),
        )
        .expect("seed settings");

        let repo = repository(&config).await;
        assert_eq!(repo.get_setting("theme", Value::Null).await.expect("theme"), json!("dark"));
        assert_eq!(repo.get_setting("volume", Value::Null).await.expect("volume"), json!(4));

        repo.set_setting("lang", json!("en"), SettingOptions::default()).await.expect("set");
        let raw = raw_settings(root.path());
        let items = raw.as_array().expect("array");
        assert_eq!(items.len(), 4);
        let keys: Vec<&str> = items.iter().filter_map(|item| item["key"].as_str()).collect();
        assert_eq!(keys, vec!["theme", "volume", "lang"]);
        assert!(items.iter().any(|item| item["note"] == "written by another tool"));
        assert!(items[1]["createdAt"].is_string());
    }

    #[tokio::test]
    async fn non_array_document_is_never_overwritten() {
        let root = tempfile::tempdir().expect("temp root");
        let config = test_config(root.path());
        std::fs::create_dir_all(root.path().join("settings")).expect("settings dir");
        std::fs::write(root.path().join("settings/settings.json"), r#"{"theme": "dark"}"#).expect("seed");

        let repo = repository(&config).await;
        let error = repo
            .set_setting("lang", json!("en"), SettingOptions::default())
            .await
            .expect_err("refuses to overwrite");
        assert_eq!(error.code(), "IO_FAILURE");
        assert_eq!(raw_settings(root.path()), json!({"theme": "dark"}));
    }

    #[tokio::test]
    async fn settings_survive_a_new_repository_instance() {
        let root = tempfile::tempdir().expect("temp root");
        let config = test_config(root.path());
        {
            let repo = repository(&config).await;
            repo.set_setting("pomodoroMinutes", json!(25), SettingOptions::default()).await.expect("set");
        }
        let reopened = repository(&config).await;
        assert_eq!(reopened.get_setting("pomodoroMinutes", Value::Null).await.expect("get"), json!(25));
    }
}
