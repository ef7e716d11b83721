use crate::config::StorageConfig;
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StorageEvent};
use crate::models::{EncryptedField, EncryptedPayload, EntityOptions, ReadOptions, Record, SealedValue, WriteOptions};
use crate::storage::crypto::EncryptionService;
use crate::storage::file_io::FileStore;
use crate::storage::{validate_component, EntityPredicate, EntityStore};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const RECORD_MARKER: &str = "_encrypted";
const MARKER_SUFFIX: &str = "_encrypted";

pub struct EntityRepository {
    root: PathBuf,
    files: FileStore,
    crypto: Arc<EncryptionService>,
    write_options: WriteOptions,
    events: EventBus,
    initialized: AtomicBool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntityRepository {
    pub fn new(config: &StorageConfig, crypto: Arc<EncryptionService>) -> Self {
        Self {
            root: config.entities_dir(),
            files: FileStore::new(config.transaction_log),
            crypto,
            write_options: config.write,
            events: EventBus::new(),
            initialized: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn entity_exists(&self, entity_type: &str, id: &str) -> AppResult<bool> {
        self.ensure_initialized()?;
        let path = self.entity_path(entity_type, id)?;
        Ok(self.files.file_exists(&path).await)
    }

    /// Entity types that have a directory on disk, sorted.
    pub async fn list_entity_types(&self) -> AppResult<Vec<String>> {
        self.ensure_initialized()?;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut types = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                types.push(name);
            }
        }
        types.sort();
        Ok(types)
    }

    fn ensure_initialized(&self) -> AppResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AppError::NotInitialized("entity repository".to_string()));
        }
        Ok(())
    }

    fn type_dir(&self, entity_type: &str) -> AppResult<PathBuf> {
        validate_component("entity type", entity_type)?;
        Ok(self.root.join(entity_type))
    }

    fn entity_path(&self, entity_type: &str, id: &str) -> AppResult<PathBuf> {
        validate_component("entity id", id)?;
        Ok(self.type_dir(entity_type)?.join(format!("{}.json", id)))
    }

    async fn key_lock(&self, entity_type: &str, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(format!("{}/{}", entity_type, id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `action` while holding the record's lock, then drops the lock entry
    /// if nobody else is holding or waiting on it.
    async fn with_key_lock<T>(&self, entity_type: &str, id: &str, action: impl Future<Output = T>) -> T {
        let lock = self.key_lock(entity_type, id).await;
        let result = {
            let _guard = lock.lock().await;
            action.await
        };
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&format!("{}/{}", entity_type, id));
        }
        result
    }

    fn observe<T>(&self, operation: &str, entity_type: &str, result: AppResult<T>) -> AppResult<T> {
        if let Err(error) = &result {
            tracing::error!(operation, entity_type, error = %error, "entity operation failed");
            self.events.publish(StorageEvent::Error {
                operation: operation.to_string(),
                entity_type: Some(entity_type.to_string()),
                message: error.to_string(),
            });
        }
        result
    }

    async fn create_inner(&self, entity_type: &str, mut data: Record, options: &EntityOptions) -> AppResult<Record> {
        let id = match data.get("id") {
            None | Some(Value::Null) => new_entity_id(),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(AppError::InvalidInput(format!("entity id must be a string, got {}", other)));
            }
        };
        let path = self.entity_path(entity_type, &id)?;

        let now = timestamp();
        data.insert("id".to_string(), Value::String(id.clone()));
        if !data.contains_key("createdAt") {
            data.insert("createdAt".to_string(), Value::String(now.clone()));
        }
        if !data.contains_key("updatedAt") {
            data.insert("updatedAt".to_string(), Value::String(now));
        }

        self.with_key_lock(entity_type, &id, async {
            if self.files.file_exists(&path).await {
                return Err(AppError::InvalidInput(format!("{} '{}' already exists", entity_type, id)));
            }
            let disk = self.seal_record(data.clone(), options).await?;
            let detail = json!({ "entityType": entity_type, "id": id });
            self.files
                .with_transaction(
                    "createEntity",
                    &path,
                    Some(&detail),
                    self.files.write_json_file(&path, &disk, self.write_options),
                )
                .await
        })
        .await?;

        self.events.publish(StorageEvent::EntityCreated {
            entity_type: entity_type.to_string(),
            id,
            data: data.clone(),
        });
        Ok(data)
    }

    async fn get_inner(&self, entity_type: &str, id: &str, options: ReadOptions) -> AppResult<Option<Record>> {
        let path = self.entity_path(entity_type, id)?;
        let Some(disk) = self.read_disk_record(&path).await else {
            return Ok(None);
        };
        if !options.decrypt {
            return Ok(Some(disk));
        }
        let (record, _) = self.open_record(disk).await?;
        Ok(Some(record))
    }

    async fn get_all_inner(&self, entity_type: &str, options: ReadOptions) -> AppResult<Vec<Record>> {
        let dir = self.type_dir(entity_type)?;
        let mut records = Vec::new();
        for stem in self.files.list_json_stems(&dir).await? {
            let Some(disk) = self.read_disk_record(&dir.join(format!("{}.json", stem))).await else {
                continue;
            };
            if options.decrypt {
                records.push(self.open_record(disk).await?.0);
            } else {
                records.push(disk);
            }
        }
        Ok(records)
    }

    async fn update_inner(
        &self,
        entity_type: &str,
        id: &str,
        partial: Record,
        options: &EntityOptions,
    ) -> AppResult<Option<Record>> {
        let path = self.entity_path(entity_type, id)?;
        let updated = self
            .with_key_lock(entity_type, id, async {
                let Some(disk) = self.read_disk_record(&path).await else {
                    return Ok(None);
                };
                let (mut record, stored_mode) = self.open_record(disk).await?;

                for (key, value) in partial {
                    if key == "id" || key == "createdAt" {
                        continue;
                    }
                    record.insert(key, value);
                }
                record.insert("id".to_string(), Value::String(id.to_string()));
                record.insert("updatedAt".to_string(), Value::String(timestamp()));

                // A plain update keeps whatever protection the stored record already had.
                let mode = if options.is_plain() { &stored_mode } else { options };
                let disk = self.seal_record(record.clone(), mode).await?;
                let detail = json!({ "entityType": entity_type, "id": id });
                self.files
                    .with_transaction(
                        "updateEntity",
                        &path,
                        Some(&detail),
                        self.files.write_json_file(&path, &disk, self.write_options),
                    )
                    .await?;
                Ok::<_, AppError>(Some(record))
            })
            .await?;

        if let Some(record) = &updated {
            self.events.publish(StorageEvent::EntityUpdated {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
                data: record.clone(),
            });
        }
        Ok(updated)
    }

    async fn delete_inner(&self, entity_type: &str, id: &str) -> AppResult<bool> {
        let path = self.entity_path(entity_type, id)?;
        let detail = json!({ "entityType": entity_type, "id": id });
        let removed = self
            .with_key_lock(
                entity_type,
                id,
                self.files
                    .with_transaction("deleteEntity", &path, Some(&detail), self.files.delete_file(&path)),
            )
            .await?;
        if !removed {
            return Ok(false);
        }
        self.events.publish(StorageEvent::EntityDeleted {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        });
        Ok(true)
    }

    async fn read_disk_record(&self, path: &std::path::Path) -> Option<Record> {
        if !self.files.file_exists(path).await {
            return None;
        }
        match self.files.read_json_file(path, Value::Null).await {
            Value::Object(record) => Some(record),
            Value::Null => None,
            other => {
                tracing::warn!(path = %path.display(), kind = %json_kind(&other), "skipping non-object entity file");
                None
            }
        }
    }

    /// Applies whole-record or per-field encryption for writing to disk.
    async fn seal_record(&self, record: Record, options: &EntityOptions) -> AppResult<Record> {
        if options.encrypt {
            return match self.crypto.encrypt_data(&Value::Object(record.clone())).await? {
                SealedValue::Encrypted(payload) => {
                    let Value::Object(mut disk) = serde_json::to_value(payload)? else {
                        return Err(AppError::Internal("encrypted payload is not an object".to_string()));
                    };
                    disk.insert(RECORD_MARKER.to_string(), Value::Bool(true));
                    Ok(disk)
                }
                SealedValue::Plain { .. } => Ok(record),
            };
        }

        let mut sealed = FieldSealedRecord {
            plain: record,
            fields: Vec::new(),
        };
        for name in &options.encrypt_fields {
            if name == "id" {
                tracing::warn!("the id field is never encrypted");
                continue;
            }
            let Some(value) = sealed.plain.get(name) else {
                continue;
            };
            if let SealedValue::Encrypted(payload) = self.crypto.encrypt_data(value).await? {
                sealed.plain.remove(name);
                sealed.fields.push(EncryptedField::from_payload(name, payload));
            }
        }
        Ok(sealed.into_disk())
    }

    /// Reverses whichever encryption mode the stored record uses and reports that mode.
    async fn open_record(&self, disk: Record) -> AppResult<(Record, EntityOptions)> {
        if disk.get(RECORD_MARKER) == Some(&Value::Bool(true)) {
            let payload: EncryptedPayload = serde_json::from_value(Value::Object(disk))
                .map_err(|error| AppError::Crypto(format!("malformed encrypted record: {}", error)))?;
            return match self.crypto.decrypt_data(&payload).await? {
                Value::Object(record) => Ok((record, EntityOptions::encrypt_record())),
                _ => Err(AppError::Crypto("decrypted record is not an object".to_string())),
            };
        }

        let sealed = FieldSealedRecord::from_disk(disk)?;
        let names: Vec<String> = sealed.fields.iter().map(|field| field.name.clone()).collect();
        let mut record = sealed.plain;
        for field in &sealed.fields {
            let value = self.crypto.decrypt_data(&field.payload()).await?;
            record.insert(field.name.clone(), value);
        }
        Ok((record, EntityOptions::encrypt_fields(names)))
    }
}

#[async_trait]
impl EntityStore for EntityRepository {
    async fn initialize(&self) -> AppResult<()> {
        self.files.ensure_dir(&self.root).await?;
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(root = %self.root.display(), "entity repository initialized");
        self.events.publish(StorageEvent::Initialized);
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn create_entity(&self, entity_type: &str, data: Record, options: &EntityOptions) -> AppResult<Record> {
        self.ensure_initialized()?;
        let result = self.create_inner(entity_type, data, options).await;
        self.observe("createEntity", entity_type, result)
    }

    async fn get_entity(&self, entity_type: &str, id: &str, options: ReadOptions) -> AppResult<Option<Record>> {
        self.ensure_initialized()?;
        let result = self.get_inner(entity_type, id, options).await;
        self.observe("getEntity", entity_type, result)
    }

    async fn get_all_entities(&self, entity_type: &str, options: ReadOptions) -> AppResult<Vec<Record>> {
        self.ensure_initialized()?;
        let result = self.get_all_inner(entity_type, options).await;
        self.observe("getAllEntities", entity_type, result)
    }

    async fn update_entity(
        &self,
        entity_type: &str,
        id: &str,
        partial: Record,
        options: &EntityOptions,
    ) -> AppResult<Option<Record>> {
        self.ensure_initialized()?;
        let result = self.update_inner(entity_type, id, partial, options).await;
        self.observe("updateEntity", entity_type, result)
    }

    async fn delete_entity(&self, entity_type: &str, id: &str) -> AppResult<bool> {
        self.ensure_initialized()?;
        let result = self.delete_inner(entity_type, id).await;
        self.observe("deleteEntity", entity_type, result)
    }

    async fn search_entities(
        &self,
        entity_type: &str,
        predicate: EntityPredicate<'_>,
        options: ReadOptions,
    ) -> AppResult<Vec<Record>> {
        self.ensure_initialized()?;
        let result = self
            .get_all_inner(entity_type, options)
            .await
            .map(|records| records.into_iter().filter(|record| predicate(record)).collect());
        self.observe("searchEntities", entity_type, result)
    }
}

/// Plain fields plus the side table of field-level ciphertexts.
struct FieldSealedRecord {
    plain: Record,
    fields: Vec<EncryptedField>,
}

impl FieldSealedRecord {
    fn into_disk(self) -> Record {
        let mut disk = self.plain;
        for field in self.fields {
            disk.insert(format!("{}_iv", field.name), Value::String(field.iv));
            disk.insert(format!("{}_salt", field.name), Value::String(field.salt));
            disk.insert(format!("{}_authTag", field.name), Value::String(field.auth_tag));
            disk.insert(format!("{}{}", field.name, MARKER_SUFFIX), Value::Bool(true));
            disk.insert(field.name, Value::String(field.ciphertext));
        }
        disk
    }

    fn from_disk(mut disk: Record) -> AppResult<Self> {
        let names: Vec<String> = disk
            .iter()
            .filter(|(key, value)| key.as_str() != RECORD_MARKER && **value == Value::Bool(true))
            .filter_map(|(key, _)| key.strip_suffix(MARKER_SUFFIX))
            .filter(|name| !name.is_empty() && disk.contains_key(&format!("{}_iv", name)))
            .map(str::to_string)
            .collect();

        let mut fields = Vec::with_capacity(names.len());
        for name in names {
            let mut take = |suffix: &str| match disk.remove(&format!("{}{}", name, suffix)) {
                Some(Value::String(value)) => Ok(value),
                _ => Err(AppError::Crypto(format!("encrypted field '{}' is missing '{}'", name, suffix))),
            };
            let iv = take("_iv")?;
            let salt = take("_salt")?;
            let auth_tag = take("_authTag")?;
            let ciphertext = take("")?;
            disk.remove(&format!("{}{}", name, MARKER_SUFFIX));
            fields.push(EncryptedField {
                name,
                ciphertext,
                iv,
                salt,
                auth_tag,
            });
        }
        Ok(Self { plain: disk, fields })
    }
}

fn new_entity_id() -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("entity_{}_{}", Utc::now().timestamp_millis(), &short[..9])
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
