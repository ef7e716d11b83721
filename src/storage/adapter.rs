use crate::config::StorageConfig;
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, EventSource, SourcedEvent, StorageEvent};
use crate::models::{EntityOptions, ReadOptions, Record, SettingOptions, SettingRecord};
use crate::storage::crypto::EncryptionService;
use crate::storage::entities::EntityRepository;
use crate::storage::metadata::MetadataRepository;
use crate::storage::settings::SettingsRepository;
use crate::storage::{EntityPredicate, EntityStore, MetadataStore, SettingsStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// One entry point over the entity, settings and metadata repositories.
///
/// Any repository may be left out. Calls fail with `AdapterNotInitialized`
/// until `initialize` has run, and with `RepositoryUnavailable` when the
/// repository they need was never supplied.
pub struct StorageAdapter<E = EntityRepository, S = SettingsRepository, M = MetadataRepository>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    entities: Option<Arc<E>>,
    settings: Option<Arc<S>>,
    metadata: Option<Arc<M>>,
    crypto: Option<Arc<EncryptionService>>,
    events: EventBus<SourcedEvent>,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    forwarders: Mutex<HashMap<EventSource, JoinHandle<()>>>,
}

impl StorageAdapter {
    /// Wires the file-backed repositories for `config` around one encryption service.
    pub fn from_config(config: &StorageConfig) -> AppResult<Self> {
        let crypto = Arc::new(EncryptionService::new(&config.encryption)?);
        Ok(Self::new(
            Some(Arc::new(EntityRepository::new(config, crypto.clone()))),
            Some(Arc::new(SettingsRepository::new(config, crypto.clone()))),
            Some(Arc::new(MetadataRepository::new(config))),
        )
        .with_encryption(crypto))
    }
}

impl<E, S, M> StorageAdapter<E, S, M>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    pub fn new(entities: Option<Arc<E>>, settings: Option<Arc<S>>, metadata: Option<Arc<M>>) -> Self {
        Self {
            entities,
            settings,
            metadata,
            crypto: None,
            events: EventBus::new(),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Also forwards the encryption service's decrypt failures to subscribers.
    pub fn with_encryption(mut self, crypto: Arc<EncryptionService>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Initializes every supplied repository. Safe to retry after a failure and
    /// to call concurrently; each repository gets exactly one event forwarder.
    pub async fn initialize(&self) -> AppResult<()> {
        let _init = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        if let Some(crypto) = &self.crypto {
            self.ensure_forwarder(EventSource::Encryption, crypto.events());
        }
        if let Some(entities) = &self.entities {
            self.ensure_forwarder(EventSource::Entity, entities.events());
            entities.initialize().await?;
        }
        if let Some(settings) = &self.settings {
            self.ensure_forwarder(EventSource::Settings, settings.events());
            settings.initialize().await?;
        }
        if let Some(metadata) = &self.metadata {
            self.ensure_forwarder(EventSource::Metadata, metadata.events());
            metadata.initialize().await?;
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            entities = self.entities.is_some(),
            settings = self.settings.is_some(),
            metadata = self.metadata.is_some(),
            "storage adapter initialized"
        );
        self.events.publish(SourcedEvent::untagged(StorageEvent::Initialized));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourcedEvent> {
        self.events.subscribe()
    }

    pub fn entity_repository(&self) -> Option<&Arc<E>> {
        self.entities.as_ref()
    }

    pub fn settings_repository(&self) -> Option<&Arc<S>> {
        self.settings.as_ref()
    }

    pub fn metadata_repository(&self) -> Option<&Arc<M>> {
        self.metadata.as_ref()
    }

    fn ensure_forwarder(&self, source: EventSource, events: &EventBus) {
        let mut forwarders = self.forwarders.lock().unwrap_or_else(PoisonError::into_inner);
        if !forwarders.contains_key(&source) {
            forwarders.insert(source, self.forward(source, events.subscribe()));
        }
    }

    fn forward(&self, source: EventSource, mut receiver: broadcast::Receiver<StorageEvent>) -> JoinHandle<()> {
        let bus = self.events.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => bus.publish(SourcedEvent::tagged(source, event)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(source = ?source, skipped, "event forwarder fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn ensure_ready(&self) -> AppResult<()> {
        if !self.is_initialized() {
            return Err(AppError::AdapterNotInitialized);
        }
        Ok(())
    }

    fn entity_store(&self) -> AppResult<&E> {
        self.ensure_ready()?;
        self.entities
            .as_deref()
            .ok_or_else(|| AppError::RepositoryUnavailable("entity".to_string()))
    }

    fn settings_store(&self) -> AppResult<&S> {
        self.ensure_ready()?;
        self.settings
            .as_deref()
            .ok_or_else(|| AppError::RepositoryUnavailable("settings".to_string()))
    }

    fn metadata_store(&self) -> AppResult<&M> {
        self.ensure_ready()?;
        self.metadata
            .as_deref()
            .ok_or_else(|| AppError::RepositoryUnavailable("metadata".to_string()))
    }

    pub async fn create_entity(&self, entity_type: &str, data: Record, options: &EntityOptions) -> AppResult<Record> {
        self.entity_store()?.create_entity(entity_type, data, options).await
    }

    pub async fn get_entity(&self, entity_type: &str, id: &str, options: ReadOptions) -> AppResult<Option<Record>> {
        self.entity_store()?.get_entity(entity_type, id, options).await
    }

    pub async fn get_all_entities(&self, entity_type: &str, options: ReadOptions) -> AppResult<Vec<Record>> {
        self.entity_store()?.get_all_entities(entity_type, options).await
    }

    pub async fn update_entity(
        &self,
        entity_type: &str,
        id: &str,
        partial: Record,
        options: &EntityOptions,
    ) -> AppResult<Option<Record>> {
        self.entity_store()?.update_entity(entity_type, id, partial, options).await
    }

    pub async fn delete_entity(&self, entity_type: &str, id: &str) -> AppResult<bool> {
        self.entity_store()?.delete_entity(entity_type, id).await
    }

    pub async fn search_entities(
        &self,
        entity_type: &str,
        predicate: EntityPredicate<'_>,
        options: ReadOptions,
    ) -> AppResult<Vec<Record>> {
        self.entity_store()?.search_entities(entity_type, predicate, options).await
    }

    pub async fn get_setting(&self, key: &str, default: Value) -> AppResult<Value> {
        self.settings_store()?.get_setting(key, default).await
    }

    pub async fn set_setting(&self, key: &str, value: Value, options: SettingOptions) -> AppResult<bool> {
        self.settings_store()?.set_setting(key, value, options).await
    }

    pub async fn delete_setting(&self, key: &str) -> AppResult<bool> {
        self.settings_store()?.delete_setting(key).await
    }

    pub async fn get_all_settings(&self) -> AppResult<Vec<SettingRecord>> {
        self.settings_store()?.get_all_settings().await
    }

    pub async fn get_metadata(&self, key: &str, default: Value) -> AppResult<Value> {
        self.metadata_store()?.get_metadata(key, default).await
    }

    pub async fn store_metadata(&self, key: &str, value: Value) -> AppResult<bool> {
        self.metadata_store()?.store_metadata(key, value).await
    }

    pub async fn update_metadata(&self, key: &str, partial: Record) -> AppResult<Record> {
        self.metadata_store()?.update_metadata(key, partial).await
    }

    pub async fn delete_metadata(&self, key: &str) -> AppResult<bool> {
        self.metadata_store()?.delete_metadata(key).await
    }

    pub async fn list_metadata_keys(&self) -> AppResult<Vec<String>> {
        self.metadata_store()?.list_metadata_keys().await
    }
}

impl<E, S, M> Drop for StorageAdapter<E, S, M>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    fn drop(&mut self) {
        let forwarders = self.forwarders.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
    }
}
