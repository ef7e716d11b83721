pub mod adapter;
pub mod crypto;
pub mod entities;
pub mod file_io;
pub mod metadata;
pub mod migration;
pub mod settings;

use crate::errors::{AppError, AppResult};
use crate::events::EventBus;
use crate::models::{EntityOptions, ReadOptions, Record, SettingOptions, SettingRecord};
use async_trait::async_trait;
use serde_json::Value;

/// Predicate for `search_entities`, applied to decrypted records.
pub type EntityPredicate<'a> = &'a (dyn Fn(&Record) -> bool + Send + Sync);

#[async_trait]
pub trait EntityStore: Send + Sync + 'static {
    async fn initialize(&self) -> AppResult<()>;
    fn events(&self) -> &EventBus;

    async fn create_entity(&self, entity_type: &str, data: Record, options: &EntityOptions) -> AppResult<Record>;
    async fn get_entity(&self, entity_type: &str, id: &str, options: ReadOptions) -> AppResult<Option<Record>>;
    async fn get_all_entities(&self, entity_type: &str, options: ReadOptions) -> AppResult<Vec<Record>>;
    async fn update_entity(
        &self,
        entity_type: &str,
        id: &str,
        partial: Record,
        options: &EntityOptions,
    ) -> AppResult<Option<Record>>;
    async fn delete_entity(&self, entity_type: &str, id: &str) -> AppResult<bool>;
    async fn search_entities(
        &self,
        entity_type: &str,
        predicate: EntityPredicate<'_>,
        options: ReadOptions,
    ) -> AppResult<Vec<Record>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    async fn initialize(&self) -> AppResult<()>;
    fn events(&self) -> &EventBus;

    async fn get_setting(&self, key: &str, default: Value) -> AppResult<Value>;
    async fn set_setting(&self, key: &str, value: Value, options: SettingOptions) -> AppResult<bool>;
    async fn delete_setting(&self, key: &str) -> AppResult<bool>;
    async fn get_all_settings(&self) -> AppResult<Vec<SettingRecord>>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn initialize(&self) -> AppResult<()>;
    fn events(&self) -> &EventBus;

    async fn get_metadata(&self, key: &str, default: Value) -> AppResult<Value>;
    async fn store_metadata(&self, key: &str, value: Value) -> AppResult<bool>;
    async fn update_metadata(&self, key: &str, partial: Record) -> AppResult<Record>;
    async fn delete_metadata(&self, key: &str) -> AppResult<bool>;
    async fn list_metadata_keys(&self) -> AppResult<Vec<String>>;
}

/// Rejects names that would escape their directory or collide with sidecar dirs.
pub(crate) fn validate_component(kind: &str, value: &str) -> AppResult<()> {
    let invalid = value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
        || value.contains("..");
    if invalid {
        return Err(AppError::InvalidInput(format!("invalid {} '{}'", kind, value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::validate_component;

    #[test]
    fn path_components_are_validated() {
        assert!(validate_component("id", "entity_1700000000000_abc").is_ok());
        assert!(validate_component("entity type", "focusSessions").is_ok());
        for bad in ["", ".hidden", "a/b", "a\\b", "..", "x..y"] {
            assert!(validate_component("id", bad).is_err(), "{bad} should be rejected");
        }
    }
}
