//! One-shot import from the older single-file store.
//!
//! The legacy document is one JSON object: each array-valued key is an entity
//! collection, `settings` is a flat key/value object and `metadata` maps keys
//! to blobs. Completion is recorded under [`LEGACY_MIGRATION_KEY`] so reruns
//! are no-ops.

use crate::errors::{AppError, AppResult};
use crate::models::{EntityOptions, MigrationReport, ReadOptions, SettingOptions};
use crate::storage::adapter::StorageAdapter;
use crate::storage::file_io::FileStore;
use crate::storage::{validate_component, EntityStore, MetadataStore, SettingsStore};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::Path;

pub const LEGACY_MIGRATION_KEY: &str = "migration_legacy_store";

pub async fn migrate_legacy_store<E, S, M>(
    adapter: &StorageAdapter<E, S, M>,
    legacy_file: &Path,
) -> AppResult<MigrationReport>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    let marker = adapter.get_metadata(LEGACY_MIGRATION_KEY, Value::Null).await?;
    if !marker.is_null() {
        tracing::info!(path = %legacy_file.display(), "legacy store already migrated");
        return Ok(MigrationReport {
            already_migrated: true,
            ..MigrationReport::default()
        });
    }

    let files = FileStore::new(false);
    if !files.file_exists(legacy_file).await {
        tracing::info!(path = %legacy_file.display(), "no legacy store to migrate");
        return Ok(MigrationReport::default());
    }
    let document = match files.read_json_file(legacy_file, Value::Null).await {
        Value::Object(document) => document,
        _ => {
            return Err(AppError::InvalidInput(format!(
                "legacy store {} is not a JSON object",
                legacy_file.display()
            )));
        }
    };

    let mut report = MigrationReport::default();
    for (name, value) in document {
        match (name.as_str(), value) {
            ("settings", Value::Object(settings)) => migrate_settings(adapter, settings, &mut report).await?,
            ("metadata", Value::Object(metadata)) => {
                for (key, blob) in metadata {
                    if validate_component("metadata key", &key).is_err() || key == LEGACY_MIGRATION_KEY {
                        report.skipped += 1;
                        continue;
                    }
                    adapter.store_metadata(&key, blob).await?;
                    report.metadata += 1;
                }
            }
            ("settings" | "metadata", _) => {
                tracing::warn!(key = %name, "legacy settings/metadata entry is not an object");
                report.skipped += 1;
            }
            (collection, Value::Array(records)) => {
                migrate_collection(adapter, collection, records, &mut report).await?;
            }
            (other, _) => {
                tracing::warn!(key = other, "skipping unrecognized legacy entry");
                report.skipped += 1;
            }
        }
    }

    adapter
        .store_metadata(
            LEGACY_MIGRATION_KEY,
            json!({
                "completedAt": Utc::now().to_rfc3339(),
                "source": legacy_file.to_string_lossy(),
                "entities": report.entities,
                "settings": report.settings,
                "metadata": report.metadata,
                "skipped": report.skipped,
            }),
        )
        .await?;
    tracing::info!(
        entities = report.entities,
        settings = report.settings,
        metadata = report.metadata,
        skipped = report.skipped,
        "legacy store migrated"
    );
    Ok(report)
}

async fn migrate_settings<E, S, M>(
    adapter: &StorageAdapter<E, S, M>,
    settings: Map<String, Value>,
    report: &mut MigrationReport,
) -> AppResult<()>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    for (key, value) in settings {
        adapter.set_setting(&key, value, SettingOptions::default()).await?;
        report.settings += 1;
    }
    Ok(())
}

async fn migrate_collection<E, S, M>(
    adapter: &StorageAdapter<E, S, M>,
    collection: &str,
    records: Vec<Value>,
    report: &mut MigrationReport,
) -> AppResult<()>
where
    E: EntityStore,
    S: SettingsStore,
    M: MetadataStore,
{
    if validate_component("entity type", collection).is_err() {
        tracing::warn!(collection, "skipping legacy collection with unusable name");
        report.skipped += records.len();
        return Ok(());
    }

    for record in records {
        let Value::Object(record) = record else {
            report.skipped += 1;
            continue;
        };
        if let Some(Value::String(id)) = record.get("id") {
            let usable = validate_component("entity id", id).is_ok();
            if !usable || adapter.get_entity(collection, id, ReadOptions::raw()).await?.is_some() {
                report.skipped += 1;
                continue;
            }
        }
        adapter.create_entity(collection, record, &EntityOptions::default()).await?;
        report.entities += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    async fn adapter(root: &Path) -> StorageAdapter {
        let mut config = StorageConfig::with_root(root.join("store"));
        config.transaction_log = false;
        let adapter = StorageAdapter::from_config(&config).expect("adapter");
        adapter.initialize().await.expect("initialize");
        adapter
    }

    fn write_legacy(root: &Path, document: Value) -> std::path::PathBuf {
        let path = root.join("legacy-store.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&document).expect("json")).expect("legacy file");
        path
    }

    #[tokio::test]
    async fn imports_collections_settings_and_metadata() {
        let root = tempfile::tempdir().expect("temp root");
        let adapter = adapter(root.path()).await;
        let legacy = write_legacy(
            root.path(),
            json!({
                "tasks": [
                    {"id": "t1", "title": "Write report", "createdAt": "2023-05-01T10:00:00.000Z"},
                    {"title": "No id yet"},
                    "not a record"
                ],
                "focusSessions": [{"id": "s1", "minutes": 25}],
                "settings": {"theme": "dark", "dailyGoal": 4},
                "metadata": {"lastSync": {"at": "2023-05-01"}},
                "version": 3
            }),
        );

        let report = migrate_legacy_store(&adapter, &legacy).await.expect("migrate");
        assert_eq!(report.entities, 3);
        assert_eq!(report.settings, 2);
        assert_eq!(report.metadata, 1);
        assert_eq!(report.skipped, 2);
        assert!(!report.already_migrated);

        let task = adapter
            .get_entity("tasks", "t1", ReadOptions::default())
            .await
            .expect("get")
            .expect("migrated task");
        assert_eq!(task["title"], "Write report");
        assert_eq!(task["createdAt"], "2023-05-01T10:00:00.000Z");
        assert_eq!(adapter.get_all_entities("tasks", ReadOptions::default()).await.expect("all").len(), 2);
        assert_eq!(adapter.get_setting("dailyGoal", Value::Null).await.expect("setting"), json!(4));
        assert_eq!(adapter.get_metadata("lastSync", Value::Null).await.expect("meta")["at"], "2023-05-01");
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let root = tempfile::tempdir().expect("temp root");
        let adapter = adapter(root.path()).await;
        let legacy = write_legacy(root.path(), json!({"tasks": [{"id": "t1"}]}));

        migrate_legacy_store(&adapter, &legacy).await.expect("first run");
        let again = migrate_legacy_store(&adapter, &legacy).await.expect("second run");
        assert!(again.already_migrated);
        assert_eq!(again.entities, 0);
        assert!(adapter
            .list_metadata_keys()
            .await
            .expect("keys")
            .contains(&LEGACY_MIGRATION_KEY.to_string()));
    }

    #[tokio::test]
    async fn existing_entities_are_not_overwritten() {
        let root = tempfile::tempdir().expect("temp root");
        let adapter = adapter(root.path()).await;
        let mut current = Map::new();
        current.insert("id".into(), json!("t1"));
        current.insert("title".into(), json!("newer"));
        adapter.create_entity("tasks", current, &EntityOptions::default()).await.expect("seed");

        let legacy = write_legacy(root.path(), json!({"tasks": [{"id": "t1", "title": "older"}]}));
        let report = migrate_legacy_store(&adapter, &legacy).await.expect("migrate");
        assert_eq!(report.skipped, 1);
        let task = adapter
            .get_entity("tasks", "t1", ReadOptions::default())
            .await
            .expect("get")
            .expect("task");
        assert_eq!(task["title"], "newer");
    }

    #[tokio::test]
    async fn missing_legacy_file_migrates_nothing() {
        let root = tempfile::tempdir().expect("temp root");
        let adapter = adapter(root.path()).await;
        let report = migrate_legacy_store(&adapter, &root.path().join("absent.json")).await.expect("migrate");
        assert_eq!(report, MigrationReport::default());
        assert!(adapter.list_metadata_keys().await.expect("keys").is_empty());
    }
}
