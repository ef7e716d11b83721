mod config;
mod errors;
mod events;
mod models;
mod secrets;
mod storage;

pub use crate::config::{EncryptionConfig, LoggingConfig, StorageConfig, DEFAULT_KDF_ITERATIONS};
pub use crate::errors::{to_client_error, AppError, AppResult};
pub use crate::events::{EventBus, EventSource, SourcedEvent, StorageEvent};
pub use crate::models::{
    EncryptedField, EncryptedPayload, EntityOptions, MigrationReport, ReadOptions, Record, ReloadPolicy,
    SealedValue, SettingOptions, SettingRecord, WriteOptions,
};
pub use crate::secrets::{KeyringSecretSource, SecretSource, StaticSecret};
pub use crate::storage::adapter::StorageAdapter;
pub use crate::storage::crypto::EncryptionService;
pub use crate::storage::entities::EntityRepository;
pub use crate::storage::file_io::FileStore;
pub use crate::storage::metadata::MetadataRepository;
pub use crate::storage::migration::{migrate_legacy_store, LEGACY_MIGRATION_KEY};
pub use crate::storage::settings::SettingsRepository;
pub use crate::storage::{EntityPredicate, EntityStore, MetadataStore, SettingsStore};

use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Builds the file-backed adapter for `config` and initializes it.
pub async fn open_storage(config: &StorageConfig) -> AppResult<StorageAdapter> {
    let adapter = StorageAdapter::from_config(config)?;
    adapter.initialize().await?;
    Ok(adapter)
}

/// Installs the process-wide JSON logger described by `config`: a daily rolling
/// file under `config.dir`, filtered by `RUST_LOG` or else `config.filter`.
pub fn init_tracing(config: &LoggingConfig) -> AppResult<()> {
    if config.file_name.trim().is_empty() {
        return Err(AppError::Config("log file name must not be empty".to_string()));
    }
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => tracing_subscriber::EnvFilter::try_new(&config.filter)
            .map_err(|error| AppError::Config(format!("invalid log filter '{}': {}", config.filter, error)))?,
    };

    std::fs::create_dir_all(&config.dir)
        .map_err(|error| AppError::Io(format!("failed to create log dir {}: {}", config.dir.display(), error)))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&config.dir, &config.file_name));
    if LOG_GUARD.set(guard).is_err() {
        return Err(AppError::Config("logging is already initialized".to_string()));
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(writer)
        .try_init()
        .map_err(|error| AppError::Config(format!("failed to install log subscriber: {}", error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_config_is_validated_before_installing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let blank = LoggingConfig {
            dir: dir.path().to_path_buf(),
            file_name: " ".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(init_tracing(&blank).expect_err("blank name").code(), "CONFIG_INVALID");
        assert!(LOG_GUARD.get().is_none());
    }
}
