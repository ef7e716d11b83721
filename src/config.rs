use crate::errors::{AppError, AppResult};
use crate::models::{ReloadPolicy, WriteOptions};
use crate::secrets::SecretSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub secret: Option<String>,
    pub iterations: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("enabled", &self.enabled)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("iterations", &self.iterations)
            .finish()
    }
}

/// Where `init_tracing` writes its JSON log and which filter it applies when
/// `RUST_LOG` is unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            file_name: "storage.log".to_string(),
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub root: PathBuf,
    pub encryption: EncryptionConfig,
    pub write: WriteOptions,
    pub transaction_log: bool,
    pub settings_reload: ReloadPolicy,
    pub logging: LoggingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            encryption: EncryptionConfig::default(),
            write: WriteOptions::default(),
            transaction_log: true,
            settings_reload: ReloadPolicy::IfMissing,
            logging: LoggingConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Loads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => return Err(AppError::Io(format!("{}: {}", path.display(), error))),
        };
        serde_json::from_slice(&raw)
            .map_err(|error| AppError::Config(format!("invalid config {}: {}", path.display(), error)))
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.root.join("entities")
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root.join("settings")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Fills the encryption secret from `source` when encryption is on and none is set.
    pub fn resolve_secret(&mut self, source: &dyn SecretSource) -> AppResult<()> {
        if self.encryption.enabled && self.encryption.secret.is_none() {
            self.encryption.secret = Some(source.load_secret()?);
        }
        Ok(())
    }
}
