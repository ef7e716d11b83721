//! Atomic, backup-protected JSON persistence.
//!
//! Writes go to `<file>.tmp` and are renamed over the destination, so a reader
//! sees either the previous complete document or the new one. The prior content
//! is copied to `<file>.bak` first, and reads that hit malformed JSON restore
//! from that copy. Checksums live in a sibling `.checksums/` directory and
//! transaction markers in a sibling `.transactions/` directory.

use crate::errors::{AppError, AppResult};
use crate::models::WriteOptions;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const CHECKSUM_DIR: &str = ".checksums";
const TRANSACTION_DIR: &str = ".transactions";

#[derive(Debug, Clone)]
pub struct FileStore {
    transaction_log: bool,
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FileStore {
    pub fn new(transaction_log: bool) -> Self {
        Self { transaction_log }
    }

    pub async fn ensure_dir(&self, path: &Path) -> AppResult<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|error| AppError::Io(format!("failed to create directory {}: {}", path.display(), error)))
    }

    pub async fn file_exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Lenient read: absent or unreadable files yield `default`; malformed JSON
    /// is restored from the backup copy when one exists. A document that parses
    /// but does not fit `T` is left untouched on disk and also yields `default`.
    pub async fn read_json_file<T: DeserializeOwned>(&self, path: &Path, default: T) -> T {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return default,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read json file; using default");
                return default;
            }
        };

        let document: Value = match serde_json::from_slice(&bytes) {
            Ok(document) => document,
            Err(error) => {
                tracing::error!(path = %path.display(), error = %error, "malformed json file; attempting backup recovery");
                return self.recover_from_backup(path, default).await;
            }
        };
        match serde_json::from_value(document) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "json file has unexpected shape; using default");
                default
            }
        }
    }

    pub async fn write_json_file<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        data: &T,
        options: WriteOptions,
    ) -> AppResult<()> {
        let tmp = sibling_with_suffix(path, ".tmp");
        let result = self.write_atomic(path, &tmp, data, options).await;
        if let Err(error) = result {
            if self.file_exists(&tmp).await {
                let _ = fs::remove_file(&tmp).await;
            }
            return Err(AppError::Io(format!("failed to write {}: {}", path.display(), error)));
        }
        Ok(())
    }

    async fn write_atomic<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        tmp: &Path,
        data: &T,
        options: WriteOptions,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if options.create_backup && self.file_exists(path).await {
            fs::copy(path, sibling_with_suffix(path, ".bak")).await?;
        }

        let bytes = if options.pretty_print {
            serde_json::to_vec_pretty(data)?
        } else {
            serde_json::to_vec(data)?
        };

        fs::write(tmp, &bytes).await?;
        fs::rename(tmp, path).await?;

        if options.store_checksum {
            let checksum_path = checksum_path(path);
            if let Some(parent) = checksum_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&checksum_path, hex::encode(Sha256::digest(&bytes))).await?;
        }
        Ok(())
    }

    /// Restores `<path>.bak` over `path` and returns its parsed content.
    pub async fn recover_from_backup<T: DeserializeOwned>(&self, path: &Path, default: T) -> T {
        let backup = sibling_with_suffix(path, ".bak");
        let bytes = match fs::read(&backup).await {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::warn!(path = %path.display(), "no usable backup; using default");
                return default;
            }
        };

        let value = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(path = %backup.display(), error = %error, "backup is also malformed; using default");
                return default;
            }
        };

        let tmp = sibling_with_suffix(path, ".tmp");
        let restored = async {
            fs::write(&tmp, &bytes).await?;
            fs::rename(&tmp, path).await
        }
        .await;
        match restored {
            Ok(()) => {
                self.refresh_checksum(path, &bytes).await;
                tracing::info!(path = %path.display(), "restored file from backup");
            }
            Err(error) => {
                let _ = fs::remove_file(&tmp).await;
                tracing::warn!(path = %path.display(), error = %error, "failed to restore backup over corrupted file");
            }
        }
        value
    }

    /// Rewrites an existing checksum sidecar after the store itself replaced the file.
    async fn refresh_checksum(&self, path: &Path, bytes: &[u8]) {
        let sidecar = checksum_path(path);
        if !self.file_exists(&sidecar).await {
            return;
        }
        if let Err(error) = fs::write(&sidecar, hex::encode(Sha256::digest(bytes))).await {
            tracing::warn!(path = %path.display(), error = %error, "failed to refresh checksum after restore");
        }
    }

    pub async fn calculate_checksum(&self, path: &Path) -> AppResult<String> {
        let bytes = fs::read(path)
            .await
            .map_err(|error| AppError::Io(format!("failed to read {}: {}", path.display(), error)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// True when the stored checksum matches, or when none was ever stored.
    pub async fn verify_file_integrity(&self, path: &Path) -> AppResult<bool> {
        let stored = match fs::read_to_string(checksum_path(path)).await {
            Ok(stored) => stored,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(true),
            Err(error) => return Err(error.into()),
        };
        if !self.file_exists(path).await {
            return Ok(false);
        }
        let actual = self.calculate_checksum(path).await?;
        Ok(stored.trim() == actual)
    }

    /// Writes one diagnostic marker file. Failures are logged and swallowed.
    pub async fn log_transaction(&self, operation: &str, path: &Path, data: Option<&Value>) {
        if !self.transaction_log {
            return;
        }
        let Some(dir) = path.parent().map(|parent| parent.join(TRANSACTION_DIR)) else {
            return;
        };
        let now = Utc::now();
        let stamp = now.format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let log_path = dir.join(format!("{}-{}-{}.log", stamp, operation, file_name(path)));
        let entry = json!({
            "operation": operation,
            "filePath": path.to_string_lossy(),
            "timestamp": now.to_rfc3339(),
            "data": data,
        });

        let written = async {
            fs::create_dir_all(&dir).await?;
            fs::write(&log_path, serde_json::to_vec_pretty(&entry)?).await?;
            Ok::<(), AppError>(())
        }
        .await;
        if let Err(error) = written {
            tracing::warn!(path = %path.display(), operation, error = %error, "failed to write transaction log");
        }
    }

    /// Brackets `action` with `<name>_start` and `<name>_complete` / `<name>_failed` markers.
    pub async fn with_transaction<T, F>(&self, name: &str, path: &Path, data: Option<&Value>, action: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        self.log_transaction(&format!("{}_start", name), path, data).await;
        match action.await {
            Ok(value) => {
                self.log_transaction(&format!("{}_complete", name), path, None).await;
                Ok(value)
            }
            Err(error) => {
                let detail = json!({ "error": error.to_string() });
                self.log_transaction(&format!("{}_failed", name), path, Some(&detail)).await;
                Err(error)
            }
        }
    }

    /// Removes `path` and its checksum sidecar. Returns false if it was absent.
    pub async fn delete_file(&self, path: &Path) -> AppResult<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                let _ = fs::remove_file(checksum_path(path)).await;
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(AppError::Io(format!("failed to delete {}: {}", path.display(), error))),
        }
    }

    /// Names of `*.json` documents directly inside `dir`, sorted, extension stripped.
    pub async fn list_json_stems(&self, dir: &Path) -> AppResult<Vec<String>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(AppError::Io(format!("failed to list {}: {}", dir.display(), error))),
        };

        let mut stems = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if path.extension().and_then(|value| value.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|value| value.to_str()) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub(crate) fn checksum_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(CHECKSUM_DIR).join(format!("{}.checksum", file_name(path)))
}
