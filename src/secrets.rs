use crate::errors::{AppError, AppResult};
use base64::Engine;
use std::fmt;

/// Supplies the password the encryption service derives its keys from.
pub trait SecretSource: Send + Sync {
    fn load_secret(&self) -> AppResult<String>;
}

#[derive(Clone)]
pub struct StaticSecret(String);

impl StaticSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }
}

impl fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticSecret([REDACTED])")
    }
}

impl SecretSource for StaticSecret {
    fn load_secret(&self) -> AppResult<String> {
        if self.0.is_empty() {
            return Err(AppError::Config("storage secret is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// OS keychain entry holding a random storage secret, created on first use.
#[derive(Debug, Clone)]
pub struct KeyringSecretSource {
    pub service: String,
    pub account: String,
}

impl Default for KeyringSecretSource {
    fn default() -> Self {
        Self {
            service: "local-docstore".to_string(),
            account: "storage-encryption-secret".to_string(),
        }
    }
}

impl SecretSource for KeyringSecretSource {
    fn load_secret(&self) -> AppResult<String> {
        let entry = keyring::Entry::new(&self.service, &self.account)?;

        if let Some(value) = existing_secret(entry.get_password())? {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&value)
                .map_err(|error| AppError::Config(error.to_string()))?;
            if decoded.len() != 32 {
                return Err(AppError::Config(format!(
                    "keychain secret for {} has unexpected length {}",
                    self.service,
                    decoded.len()
                )));
            }
            return Ok(value);
        }

        let secret: [u8; 32] = rand::random();
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
        entry.set_password(&encoded)?;
        tracing::info!(service = %self.service, "generated new storage secret in keychain");
        Ok(encoded)
    }
}

/// Only a missing entry means "generate one"; any other keychain failure must
/// not lead to overwriting a secret that may still exist.
fn existing_secret(lookup: keyring::Result<String>) -> AppResult<Option<String>> {
    match lookup {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(AppError::Config(format!("failed to read storage secret from keychain: {}", error))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_keychain_entries_trigger_generation() {
        assert_eq!(existing_secret(Ok("c2VjcmV0".to_string())).expect("found"), Some("c2VjcmV0".to_string()));
        assert_eq!(existing_secret(Err(keyring::Error::NoEntry)).expect("missing"), None);

        let locked = keyring::Error::NoStorageAccess(Box::new(std::io::Error::other("keychain locked")));
        let error = existing_secret(Err(locked)).expect_err("locked keychain");
        assert_eq!(error.code(), "CONFIG_INVALID");

        let platform = keyring::Error::PlatformFailure(Box::new(std::io::Error::other("dbus down")));
        assert!(existing_secret(Err(platform)).is_err());
        assert!(existing_secret(Err(keyring::Error::BadEncoding(vec![0xff]))).is_err());
    }

    #[test]
    fn static_secret_rejects_empty_password() {
        assert!(StaticSecret::new("").load_secret().is_err());
        assert_eq!(StaticSecret::new("pw").load_secret().expect("secret"), "pw");
    }

    #[test]
    fn static_secret_debug_is_redacted() {
        assert!(!format!("{:?}", StaticSecret::new("hunter2")).contains("hunter2"));
    }
}
