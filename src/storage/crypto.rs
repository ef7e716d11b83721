use crate::config::EncryptionConfig;
use crate::errors::{AppError, AppResult};
use crate::events::{EventBus, StorageEvent};
use crate::models::{EncryptedPayload, SealedValue};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// AES-256-GCM over JSON values with a PBKDF2 key derived per call from a fresh salt.
pub struct EncryptionService {
    enabled: AtomicBool,
    secret: Option<Arc<str>>,
    iterations: u32,
    events: EventBus,
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("enabled", &self.is_enabled())
            .field("has_secret", &self.secret.is_some())
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl EncryptionService {
    pub fn new(config: &EncryptionConfig) -> AppResult<Self> {
        let secret = config.secret.as_deref().filter(|secret| !secret.is_empty());
        if config.enabled && secret.is_none() {
            return Err(AppError::Config("encryption enabled without a secret".to_string()));
        }
        if config.iterations == 0 {
            return Err(AppError::Config("key derivation iterations must be positive".to_string()));
        }
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            secret: secret.map(Arc::from),
            iterations: config.iterations,
            events: EventBus::new(),
        })
    }

    /// A service that never encrypts and cannot decrypt.
    pub fn disabled() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            secret: None,
            iterations: crate::config::DEFAULT_KDF_ITERATIONS,
            events: EventBus::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Existing ciphertext is left as-is; callers migrate it if they need to.
    pub fn set_enabled(&self, enabled: bool) -> AppResult<()> {
        if enabled && self.secret.is_none() {
            return Err(AppError::Config("cannot enable encryption without a secret".to_string()));
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn encrypt_data(&self, value: &Value) -> AppResult<SealedValue> {
        let Some(secret) = self.secret.clone().filter(|_| self.is_enabled()) else {
            return Ok(SealedValue::Plain { data: value.clone() });
        };
        let plaintext = serde_json::to_vec(value)?;
        let iterations = self.iterations;
        let payload = tokio::task::spawn_blocking(move || seal(&secret, iterations, &plaintext)).await??;
        Ok(SealedValue::Encrypted(payload))
    }

    pub async fn decrypt_data(&self, payload: &EncryptedPayload) -> AppResult<Value> {
        let result = match self.secret.clone() {
            Some(secret) => {
                let payload = payload.clone();
                let iterations = self.iterations;
                match tokio::task::spawn_blocking(move || open(&secret, iterations, &payload)).await {
                    Ok(result) => result,
                    Err(error) => Err(AppError::from(error)),
                }
            }
            None => Err(AppError::Crypto("no secret configured for decryption".to_string())),
        };

        if let Err(error) = &result {
            tracing::error!(error = %error, "decryption failed");
            self.events.publish(StorageEvent::Error {
                operation: "decrypt".to_string(),
                entity_type: None,
                message: error.to_string(),
            });
        }
        result
    }

    /// Unwraps either form produced by `encrypt_data`.
    pub async fn open_sealed(&self, sealed: &SealedValue) -> AppResult<Value> {
        match sealed {
            SealedValue::Encrypted(payload) => self.decrypt_data(payload).await,
            SealedValue::Plain { data } => Ok(data.clone()),
        }
    }
}

fn derive_key(secret: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut key);
    key
}

fn seal(secret: &str, iterations: u32, plaintext: &[u8]) -> AppResult<EncryptedPayload> {
    let salt: [u8; SALT_LEN] = rand::random();
    let iv: [u8; IV_LEN] = rand::random();
    let key = derive_key(secret, &salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|error| AppError::Crypto(error.to_string()))?;
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|error| AppError::Crypto(error.to_string()))?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedPayload {
        data: STANDARD.encode(&sealed),
        salt: STANDARD.encode(salt),
        iv: STANDARD.encode(iv),
        auth_tag: STANDARD.encode(tag),
    })
}

fn open(secret: &str, iterations: u32, payload: &EncryptedPayload) -> AppResult<Value> {
    let salt = decode_part("salt", &payload.salt)?;
    let iv = decode_part("iv", &payload.iv)?;
    let tag = decode_part("authTag", &payload.auth_tag)?;
    let mut ciphertext = decode_part("data", &payload.data)?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(AppError::Crypto("malformed encryption envelope".to_string()));
    }

    let key = derive_key(secret, &salt, iterations);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|error| AppError::Crypto(error.to_string()))?;
    ciphertext.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| AppError::Crypto("authentication failed: wrong key or tampered data".to_string()))?;
    serde_json::from_slice(&plaintext).map_err(|error| AppError::Crypto(format!("decrypted payload is not json: {}", error)))
}

fn decode_part(name: &str, encoded: &str) -> AppResult<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|error| AppError::Crypto(format!("invalid {} encoding: {}", name, error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(secret: &str) -> EncryptionService {
        EncryptionService::new(&EncryptionConfig {
            enabled: true,
            secret: Some(secret.to_string()),
            iterations: 1_000,
        })
        .expect("encryption service")
    }

    fn encrypted(sealed: SealedValue) -> EncryptedPayload {
        match sealed {
            SealedValue::Encrypted(payload) => payload,
            SealedValue::Plain { .. } => panic!("expected ciphertext"),
        }
    }

    #[test]
    fn enabled_without_secret_fails_initialization() {
        let error = EncryptionService::new(&EncryptionConfig {
            enabled: true,
            secret: None,
            iterations: 1_000,
        })
        .expect_err("missing secret");
        assert_eq!(error.code(), "CONFIG_INVALID");
    }

    #[tokio::test]
    async fn structured_values_survive_a_round_trip() {
        let crypto = service("pw");
        let value = json!({"title": "Deep work", "minutes": 50, "tags": ["focus"]});
        let payload = encrypted(crypto.encrypt_data(&value).await.expect("encrypt"));
        assert!(!payload.data.contains("Deep work"));
        assert_eq!(crypto.decrypt_data(&payload).await.expect("decrypt"), value);
    }

    #[tokio::test]
    async fn each_call_uses_fresh_salt_and_iv() {
        let crypto = service("pw");
        let first = encrypted(crypto.encrypt_data(&json!("same")).await.expect("first"));
        let second = encrypted(crypto.encrypt_data(&json!("same")).await.expect("second"));
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.data, second.data);
    }

    #[tokio::test]
    async fn disabled_service_passes_values_through() {
        let crypto = service("pw");
        crypto.set_enabled(false).expect("disable");
        let sealed = crypto.encrypt_data(&json!({"a": 1})).await.expect("encrypt");
        assert_eq!(sealed, SealedValue::Plain { data: json!({"a": 1}) });
        assert_eq!(crypto.open_sealed(&sealed).await.expect("open"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_rejected_and_reported() {
        let crypto = service("pw");
        let mut receiver = crypto.events().subscribe();
        let mut payload = encrypted(crypto.encrypt_data(&json!("secret")).await.expect("encrypt"));
        let mut tag = STANDARD.decode(&payload.auth_tag).expect("tag");
        tag[0] ^= 0xff;
        payload.auth_tag = STANDARD.encode(tag);

        let error = crypto.decrypt_data(&payload).await.expect_err("tampered");
        assert_eq!(error.code(), "CRYPTO_FAILURE");
        match receiver.recv().await.expect("error event") {
            StorageEvent::Error { operation, .. } => assert_eq!(operation, "decrypt"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_secret_cannot_decrypt() {
        let payload = encrypted(service("right").encrypt_data(&json!(42)).await.expect("encrypt"));
        assert!(service("wrong").decrypt_data(&payload).await.is_err());
    }

    #[tokio::test]
    async fn malformed_envelope_is_a_crypto_error() {
        let crypto = service("pw");
        let payload = EncryptedPayload {
            data: "%%%".to_string(),
            salt: "AAAA".to_string(),
            iv: "AAAA".to_string(),
            auth_tag: "AAAA".to_string(),
        };
        assert_eq!(crypto.decrypt_data(&payload).await.expect_err("malformed").code(), "CRYPTO_FAILURE");
    }

    #[test]
    fn enabling_requires_a_secret() {
        let crypto = EncryptionService::disabled();
        assert!(crypto.set_enabled(true).is_err());
        assert!(!crypto.is_enabled());
    }
}
