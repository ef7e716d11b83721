use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A JSON object as stored on disk: entities, metadata blobs and merge patches.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriteOptions {
    pub create_backup: bool,
    pub pretty_print: bool,
    pub store_checksum: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create_backup: true,
            pretty_print: true,
            store_checksum: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReloadPolicy {
    /// Reload the settings document only when the cache has been dropped.
    #[default]
    IfMissing,
    Always,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityOptions {
    pub encrypt_fields: Vec<String>,
    pub encrypt: bool,
}

impl EntityOptions {
    pub fn encrypt_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            encrypt_fields: fields.into_iter().map(Into::into).collect(),
            encrypt: false,
        }
    }

    pub fn encrypt_record() -> Self {
        Self {
            encrypt_fields: Vec::new(),
            encrypt: true,
        }
    }

    pub fn is_plain(&self) -> bool {
        !self.encrypt && self.encrypt_fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadOptions {
    pub decrypt: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { decrypt: true }
    }
}

impl ReadOptions {
    pub fn raw() -> Self {
        Self { decrypt: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SettingOptions {
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SettingRecord {
    /// Ciphertext envelope of an encrypted setting, if all parts are present.
    pub fn sealed_payload(&self) -> Option<EncryptedPayload> {
        if !self.encrypted {
            return None;
        }
        Some(EncryptedPayload {
            data: self.value.as_str()?.to_string(),
            salt: self.salt.clone()?,
            iv: self.iv.clone()?,
            auth_tag: self.auth_tag.clone()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub data: String,
    pub salt: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Output of `encrypt_data`: ciphertext when encryption is on, the value untouched when off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SealedValue {
    Encrypted(EncryptedPayload),
    Plain { data: Value },
}

/// One field-level encrypted value, mapped to `<name>`, `<name>_iv`, `<name>_salt`,
/// `<name>_authTag` and `<name>_encrypted` keys only when written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub name: String,
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub auth_tag: String,
}

impl EncryptedField {
    pub fn from_payload(name: &str, payload: EncryptedPayload) -> Self {
        Self {
            name: name.to_string(),
            ciphertext: payload.data,
            iv: payload.iv,
            salt: payload.salt,
            auth_tag: payload.auth_tag,
        }
    }

    pub fn payload(&self) -> EncryptedPayload {
        EncryptedPayload {
            data: self.ciphertext.clone(),
            salt: self.salt.clone(),
            iv: self.iv.clone(),
            auth_tag: self.auth_tag.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub entities: usize,
    pub settings: usize,
    pub metadata: usize,
    pub skipped: usize,
    pub already_migrated: bool,
}
