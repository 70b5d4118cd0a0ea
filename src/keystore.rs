//! API key storage for ingestion plugins.
//!
//! Keys are `lineflow_ak_` followed by 64 hex characters (256 random
//! bits). Plaintext keys are never persisted or returned: the database
//! holds a salted SHA-256 verification hash plus an unsalted SHA-256
//! lookup hash. The lookup hash has a unique index, so authentication is a
//! single exact-match query followed by one salted verification on the
//! matched row. Anywhere a key surfaces (listings, logs, audit rows) it is
//! masked to `prefix + stars + suffix`.
//!
//! Key mutations append best-effort audit rows; an audit failure is logged
//! and never fails the operation itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::store::{Connection, StoreError};

const KEY_PREFIX: &str = "lineflow_ak_";
const KEY_RANDOM_BYTES: usize = 32;
/// `lineflow_ak_` + 64 hex chars.
const KEY_LENGTH: usize = 76;
const MASK_PREFIX_LEN: usize = 16;
const MASK_SUFFIX_LEN: usize = 4;
const SALT_BYTES: usize = 16;
const HASH_SCHEME: &str = "sha256";

/// An API key with plugin identification and permissions.
///
/// The `key` field holds the plaintext only while a new key is being
/// added; everywhere else it carries the masked representation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub plugin_id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl ApiKey {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| Utc::now() > at)
    }
}

/// Key store errors.
#[derive(Debug)]
pub enum KeyStoreError {
    KeyEmpty,
    KeyAlreadyExists,
    KeyNotFound,
    PluginIdEmpty,
    InvalidKeyFormat,
    InvalidKeyLength,
    Store(StoreError),
}

impl std::fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyStoreError::KeyEmpty => write!(f, "API key cannot be empty"),
            KeyStoreError::KeyAlreadyExists => write!(f, "API key already exists"),
            KeyStoreError::KeyNotFound => write!(f, "API key not found"),
            KeyStoreError::PluginIdEmpty => write!(f, "plugin ID cannot be empty"),
            KeyStoreError::InvalidKeyFormat => write!(f, "invalid API key format"),
            KeyStoreError::InvalidKeyLength => write!(f, "invalid API key length"),
            KeyStoreError::Store(e) => write!(f, "key store backend error: {e}"),
        }
    }
}

impl std::error::Error for KeyStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyStoreError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for KeyStoreError {
    fn from(err: StoreError) -> Self {
        KeyStoreError::Store(err)
    }
}

impl From<rusqlite::Error> for KeyStoreError {
    fn from(err: rusqlite::Error) -> Self {
        KeyStoreError::Store(StoreError::Database(err))
    }
}

/// Storage interface for API keys.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up a key by its plaintext value. Returns `None` when the key is
    /// unknown or fails verification. Active/expiry checks belong to the
    /// authentication layer, not the store.
    async fn find_by_key(&self, key: &str) -> Option<ApiKey>;

    /// Store a new key. `api_key.key` carries the plaintext; only its
    /// hashes are persisted.
    async fn add(&self, api_key: &ApiKey) -> Result<(), KeyStoreError>;

    /// Update name, permissions, active flag and expiry. The key value
    /// itself cannot change.
    async fn update(&self, api_key: &ApiKey) -> Result<(), KeyStoreError>;

    /// Soft-delete: flips `active` off, preserving the row for the audit
    /// trail.
    async fn delete(&self, key_id: &str) -> Result<(), KeyStoreError>;

    /// All active keys for a plugin, newest first, with masked key values.
    async fn list_by_plugin(&self, plugin_id: &str) -> Result<Vec<ApiKey>, KeyStoreError>;

    async fn health_check(&self) -> Result<(), KeyStoreError>;
}

/// Generate a new API key for a plugin.
pub fn generate_api_key(plugin_id: &str) -> Result<String, KeyStoreError> {
    if plugin_id.trim().is_empty() {
        return Err(KeyStoreError::PluginIdEmpty);
    }

    let mut bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);

    Ok(format!("{KEY_PREFIX}{}", hex::encode(bytes)))
}

/// Extract an API key from a header value, accepting an optional
/// `Bearer ` prefix.
pub fn parse_api_key(header_value: &str) -> Result<String, KeyStoreError> {
    if header_value.is_empty() {
        return Err(KeyStoreError::KeyEmpty);
    }

    let key = header_value.strip_prefix("Bearer ").unwrap_or(header_value);

    if !key.starts_with(KEY_PREFIX) {
        return Err(KeyStoreError::InvalidKeyFormat);
    }
    if key.len() != KEY_LENGTH {
        return Err(KeyStoreError::InvalidKeyLength);
    }

    Ok(key.to_string())
}

/// Mask a key for logs and listings: prefix + stars + suffix for
/// well-formed keys, all stars for anything else.
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }

    if key.len() == KEY_LENGTH {
        let masked_len = KEY_LENGTH - MASK_PREFIX_LEN - MASK_SUFFIX_LEN;

        return format!(
            "{}{}{}",
            &key[..MASK_PREFIX_LEN],
            "*".repeat(masked_len),
            &key[KEY_LENGTH - MASK_SUFFIX_LEN..]
        );
    }

    "*".repeat(key.len())
}

/// Hash a key for storage: `sha256$<salt hex>$<digest hex>` with a random
/// per-key salt, so identical keys never produce identical hashes.
pub fn hash_api_key(key: &str) -> Result<String, KeyStoreError> {
    if key.is_empty() {
        return Err(KeyStoreError::KeyEmpty);
    }

    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);

    let digest = salted_digest(&salt, key);

    Ok(format!("{HASH_SCHEME}${}${}", hex::encode(salt), hex::encode(digest)))
}

/// Constant-time verification of a key against its stored salted hash.
pub fn verify_api_key(stored_hash: &str, key: &str) -> bool {
    if stored_hash.is_empty() || key.is_empty() {
        return false;
    }

    let mut parts = stored_hash.split('$');
    let (scheme, salt_hex, digest_hex) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(salt), Some(digest), None) => (scheme, salt, digest),
        _ => return false,
    };

    if scheme != HASH_SCHEME {
        return false;
    }

    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };

    constant_time_eq(&salted_digest(&salt, key), &expected)
}

/// Unsalted SHA-256 of the key, used only for the indexed lookup column.
/// The salted hash remains the verification boundary.
pub fn compute_lookup_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn salted_digest(salt: &[u8], key: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(key.as_bytes());
    hasher.finalize().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}

/// SQLite-backed implementation of [`ApiKeyStore`].
pub struct PersistentKeyStore {
    conn: Arc<Connection>,
}

impl PersistentKeyStore {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    fn log_audit(&self, operation: &str, key_id: &str, masked_key: &str, plugin_id: &str) {
        let result: Result<(), KeyStoreError> = (|| {
            let guard = self.conn.write()?;
            guard.execute(
                "INSERT INTO api_key_audit_log (api_key_id, operation, masked_key, plugin_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, '{}', ?5)",
                params![key_id, operation, masked_key, plugin_id, crate::store::now_millis()],
            )?;
            Ok(())
        })();

        if let Err(e) = result {
            log::error!("failed to write audit log entry (operation: {operation}, key: {key_id}): {e}");
        }
    }

    fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ApiKey, String)> {
        let permissions_json: String = row.get(4)?;
        let created_at: i64 = row.get(5)?;
        let expires_at: Option<i64> = row.get(6)?;
        let key_hash: String = row.get(1)?;

        let key = ApiKey {
            id: row.get(0)?,
            key: String::new(),
            plugin_id: row.get(2)?,
            name: row.get(3)?,
            permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
            created_at: crate::store::millis_to_datetime(created_at),
            expires_at: expires_at.map(crate::store::millis_to_datetime),
            active: row.get::<_, i64>(7)? != 0,
        };

        Ok((key, key_hash))
    }
}

#[async_trait]
impl ApiKeyStore for PersistentKeyStore {
    async fn find_by_key(&self, key: &str) -> Option<ApiKey> {
        if key.is_empty() {
            return None;
        }

        let lookup_hash = compute_lookup_hash(key);

        let found = {
            let guard = self.conn.read().ok()?;
            guard
                .query_row(
                    "SELECT id, key_hash, plugin_id, name, permissions, created_at, expires_at, active
                     FROM api_keys
                     WHERE key_lookup_hash = ?1
                     LIMIT 1",
                    params![lookup_hash],
                    Self::row_to_key,
                )
                .optional()
                .ok()?
        };

        let (mut api_key, key_hash) = found?;

        // The salted hash is the security boundary; the lookup hash only
        // narrows the search to one row.
        if !verify_api_key(&key_hash, key) {
            log::warn!(
                "key lookup hash matched but verification failed (key_id: {}, plugin: {})",
                api_key.id,
                api_key.plugin_id
            );

            return None;
        }

        api_key.key = mask_key(key);

        Some(api_key)
    }

    async fn add(&self, api_key: &ApiKey) -> Result<(), KeyStoreError> {
        if api_key.key.is_empty() {
            return Err(KeyStoreError::KeyEmpty);
        }

        if self.find_by_key(&api_key.key).await.is_some() {
            return Err(KeyStoreError::KeyAlreadyExists);
        }

        let key_hash = hash_api_key(&api_key.key)?;
        let lookup_hash = compute_lookup_hash(&api_key.key);
        let permissions_json = serde_json::to_string(&api_key.permissions)
            .map_err(|e| KeyStoreError::Store(StoreError::Serialization(e)))?;

        {
            let guard = self.conn.write()?;
            guard.execute(
                "INSERT INTO api_keys (id, key_hash, key_lookup_hash, plugin_id, name, permissions, created_at, expires_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    api_key.id,
                    key_hash,
                    lookup_hash,
                    api_key.plugin_id,
                    api_key.name,
                    permissions_json,
                    api_key.created_at.timestamp_millis(),
                    api_key.expires_at.map(|at| at.timestamp_millis()),
                    api_key.active as i64,
                ],
            )?;
        }

        self.log_audit("created", &api_key.id, &mask_key(&api_key.key), &api_key.plugin_id);

        Ok(())
    }

    async fn update(&self, api_key: &ApiKey) -> Result<(), KeyStoreError> {
        if api_key.id.is_empty() {
            return Err(KeyStoreError::KeyNotFound);
        }

        let permissions_json = serde_json::to_string(&api_key.permissions)
            .map_err(|e| KeyStoreError::Store(StoreError::Serialization(e)))?;

        let updated = {
            let guard = self.conn.write()?;
            guard.execute(
                "UPDATE api_keys
                 SET name = ?1, permissions = ?2, active = ?3, expires_at = ?4
                 WHERE id = ?5",
                params![
                    api_key.name,
                    permissions_json,
                    api_key.active as i64,
                    api_key.expires_at.map(|at| at.timestamp_millis()),
                    api_key.id,
                ],
            )?
        };

        if updated == 0 {
            return Err(KeyStoreError::KeyNotFound);
        }

        self.log_audit("updated", &api_key.id, "", &api_key.plugin_id);

        Ok(())
    }

    async fn delete(&self, key_id: &str) -> Result<(), KeyStoreError> {
        if key_id.is_empty() {
            return Err(KeyStoreError::KeyNotFound);
        }

        let updated = {
            let guard = self.conn.write()?;
            guard.execute("UPDATE api_keys SET active = 0 WHERE id = ?1", params![key_id])?
        };

        if updated == 0 {
            return Err(KeyStoreError::KeyNotFound);
        }

        self.log_audit("deleted", key_id, "", "");

        Ok(())
    }

    async fn list_by_plugin(&self, plugin_id: &str) -> Result<Vec<ApiKey>, KeyStoreError> {
        if plugin_id.trim().is_empty() {
            return Err(KeyStoreError::PluginIdEmpty);
        }

        let guard = self.conn.read()?;
        let mut stmt = guard.prepare(
            "SELECT id, key_hash, plugin_id, name, permissions, created_at, expires_at, active
             FROM api_keys
             WHERE plugin_id = ?1 AND active = 1
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![plugin_id], Self::row_to_key)?;

        let mut keys = Vec::new();
        for row in rows {
            let (mut key, key_hash) = row?;
            key.key = mask_key(&key_hash);
            keys.push(key);
        }

        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), KeyStoreError> {
        self.conn.health_check().map_err(KeyStoreError::from)
    }
}
