//! Credential Store — encryption at rest for per-user provider API keys
//! and connector environment blobs (spec.md §4.3).
//!
//! Grounded in `auth::crypto` from the 0xfe-buddy example: the same
//! AES-256-GCM-SIV primitive (`encrypt_blob`/`decrypt_blob`, random
//! 12-byte nonce, base64-encoded fields) and the same "decode-then-decrypt
//! with fixed-length enforcement" decoding helpers. Two things differ
//! because this runs as a multi-tenant server rather than a single-user
//! CLI: there is no per-secret random DEK wrapped by a machine-bound KEK
//! (a CLI protects against the store file being copied to another
//! machine; a server protects against the database being read without
//! the process's environment) — every secret is encrypted directly under
//! one process-wide key read from `TASKFORGE_MASTER_KEY`. The machine-id
//! derivation (`derive_machine_kek`) is dropped entirely as a result.

use aes_gcm_siv::aead::{Aead, KeyInit};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::DbHandle;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MASTER_KEY_ENV: &str = "TASKFORGE_MASTER_KEY";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{MASTER_KEY_ENV} is not set")]
    MasterKeyMissing,

    #[error("{MASTER_KEY_ENV} must decode to {KEY_LEN} bytes of base64: {0}")]
    MasterKeyInvalid(String),

    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed")]
    DecryptFailed,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One encrypted secret at rest: a base64 nonce and base64 ciphertext,
/// serialized together as the opaque string stored in `keys.value_encrypted`
/// and `connectors.env_encrypted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedSecret {
    nonce: String,
    ciphertext: String,
}

/// Reads the process-wide master key once and serves encrypt/decrypt calls
/// against it. Holding the raw key bytes in a field (rather than re-reading
/// the env var per call) means a credential rotation requires a restart,
/// matching how the teacher's machine-bound key is fixed for a process's
/// lifetime too.
#[derive(Clone)]
pub struct CredentialStore {
    db: DbHandle,
    master_key: [u8; KEY_LEN],
}

impl CredentialStore {
    pub fn new(db: DbHandle) -> Result<Self, CredentialError> {
        let master_key = load_master_key()?;
        Ok(Self { db, master_key })
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let cipher = Aes256GcmSiv::new_from_slice(&self.master_key)
            .map_err(|_| CredentialError::EncryptFailed)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CredentialError::EncryptFailed)?;
        let record = EncryptedSecret {
            nonce: B64.encode(nonce),
            ciphertext: B64.encode(ciphertext),
        };
        Ok(serde_json::to_string(&record).map_err(|e| CredentialError::Store(e.into()))?)
    }

    fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let record: EncryptedSecret =
            serde_json::from_str(encoded).map_err(|_| CredentialError::DecryptFailed)?;
        let nonce = decode_fixed::<NONCE_LEN>(&record.nonce)?;
        let ciphertext = B64.decode(&record.ciphertext).map_err(|_| CredentialError::DecryptFailed)?;
        let cipher = Aes256GcmSiv::new_from_slice(&self.master_key)
            .map_err(|_| CredentialError::DecryptFailed)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CredentialError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::DecryptFailed)
    }

    pub async fn put_user_api_key(&self, user_id: &str, provider: &str, value: &str) -> Result<(), CredentialError> {
        let encrypted = self.encrypt(value)?;
        let db = self.db.clone();
        let user_id = user_id.to_string();
        let provider = provider.to_string();
        db.call(move |conn| conn.put_encrypted_key(&user_id, &provider, &encrypted))
            .await
            .map_err(CredentialError::Store)
    }

    /// Returns the user's own decrypted key for `provider` if one is on
    /// file, falling back to `env_default` (the deployment's shared
    /// fallback key, e.g. `CLAUDE_API_KEY`) otherwise. A decryption failure
    /// — the stored value was written under a since-rotated master key —
    /// is treated the same as "no user key": the caller silently falls
    /// back rather than failing the task outright.
    pub async fn get_user_api_key(&self, user_id: &str, provider: &str, env_default: Option<&str>) -> Option<String> {
        let db = self.db.clone();
        let user_id = user_id.to_string();
        let provider_owned = provider.to_string();
        let stored = db
            .call(move |conn| conn.get_encrypted_key(&user_id, &provider_owned))
            .await
            .ok()
            .flatten();

        if let Some(encoded) = stored {
            if let Ok(plaintext) = self.decrypt(&encoded) {
                return Some(plaintext);
            }
        }
        env_default.map(|s| s.to_string())
    }

    pub async fn get_connector_env(&self, connector_id: &str) -> Result<std::collections::HashMap<String, String>, CredentialError> {
        let db = self.db.clone();
        let id = connector_id.to_string();
        let connector = db
            .call(move |conn| conn.get_connector(&id))
            .await
            .map_err(CredentialError::Store)?
            .ok_or_else(|| CredentialError::Store(anyhow::anyhow!("connector not found")))?;
        let plaintext = self.decrypt(&connector.env_encrypted)?;
        serde_json::from_str(&plaintext).map_err(|e| CredentialError::Store(e.into()))
    }

    pub fn encrypt_connector_env(&self, env: &std::collections::HashMap<String, String>) -> Result<String, CredentialError> {
        let plaintext = serde_json::to_string(env).map_err(|e| CredentialError::Store(e.into()))?;
        self.encrypt(&plaintext)
    }
}

fn load_master_key() -> Result<[u8; KEY_LEN], CredentialError> {
    let raw = std::env::var(MASTER_KEY_ENV).map_err(|_| CredentialError::MasterKeyMissing)?;
    let bytes = B64
        .decode(raw.trim())
        .map_err(|e| CredentialError::MasterKeyInvalid(e.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(CredentialError::MasterKeyInvalid(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], CredentialError> {
    let bytes = B64.decode(value).map_err(|_| CredentialError::DecryptFailed)?;
    if bytes.len() != N {
        return Err(CredentialError::DecryptFailed);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}
