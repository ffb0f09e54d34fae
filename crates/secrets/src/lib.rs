use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use core_types::ProfileId;
use parking_lot::Mutex;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("encrypted secrets exist but no password provided")]
    MissingPassword,
    #[error("secret store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret store file is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("secret store crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Opaque key/value capability holding secret strings.
pub trait SecretStore: Send + Sync {
    fn set(&self, key: &str, secret: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Secrets persisted to a JSON file, encrypted with AES-256-GCM when a
/// password is configured.
#[derive(Debug)]
pub struct FileSecretStore {
    root: PathBuf,
    encryption_password: Option<String>,
    write_lock: Mutex<()>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlainSecretsFile {
    schema_version: u32,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedSecretsFile {
    schema_version: u32,
    salt_b64: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            encryption_password: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.encryption_password = password;
        self
    }

    pub fn is_encrypted_mode(&self) -> bool {
        self.encryption_password.is_some()
    }

    fn load_values(&self) -> Result<BTreeMap<String, String>> {
        let plain_path = self.plain_path();
        let enc_path = self.encrypted_path();

        match (
            plain_path.exists(),
            enc_path.exists(),
            self.encryption_password.as_ref(),
        ) {
            (false, false, _) => Ok(BTreeMap::new()),
            (true, false, _) => self.read_plain_file(),
            (false, true, None) => Err(SecretError::MissingPassword),
            (_, true, Some(password)) => self.read_encrypted_file(password),
            (true, true, None) => self.read_plain_file(),
        }
    }

    fn save_values(&self, values: &BTreeMap<String, String>) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        if let Some(password) = self.encryption_password.as_ref() {
            let encrypted = encrypt_values(password, values)?;
            fs::write(self.encrypted_path(), serde_json::to_string_pretty(&encrypted)?)?;
            if self.plain_path().exists() {
                fs::remove_file(self.plain_path())?;
            }
            debug!(entries = values.len(), "secrets persisted in encrypted mode");
            return Ok(());
        }

        let plain = PlainSecretsFile {
            schema_version: SCHEMA_VERSION,
            values: values.clone(),
        };
        fs::write(self.plain_path(), serde_json::to_string_pretty(&plain)?)?;
        if self.encrypted_path().exists() {
            fs::remove_file(self.encrypted_path())?;
        }
        debug!(entries = values.len(), "secrets persisted in plain mode");
        Ok(())
    }

    fn read_plain_file(&self) -> Result<BTreeMap<String, String>> {
        let text = fs::read_to_string(self.plain_path())?;
        let doc: PlainSecretsFile = serde_json::from_str(&text)?;
        Ok(doc.values)
    }

    fn read_encrypted_file(&self, password: &str) -> Result<BTreeMap<String, String>> {
        let text = fs::read_to_string(self.encrypted_path())?;
        let doc: EncryptedSecretsFile = serde_json::from_str(&text)?;
        decrypt_values(password, &doc)
    }

    fn plain_path(&self) -> PathBuf {
        self.root.join("secrets.json")
    }

    fn encrypted_path(&self) -> PathBuf {
        self.root.join("secrets.enc.json")
    }
}

impl SecretStore for FileSecretStore {
    fn set(&self, key: &str, secret: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut values = self.load_values()?;
        values.insert(key.to_string(), secret.to_string());
        self.save_values(&values)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.write_lock.lock();
        Ok(self.load_values()?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut values = self.load_values()?;
        if values.remove(key).is_some() {
            self.save_values(&values)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn set(&self, key: &str, secret: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Secrets keyed by profile, stored as `<namespace>_<profileId>`.
#[derive(Clone)]
pub struct ProfileSecrets {
    namespace: String,
    store: Arc<dyn SecretStore>,
}

impl ProfileSecrets {
    pub fn new(store: Arc<dyn SecretStore>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
        }
    }

    pub fn key_for(&self, profile_id: ProfileId) -> String {
        format!("{}_{}", self.namespace, profile_id)
    }

    pub fn set(&self, profile_id: ProfileId, secret: &str) -> Result<()> {
        self.store.set(&self.key_for(profile_id), secret)?;
        info!(%profile_id, "stored profile secret");
        Ok(())
    }

    pub fn get(&self, profile_id: ProfileId) -> Result<Option<String>> {
        self.store.get(&self.key_for(profile_id))
    }

    pub fn delete(&self, profile_id: ProfileId) -> Result<()> {
        self.store.delete(&self.key_for(profile_id))?;
        info!(%profile_id, "removed profile secret");
        Ok(())
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| SecretError::Crypto(format!("failed to derive encryption key: {e}")))?;
    Ok(key)
}

fn encrypt_values(
    password: &str,
    values: &BTreeMap<String, String>,
) -> Result<EncryptedSecretsFile> {
    let plaintext = serde_json::to_vec(values)?;
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SecretError::Crypto(format!("failed to build cipher: {e}")))?;

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|e| SecretError::Crypto(format!("failed to encrypt secrets: {e}")))?;

    Ok(EncryptedSecretsFile {
        schema_version: SCHEMA_VERSION,
        salt_b64: BASE64.encode(salt),
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

fn decrypt_values(
    password: &str,
    encrypted: &EncryptedSecretsFile,
) -> Result<BTreeMap<String, String>> {
    let decode = |field: &str| {
        BASE64
            .decode(field)
            .map_err(|e| SecretError::Crypto(format!("invalid base64: {e}")))
    };
    let salt = decode(&encrypted.salt_b64)?;
    let nonce_bytes = decode(&encrypted.nonce_b64)?;
    let ciphertext = decode(&encrypted.ciphertext_b64)?;

    if nonce_bytes.len() != 12 {
        return Err(SecretError::Crypto("invalid nonce length".to_string()));
    }

    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| SecretError::Crypto(format!("failed to build cipher: {e}")))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| SecretError::Crypto(format!("failed to decrypt secrets: {e}")))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

pub fn default_secret_dir_from(base_dir: &Path) -> PathBuf {
    base_dir.join("secrets")
}
