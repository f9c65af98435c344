//! Durable storage for the access/refresh credential pair.
//!
//! Every backend upholds the same invariant: both tokens are stored, or
//! neither is.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::StorageError;

const SERVICE_NAME: &str = "croupier";

/// Storage key for the access credential
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh credential
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Access and refresh tokens, always handled together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// A pair with an empty half is as good as no pair
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }
}

// Tokens stay out of logs
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Process-wide persistence for the credential pair.
///
/// Implementations are synchronous and may block on keychain IPC or key
/// derivation; the session runs them on the blocking pool.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<CredentialPair>, StorageError>;

    /// Replace the stored pair atomically.
    fn put(&self, pair: &CredentialPair) -> Result<(), StorageError>;

    /// Remove both credentials. Clearing an empty store succeeds.
    fn clear(&self) -> Result<(), StorageError>;
}

// ============================================================================
// OS keychain
// ============================================================================

/// Named secrets addressed by key. The OS keychain in production.
trait SecretEntries: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Deleting a missing entry succeeds
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

struct OsKeychain {
    service: String,
}

impl OsKeychain {
    fn entry(&self, key: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl SecretEntries for OsKeychain {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Ok(self.entry(key)?.set_password(value)?)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stores each token as its own keychain entry.
///
/// Two entries cannot be replaced atomically, so `put` removes the access
/// entry before touching the refresh entry. Until the final write lands the
/// store holds at most one entry, which `get` treats as absent.
pub struct KeyringCredentialStore {
    entries: Box<dyn SecretEntries>,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self::with_entries(Box::new(OsKeychain {
            service: service.into(),
        }))
    }

    fn with_entries(entries: Box<dyn SecretEntries>) -> Self {
        Self { entries }
    }

    fn write_both(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        self.entries.delete(ACCESS_TOKEN_KEY)?;
        self.entries.write(REFRESH_TOKEN_KEY, &pair.refresh_token)?;
        self.entries.write(ACCESS_TOKEN_KEY, &pair.access_token)
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>, StorageError> {
        let access = self.entries.read(ACCESS_TOKEN_KEY)?;
        let refresh = self.entries.read(REFRESH_TOKEN_KEY)?;
        match (access, refresh) {
            (Some(access), Some(refresh)) => Ok(Some(CredentialPair::new(access, refresh))),
            (None, None) => Ok(None),
            _ => {
                warn!("Keychain holds only one credential, clearing both");
                self.clear()?;
                Ok(None)
            }
        }
    }

    fn put(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        if let Err(e) = self.write_both(pair) {
            warn!(error = %e, "Keychain write failed, clearing partial credentials");
            if let Err(clear_err) = self.clear() {
                warn!(error = %clear_err, "Failed to clear keychain after write failure");
            }
            return Err(e);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let access = self.entries.delete(ACCESS_TOKEN_KEY);
        let refresh = self.entries.delete(REFRESH_TOKEN_KEY);
        access.and(refresh)
    }
}

// ============================================================================
// Encrypted file
// ============================================================================

const FILE_MAGIC: &[u8; 4] = b"CRP1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = FILE_MAGIC.len() + SALT_LEN + NONCE_LEN;

/// Stores the pair as one encrypted file.
///
/// Layout: `CRP1 | salt(16) | nonce(12) | ciphertext`. The key is derived
/// from the passphrase with Argon2 using the stored salt. Writes go to a
/// sibling temp file which is then renamed over the original.
pub struct FileCredentialStore {
    path: PathBuf,
    passphrase: Option<String>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf, passphrase: Option<String>) -> Self {
        Self { path, passphrase }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn passphrase(&self) -> Result<&str, StorageError> {
        match self.passphrase.as_deref() {
            Some(p) if !p.is_empty() => Ok(p),
            _ => Err(StorageError::Locked),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN], StorageError> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase()?.as_bytes(), salt, &mut key)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(key)
    }

    fn encrypt(&self, pair: &CredentialPair) -> Result<Vec<u8>, StorageError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext =
            serde_json::to_vec(pair).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
            .map_err(|_| StorageError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(FILE_MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, bytes: &[u8]) -> Result<CredentialPair, StorageError> {
        if bytes.len() <= HEADER_LEN || &bytes[..FILE_MAGIC.len()] != FILE_MAGIC {
            return Err(StorageError::Corrupt("unrecognized file header".to_string()));
        }
        let salt = &bytes[FILE_MAGIC.len()..FILE_MAGIC.len() + SALT_LEN];
        let nonce = &bytes[FILE_MAGIC.len() + SALT_LEN..HEADER_LEN];

        let key = self.derive_key(salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), &bytes[HEADER_LEN..])
            .map_err(|_| StorageError::Crypto("wrong passphrase or tampered file".to_string()))?;

        let pair: CredentialPair =
            serde_json::from_slice(&plaintext).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        if !pair.is_complete() {
            return Err(StorageError::Corrupt("incomplete credential pair".to_string()));
        }
        Ok(pair)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Write `contents` to a new owner-only file and flush it to disk.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>, StorageError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.decrypt(&bytes).map(Some)
    }

    fn put(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        let contents = self.encrypt(pair)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.temp_path();
        let written =
            write_private(&tmp, &contents).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = written {
            match std::fs::remove_file(&tmp) {
                Ok(()) => {}
                Err(cleanup) if cleanup.kind() == std::io::ErrorKind::NotFound => {}
                Err(cleanup) => {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp credential file");
                }
            }
            return Err(e.into());
        }
        debug!(path = %self.path.display(), "Credentials written");
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Non-durable store; lives as long as the process.
#[derive(Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<CredentialPair>, StorageError> {
        Ok(self.pair.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn put(&self, pair: &CredentialPair) -> Result<(), StorageError> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
