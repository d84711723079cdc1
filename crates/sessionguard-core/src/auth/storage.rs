use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::RngCore;

use super::credentials::RefreshCredential;

/// Keychain service name
const SERVICE_NAME: &str = "sessionguard";

/// Fixed key the refresh credential is stored under
pub const REFRESH_KEY: &str = "refresh-token";

/// Encrypted refresh credential file name
const REFRESH_FILE: &str = "refresh-token.enc";

/// Key file used by `FileRefreshStore`
const KEY_FILE: &str = ".secret_key";

/// 256-bit key for ChaCha20-Poly1305
const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length in bytes
const NONCE_LEN: usize = 12;

/// Durable storage for the refresh credential, scoped to a single fixed key.
///
/// Implementations only fail when the underlying medium is inaccessible;
/// a missing value is `Ok(None)`.
pub trait RefreshStore: Send + Sync {
    fn load(&self) -> Result<Option<RefreshCredential>>;
    fn save(&self, credential: &RefreshCredential) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// Refresh credential stored in the OS keychain.
pub struct KeyringRefreshStore {
    service: String,
}

impl KeyringRefreshStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, REFRESH_KEY).context("Failed to create keyring entry")
    }
}

impl Default for KeyringRefreshStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshStore for KeyringRefreshStore {
    fn load(&self) -> Result<Option<RefreshCredential>> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(RefreshCredential::new(token))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve refresh token from keychain"),
        }
    }

    fn save(&self, credential: &RefreshCredential) -> Result<()> {
        self.entry()?
            .set_password(credential.expose())
            .context("Failed to store refresh token in keychain")
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete refresh token from keychain"),
        }
    }
}

/// Refresh credential stored in an encrypted file.
///
/// The file holds `nonce ‖ ciphertext ‖ tag`. The key is generated on first
/// use and kept next to it with owner-only permissions.
pub struct FileRefreshStore {
    dir: PathBuf,
}

impl FileRefreshStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn token_path(&self) -> PathBuf {
        self.dir.join(REFRESH_FILE)
    }

    fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Cipher for an existing key. Never creates one.
    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        let path = self.key_path();
        anyhow::ensure!(path.exists(), "Secret key file {} is missing", path.display());
        let key = std::fs::read(&path).context("Failed to read secret key file")?;
        anyhow::ensure!(key.len() == KEY_LEN, "Secret key file is corrupt");
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }

    fn cipher_or_create(&self) -> Result<ChaCha20Poly1305> {
        if self.key_path().exists() {
            return self.cipher();
        }

        let mut key = vec![0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.key_path();
        std::fs::write(&path, &key).context("Failed to write secret key file")?;
        restrict_permissions(&path)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}

impl RefreshStore for FileRefreshStore {
    fn load(&self) -> Result<Option<RefreshCredential>> {
        let path = self.token_path();
        if !path.exists() {
            return Ok(None);
        }

        let blob = std::fs::read(&path).context("Failed to read refresh token file")?;
        anyhow::ensure!(blob.len() > NONCE_LEN, "Refresh token file is truncated");

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("Failed to decrypt refresh token (wrong key or tampered file)"))?;
        let token = String::from_utf8(plaintext).context("Refresh token is not valid UTF-8")?;
        Ok(Some(RefreshCredential::new(token)))
    }

    fn save(&self, credential: &RefreshCredential) -> Result<()> {
        let cipher = self.cipher_or_create()?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, credential.expose().as_bytes())
            .map_err(|e| anyhow::anyhow!("Failed to encrypt refresh token: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let path = self.token_path();
        std::fs::write(&path, blob).context("Failed to write refresh token file")?;
        restrict_permissions(&path)
    }

    fn delete(&self) -> Result<()> {
        let path = self.token_path();
        if path.exists() {
            std::fs::remove_file(&path).context("Failed to delete refresh token file")?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Refresh credential kept in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryRefreshStore {
    value: Mutex<Option<RefreshCredential>>,
}

impl MemoryRefreshStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshStore for MemoryRefreshStore {
    fn load(&self) -> Result<Option<RefreshCredential>> {
        let value = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("Refresh store lock poisoned"))?;
        Ok(value.clone())
    }

    fn save(&self, credential: &RefreshCredential) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("Refresh store lock poisoned"))?;
        *value = Some(credential.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut value = self
            .value
            .lock()
            .map_err(|_| anyhow::anyhow!("Refresh store lock poisoned"))?;
        *value = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryRefreshStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&RefreshCredential::new("r1")).unwrap();
        assert_eq!(store.load().unwrap().unwrap().expose(), "r1");

        store.save(&RefreshCredential::new("r2")).unwrap();
        assert_eq!(store.load().unwrap().unwrap().expose(), "r2");

        store.delete().unwrap();
        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        FileRefreshStore::new(tmp.path())
            .save(&RefreshCredential::new("long-lived"))
            .unwrap();

        let reopened = FileRefreshStore::new(tmp.path());
        assert_eq!(reopened.load().unwrap().unwrap().expose(), "long-lived");
    }

    #[test]
    fn test_file_store_does_not_write_plaintext() {
        let tmp = TempDir::new().unwrap();
        let store = FileRefreshStore::new(tmp.path());
        store.save(&RefreshCredential::new("super-secret-refresh")).unwrap();

        let raw = std::fs::read(tmp.path().join(REFRESH_FILE)).unwrap();
        let needle = b"super-secret-refresh";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_file_store_missing_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileRefreshStore::new(tmp.path().join("not-yet-created"));
        assert!(store.load().unwrap().is_none());
        store.delete().unwrap();
    }

    #[test]
    fn test_file_store_rejects_tampered_file() {
        let tmp = TempDir::new().unwrap();
        let store = FileRefreshStore::new(tmp.path());
        store.save(&RefreshCredential::new("token")).unwrap();

        let path = tmp.path().join(REFRESH_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        assert!(store.load().is_err());
    }

    #[test]
    fn test_file_store_load_never_creates_key() {
        let tmp = TempDir::new().unwrap();
        let store = FileRefreshStore::new(tmp.path());
        assert!(store.load().unwrap().is_none());
        assert!(!tmp.path().join(KEY_FILE).exists());

        // Token without its key cannot be decrypted, and no new key appears
        store.save(&RefreshCredential::new("token")).unwrap();
        std::fs::remove_file(tmp.path().join(KEY_FILE)).unwrap();
        assert!(store.load().is_err());
        assert!(!tmp.path().join(KEY_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = FileRefreshStore::new(tmp.path());
        store.save(&RefreshCredential::new("token")).unwrap();

        let mode = std::fs::metadata(tmp.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
