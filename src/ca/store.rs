//! Persistent storage for the CA's storage key and issued certificates

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::encoding::{base64_bytes, from_base64, to_base64};
use crate::error::CaError;

/// Holds the symmetric key that seals private keys at rest.
pub trait SecretStore: Send + Sync {
    /// Load the key, `None` if none has been stored yet.
    fn load(&self) -> Result<Option<Vec<u8>>, CaError>;

    /// Replace the stored key.
    fn store(&self, key: &[u8]) -> Result<(), CaError>;
}

/// A certificate as persisted: PEM in the clear, private key sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub domain: String,
    pub certificate_pem: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
}

/// Keyed store of issued certificates, one per domain.
pub trait CertificateStore: Send + Sync {
    fn get(&self, domain: &str) -> Result<Option<StoredCertificate>, CaError>;
    fn put(&self, certificate: StoredCertificate) -> Result<(), CaError>;
    fn clear(&self) -> Result<(), CaError>;
}

/// Secret store backed by a single owner-only file.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SecretStore for FileSecretStore {
    fn load(&self) -> Result<Option<Vec<u8>>, CaError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| CaError::SecretStore(format!("{}: {}", self.path.display(), e)))?;
        let key = from_base64(text.trim())
            .map_err(|e| CaError::SecretStore(format!("{}: {}", self.path.display(), e)))?;
        Ok(Some(key))
    }

    fn store(&self, key: &[u8]) -> Result<(), CaError> {
        write_private(&self.path, to_base64(key).as_bytes())
            .map_err(|e| CaError::SecretStore(format!("{}: {}", self.path.display(), e)))
    }
}

/// In-memory secret store, optionally refusing every operation.
#[derive(Default)]
pub struct MemorySecretStore {
    key: Mutex<Option<Vec<u8>>>,
    unavailable: bool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose backend cannot be reached.
    pub fn unavailable() -> Self {
        Self {
            key: Mutex::new(None),
            unavailable: true,
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn load(&self) -> Result<Option<Vec<u8>>, CaError> {
        if self.unavailable {
            return Err(CaError::SecretStore("keyring not available".into()));
        }
        Ok(self.key.lock().clone())
    }

    fn store(&self, key: &[u8]) -> Result<(), CaError> {
        if self.unavailable {
            return Err(CaError::SecretStore("keyring not available".into()));
        }
        *self.key.lock() = Some(key.to_vec());
        Ok(())
    }
}

/// Certificate store persisted as one JSON document keyed by domain.
pub struct FileCertificateStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, StoredCertificate>>,
}

impl FileCertificateStore {
    /// Open the store, loading any existing document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CaError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| CaError::Storage(format!("{}: {}", path.display(), e)))?;
            serde_json::from_str(&contents)
                .map_err(|e| CaError::Storage(format!("{}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &HashMap<String, StoredCertificate>) -> Result<(), CaError> {
        let contents = serde_json::to_vec_pretty(entries)
            .map_err(|e| CaError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, &contents)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| CaError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

impl CertificateStore for FileCertificateStore {
    fn get(&self, domain: &str) -> Result<Option<StoredCertificate>, CaError> {
        Ok(self.entries.lock().get(domain).cloned())
    }

    fn put(&self, certificate: StoredCertificate) -> Result<(), CaError> {
        let mut entries = self.entries.lock();
        entries.insert(certificate.domain.clone(), certificate);
        self.flush(&entries)
    }

    fn clear(&self) -> Result<(), CaError> {
        let mut entries = self.entries.lock();
        entries.clear();
        self.flush(&entries)
    }
}

/// Volatile certificate store.
#[derive(Default)]
pub struct MemoryCertificateStore {
    entries: Mutex<HashMap<String, StoredCertificate>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn get(&self, domain: &str) -> Result<Option<StoredCertificate>, CaError> {
        Ok(self.entries.lock().get(domain).cloned())
    }

    fn put(&self, certificate: StoredCertificate) -> Result<(), CaError> {
        self.entries
            .lock()
            .insert(certificate.domain.clone(), certificate);
        Ok(())
    }

    fn clear(&self) -> Result<(), CaError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Write a file readable only by the current user.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = fs::OpenOptions::new();
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(domain: &str) -> StoredCertificate {
        StoredCertificate {
            domain: domain.to_string(),
            certificate_pem: "-----BEGIN CERTIFICATE-----".to_string(),
            encrypted_key: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_file_secret_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("keys").join("storage.key"));
        assert_eq!(store.load().unwrap(), None);

        store.store(&[7u8; 32]).unwrap();
        assert_eq!(store.load().unwrap(), Some(vec![7u8; 32]));
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.key");
        FileSecretStore::new(&path).store(&[1u8; 32]).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_unavailable_secret_store() {
        let store = MemorySecretStore::unavailable();
        assert!(matches!(store.load(), Err(CaError::SecretStore(_))));
        assert!(store.store(b"k").is_err());
    }

    #[test]
    fn test_file_certificate_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificates.json");

        let store = FileCertificateStore::open(&path).unwrap();
        store.put(sample("example.com")).unwrap();
        store.put(sample("CA Root")).unwrap();
        drop(store);

        let reopened = FileCertificateStore::open(&path).unwrap();
        assert_eq!(reopened.get("example.com").unwrap(), Some(sample("example.com")));

        reopened.clear().unwrap();
        let emptied = FileCertificateStore::open(&path).unwrap();
        assert_eq!(emptied.get("CA Root").unwrap(), None);
    }

    #[test]
    fn test_corrupt_certificate_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificates.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(FileCertificateStore::open(&path), Err(CaError::Storage(_))));
    }
}
