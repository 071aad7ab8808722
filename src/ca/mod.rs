//! Certificate authority for HTTPS interception
//!
//! Issues per-host leaf certificates signed by a long-lived root, with
//! private keys sealed at rest under a key held in a [`SecretStore`].

mod authority;
mod crypto;
mod store;

use std::path::Path;

pub use authority::{CertificateAuthority, CertificateRecord, ROOT_CONTENT_TYPE, ROOT_DOMAIN};
pub use crypto::{decrypt, encrypt, generate_key};
pub use store::{
    CertificateStore, FileCertificateStore, FileSecretStore, MemoryCertificateStore,
    MemorySecretStore, SecretStore, StoredCertificate,
};

use crate::error::CaError;

impl CertificateAuthority {
    /// Authority persisted under `dir` (`storage.key` and `certificates.json`).
    pub fn open(dir: &Path) -> Result<Self, CaError> {
        let store = FileCertificateStore::open(dir.join("certificates.json"))?;
        Ok(Self::new(
            Box::new(FileSecretStore::new(dir.join("storage.key"))),
            Box::new(store),
        ))
    }

    /// Volatile authority, used by tests and throwaway sessions.
    pub fn in_memory() -> Self {
        Self::new(
            Box::new(MemorySecretStore::new()),
            Box::new(MemoryCertificateStore::new()),
        )
    }
}
