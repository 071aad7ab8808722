//! Root CA lifecycle and on-demand leaf issuance

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P384_SHA384,
};
use rustls_pki_types::{pem::PemObject, CertificateDer};
use std::collections::HashMap;
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

use super::crypto;
use super::store::{CertificateStore, SecretStore, StoredCertificate};
use crate::error::CaError;

/// Store key under which the root certificate is kept.
pub const ROOT_DOMAIN: &str = "CA Root";

/// Content type served when the root certificate is exported.
pub const ROOT_CONTENT_TYPE: &str = "application/x-x509-ca-cert";

const ROOT_VALIDITY_DAYS: i64 = 365 * 30;
const LEAF_VALIDITY_DAYS: i64 = 365 * 10;
const SERIAL_LEN: usize = 20;

/// A certificate with its private key, both PEM encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

struct Root {
    record: CertificateRecord,
    issuer: Certificate,
    key: KeyPair,
    storage_key: Vec<u8>,
}

#[derive(Default)]
struct AuthorityState {
    root: Option<Root>,
    leaves: HashMap<String, CertificateRecord>,
}

/// Certificate authority backing HTTPS interception.
///
/// One root exists at a time. It is loaded from the stores on first use,
/// or generated (with a fresh storage key) when none is present. Leaves are
/// cached in memory and persisted with their keys sealed under the storage
/// key.
pub struct CertificateAuthority {
    secrets: Box<dyn SecretStore>,
    store: Box<dyn CertificateStore>,
    state: Mutex<AuthorityState>,
}

impl CertificateAuthority {
    pub fn new(secrets: Box<dyn SecretStore>, store: Box<dyn CertificateStore>) -> Self {
        Self {
            secrets,
            store,
            state: Mutex::new(AuthorityState::default()),
        }
    }

    /// PEM of the root certificate, generating the root if needed.
    pub fn root_certificate(&self) -> Result<String, CaError> {
        let mut state = self.state.lock();
        let root = self.ensure_root(&mut state)?;
        Ok(root.record.certificate_pem.clone())
    }

    /// Root certificate for download, as `(content type, body)`.
    pub fn export_root(&self) -> Result<(&'static str, Vec<u8>), CaError> {
        let pem = self.root_certificate()?;
        Ok((ROOT_CONTENT_TYPE, pem.into_bytes()))
    }

    /// Leaf certificate for `domain`, issuing and persisting one if needed.
    ///
    /// [`ROOT_DOMAIN`] returns the root record itself.
    pub fn certificate_for_domain(&self, domain: &str) -> Result<CertificateRecord, CaError> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let root = self.ensure_root_mut(&mut state.root, &mut state.leaves)?;
        if domain == ROOT_DOMAIN {
            return Ok(root.record.clone());
        }

        if let Some(cached) = state.leaves.get(domain) {
            return Ok(cached.clone());
        }

        let record = match self.store.get(domain)? {
            Some(stored) => open_stored(&stored, &root.storage_key)?,
            None => {
                let record = issue_leaf(domain, root)?;
                self.store.put(StoredCertificate {
                    domain: domain.to_string(),
                    certificate_pem: record.certificate_pem.clone(),
                    encrypted_key: crypto::encrypt(
                        &root.storage_key,
                        record.private_key_pem.as_bytes(),
                    )?,
                })?;
                tracing::debug!(domain, "Issued leaf certificate");
                record
            }
        };

        state.leaves.insert(domain.to_string(), record.clone());
        Ok(record)
    }

    fn ensure_root<'a>(&self, state: &'a mut AuthorityState) -> Result<&'a Root, CaError> {
        self.ensure_root_mut(&mut state.root, &mut state.leaves)
    }

    fn ensure_root_mut<'a>(
        &self,
        slot: &'a mut Option<Root>,
        leaves: &mut HashMap<String, CertificateRecord>,
    ) -> Result<&'a Root, CaError> {
        if slot.is_none() {
            let root = match self.load_root()? {
                Some(root) => root,
                None => {
                    leaves.clear();
                    self.generate_root()?
                }
            };
            *slot = Some(root);
        }

        slot.as_ref()
            .ok_or_else(|| CaError::Storage("root certificate unavailable".into()))
    }

    fn load_root(&self) -> Result<Option<Root>, CaError> {
        let storage_key = self.secrets.load()?;
        let stored = self.store.get(ROOT_DOMAIN)?;

        let (storage_key, stored) = match (storage_key, stored) {
            (Some(k), Some(s)) => (k, s),
            _ => return Ok(None),
        };

        let record = open_stored(&stored, &storage_key)?;
        let key = KeyPair::from_pem(&record.private_key_pem).map_err(|e| CaError::MalformedPem {
            domain: ROOT_DOMAIN.to_string(),
            reason: e.to_string(),
        })?;

        // Rebuild an issuer with the same subject and key; leaves chain to the stored root.
        let issuer = root_params(None)?
            .self_signed(&key)
            .map_err(|e| CaError::Signing {
                domain: ROOT_DOMAIN.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Loaded root CA from certificate store");
        Ok(Some(Root {
            record,
            issuer,
            key,
            storage_key,
        }))
    }

    fn generate_root(&self) -> Result<Root, CaError> {
        tracing::info!("Generating new root CA certificate");

        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;
        let issuer = root_params(Some(random_serial()?))?
            .self_signed(&key)
            .map_err(|e| CaError::Signing {
                domain: ROOT_DOMAIN.to_string(),
                reason: e.to_string(),
            })?;

        let record = CertificateRecord {
            domain: ROOT_DOMAIN.to_string(),
            certificate_pem: issuer.pem(),
            private_key_pem: key.serialize_pem(),
        };

        let storage_key = crypto::generate_key()?;
        let encrypted_key = crypto::encrypt(&storage_key, record.private_key_pem.as_bytes())?;

        // Leaves signed by a previous root are useless now.
        self.store.clear()?;
        self.secrets.store(&storage_key)?;
        self.store.put(StoredCertificate {
            domain: ROOT_DOMAIN.to_string(),
            certificate_pem: record.certificate_pem.clone(),
            encrypted_key,
        })?;

        Ok(Root {
            record,
            issuer,
            key,
            storage_key,
        })
    }
}

fn root_params(serial: Option<SerialNumber>) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Waylay Root CA");
    dn.push(DnType::OrganizationName, "Waylay Root CA");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params.serial_number = serial;

    Ok(params)
}

fn issue_leaf(domain: &str, root: &Root) -> Result<CertificateRecord, CaError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    // IP literals need an IP SAN; hostnames get exactly one DNS SAN.
    params.subject_alt_names = match domain.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(
            domain
                .try_into()
                .map_err(|_| CaError::InvalidDomain(domain.to_string()))?,
        )],
    };

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
    params.serial_number = Some(random_serial()?);

    let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;
    let cert = params
        .signed_by(&key, &root.issuer, &root.key)
        .map_err(|e| CaError::Signing {
            domain: domain.to_string(),
            reason: e.to_string(),
        })?;

    Ok(CertificateRecord {
        domain: domain.to_string(),
        certificate_pem: cert.pem(),
        private_key_pem: key.serialize_pem(),
    })
}

/// Serial drawn uniformly from [0, 2^159).
fn random_serial() -> Result<SerialNumber, CaError> {
    let mut bytes = [0u8; SERIAL_LEN];
    crypto::random_bytes(&mut bytes)?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

fn open_stored(stored: &StoredCertificate, storage_key: &[u8]) -> Result<CertificateRecord, CaError> {
    let malformed = |reason: String| CaError::MalformedPem {
        domain: stored.domain.clone(),
        reason,
    };

    let certs = CertificateDer::pem_slice_iter(stored.certificate_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| malformed(e.to_string()))?;
    if certs.is_empty() {
        return Err(malformed("no certificate block".into()));
    }

    let key_bytes = crypto::decrypt(storage_key, &stored.encrypted_key)?;
    let private_key_pem = String::from_utf8(key_bytes).map_err(|e| malformed(e.to_string()))?;

    Ok(CertificateRecord {
        domain: stored.domain.clone(),
        certificate_pem: stored.certificate_pem.clone(),
        private_key_pem,
    })
}
