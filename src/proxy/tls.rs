//! TLS for both legs of an intercepted connection

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::conn::BoxIo;
use crate::ca::CertificateAuthority;
use crate::error::ProxyError;

/// Builds per-host acceptors from the certificate authority and dials
/// upstream servers.
pub struct TlsFactory {
    ca: Arc<CertificateAuthority>,
    provider: Arc<CryptoProvider>,
    acceptors: Mutex<HashMap<String, TlsAcceptor>>,
    connector: TlsConnector,
}

impl TlsFactory {
    /// Upstream certificates are accepted as presented, as an intercepting
    /// proxy has to reach self-signed and internal servers.
    pub fn new(ca: Arc<CertificateAuthority>) -> Result<Self, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_setup_error("upstream", e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider.clone())))
            .with_no_client_auth();
        Ok(Self::build(ca, provider, client_config))
    }

    /// Upstream certificates are checked against the Mozilla root set.
    pub fn verifying(ca: Arc<CertificateAuthority>) -> Result<Self, ProxyError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(ca, roots)
    }

    pub fn with_roots(
        ca: Arc<CertificateAuthority>,
        roots: rustls::RootCertStore,
    ) -> Result<Self, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_setup_error("upstream", e))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::build(ca, provider, client_config))
    }

    fn build(
        ca: Arc<CertificateAuthority>,
        provider: Arc<CryptoProvider>,
        mut client_config: rustls::ClientConfig,
    ) -> Self {
        client_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            ca,
            provider,
            acceptors: Mutex::new(HashMap::new()),
            connector: TlsConnector::from(Arc::new(client_config)),
        }
    }

    /// Acceptor presenting a leaf certificate for `host`.
    ///
    /// Issues the certificate on first use, off the async workers since key
    /// generation is CPU bound. Only HTTP/1.1 is offered.
    pub async fn acceptor(&self, host: &str) -> Result<TlsAcceptor, ProxyError> {
        let cached = self.acceptors.lock().get(host).cloned();
        if let Some(acceptor) = cached {
            return Ok(acceptor);
        }

        let ca = self.ca.clone();
        let domain = host.to_string();
        let record = tokio::task::spawn_blocking(move || ca.certificate_for_domain(&domain))
            .await
            .map_err(|e| cert_error(host, e))?
            .map_err(|e| cert_error(host, e))?;

        let certs = CertificateDer::pem_slice_iter(record.certificate_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| cert_error(host, e))?;
        let key = PrivateKeyDer::from_pem_slice(record.private_key_pem.as_bytes())
            .map_err(|e| cert_error(host, e))?;

        let mut config = rustls::ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| cert_error(host, e))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| cert_error(host, e))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let acceptor = TlsAcceptor::from(Arc::new(config));
        self.acceptors
            .lock()
            .insert(host.to_string(), acceptor.clone());
        tracing::debug!(host, "Built TLS acceptor");
        Ok(acceptor)
    }

    /// Wrap the client side of a CONNECT tunnel.
    pub async fn accept(&self, acceptor: TlsAcceptor, io: BoxIo) -> Result<BoxIo, ProxyError> {
        let tls = acceptor
            .accept(io)
            .await
            .map_err(|e| ProxyError::InvalidRequest(format!("client TLS handshake failed: {}", e)))?;
        Ok(Box::new(tls))
    }

    /// Open TLS to an upstream server.
    pub async fn connect(&self, host: &str, io: BoxIo) -> Result<BoxIo, ProxyError> {
        let name = ServerName::try_from(host.to_string()).map_err(|e| {
            ProxyError::TargetConnectionError {
                target: host.to_string(),
                reason: e.to_string(),
            }
        })?;
        let tls = self
            .connector
            .connect(name, io)
            .await
            .map_err(|e| ProxyError::TargetConnectionError {
                target: host.to_string(),
                reason: format!("TLS: {}", e),
            })?;
        Ok(Box::new(tls))
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }
}

/// Verifier for the upstream leg that trusts any certificate but still
/// checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn cert_error(domain: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::CertificateError {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}

fn tls_setup_error(side: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::StartError {
        addr: side.to_string(),
        reason: e.to_string(),
    }
}
