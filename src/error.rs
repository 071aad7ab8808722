//! Custom error types for Waylay
//!
//! Provides structured error handling with context propagation
//! and user-friendly error messages.

use thiserror::Error;

/// Main error type for Waylay operations
#[derive(Error, Debug)]
pub enum WaylayError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate authority errors
    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// HTTP parsing and client errors
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// Proxy server errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError { path: String, source: std::io::Error },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Configuration file not found: {0}")]
    NotFound(String),
}

/// Certificate authority and key storage errors
#[derive(Error, Debug)]
pub enum CaError {
    #[error("Secret store unavailable: {0}")]
    SecretStore(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Certificate signing failed for {domain}: {reason}")]
    Signing { domain: String, reason: String },

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Stored key material is corrupt")]
    CorruptCiphertext,

    #[error("Stored certificate for {domain} is malformed: {reason}")]
    MalformedPem { domain: String, reason: String },

    #[error("Certificate storage failed: {0}")]
    Storage(String),
}

/// HTTP parsing and client errors
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Could not parse HTTP message: {0}")]
    Parse(String),

    #[error("Incomplete HTTP message")]
    Incomplete,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },
}

/// Proxy server errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to start proxy on {addr}: {reason}")]
    StartError { addr: String, reason: String },

    #[error("Failed to generate certificate for {domain}: {reason}")]
    CertificateError { domain: String, reason: String },

    #[error("Connection to target failed: {target}: {reason}")]
    TargetConnectionError { target: String, reason: String },

    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    #[error("Upstream proxy refused tunnel: {0}")]
    UpstreamRefused(String),

    #[error("Proxy already running")]
    AlreadyRunning,
}

impl WaylayError {
    /// Create an error with additional context
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        WaylayError::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            WaylayError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            WaylayError::Ca(e) => format!("Certificate problem: {}", e.user_hint()),
            WaylayError::Http(e) => format!("Network issue: {}", e.user_hint()),
            WaylayError::Proxy(e) => format!("Proxy issue: {}", e.user_hint()),
            WaylayError::Io(e) => format!("File system issue: {}", e),
            WaylayError::WithContext { context, source } => {
                format!("{}: {}", context, source)
            }
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
            ConfigError::NotFound(path) => {
                format!("Configuration file '{}' not found. Run with --generate-config to create one.", path)
            }
        }
    }
}

impl UserHint for CaError {
    fn user_hint(&self) -> String {
        match self {
            CaError::SecretStore(_) => {
                "The key store could not be opened. Check permissions on the data directory.".into()
            }
            CaError::CorruptCiphertext | CaError::MalformedPem { .. } => {
                "Stored certificates are damaged. Remove the certificate store to regenerate the root CA.".into()
            }
            CaError::InvalidDomain(domain) => {
                format!("'{}' cannot be used as a certificate name.", domain)
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for HttpError {
    fn user_hint(&self) -> String {
        match self {
            HttpError::ConnectionError(_) => {
                "Could not connect to the server. Check if it's running and accessible.".into()
            }
            HttpError::Timeout(ms) => {
                format!("Request timed out after {}ms. The server may be slow or unresponsive.", ms)
            }
            HttpError::InvalidUrl(url) => {
                format!("'{}' is not a valid URL. Check the format.", url)
            }
            HttpError::TlsError(_) => {
                "TLS/SSL connection failed. The certificate may be invalid or expired.".into()
            }
            _ => self.to_string(),
        }
    }
}

impl UserHint for ProxyError {
    fn user_hint(&self) -> String {
        match self {
            ProxyError::StartError { addr, .. } => {
                format!("Could not start proxy on {}. It may already be in use.", addr)
            }
            ProxyError::CertificateError { domain, .. } => {
                format!("Could not create certificate for '{}'. Check CA configuration.", domain)
            }
            ProxyError::UpstreamRefused(_) => {
                "The upstream proxy rejected the tunnel. Check the upstream_proxy setting.".into()
            }
            _ => self.to_string(),
        }
    }
}

/// Extension trait for adding context to Result types
pub trait ResultExt<T, E> {
    fn with_context<C>(self, context: C) -> Result<T, WaylayError>
    where
        C: Into<String>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<C>(self, context: C) -> Result<T, WaylayError>
    where
        C: Into<String>,
    {
        self.map_err(|e| WaylayError::with_context(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_uses_hint() {
        let err = WaylayError::from(CaError::CorruptCiphertext);
        assert!(err.user_message().contains("regenerate the root CA"));
    }

    #[test]
    fn test_result_ext_wraps_source() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = res.with_context("Writing key").unwrap_err();
        assert_eq!(err.to_string(), "Writing key: disk gone");
    }
}
