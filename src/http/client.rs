//! Shared outbound connection pool for replayed and bulk requests

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use super::headers::correct_length_headers;
use super::request::parse_request;
use crate::app::Config;
use crate::error::HttpError;
use crate::project::BodySource;

/// Client certificate presented to upstream servers.
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub certificate_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl ClientCertificate {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, HttpError> {
        let read = |p: &Path| {
            std::fs::read(p).map_err(|e| HttpError::TlsError(format!("{}: {}", p.display(), e)))
        };
        Ok(Self {
            certificate_pem: read(cert_path)?,
            key_pem: read(key_path)?,
        })
    }
}

/// Pool construction options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Exchanges in flight to one host at a time
    pub max_connections_per_host: usize,
    pub max_idle_per_host: usize,
    pub connect_timeout: Duration,
    pub upstream_proxy: Option<String>,
    pub client_certificate: Option<ClientCertificate>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections_per_host: 2,
            max_idle_per_host: 100,
            connect_timeout: Duration::from_secs(30),
            upstream_proxy: None,
            client_certificate: None,
        }
    }
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Result<Self, HttpError> {
        let client_certificate = match (
            &config.requests.client_cert_path,
            &config.requests.client_key_path,
        ) {
            (Some(cert), Some(key)) => Some(ClientCertificate::load(cert, key)?),
            _ => None,
        };

        Ok(Self {
            max_connections_per_host: config.requests.max_connections_per_host,
            max_idle_per_host: config.requests.max_idle_per_host,
            connect_timeout: Duration::from_secs(config.requests.connect_timeout),
            upstream_proxy: config.proxy.upstream_proxy.clone(),
            client_certificate,
        })
    }
}

/// Target of a request after resolving it against the site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub url: Url,
    pub method: String,
}

/// Per-host cap on exchanges in flight, keyed by `host:port`.
pub struct HostLimits {
    max: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a free slot on the host of `url`.
    pub async fn acquire(&self, url: &Url) -> Result<OwnedSemaphorePermit, HttpError> {
        let key = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        let semaphore = self
            .hosts
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max)))
            .clone();
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| HttpError::ConnectionError("host connection limit closed".into()))
    }
}

/// A response that keeps its host slot until it is dropped.
#[derive(Debug)]
pub struct PooledResponse {
    response: reqwest::Response,
    _permit: OwnedSemaphorePermit,
}

impl PooledResponse {
    pub fn into_inner(self) -> reqwest::Response {
        self.response
    }
}

impl Deref for PooledResponse {
    type Target = reqwest::Response;

    fn deref(&self) -> &reqwest::Response {
        &self.response
    }
}

#[async_trait]
impl BodySource for PooledResponse {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        self.response.next_chunk().await
    }
}

/// HTTP/1.1 client shared by every outbound request.
///
/// Redirects are never followed and upstream certificates are not
/// verified: responses are recorded exactly as the server sent them.
/// At most `max_connections_per_host` exchanges run against one host at a
/// time; pools built with [`with_limits`](Self::with_limits) share that cap.
#[derive(Clone)]
pub struct ConnectionPool {
    client: reqwest::Client,
    limits: Arc<HostLimits>,
}

impl ConnectionPool {
    pub fn new(options: &PoolOptions) -> Result<Self, HttpError> {
        Self::with_limits(options, Arc::new(HostLimits::new(options.max_connections_per_host)))
    }

    pub fn with_limits(options: &PoolOptions, limits: Arc<HostLimits>) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(options.max_idle_per_host)
            .connect_timeout(options.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true);

        builder = match &options.upstream_proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", proxy, e)))?,
            ),
            None => builder.no_proxy(),
        };

        if let Some(cert) = &options.client_certificate {
            let mut pem = cert.certificate_pem.clone();
            pem.push(b'\n');
            pem.extend_from_slice(&cert.key_pem);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| HttpError::TlsError(format!("client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| HttpError::RequestFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, limits })
    }

    pub fn limits(&self) -> &Arc<HostLimits> {
        &self.limits
    }

    /// Send raw request bytes to `site`.
    ///
    /// The scheme comes from `site`; the host comes from the request's
    /// `Host` header when present. Length headers are recomputed first.
    /// The host slot is held until the returned response is dropped.
    pub async fn make_request_to_site(
        &self,
        site: &Url,
        raw: &[u8],
    ) -> Result<(PreparedRequest, PooledResponse), HttpError> {
        let prepared = prepare(site, raw)?;
        let corrected = correct_length_headers(raw);
        let parsed = parse_request(&corrected)?;

        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|_| HttpError::Parse(format!("invalid method '{}'", parsed.method)))?;

        let mut builder = self.client.request(method, prepared.url.clone());
        for (name, value) in &parsed.headers {
            if is_managed_header(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => builder = builder.header(n, v),
                _ => tracing::debug!(header = %name, "Skipping header that cannot be sent"),
            }
        }
        if !parsed.body.is_empty() {
            builder = builder.body(parsed.body);
        }

        let permit = self.limits.acquire(&prepared.url).await?;
        let response = builder.send().await.map_err(classify)?;
        Ok((
            prepared,
            PooledResponse {
                response,
                _permit: permit,
            },
        ))
    }
}

/// Resolve the URL and method for `raw` against `site`.
pub fn prepare(site: &Url, raw: &[u8]) -> Result<PreparedRequest, HttpError> {
    let parsed = parse_request(&correct_length_headers(raw))?;
    let scheme = site.scheme();

    let default_host = match site.port() {
        Some(port) => format!("{}:{}", site.host_str().unwrap_or_default(), port),
        None => site.host_str().unwrap_or_default().to_string(),
    };
    let host = parsed
        .header("host")
        .map(str::to_string)
        .unwrap_or(default_host);
    let host = match scheme {
        "https" => host.strip_suffix(":443").unwrap_or(&host).to_string(),
        "http" => host.strip_suffix(":80").unwrap_or(&host).to_string(),
        _ => host,
    };

    let url = parsed.url(scheme, &host)?;
    Ok(PreparedRequest {
        url,
        method: parsed.method,
    })
}

fn is_managed_header(name: &str) -> bool {
    ["host", "content-length", "connection", "transfer-encoding"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

fn classify(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout(0)
    } else if e.is_connect() {
        HttpError::ConnectionError(e.to_string())
    } else {
        HttpError::RequestFailed(e.to_string())
    }
}

/// Reconstruct the wire head of a response received through the pool.
pub fn response_head(response: &reqwest::Response) -> Vec<u8> {
    let version = match response.version() {
        reqwest::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let status = response.status();

    let mut head = format!(
        "{} {} {}\r\n",
        version,
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}
