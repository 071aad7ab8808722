//! Dialing upstream servers, directly or through a chained proxy

use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

use super::conn::{BoxIo, HttpConn};
use crate::error::{HttpError, ProxyError};
use crate::http::parse_response;

/// Opens raw byte streams to `host:port`.
#[derive(Debug, Clone)]
pub struct Upstream {
    proxy: Option<Url>,
    connect_timeout: Duration,
}

impl Upstream {
    pub fn new(proxy: Option<&str>, connect_timeout: Duration) -> Result<Self, ProxyError> {
        let proxy = proxy
            .map(|p| {
                Url::parse(p).map_err(|e| ProxyError::InvalidRequest(format!("upstream proxy {}: {}", p, e)))
            })
            .transpose()?;
        Ok(Self {
            proxy,
            connect_timeout,
        })
    }

    pub fn direct() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Connect to `host:port`.
    ///
    /// With a chained proxy the stream is a CONNECT tunnel through it, for
    /// plain HTTP targets as well.
    pub async fn connect(&self, host: &str, port: u16) -> Result<BoxIo, ProxyError> {
        let target = format!("{}:{}", host, port);
        match &self.proxy {
            None => self.dial(host, port).await,
            Some(proxy) => {
                let proxy_host = proxy.host_str().unwrap_or("127.0.0.1");
                let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
                let io = self.dial(proxy_host, proxy_port).await?;
                tunnel(io, &target).await
            }
        }
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxIo, ProxyError> {
        let target = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| ProxyError::TargetConnectionError {
                target: target.clone(),
                reason: format!("timed out after {}s", self.connect_timeout.as_secs()),
            })?
            .map_err(|e| ProxyError::TargetConnectionError {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Ask a proxy on `io` to open a tunnel to `target`.
async fn tunnel(io: BoxIo, target: &str) -> Result<BoxIo, ProxyError> {
    let mut conn = HttpConn::new(io);
    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n"
    );
    conn.send(request.as_bytes()).await.map_err(refused)?;

    let head = conn
        .read_head()
        .await
        .map_err(refused)?
        .ok_or_else(|| ProxyError::UpstreamRefused("connection closed".into()))?;
    let response = parse_response(&head).map_err(refused)?;
    if !(200..300).contains(&response.status) {
        return Err(ProxyError::UpstreamRefused(format!(
            "{} {}",
            response.status, response.reason
        )));
    }

    let (io, leftover) = conn.into_inner();
    if !leftover.is_empty() {
        tracing::debug!(target, "Discarding {} bytes after CONNECT reply", leftover.len());
    }
    Ok(io)
}

fn refused(e: HttpError) -> ProxyError {
    ProxyError::UpstreamRefused(e.to_string())
}
