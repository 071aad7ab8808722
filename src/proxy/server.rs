//! Proxy server implementation

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use url::Url;

use super::conn::{HttpConn, WireBody};
use super::engine::{InterceptionEngine, RequestVerdict, ResponseStart};
use super::tls::TlsFactory;
use super::upstream::Upstream;
use super::websocket;
use crate::app::ProxyConfig;
use crate::error::{HttpError, ProxyError};
use crate::http::{
    dechunk, parse_request, parse_response, reframe_with_length, request_framing,
    response_framing, split_authority, text_response, to_origin_form, BodyFraming,
    ParsedRequest, ParsedResponse,
};
use crate::project::BodySource;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Where requests on a connection are going.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: &'static str,
    host: String,
    port: u16,
}

impl Target {
    fn from_url(url: &Url) -> Option<Self> {
        let scheme = match url.scheme() {
            "https" => "https",
            "http" => "http",
            _ => return None,
        };
        Some(Self {
            scheme,
            host: url.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string(),
            port: url.port_or_known_default()?,
        })
    }

    /// `host[:port]`, omitting the scheme's default port.
    fn authority(&self) -> String {
        let default = if self.scheme == "https" { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// State shared by every connection.
struct Shared {
    engine: Arc<InterceptionEngine>,
    tls: Arc<TlsFactory>,
    upstream: Upstream,
    https_intercept: bool,
    max_request_size: usize,
}

/// Intercepting proxy server
pub struct ProxyServer {
    /// Configuration
    config: ProxyConfig,

    shared: Arc<Shared>,

    /// Server shutdown signal
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,

    /// Server running flag
    running: Arc<AtomicBool>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: &ProxyConfig,
        engine: Arc<InterceptionEngine>,
        tls: Arc<TlsFactory>,
        upstream: Upstream,
    ) -> Self {
        let shared = Shared {
            engine,
            tls,
            upstream,
            https_intercept: config.https_intercept,
            max_request_size: config.max_request_size,
        };
        Self {
            config: config.clone(),
            shared: Arc::new(shared),
            shutdown_tx: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the proxy server, returning the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning.into());
        }

        let addr = format!("{}:{}", self.config.listen_addr, self.config.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ProxyError::StartError {
                    addr,
                    reason: e.to_string(),
                }
                .into());
            }
        };
        let local = listener
            .local_addr()
            .context("Failed to read proxy listen address")?;

        tracing::info!("Proxy server listening on {}", local);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let shared = self.shared.clone();
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            tracing::debug!("Proxy: new connection from {}", peer_addr);
                            let shared = shared.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(shared, stream).await {
                                    tracing::warn!("Proxy connection error from {}: {:#}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            tracing::info!("Proxy server stopped");
        });

        Ok(local)
    }

    /// Stop accepting connections; open connections finish on their own
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Check if proxy is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn engine(&self) -> &Arc<InterceptionEngine> {
        &self.shared.engine
    }
}

/// Handle a single client connection
async fn handle_connection(shared: Arc<Shared>, stream: TcpStream) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut client = HttpConn::new(Box::new(stream));

    let Some(head) = client.read_head().await? else {
        return Ok(());
    };
    let parsed = match parse_request(&head) {
        Ok(parsed) => parsed,
        Err(e) => {
            client
                .send(&text_response(400, "Bad Request", &e.to_string()))
                .await?;
            return Ok(());
        }
    };

    if parsed.is_connect() {
        handle_connect(shared, client, &parsed.target).await
    } else {
        serve(shared, client, None, Some(head)).await
    }
}

/// Handle CONNECT: a blind tunnel, or TLS interception with an issued certificate
async fn handle_connect(shared: Arc<Shared>, mut client: HttpConn, authority: &str) -> Result<()> {
    let (host, port) = match split_authority(authority, 443) {
        Ok(target) => target,
        Err(e) => {
            client
                .send(&text_response(400, "Bad Request", &e.to_string()))
                .await?;
            return Ok(());
        }
    };

    let intercept = shared.https_intercept && !shared.engine.passthrough().host_excluded(&host);
    if !intercept {
        tracing::debug!("Proxy: tunnelling {}:{}", host, port);
        let upstream = match shared.upstream.connect(&host, port).await {
            Ok(io) => io,
            Err(e) => {
                client
                    .send(&text_response(502, "Bad Gateway", &e.to_string()))
                    .await?;
                return Ok(());
            }
        };
        client.send(CONNECT_ESTABLISHED).await?;
        return tunnel(client, HttpConn::new(upstream)).await;
    }

    // The certificate must exist before the client is told to go ahead.
    let acceptor = match shared.tls.acceptor(&host).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            tracing::warn!("Proxy: {}", e);
            client
                .send(&text_response(500, "Internal Server Error", &e.to_string()))
                .await?;
            return Ok(());
        }
    };
    client.send(CONNECT_ESTABLISHED).await?;

    let (io, leftover) = client.into_inner();
    if !leftover.is_empty() {
        tracing::debug!(host = %host, "Client sent {} bytes before the CONNECT reply", leftover.len());
    }
    let tls = shared
        .tls
        .accept(acceptor, io)
        .await
        .with_context(|| format!("TLS with client for {}", host))?;

    let target = Target {
        scheme: "https",
        host,
        port,
    };
    serve(shared, HttpConn::new(tls), Some(target), None).await
}

/// Copy bytes both ways until either side closes
async fn tunnel(client: HttpConn, server: HttpConn) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let (mut client_io, client_leftover) = client.into_inner();
    let (mut server_io, server_leftover) = server.into_inner();
    if !client_leftover.is_empty() {
        server_io.write_all(&client_leftover).await?;
    }
    if !server_leftover.is_empty() {
        client_io.write_all(&server_leftover).await?;
    }
    let _ = tokio::io::copy_bidirectional(&mut client_io, &mut server_io).await;
    Ok(())
}

/// Exchange loop for one client connection
///
/// `default_target` is the CONNECT destination for intercepted TLS; plain
/// proxy requests name their target in absolute form.
async fn serve(
    shared: Arc<Shared>,
    mut client: HttpConn,
    default_target: Option<Target>,
    mut first_head: Option<Vec<u8>>,
) -> Result<()> {
    let mut upstream: Option<(Target, HttpConn)> = None;

    loop {
        let head = match first_head.take() {
            Some(head) => head,
            None => match client.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Proxy: client read ended: {}", e);
                    break;
                }
            },
        };

        let parsed = match parse_request(&head) {
            Ok(parsed) => parsed,
            Err(e) => {
                client
                    .send(&text_response(400, "Bad Request", &e.to_string()))
                    .await?;
                break;
            }
        };

        let target = match resolve_target(&parsed, default_target.as_ref()) {
            Some(target) => target,
            None => {
                client
                    .send(&text_response(400, "Bad Request", "Request target has no host"))
                    .await?;
                break;
            }
        };

        let raw = match read_request(&shared, &mut client, &parsed, head).await {
            Ok(raw) => raw,
            Err(HttpError::BodyTooLarge { size, max }) => {
                let message = format!("Request body of {} bytes exceeds {} bytes", size, max);
                client
                    .send(&text_response(413, "Payload Too Large", &message))
                    .await?;
                break;
            }
            Err(e) => {
                tracing::debug!("Proxy: could not read request body: {}", e);
                break;
            }
        };

        let url = parsed
            .url(target.scheme, &target.authority())
            .context("Building request URL")?;
        let client_close = parsed.wants_close();

        let keep_alive = match shared.engine.on_request(&url, raw.clone()).await {
            RequestVerdict::Respond { response, .. } => {
                client.send(&response).await?;
                false
            }
            RequestVerdict::Passthrough => {
                relay_uncaptured(&shared, &mut client, &mut upstream, &target, &parsed.method, &raw)
                    .await?
            }
            RequestVerdict::Forward { request, outgoing } => {
                let started = Instant::now();
                let exchange =
                    send_upstream(&shared, &mut upstream, &target, &outgoing).await;

                let (mut server, head) = match exchange {
                    Ok(exchange) => exchange,
                    Err(e) => {
                        let (_, response) = shared.engine.upstream_failed(request, &e);
                        client.send(&response).await?;
                        break;
                    }
                };
                let response = match parse_response(&head) {
                    Ok(response) => response,
                    Err(e) => {
                        let (_, reply) = shared
                            .engine
                            .upstream_failed(request, &format!("Invalid response: {}", e));
                        client.send(&reply).await?;
                        break;
                    }
                };

                let mut request = request;
                request.response_time_ms = started.elapsed().as_millis() as u64;

                if response.status == 101 {
                    shared.engine.begin_stream(&mut request, &head);
                    client.send(&head).await?;
                    websocket::relay(&shared.engine, request, client, server).await;
                    return Ok(());
                }

                let framing = response_framing(response.status, &request.verb, &response.headers)
                    .unwrap_or(BodyFraming::UntilClose);
                let reusable = forward_response(&shared, &mut client, &mut server, request, head, framing)
                    .await?;

                if reusable && !server_wants_close(&response) {
                    upstream = Some((target.clone(), server));
                }
                framing != BodyFraming::UntilClose
            }
        };

        if client_close || !keep_alive {
            break;
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Target of a request: absolute-form URLs name their own, others use the
/// connection's CONNECT destination.
fn resolve_target(parsed: &ParsedRequest, default: Option<&Target>) -> Option<Target> {
    if parsed.is_absolute_form() {
        return Url::parse(&parsed.target)
            .ok()
            .and_then(|url| Target::from_url(&url));
    }
    match default {
        Some(target) => Some(target.clone()),
        None => {
            let host = parsed.header("host")?;
            Url::parse(&format!("http://{}", host))
                .ok()
                .and_then(|url| Target::from_url(&url))
        }
    }
}

/// Read the rest of a request and return it as sent upstream.
///
/// Chunked bodies are decoded and given a `Content-Length`; absolute-form
/// targets are rewritten to origin form.
async fn read_request(
    shared: &Shared,
    client: &mut HttpConn,
    parsed: &ParsedRequest,
    head: Vec<u8>,
) -> Result<Vec<u8>, HttpError> {
    if parsed
        .header("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    {
        client.send(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }

    let framing = request_framing(&parsed.headers)?;
    let body = client
        .read_full_body(framing, shared.max_request_size)
        .await?;

    let mut raw = head;
    if framing == BodyFraming::Chunked {
        raw.extend_from_slice(&dechunk(&body)?);
        raw = reframe_with_length(&raw);
    } else {
        raw.extend_from_slice(&body);
    }

    if parsed.is_absolute_form() {
        raw = to_origin_form(&raw);
    }
    Ok(raw)
}

/// Send `outgoing` and read the final response head.
///
/// A reused keep-alive connection that turns out to be dead is replaced
/// once with a fresh one.
async fn send_upstream(
    shared: &Shared,
    cache: &mut Option<(Target, HttpConn)>,
    target: &Target,
    outgoing: &[u8],
) -> std::result::Result<(HttpConn, Vec<u8>), String> {
    let mut reused = match cache.take() {
        Some((cached, conn)) if cached == *target => Some(conn),
        _ => None,
    };

    loop {
        let was_reused = reused.is_some();
        let mut conn = match reused.take() {
            Some(conn) => conn,
            None => open_upstream(shared, target).await.map_err(|e| e.to_string())?,
        };

        match exchange_head(&mut conn, outgoing).await {
            Ok(head) => return Ok((conn, head)),
            Err(e) if was_reused => {
                tracing::debug!("Proxy: stale upstream connection to {}: {}", target.host, e);
                continue;
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn exchange_head(conn: &mut HttpConn, outgoing: &[u8]) -> Result<Vec<u8>, HttpError> {
    conn.send(outgoing).await?;
    loop {
        let head = conn
            .read_head()
            .await?
            .ok_or_else(|| HttpError::ConnectionError("server closed the connection".into()))?;
        // Interim responses other than 101 are consumed here.
        match parse_response(&head) {
            Ok(r) if (100..200).contains(&r.status) && r.status != 101 => continue,
            _ => return Ok(head),
        }
    }
}

async fn open_upstream(shared: &Shared, target: &Target) -> Result<HttpConn, ProxyError> {
    let io = shared.upstream.connect(&target.host, target.port).await?;
    let io = if target.scheme == "https" {
        shared.tls.connect(&target.host, io).await?
    } else {
        io
    };
    Ok(HttpConn::new(io))
}

/// Capture and forward a response body; true if the upstream connection
/// can carry another exchange.
async fn forward_response(
    shared: &Shared,
    client: &mut HttpConn,
    server: &mut HttpConn,
    request: crate::project::Request,
    head: Vec<u8>,
    framing: BodyFraming,
) -> Result<bool> {
    let engine = &shared.engine;
    let mut body = server.body(framing);

    match engine
        .on_response_start(request, head, &mut body, framing == BodyFraming::Chunked)
        .await
    {
        ResponseStart::Buffered { response, .. } => {
            client.send(&response).await?;
        }
        ResponseStart::Streaming { request, first } => {
            let (tx, rx) = mpsc::channel(64);
            engine.continue_stream(request, rx);

            let mut client_gone = client.send(&first).await.is_err();
            while let Some(chunk) = next_or_report(&mut body, &tx).await {
                if !client_gone && client.send(&chunk).await.is_err() {
                    tracing::debug!("Proxy: client went away during streaming");
                    client_gone = true;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            if client_gone {
                return Ok(false);
            }
        }
    }
    Ok(body.is_done())
}

/// Next body chunk; errors are handed to the capture task.
async fn next_or_report(
    body: &mut WireBody<'_>,
    tx: &mpsc::Sender<std::result::Result<Vec<u8>, HttpError>>,
) -> Option<Vec<u8>> {
    match body.next_chunk().await {
        Ok(chunk) => chunk,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            None
        }
    }
}

/// Forward an exchange without recording it.
async fn relay_uncaptured(
    shared: &Shared,
    client: &mut HttpConn,
    cache: &mut Option<(Target, HttpConn)>,
    target: &Target,
    method: &str,
    raw: &[u8],
) -> Result<bool> {
    let (mut server, head) = match send_upstream(shared, cache, target, raw).await {
        Ok(exchange) => exchange,
        Err(e) => {
            client
                .send(&text_response(502, "Bad Gateway", &e))
                .await?;
            return Ok(false);
        }
    };
    client.send(&head).await?;

    let Ok(response) = parse_response(&head) else {
        return Ok(false);
    };
    let framing = response_framing(response.status, method, &response.headers)
        .unwrap_or(BodyFraming::UntilClose);

    let mut body = server.body(framing);
    while let Some(chunk) = body.next_chunk().await? {
        client.send(&chunk).await?;
    }
    let reusable = body.is_done() && framing != BodyFraming::UntilClose;
    if reusable && !server_wants_close(&response) {
        *cache = Some((target.clone(), server));
    }
    Ok(framing != BodyFraming::UntilClose)
}

fn server_wants_close(response: &ParsedResponse) -> bool {
    crate::http::header_has_token(&response.headers, "connection", "close")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::InterceptSettings;
    use crate::ca::{CertificateAuthority, MemoryCertificateStore, MemorySecretStore};
    use crate::project::{Broadcaster, History, Project};
    use crate::proxy::{InterceptQueue, Passthrough};
    use crate::scripting::NoHooks;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Running {
        server: ProxyServer,
        addr: SocketAddr,
        history: Arc<History>,
    }

    async fn start_proxy(config: ProxyConfig, ca: CertificateAuthority) -> Running {
        let history = Arc::new(History::default());
        let hub = Arc::new(Broadcaster::default());
        let project = Arc::new(Project::new(history.clone(), hub.clone()));
        let engine = Arc::new(InterceptionEngine::new(
            InterceptSettings::default(),
            Arc::new(InterceptQueue::new(hub)),
            Arc::new(NoHooks),
            project,
            Passthrough::from_config(&config),
            config.stream_threshold,
        ));
        let tls = Arc::new(TlsFactory::new(Arc::new(ca)).unwrap());
        let server = ProxyServer::new(&config, engine, tls, Upstream::direct());
        let addr = server.start().await.unwrap();
        Running {
            server,
            addr,
            history,
        }
    }

    fn config() -> ProxyConfig {
        ProxyConfig {
            port: 0,
            ..ProxyConfig::default()
        }
    }

    async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    async fn until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_plain_http_is_captured() {
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("world"))
            .mount(&origin)
            .await;

        let proxy = start_proxy(config(), CertificateAuthority::in_memory()).await;
        let request = format!(
            "GET {}/hello HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n",
            origin.uri(),
            origin.address()
        );
        let response = roundtrip(proxy.addr, request.as_bytes()).await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("world"));

        let summaries = proxy.history.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].response_status, 200);
        assert!(summaries[0].url.ends_with("/hello"));

        // Origin saw an origin-form request without proxy headers.
        let received = &origin.received_requests().await.unwrap()[0];
        assert!(received.headers.get("proxy-connection").is_none());
        proxy.server.stop();
    }

    #[tokio::test]
    async fn test_upstream_failure_returns_502_and_records_error() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let proxy = start_proxy(config(), CertificateAuthority::in_memory()).await;
        let request = format!(
            "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"
        );
        let response = roundtrip(proxy.addr, request.as_bytes()).await;

        assert!(response.starts_with("HTTP/1.1 502"));
        let summaries = proxy.history.summaries();
        assert_eq!(summaries[0].response_status, 502);
        assert!(!summaries[0].error.is_empty());
    }

    #[tokio::test]
    async fn test_connect_reports_certificate_failure() {
        let ca = CertificateAuthority::new(
            Box::new(MemorySecretStore::unavailable()),
            Box::new(MemoryCertificateStore::new()),
        );
        let proxy = start_proxy(config(), ca).await;
        let response = roundtrip(
            proxy.addr,
            b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n",
        )
        .await;

        assert!(response.starts_with("HTTP/1.1 500"));
        assert!(response.contains("secure.test"));
    }

    #[tokio::test]
    async fn test_connect_without_interception_is_a_blind_tunnel() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let proxy = start_proxy(
            ProxyConfig {
                https_intercept: false,
                ..config()
            },
            CertificateAuthority::in_memory(),
        )
        .await;

        let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
        stream
            .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", echo_addr).as_bytes())
            .await
            .unwrap();
        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECT_ESTABLISHED);

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        assert!(proxy.history.is_empty());
    }

    #[tokio::test]
    async fn test_large_response_is_streamed_and_captured() {
        let origin = MockServer::start().await;
        let body = "x".repeat(8 * 1024);
        Mock::given(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.clone()))
            .mount(&origin)
            .await;

        let proxy = start_proxy(
            ProxyConfig {
                stream_threshold: 1024,
                ..config()
            },
            CertificateAuthority::in_memory(),
        )
        .await;
        let request = format!(
            "GET {}/big HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            origin.uri(),
            origin.address()
        );
        let response = roundtrip(proxy.addr, request.as_bytes()).await;
        assert!(response.ends_with(&body));

        let history = proxy.history.clone();
        until(|| {
            history
                .summaries()
                .first()
                .is_some_and(|s| s.response_size as usize >= body.len())
        })
        .await;
        let summary = &proxy.history.summaries()[0];
        assert_eq!(summary.response_status, 200);
        assert!(summary.response_size as usize >= body.len());
    }

    #[tokio::test]
    async fn test_oversized_request_gets_413() {
        let proxy = start_proxy(
            ProxyConfig {
                max_request_size: 8,
                ..config()
            },
            CertificateAuthority::in_memory(),
        )
        .await;
        let response = roundtrip(
            proxy.addr,
            b"POST http://127.0.0.1:9/ HTTP/1.1\r\nHost: 127.0.0.1:9\r\nContent-Length: 20\r\n\r\n01234567890123456789",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let proxy = start_proxy(config(), CertificateAuthority::in_memory()).await;
        assert!(proxy.server.is_running());
        assert!(proxy.server.start().await.is_err());
        proxy.server.stop();
    }

    #[test]
    fn test_target_authority_omits_default_port() {
        let url = Url::parse("https://example.com/x").unwrap();
        let target = Target::from_url(&url).unwrap();
        assert_eq!(target.port, 443);
        assert_eq!(target.authority(), "example.com");

        let url = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(Target::from_url(&url).unwrap().authority(), "example.com:8080");
    }
}
