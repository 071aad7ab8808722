//! Ad hoc, queued and bulk requests made on behalf of the operator or a scan

use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

use super::payloads::{sniper_combinations, PayloadSource};
use super::pool::{BulkReport, BulkRequest, BulkRequestPool, Dispatch, RequestMeta, SiteDispatcher};
use super::template::RequestTemplate;
use super::tracker::RequestTracker;
use crate::encoding::base64_bytes;
use crate::error::HttpError;
use crate::http::{ClientCertificate, ConnectionPool, HostLimits, PoolOptions};
use crate::project::{Project, Request};

/// A single request to send right away.
#[derive(Debug, Clone, Deserialize)]
pub struct MakeRequest {
    #[serde(with = "base64_bytes")]
    pub request: Vec<u8>,
    /// `host[:port]`; the scheme default port is assumed when absent
    pub host: String,
    pub ssl: bool,
    #[serde(default)]
    pub scan_id: String,
    /// PEM client certificate, used together with `client_cert_key`
    #[serde(default)]
    pub client_cert: String,
    #[serde(default)]
    pub client_cert_key: String,
}

/// A request added to a scan's queue.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedRequest {
    #[serde(with = "base64_bytes")]
    pub request: Vec<u8>,
    pub host: String,
    pub ssl: bool,
    pub scan_id: String,
    #[serde(default)]
    pub payloads: String,
}

/// An injection campaign over one templated request.
#[derive(Debug, Clone, Deserialize)]
pub struct InjectionRun {
    pub scan_id: String,
    pub host: String,
    pub ssl: bool,
    pub template: RequestTemplate,
    #[serde(flatten)]
    pub payloads: PayloadSource,
}

/// `scheme://host[:port]` for a host and TLS flag.
pub fn site_url(host: &str, ssl: bool) -> Result<Url, HttpError> {
    let scheme = if ssl { "https" } else { "http" };
    let text = format!("{}://{}", scheme, host);
    Url::parse(&text).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", text, e)))
}

/// Entry point for requests that do not come through the proxy listener.
pub struct RequestRunner {
    tracker: Arc<RequestTracker>,
    dispatcher: Arc<dyn Dispatch>,
    pool: BulkRequestPool,
    options: PoolOptions,
    limits: Arc<HostLimits>,
    project: Arc<Project>,
    stream_threshold: usize,
}

impl RequestRunner {
    pub fn new(
        tracker: Arc<RequestTracker>,
        options: PoolOptions,
        project: Arc<Project>,
        workers: usize,
        stream_threshold: usize,
    ) -> Result<Self, HttpError> {
        let shared = ConnectionPool::new(&options)?;
        let limits = shared.limits().clone();
        let dispatcher: Arc<dyn Dispatch> =
            Arc::new(SiteDispatcher::new(shared, project.clone(), stream_threshold));
        let mut runner = Self::with_dispatcher(
            tracker,
            dispatcher,
            options,
            project,
            workers,
            stream_threshold,
        );
        runner.limits = limits;
        Ok(runner)
    }

    pub fn with_dispatcher(
        tracker: Arc<RequestTracker>,
        dispatcher: Arc<dyn Dispatch>,
        options: PoolOptions,
        project: Arc<Project>,
        workers: usize,
        stream_threshold: usize,
    ) -> Self {
        let pool = BulkRequestPool::new(tracker.clone(), dispatcher.clone(), workers);
        let limits = Arc::new(HostLimits::new(options.max_connections_per_host));
        Self {
            tracker,
            dispatcher,
            pool,
            options,
            limits,
            project,
            stream_threshold,
        }
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Send one request through a fresh pool, presenting the client
    /// certificate if one is given. The per-host cap is shared with queued
    /// and bulk requests.
    pub async fn make_request(&self, params: MakeRequest) -> Result<Request, HttpError> {
        let site = site_url(&params.host, params.ssl)?;

        let mut options = self.options.clone();
        if !params.client_cert.is_empty() && !params.client_cert_key.is_empty() {
            options.client_certificate = Some(ClientCertificate {
                certificate_pem: params.client_cert.into_bytes(),
                key_pem: params.client_cert_key.into_bytes(),
            });
        }
        let pool = ConnectionPool::with_limits(&options, self.limits.clone())?;
        let dispatcher = SiteDispatcher::new(pool, self.project.clone(), self.stream_threshold);

        let meta = RequestMeta {
            scan_id: params.scan_id,
            payloads: String::new(),
        };
        Ok(dispatcher.dispatch(&site, params.request, meta).await)
    }

    /// Queue a request under its scan.
    ///
    /// The request is abandoned if the scan is cancelled before it
    /// completes; the task then yields `None`.
    pub fn queue_request(&self, params: QueuedRequest) -> Result<JoinHandle<Option<Request>>, HttpError> {
        let site = site_url(&params.host, params.ssl)?;
        let tracker = self.tracker.clone();
        let dispatcher = self.dispatcher.clone();

        tracker.increment(&params.scan_id);
        let mut signal = tracker.channel(&params.scan_id);

        Ok(tokio::spawn(async move {
            let meta = RequestMeta {
                scan_id: params.scan_id.clone(),
                payloads: params.payloads,
            };
            tokio::select! {
                request = dispatcher.dispatch(&site, params.request, meta) => {
                    tracker.decrement(&params.scan_id);
                    Some(request)
                }
                _ = signal.closed() => {
                    tracing::debug!(scan = %params.scan_id, "Queued request abandoned");
                    None
                }
            }
        }))
    }

    /// Send pre-built payload combinations through the worker pool.
    pub async fn bulk_queue(&self, bulk: BulkRequest) -> BulkReport {
        self.pool.run(bulk).await
    }

    /// Sniper injection over a template: every point takes every payload.
    pub async fn run_injection(&self, run: InjectionRun) -> Result<BulkReport, HttpError> {
        let site = site_url(&run.host, run.ssl)?;
        let payloads = run.payloads.load().await;
        let combinations = sniper_combinations(&run.template.original_values(), &payloads);

        Ok(self
            .bulk_queue(BulkRequest {
                scan_id: run.scan_id,
                site,
                template: run.template,
                combinations,
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzer::template::RequestPart;
    use crate::project::Direction;
    use crate::proxy::HttpConn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn runner() -> (RequestRunner, Arc<crate::project::History>) {
        let (project, history, _) = Project::in_memory();
        let runner = RequestRunner::new(
            Arc::new(RequestTracker::new()),
            PoolOptions::default(),
            Arc::new(project),
            2,
            1024 * 1024,
        )
        .unwrap();
        (runner, history)
    }

    #[test]
    fn test_site_url() {
        assert_eq!(site_url("example.com", true).unwrap().as_str(), "https://example.com/");
        assert_eq!(
            site_url("example.com:8080", false).unwrap().as_str(),
            "http://example.com:8080/"
        );
    }

    #[tokio::test]
    async fn test_make_request_records_scan() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (runner, history) = runner();
        let request = runner
            .make_request(MakeRequest {
                request: b"GET /ping HTTP/1.1\r\n\r\n".to_vec(),
                host: server.address().to_string(),
                ssl: false,
                scan_id: "manual-1".into(),
                client_cert: String::new(),
                client_cert_key: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(request.response_status, 204);
        assert_eq!(history.by_scan("manual-1").len(), 1);
    }

    #[tokio::test]
    async fn test_queue_request_decrements_on_completion() {
        let server = MockServer::start().await;
        Mock::given(path("/q"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let (runner, _) = runner();
        let handle = runner
            .queue_request(QueuedRequest {
                request: b"GET /q HTTP/1.1\r\n\r\n".to_vec(),
                host: server.address().to_string(),
                ssl: false,
                scan_id: "scan-q".into(),
                payloads: String::new(),
            })
            .unwrap();
        assert!(runner.tracker().contains("scan-q"));

        let request = handle.await.unwrap().unwrap();
        assert!(request.data(Direction::ServerToBrowser, false).ends_with(b"ok"));
        assert!(!runner.tracker().contains("scan-q"));
    }

    #[tokio::test]
    async fn test_cancel_abandons_queued_request() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let (runner, _) = runner();
        let handle = runner
            .queue_request(QueuedRequest {
                request: b"GET /slow HTTP/1.1\r\n\r\n".to_vec(),
                host: server.address().to_string(),
                ssl: false,
                scan_id: "scan-c".into(),
                payloads: String::new(),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.tracker().cancel("scan-c");
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_none());
    }

    /// Origin that answers slowly and tracks how many requests it is
    /// serving at once.
    async fn counting_origin() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let counted = peak.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let active = active.clone();
                let peak = counted.clone();
                tokio::spawn(async move {
                    let mut conn = HttpConn::new(Box::new(stream));
                    while let Ok(Some(_)) = conn.read_head().await {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        if conn
                            .send(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        (addr, peak)
    }

    #[tokio::test]
    async fn test_queued_requests_respect_host_limit() {
        let (host, peak) = counting_origin().await;
        let (project, _, _) = Project::in_memory();
        let options = PoolOptions {
            max_connections_per_host: 2,
            ..PoolOptions::default()
        };
        let runner = RequestRunner::new(
            Arc::new(RequestTracker::new()),
            options,
            Arc::new(project),
            2,
            1024 * 1024,
        )
        .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                runner
                    .queue_request(QueuedRequest {
                        request: format!("GET /{} HTTP/1.1\r\n\r\n", i).into_bytes(),
                        host: host.clone(),
                        ssl: false,
                        scan_id: "scan-limit".into(),
                        payloads: String::new(),
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            let request = handle.await.unwrap().unwrap();
            assert_eq!(request.response_status, 200);
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in flight was {}", peak);
        assert!(!runner.tracker().contains("scan-limit"));
    }

    #[tokio::test]
    async fn test_injection_run_covers_every_point() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (runner, history) = runner();
        let report = runner
            .run_injection(InjectionRun {
                scan_id: "inject-1".into(),
                host: server.address().to_string(),
                ssl: false,
                template: RequestTemplate::new(vec![
                    RequestPart::fixed("GET /?a="),
                    RequestPart::injectable("1"),
                    RequestPart::fixed("&b="),
                    RequestPart::injectable("2"),
                    RequestPart::fixed(" HTTP/1.1\r\n\r\n"),
                ]),
                payloads: PayloadSource::range(5, 8),
            })
            .await
            .unwrap();

        // Two points times three payloads, plus the base request.
        assert_eq!(report.dispatched, 7);
        assert_eq!(history.by_scan("inject-1").len(), 7);
        assert_eq!(server.received_requests().await.unwrap().len(), 7);
    }
}
