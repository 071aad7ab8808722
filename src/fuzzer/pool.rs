//! Bounded worker pool for bulk (fuzzing) requests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use super::template::RequestTemplate;
use super::tracker::RequestTracker;
use crate::http::{
    correct_length_headers, header_has_token, parse_response, prepare, reframe_with_length,
    response_head, ConnectionPool,
};
use crate::project::{
    read_body, spawn_stream_capture, Direction, Project, Request, PROTOCOL_HTTP11,
};

/// Tags attached to a dispatched request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub scan_id: String,
    /// JSON map of original to substituted values; empty for base requests
    pub payloads: String,
}

/// Sends one raw request and records the result.
///
/// Failures end up on `Request::error`; dispatching never fails outright.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, site: &Url, raw: Vec<u8>, meta: RequestMeta) -> Request;
}

/// Dispatcher backed by the shared connection pool.
///
/// Responses reaching the stream threshold keep being captured in the
/// background; the returned record is the snapshot taken when streaming
/// began.
pub struct SiteDispatcher {
    pool: ConnectionPool,
    project: Arc<Project>,
    stream_threshold: usize,
}

impl SiteDispatcher {
    pub fn new(pool: ConnectionPool, project: Arc<Project>, stream_threshold: usize) -> Self {
        Self {
            pool,
            project,
            stream_threshold,
        }
    }
}

#[async_trait]
impl Dispatch for SiteDispatcher {
    async fn dispatch(&self, site: &Url, raw: Vec<u8>, meta: RequestMeta) -> Request {
        let raw = correct_length_headers(&raw);
        let mut request = match prepare(site, &raw) {
            Ok(prepared) => Request::new(prepared.url.as_str(), prepared.method, PROTOCOL_HTTP11),
            Err(e) => {
                let mut request = Request::new(site.as_str(), "", PROTOCOL_HTTP11);
                request.error = format!("Could not parse request: {}", e);
                request
            }
        };
        request.scan_id = meta.scan_id;
        request.payloads = meta.payloads;
        request.request_size = raw.len() as i64;
        request.append_packet(Direction::BrowserToServer, false, raw.clone());
        if !request.error.is_empty() {
            self.project.record(&mut request);
            return request;
        }

        let started = Instant::now();
        let mut response = match self.pool.make_request_to_site(site, &raw).await {
            Ok((_, response)) => response,
            Err(e) => {
                request.error = format!("Error making request to site: {}", e);
                self.project.record(&mut request);
                return request;
            }
        };
        request.response_time_ms = started.elapsed().as_millis() as u64;

        let head = response_head(&response);
        let parsed_head = parse_response(&head).ok();
        let event_stream = parsed_head.as_ref().is_some_and(|p| p.is_event_stream());

        let capture = read_body(&mut response, head.len(), event_stream, self.stream_threshold).await;
        if let Some(e) = &capture.error {
            request.error = e.to_string();
        }

        let mut message = head;
        message.extend_from_slice(&capture.body);
        // The client has already removed chunked framing.
        let chunked = parsed_head
            .as_ref()
            .is_some_and(|p| header_has_token(&p.headers, "transfer-encoding", "chunked"));
        if chunked && !capture.streaming {
            message = reframe_with_length(&message);
        }

        let total = message.len();
        let parsed = parse_response(&message);
        request.append_packet(Direction::ServerToBrowser, false, message);
        if let Ok(parsed) = parsed {
            request.apply_response(&parsed, total);
        }
        self.project.record(&mut request);

        if capture.streaming {
            spawn_stream_capture(request.clone(), response, self.project.clone());
        }
        request
    }
}

/// A bulk run: a template, its substitutions, and the scan they belong to.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub scan_id: String,
    pub site: Url,
    pub template: RequestTemplate,
    /// One payload per injection point, per request
    pub combinations: Vec<Vec<Vec<u8>>>,
}

/// Counts from a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkReport {
    /// Requests dispatched, including the base request
    pub dispatched: usize,
    /// Combinations skipped because they did not fit the template
    pub skipped: usize,
}

/// Fixed-size set of workers draining a payload channel.
pub struct BulkRequestPool {
    tracker: Arc<RequestTracker>,
    dispatcher: Arc<dyn Dispatch>,
    workers: usize,
}

impl BulkRequestPool {
    pub fn new(tracker: Arc<RequestTracker>, dispatcher: Arc<dyn Dispatch>, workers: usize) -> Self {
        Self {
            tracker,
            dispatcher,
            workers: workers.max(1),
        }
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Run the base request and then every combination, returning once all
    /// workers have stopped.
    pub async fn run(&self, bulk: BulkRequest) -> BulkReport {
        let BulkRequest {
            scan_id,
            site,
            template,
            combinations,
        } = bulk;
        let total = combinations.len();

        tracing::info!(scan = %scan_id, requests = total + 1, workers = self.workers, "Bulk run started");
        self.tracker.increment_by(&scan_id, total as i64 + 1);
        let signal = self.tracker.channel(&scan_id);

        let meta = RequestMeta {
            scan_id: scan_id.clone(),
            payloads: String::new(),
        };
        self.dispatcher.dispatch(&site, template.base(), meta).await;
        self.tracker.decrement(&scan_id);

        let (tx, rx) = mpsc::channel(total.max(1));
        for combination in combinations {
            if tx.send(combination).await.is_err() {
                break;
            }
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let dispatched = Arc::new(AtomicUsize::new(1));
        let skipped = Arc::new(AtomicUsize::new(0));
        let template = Arc::new(template);
        let site = Arc::new(site);

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let rx = rx.clone();
            let mut signal = signal.clone();
            let tracker = self.tracker.clone();
            let dispatcher = self.dispatcher.clone();
            let template = template.clone();
            let site = site.clone();
            let scan_id = scan_id.clone();
            let dispatched = dispatched.clone();
            let skipped = skipped.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = signal.closed() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(payloads) = next else {
                        break;
                    };
                    if !tracker.contains(&scan_id) {
                        break;
                    }

                    match template.splice(&payloads) {
                        Ok(spliced) => {
                            let meta = RequestMeta {
                                scan_id: scan_id.clone(),
                                payloads: spliced.changes,
                            };
                            dispatcher.dispatch(&site, spliced.bytes, meta).await;
                            dispatched.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            tracing::warn!(scan = %scan_id, "Skipping payload set: {}", e);
                            skipped.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    tracker.decrement(&scan_id);
                }
                tracing::debug!(scan = %scan_id, worker, "Bulk worker stopped");
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(scan = %scan_id, "Bulk worker panicked: {}", e);
            }
        }

        let report = BulkReport {
            dispatched: dispatched.load(Ordering::SeqCst),
            skipped: skipped.load(Ordering::SeqCst),
        };
        tracing::info!(
            scan = %scan_id,
            dispatched = report.dispatched,
            skipped = report.skipped,
            "Bulk run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzer::template::RequestPart;
    use crate::http::PoolOptions;
    use parking_lot::Mutex as SyncMutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records what it was asked to send and what the tracker said at the time.
    struct FakeDispatcher {
        tracker: Arc<RequestTracker>,
        calls: SyncMutex<Vec<(Vec<u8>, RequestMeta, bool)>>,
        cancel_after: Option<usize>,
    }

    impl FakeDispatcher {
        fn new(tracker: Arc<RequestTracker>, cancel_after: Option<usize>) -> Self {
            Self {
                tracker,
                calls: SyncMutex::new(Vec::new()),
                cancel_after,
            }
        }
    }

    #[async_trait]
    impl Dispatch for FakeDispatcher {
        async fn dispatch(&self, site: &Url, raw: Vec<u8>, meta: RequestMeta) -> Request {
            let contained = self.tracker.contains(&meta.scan_id);
            let count = {
                let mut calls = self.calls.lock();
                calls.push((raw, meta.clone(), contained));
                calls.len()
            };
            if self.cancel_after == Some(count) {
                self.tracker.cancel(&meta.scan_id);
            }
            tokio::task::yield_now().await;
            let mut request = Request::new(site.as_str(), "GET", PROTOCOL_HTTP11);
            request.scan_id = meta.scan_id;
            request.payloads = meta.payloads;
            request
        }
    }

    fn bulk(combinations: Vec<Vec<Vec<u8>>>) -> BulkRequest {
        BulkRequest {
            scan_id: "scan-1".into(),
            site: Url::parse("http://shop.test").unwrap(),
            template: RequestTemplate::new(vec![
                RequestPart::fixed("GET /?q="),
                RequestPart::injectable("orig"),
                RequestPart::fixed(" HTTP/1.1\r\nHost: shop.test\r\n\r\n"),
            ]),
            combinations,
        }
    }

    #[tokio::test]
    async fn test_base_plus_every_combination() {
        let tracker = Arc::new(RequestTracker::new());
        let fake = Arc::new(FakeDispatcher::new(tracker.clone(), None));
        let pool = BulkRequestPool::new(tracker.clone(), fake.clone(), 2);
        let signal = tracker.channel("scan-1");

        let report = pool
            .run(bulk(vec![vec![b"a".to_vec()], vec![b"b".to_vec()], vec![b"c".to_vec()]]))
            .await;

        assert_eq!(report, BulkReport { dispatched: 4, skipped: 0 });
        let calls = fake.calls.lock();
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|(_, _, contained)| *contained));
        // Base request goes first and carries no payload map.
        assert!(calls[0].0.starts_with(b"GET /?q=orig "));
        assert!(calls[0].1.payloads.is_empty());
        assert!(calls[1..]
            .iter()
            .all(|(_, meta, _)| meta.payloads.starts_with(r#"{"orig":"#)));

        assert!(!tracker.contains("scan-1"));
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn test_mismatched_payloads_are_skipped_but_counted() {
        let tracker = Arc::new(RequestTracker::new());
        let fake = Arc::new(FakeDispatcher::new(tracker.clone(), None));
        let pool = BulkRequestPool::new(tracker.clone(), fake.clone(), 1);

        let report = pool
            .run(bulk(vec![vec![b"a".to_vec(), b"extra".to_vec()], vec![b"b".to_vec()]]))
            .await;

        assert_eq!(report, BulkReport { dispatched: 2, skipped: 1 });
        assert!(!tracker.contains("scan-1"));
    }

    #[tokio::test]
    async fn test_cancel_stops_remaining_payloads() {
        let tracker = Arc::new(RequestTracker::new());
        // Base plus three combinations, then the scan is cancelled with two left.
        let fake = Arc::new(FakeDispatcher::new(tracker.clone(), Some(4)));
        let pool = BulkRequestPool::new(tracker.clone(), fake.clone(), 1);

        let combos = (0..5).map(|i| vec![i.to_string().into_bytes()]).collect();
        pool.run(bulk(combos)).await;

        assert_eq!(fake.calls.lock().len(), 4);
        assert!(!tracker.contains("scan-1"));
    }

    #[tokio::test]
    async fn test_site_dispatcher_records_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "x"))
            .respond_with(ResponseTemplate::new(200).set_body_string("found"))
            .mount(&server)
            .await;

        let (project, history, _) = Project::in_memory();
        let pool = ConnectionPool::new(&PoolOptions::default()).unwrap();
        let dispatcher = SiteDispatcher::new(pool, Arc::new(project), 1024 * 1024);

        let site = Url::parse(&server.uri()).unwrap();
        let meta = RequestMeta {
            scan_id: "scan-9".into(),
            payloads: r#"{"a":"x"}"#.into(),
        };
        let request = dispatcher
            .dispatch(&site, b"GET /search?q=x HTTP/1.1\r\n\r\n".to_vec(), meta)
            .await;

        assert_eq!(request.response_status, 200);
        assert!(request.error.is_empty());
        assert!(request.data(Direction::ServerToBrowser, false).ends_with(b"found"));
        assert_eq!(history.by_scan("scan-9").len(), 1);
    }

    #[tokio::test]
    async fn test_site_dispatcher_records_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (project, history, _) = Project::in_memory();
        let pool = ConnectionPool::new(&PoolOptions::default()).unwrap();
        let dispatcher = SiteDispatcher::new(pool, Arc::new(project), 1024);

        let site = Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
        let request = dispatcher
            .dispatch(&site, b"GET / HTTP/1.1\r\n\r\n".to_vec(), RequestMeta::default())
            .await;

        assert!(request.error.starts_with("Error making request to site"));
        assert_eq!(history.get(&request.guid).unwrap().error, request.error);
    }
}
