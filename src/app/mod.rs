//! Application core module
//!
//! Builds the long-lived services once (certificate authority, recorder,
//! interception engine, proxy listener, request runner and scan tracker)
//! and shares them by `Arc`.

mod config;
mod events;

pub use config::{
    Config, GeneralConfig, InterceptSettings, ProxyConfig, RequestConfig, DEFAULT_STREAM_THRESHOLD,
};
pub use events::{ProjectEvent, RecordAction};

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ca::CertificateAuthority;
use crate::error::{ResultExt, WaylayError};
use crate::fuzzer::{RequestRunner, RequestTracker};
use crate::http::PoolOptions;
use crate::project::{
    Broadcaster, History, JsonLinesSink, Persist, Project, RecordSink, Recorder,
};
use crate::proxy::{InterceptQueue, InterceptionEngine, Passthrough, ProxyServer, TlsFactory, Upstream};
use crate::scripting::{Hooks, NoHooks};

/// Service container with an init → run → shutdown lifecycle
pub struct App {
    config: Config,
    ca: Arc<CertificateAuthority>,
    history: Arc<History>,
    broadcaster: Arc<Broadcaster>,
    engine: Arc<InterceptionEngine>,
    proxy: ProxyServer,
    tracker: Arc<RequestTracker>,
    runner: RequestRunner,
    recorder_task: Option<JoinHandle<()>>,
}

impl App {
    /// Build every service from `config`, with the CA stored under the data
    /// directory.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.resolved_data_dir()?;
        let ca = open_authority(&data_dir.join("ca"))?;
        Self::with_parts(config, ca, Arc::new(NoHooks))
    }

    /// Build with an explicit authority and hook collaborator.
    pub fn with_parts(
        config: Config,
        ca: CertificateAuthority,
        hooks: Arc<dyn Hooks>,
    ) -> anyhow::Result<Self> {
        let ca = Arc::new(ca);
        let history = Arc::new(History::new(config.general.max_history_items));
        let broadcaster = Arc::new(Broadcaster::default());

        let (persist, recorder_task) = match &config.general.record_file {
            Some(path) => {
                let sinks: Vec<Box<dyn RecordSink>> = vec![
                    Box::new(history.clone()),
                    Box::new(JsonLinesSink::open(path)?),
                ];
                let (recorder, task) = Recorder::spawn(sinks);
                tracing::info!("Recording requests to {}", path.display());
                (Arc::new(recorder) as Arc<dyn Persist>, Some(task))
            }
            None => (history.clone() as Arc<dyn Persist>, None),
        };
        let project = Arc::new(Project::new(persist, broadcaster.clone()));

        let queue = Arc::new(InterceptQueue::new(broadcaster.clone()));
        let engine = Arc::new(InterceptionEngine::new(
            config.proxy.intercept,
            queue,
            hooks,
            project.clone(),
            Passthrough::from_config(&config.proxy),
            config.proxy.stream_threshold,
        ));

        let tls = Arc::new(if config.proxy.verify_upstream_tls {
            TlsFactory::verifying(ca.clone())?
        } else {
            TlsFactory::new(ca.clone())?
        });
        let upstream = Upstream::new(
            config.proxy.upstream_proxy.as_deref(),
            Duration::from_secs(config.requests.connect_timeout),
        )?;
        let proxy = ProxyServer::new(&config.proxy, engine.clone(), tls, upstream);

        let tracker = Arc::new(RequestTracker::new());
        let runner = RequestRunner::new(
            tracker.clone(),
            PoolOptions::from_config(&config)?,
            project,
            config.requests.max_connections_per_host,
            config.proxy.stream_threshold,
        )?;

        Ok(Self {
            config,
            ca,
            history,
            broadcaster,
            engine,
            proxy,
            tracker,
            runner,
            recorder_task,
        })
    }

    /// Start the proxy and serve until `shutdown` resolves.
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> anyhow::Result<()> {
        let addr = self.start().await?;
        tracing::info!("Waylay ready on {}", addr);
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    /// Start the proxy listener.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        self.proxy.start().await
    }

    /// Stop the listener, release holds and close every scan.
    pub async fn shutdown(&mut self) {
        self.proxy.stop();

        let queue = self.engine.queue();
        let released = queue.release_all(crate::project::Direction::BrowserToServer)
            + queue.release_all(crate::project::Direction::ServerToBrowser);
        if released > 0 {
            tracing::info!("Released {} held exchanges", released);
        }

        self.tracker.close_all();

        if let Some(task) = self.recorder_task.take() {
            // The writer ends once every handle to the recorder is gone;
            // open connections may still hold one.
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                tracing::debug!("Recorder still has pending writers at shutdown");
            }
        }
        tracing::info!("Waylay stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<InterceptionEngine> {
        &self.engine
    }

    pub fn intercept_queue(&self) -> &Arc<InterceptQueue> {
        self.engine.queue()
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn runner(&self) -> &RequestRunner {
        &self.runner
    }

    pub fn history(&self) -> &Arc<History> {
        &self.history
    }

    pub fn proxy(&self) -> &ProxyServer {
        &self.proxy
    }

    /// Subscribe to project events.
    pub fn subscribe(&self) -> mpsc::Receiver<ProjectEvent> {
        self.broadcaster.subscribe()
    }

    pub fn set_intercept_settings(&self, settings: InterceptSettings) {
        self.engine.set_intercept_settings(settings);
    }

    /// Root certificate for installing in a browser, with its content type.
    pub fn export_root_ca(&self) -> Result<(&'static str, Vec<u8>), WaylayError> {
        Ok(self.ca.export_root()?)
    }
}

/// Certificate authority persisted under `dir`.
pub fn open_authority(dir: &Path) -> Result<CertificateAuthority, WaylayError> {
    std::fs::create_dir_all(dir)
        .with_context(format!("Creating certificate directory {}", dir.display()))?;
    Ok(CertificateAuthority::open(dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Direction;
    use crate::proxy::InterceptAction;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.general.data_dir = Some(dir.to_path_buf());
        config.proxy.port = 0;
        config
    }

    #[tokio::test]
    async fn test_open_authority_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ca = open_authority(&dir.path().join("nested").join("ca")).unwrap();
        let pem = ca.root_certificate().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_export_root_matches_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(test_config(dir.path())).unwrap();
        let (content_type, first) = app.export_root_ca().unwrap();
        let (_, second) = app.export_root_ca().unwrap();
        assert_eq!(content_type, "application/x-x509-ca-cert");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_held_request_released_by_operator() {
        let origin = MockServer::start().await;
        Mock::given(path("/held"))
            .respond_with(ResponseTemplate::new(200).set_body_string("through"))
            .mount(&origin)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.proxy.intercept.browser_to_server = true;
        config.general.record_file = Some(dir.path().join("requests.jsonl"));
        let mut app = App::with_parts(config, CertificateAuthority::in_memory(), Arc::new(NoHooks)).unwrap();
        let mut events = app.subscribe();
        let addr = app.start().await.unwrap();

        let request = format!(
            "GET {}/held HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            origin.uri(),
            origin.address()
        );
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            String::from_utf8_lossy(&out).into_owned()
        });

        // Wait for the hold to be announced.
        let held = loop {
            match events.recv().await.unwrap() {
                ProjectEvent::InterceptedRequest {
                    action: RecordAction::Add,
                    intercepted,
                } => break intercepted,
                _ => continue,
            }
        };
        assert_eq!(held.direction, Direction::BrowserToServer);
        assert!(app.intercept_queue().resolve(
            &held.request.guid,
            &held.packet_guid,
            Direction::BrowserToServer,
            held.body.clone(),
            InterceptAction::Forward,
        ));

        let response = client.await.unwrap();
        assert!(response.ends_with("through"));

        // Snapshots reach the history through the recorder's writer task.
        for _ in 0..100 {
            if app.history().summaries().first().is_some_and(|s| s.response_status == 200) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(app.history().len(), 1);
        app.shutdown().await;

        let log = std::fs::read_to_string(dir.path().join("requests.jsonl")).unwrap();
        assert!(log.lines().count() >= 1);
    }
}
