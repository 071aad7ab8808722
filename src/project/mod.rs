//! Project module
//!
//! The captured-traffic data model and the side effects every capture
//! transition goes through: sitemap bucketing, persistence and broadcast.

mod capture;
mod io;
mod request;
mod sitemap;

pub use capture::{read_body, spawn_stream_capture, BodyCapture, BodySource};
pub use io::{Broadcast, Broadcaster, History, JsonLinesSink, Persist, RecordSink, Recorder};
pub use request::{
    DataPacket, Direction, Request, RequestSummary, PROTOCOL_HTTP11, PROTOCOL_OUT_OF_BAND,
    PROTOCOL_WEBSOCKET,
};
pub use sitemap::{sitemap_bucket, SiteMap};

use std::sync::Arc;
use uuid::Uuid;

use crate::app::{ProjectEvent, RecordAction};

/// Recording front-end shared by the proxy and the request runners.
pub struct Project {
    persist: Arc<dyn Persist>,
    broadcast: Arc<dyn Broadcast>,
    sitemap: SiteMap,
}

impl Project {
    pub fn new(persist: Arc<dyn Persist>, broadcast: Arc<dyn Broadcast>) -> Self {
        Self {
            persist,
            broadcast,
            sitemap: SiteMap::new(),
        }
    }

    /// Project backed by an in-memory history and a broadcast hub.
    pub fn in_memory() -> (Self, Arc<History>, Arc<Broadcaster>) {
        let history = Arc::new(History::default());
        let hub = Arc::new(Broadcaster::default());
        let project = Self::new(history.clone(), hub.clone());
        (project, history, hub)
    }

    /// Persist and broadcast a snapshot of `request`.
    ///
    /// Fills in a missing GUID and assigns a sitemap bucket on first sight
    /// of a manual or successful exchange.
    pub fn record(&self, request: &mut Request) {
        if request.guid.is_empty() {
            request.guid = Uuid::new_v4().to_string();
        }

        if request.sitemap_path.is_empty()
            && request.protocol != PROTOCOL_OUT_OF_BAND
            && (request.scan_id.is_empty() || request.is_success())
        {
            if let Some(bucket) = sitemap_bucket(&request.url) {
                if self.sitemap.insert(&bucket) {
                    self.broadcast.broadcast(ProjectEvent::SiteMapPath {
                        action: RecordAction::Add,
                        path: bucket.clone(),
                    });
                }
                request.sitemap_path = bucket;
            }
        }

        self.persist.persist(request);
        self.broadcast.broadcast(ProjectEvent::Request {
            action: RecordAction::Update,
            request: RequestSummary::from(&*request),
        });
    }

    pub fn broadcast(&self, event: ProjectEvent) {
        self.broadcast.broadcast(event);
    }

    pub fn sitemap(&self) -> &SiteMap {
        &self.sitemap
    }
}
