//! Persistence and broadcast collaborators for captured requests

use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::request::{Request, RequestSummary};
use crate::app::ProjectEvent;

/// Accepts request snapshots for storage. Must not block.
pub trait Persist: Send + Sync {
    fn persist(&self, request: &Request);
}

/// Fans project events out to subscribers. Must not block.
pub trait Broadcast: Send + Sync {
    fn broadcast(&self, event: ProjectEvent);
}

/// Destination for the recorder's writer task.
pub trait RecordSink: Send {
    fn write(&mut self, request: &Request) -> anyhow::Result<()>;
}

/// In-memory request history, newest last.
pub struct History {
    entries: RwLock<Vec<Request>>,
    max_entries: usize,
}

impl History {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    /// Insert a record or replace the stored one with the same GUID.
    pub fn upsert(&self, request: &Request) {
        let mut entries = self.entries.write();
        match entries.iter().rposition(|r| r.guid == request.guid) {
            Some(pos) => entries[pos] = request.clone(),
            None => {
                entries.push(request.clone());
                if entries.len() > self.max_entries {
                    entries.remove(0);
                }
            }
        }
    }

    pub fn get(&self, guid: &str) -> Option<Request> {
        self.entries.read().iter().rev().find(|r| r.guid == guid).cloned()
    }

    pub fn summaries(&self) -> Vec<RequestSummary> {
        self.entries.read().iter().map(RequestSummary::from).collect()
    }

    /// Records belonging to `scan_id`, oldest first.
    pub fn by_scan(&self, scan_id: &str) -> Vec<Request> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.scan_id == scan_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl Persist for History {
    fn persist(&self, request: &Request) {
        self.upsert(request);
    }
}

impl RecordSink for Arc<History> {
    fn write(&mut self, request: &Request) -> anyhow::Result<()> {
        self.upsert(request);
        Ok(())
    }
}

/// Appends each snapshot as one JSON line.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for JsonLinesSink {
    fn write(&mut self, request: &Request) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, request)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Fire-and-forget persistence through a single sequential writer.
///
/// Snapshots are queued on an unbounded channel and drained, in order, by
/// one blocking task that hands each to every sink.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Request>,
}

impl Recorder {
    pub fn spawn(mut sinks: Vec<Box<dyn RecordSink>>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(request) = rx.blocking_recv() {
                for sink in sinks.iter_mut() {
                    if let Err(e) = sink.write(&request) {
                        tracing::warn!(guid = %request.guid, "Failed to persist request: {}", e);
                    }
                }
            }
            tracing::debug!("Recorder writer finished");
        });

        (Self { tx }, handle)
    }
}

impl Persist for Recorder {
    fn persist(&self, request: &Request) {
        if self.tx.send(request.clone()).is_err() {
            tracing::warn!(guid = %request.guid, "Recorder closed, dropping snapshot");
        }
    }
}

/// Broadcast hub with a bounded queue per subscriber.
///
/// A subscriber whose queue is full is disconnected rather than allowed to
/// stall capture.
pub struct Broadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<ProjectEvent>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ProjectEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broadcast for Broadcaster {
    fn broadcast(&self, event: ProjectEvent) {
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(kind = event.kind(), "Subscriber queue full, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
