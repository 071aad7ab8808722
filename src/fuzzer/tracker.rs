//! Per-scan completion tracking
//!
//! Counts outstanding requests for each scan GUID and exposes a signal that
//! closes once the scan drains or is cancelled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A long-running scan that wants to hear about each completed request.
pub trait QueueableOperation: Send + Sync {
    fn guid(&self) -> String;
    fn request_completed(&self);
    fn broadcast(&self);
}

#[derive(Default)]
struct TrackerState {
    counts: HashMap<String, i64>,
    operations: HashMap<String, Arc<dyn QueueableOperation>>,
    signals: HashMap<String, watch::Sender<bool>>,
}

impl TrackerState {
    /// Close and forget the signal for `guid`, if one was handed out.
    fn close_signal(&mut self, guid: &str) {
        if let Some(tx) = self.signals.remove(guid) {
            tx.send_replace(true);
        }
    }
}

/// Reference counts of in-flight requests, keyed by scan GUID.
#[derive(Default)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

/// Cancellation/completion signal for one scan.
#[derive(Clone)]
pub struct ScanSignal {
    rx: watch::Receiver<bool>,
}

impl ScanSignal {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the scan has drained or been cancelled.
    pub async fn closed(&mut self) {
        // A dropped sender means the tracker itself is gone.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, guid: &str) {
        self.increment_by(guid, 1);
    }

    pub fn increment_by(&self, guid: &str, amount: i64) {
        let mut state = self.state.lock();
        *state.counts.entry(guid.to_string()).or_insert(0) += amount;
    }

    /// Track a scan object that receives a callback per completed request.
    pub fn register_operation(&self, operation: Arc<dyn QueueableOperation>) {
        self.state.lock().operations.insert(operation.guid(), operation);
    }

    /// Mark one request of `guid` as finished.
    ///
    /// When the count drops to zero the entry is removed and the scan's
    /// signal closes. Unknown GUIDs are ignored.
    pub fn decrement(&self, guid: &str) {
        let operation = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let operation = state.operations.get(guid).cloned();

            match state.counts.get_mut(guid) {
                Some(count) => {
                    *count -= 1;
                    if *count <= 0 {
                        state.counts.remove(guid);
                        state.close_signal(guid);
                        tracing::debug!(scan = guid, "Scan queue drained");
                    }
                }
                None if operation.is_none() => {
                    tracing::debug!(scan = guid, "Decrement for unknown scan ignored");
                    return;
                }
                None => {}
            }
            operation
        };

        if let Some(operation) = operation {
            operation.request_completed();
            operation.broadcast();
        }
    }

    /// Signal for `guid`, created on first use.
    ///
    /// A signal for a scan that is not tracked stays open until the scan is
    /// cancelled or [`close_all`](Self::close_all) runs.
    pub fn channel(&self, guid: &str) -> ScanSignal {
        let mut state = self.state.lock();
        let tx = state
            .signals
            .entry(guid.to_string())
            .or_insert_with(|| watch::channel(false).0);
        ScanSignal { rx: tx.subscribe() }
    }

    /// Stop a scan: forget its counter and operation and close its signal.
    pub fn cancel(&self, guid: &str) {
        let mut state = self.state.lock();
        state.counts.remove(guid);
        state.operations.remove(guid);
        state.close_signal(guid);
        tracing::info!(scan = guid, "Scan cancelled");
    }

    pub fn contains(&self, guid: &str) -> bool {
        let state = self.state.lock();
        state.counts.contains_key(guid) || state.operations.contains_key(guid)
    }

    /// Outstanding requests for `guid`; zero when untracked.
    pub fn outstanding(&self, guid: &str) -> i64 {
        self.state.lock().counts.get(guid).copied().unwrap_or(0)
    }

    /// Wait for `guid` to drain or be cancelled.
    pub async fn wait(&self, guid: &str) {
        if !self.contains(guid) {
            return;
        }
        let mut signal = self.channel(guid);
        // The scan may have drained between the check and the subscription.
        if !self.contains(guid) {
            return;
        }
        signal.closed().await;
    }

    /// Shutdown: drop all counters and close every signal.
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.counts.clear();
        for (_, tx) in state.signals.drain() {
            tx.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_signal_closes_after_last_decrement() {
        let tracker = RequestTracker::new();
        tracker.increment("scan");
        tracker.increment("scan");
        tracker.increment("scan");
        let signal = tracker.channel("scan");

        tracker.decrement("scan");
        tracker.decrement("scan");
        assert!(tracker.contains("scan"));
        assert!(!signal.is_closed());

        tracker.decrement("scan");
        assert!(!tracker.contains("scan"));
        assert!(signal.is_closed());
    }

    #[test]
    fn test_unknown_decrement_is_ignored() {
        let tracker = RequestTracker::new();
        let signal = tracker.channel("ghost");
        tracker.decrement("ghost");
        assert!(!tracker.contains("ghost"));
        assert!(!signal.is_closed());
    }

    #[test]
    fn test_cancel_closes_signal() {
        let tracker = RequestTracker::new();
        tracker.increment_by("scan", 5);
        let signal = tracker.channel("scan");
        tracker.cancel("scan");
        assert!(!tracker.contains("scan"));
        assert!(signal.is_closed());
        assert_eq!(tracker.outstanding("scan"), 0);
    }

    struct Counting {
        completed: AtomicUsize,
        broadcasts: AtomicUsize,
    }

    impl QueueableOperation for Counting {
        fn guid(&self) -> String {
            "op".into()
        }
        fn request_completed(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        fn broadcast(&self) {
            self.broadcasts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_operation_callbacks_and_containment() {
        let tracker = RequestTracker::new();
        let op = Arc::new(Counting {
            completed: AtomicUsize::new(0),
            broadcasts: AtomicUsize::new(0),
        });
        tracker.register_operation(op.clone());
        tracker.increment("op");

        tracker.decrement("op");
        assert_eq!(op.completed.load(Ordering::SeqCst), 1);
        assert_eq!(op.broadcasts.load(Ordering::SeqCst), 1);
        // The operation stays registered until cancelled.
        assert!(tracker.contains("op"));

        tracker.cancel("op");
        assert!(!tracker.contains("op"));
    }

    #[tokio::test]
    async fn test_wait_returns_when_drained() {
        let tracker = Arc::new(RequestTracker::new());
        tracker.increment_by("scan", 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait("scan").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.decrement("scan");
        tracker.decrement("scan");

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_all_releases_waiters() {
        let tracker = Arc::new(RequestTracker::new());
        tracker.increment("a");
        let mut signal = tracker.channel("a");
        tracker.close_all();
        tokio::time::timeout(Duration::from_secs(1), signal.closed())
            .await
            .unwrap();
    }
}
