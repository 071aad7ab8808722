//! Hold/release queue for intercepted exchanges

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::app::{ProjectEvent, RecordAction};
use crate::encoding::base64_bytes;
use crate::http::correct_length_headers;
use crate::project::{Broadcast, DataPacket, Direction, Request, RequestSummary};

/// Operator decision for a held exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptAction {
    Forward,
    /// Forward the request and hold its response too
    ForwardAndInterceptResponse,
    Drop,
}

impl InterceptAction {
    /// Parse an operator action; anything unrecognised drops the exchange.
    pub fn parse(action: &str) -> Self {
        match action {
            "forward" => InterceptAction::Forward,
            "forward_and_intercept_response" => InterceptAction::ForwardAndInterceptResponse,
            _ => InterceptAction::Drop,
        }
    }

    pub fn forwards(&self) -> bool {
        !matches!(self, InterceptAction::Drop)
    }
}

/// What a held exchange resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptOutcome {
    pub action: InterceptAction,
    /// Bytes to continue with (corrected if they were replaced)
    pub data: Vec<u8>,
    /// Replacement packet, present when the bytes changed
    pub modified_packet: Option<DataPacket>,
}

/// Wait side of a held exchange.
pub struct InterceptHandle {
    rx: oneshot::Receiver<InterceptOutcome>,
    original: Vec<u8>,
}

impl InterceptHandle {
    /// Block until the exchange is resolved.
    ///
    /// If the queue is torn down first the original bytes are forwarded.
    pub async fn wait(self) -> InterceptOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => InterceptOutcome {
                action: InterceptAction::Forward,
                data: self.original,
                modified_packet: None,
            },
        }
    }
}

/// Serializable view of a held exchange for the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterceptedView {
    pub request: RequestSummary,
    /// Held WebSocket frame; empty for a whole HTTP message
    pub packet_guid: String,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    pub direction: Direction,
    pub is_utf8: bool,
}

struct Pending {
    request: Request,
    packet_guid: String,
    direction: Direction,
    original: Vec<u8>,
    already_modified: bool,
    tx: oneshot::Sender<InterceptOutcome>,
}

impl Pending {
    fn matches(&self, request_guid: &str, packet_guid: &str, direction: Direction) -> bool {
        self.request.guid == request_guid
            && self.packet_guid == packet_guid
            && self.direction == direction
    }

    fn view(&self) -> InterceptedView {
        InterceptedView {
            request: RequestSummary::from(&self.request),
            packet_guid: self.packet_guid.clone(),
            body: self.original.clone(),
            direction: self.direction,
            is_utf8: std::str::from_utf8(&self.original).is_ok(),
        }
    }
}

/// Exchanges held for an operator decision.
pub struct InterceptQueue {
    pending: Mutex<Vec<Pending>>,
    broadcast: Arc<dyn Broadcast>,
}

impl InterceptQueue {
    pub fn new(broadcast: Arc<dyn Broadcast>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            broadcast,
        }
    }

    /// Hold `data` until it is resolved.
    ///
    /// `already_modified` marks bytes that a hook has rewritten, so a
    /// replacement packet is produced even if the operator changes nothing.
    pub fn add(
        &self,
        request: &Request,
        packet_guid: &str,
        direction: Direction,
        data: &[u8],
        already_modified: bool,
    ) -> InterceptHandle {
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            request: request.clone(),
            packet_guid: packet_guid.to_string(),
            direction,
            original: data.to_vec(),
            already_modified,
            tx,
        };
        let view = pending.view();

        self.pending.lock().push(pending);
        tracing::debug!(guid = %request.guid, direction = direction.as_str(), "Holding exchange");
        self.broadcast.broadcast(ProjectEvent::InterceptedRequest {
            action: RecordAction::Add,
            intercepted: view,
        });

        InterceptHandle {
            rx,
            original: data.to_vec(),
        }
    }

    /// Resolve the held exchange matching the key; false if none matched.
    pub fn resolve(
        &self,
        request_guid: &str,
        packet_guid: &str,
        direction: Direction,
        data: Vec<u8>,
        action: InterceptAction,
    ) -> bool {
        let pending = {
            let mut pending = self.pending.lock();
            match pending
                .iter()
                .position(|p| p.matches(request_guid, packet_guid, direction))
            {
                Some(idx) => pending.remove(idx),
                None => return false,
            }
        };
        self.complete(pending, data, action);
        true
    }

    /// Forward every exchange held in `direction` unchanged.
    pub fn release_all(&self, direction: Direction) -> usize {
        let released: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let (matching, rest) = pending.drain(..).partition(|p| p.direction == direction);
            *pending = rest;
            matching
        };

        let count = released.len();
        for pending in released {
            let data = pending.original.clone();
            self.complete(pending, data, InterceptAction::Forward);
        }
        if count > 0 {
            tracing::info!(direction = direction.as_str(), "Released {} held exchanges", count);
        }
        count
    }

    /// Drop every exchange held for `request_guid` without releasing it.
    ///
    /// Used when the connection carrying them is gone; waiters, if any are
    /// left, continue with their original bytes.
    pub fn discard(&self, request_guid: &str) -> usize {
        let discarded: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let (matching, rest) = pending
                .drain(..)
                .partition(|p| p.request.guid == request_guid);
            *pending = rest;
            matching
        };

        for pending in &discarded {
            self.broadcast.broadcast(ProjectEvent::InterceptedRequest {
                action: RecordAction::Delete,
                intercepted: pending.view(),
            });
        }
        if !discarded.is_empty() {
            tracing::debug!(guid = %request_guid, "Discarded {} held exchanges", discarded.len());
        }
        discarded.len()
    }

    pub fn list(&self) -> Vec<InterceptedView> {
        self.pending.lock().iter().map(Pending::view).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn complete(&self, pending: Pending, data: Vec<u8>, action: InterceptAction) {
        let view = pending.view();
        let changed = pending.already_modified || data != pending.original;

        let (data, modified_packet) = if changed {
            let websocket = pending.request.is_websocket();
            let data = if websocket {
                data
            } else {
                correct_length_headers(&data)
            };
            let start = pending.request.next_offset(pending.direction, true);
            let mut packet = DataPacket::new(pending.direction, true, start, data.clone());
            if websocket && !pending.packet_guid.is_empty() {
                packet.guid = pending.packet_guid.clone();
            }
            (data, Some(packet))
        } else {
            (data, None)
        };

        let outcome = InterceptOutcome {
            action,
            data,
            modified_packet,
        };
        if pending.tx.send(outcome).is_err() {
            tracing::debug!(guid = %view.request.guid, "Held exchange went away before release");
        }

        self.broadcast.broadcast(ProjectEvent::InterceptedRequest {
            action: RecordAction::Delete,
            intercepted: view,
        });
    }
}
