//! Captured request records and their byte-range data packets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::base64_bytes;
use crate::http::ParsedResponse;

/// Protocol label for plain HTTP/1.1 exchanges.
pub const PROTOCOL_HTTP11: &str = "HTTP/1.1";
/// Protocol label for WebSocket sessions.
pub const PROTOCOL_WEBSOCKET: &str = "Websocket";
/// Protocol label for out-of-band interactions (never bucketed in the sitemap).
pub const PROTOCOL_OUT_OF_BAND: &str = "Out of Band";

/// Direction of travel of a data packet, and of an interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Request data, browser to server
    BrowserToServer,
    /// Response data, server to browser
    ServerToBrowser,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::BrowserToServer => "browser_to_server",
            Direction::ServerToBrowser => "server_to_browser",
        }
    }
}

/// One contiguous byte range of a request or response.
///
/// Offsets are inclusive. For a given (direction, modified) stream,
/// consecutive packets satisfy `next.start_offset == prev.end_offset + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub guid: String,
    pub time: DateTime<Utc>,
    pub direction: Direction,
    pub modified: bool,
    pub start_offset: i64,
    pub end_offset: i64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Rendering hints, e.g. `{"opcode": "text"}` for WebSocket frames
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_data: Option<serde_json::Value>,
}

impl DataPacket {
    pub fn new(direction: Direction, modified: bool, start_offset: i64, data: Vec<u8>) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            time: Utc::now(),
            direction,
            modified,
            start_offset,
            end_offset: start_offset + data.len() as i64 - 1,
            data,
            display_data: None,
        }
    }
}

/// A single logical exchange as recorded by the proxy or request runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub guid: String,
    pub url: String,
    pub protocol: String,
    pub verb: String,
    pub time: DateTime<Utc>,

    pub response_status: u16,
    pub response_status_text: String,
    pub response_size: i64,
    pub response_content_length: i64,
    pub response_content_type: String,
    pub response_time_ms: u64,

    /// Bytes of request data; response packets start at this offset
    pub request_size: i64,

    /// Scan/campaign this request belongs to; empty for manual traffic
    pub scan_id: String,
    pub error: String,
    pub notes: String,
    /// JSON object mapping original injection values to substitutes
    pub payloads: String,
    /// Hold the response of this exchange regardless of global settings
    pub intercept_response: bool,
    pub sitemap_path: String,

    pub data_packets: Vec<DataPacket>,
}

impl Request {
    pub fn new(url: impl Into<String>, verb: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            url: url.into(),
            protocol: protocol.into(),
            verb: verb.into(),
            time: Utc::now(),
            response_status: 0,
            response_status_text: String::new(),
            response_size: 0,
            response_content_length: 0,
            response_content_type: String::new(),
            response_time_ms: 0,
            request_size: 0,
            scan_id: String::new(),
            error: String::new(),
            notes: String::new(),
            payloads: String::new(),
            intercept_response: false,
            sitemap_path: String::new(),
            data_packets: Vec::new(),
        }
    }

    /// WebSocket session record promoted from the upgrade exchange.
    pub fn websocket_from(upgrade: &Request) -> Self {
        let mut ws = Request::new(upgrade.url.clone(), upgrade.verb.clone(), PROTOCOL_WEBSOCKET);
        ws.response_status = upgrade.response_status;
        ws.response_content_type = upgrade.response_content_type.clone();
        ws.scan_id = upgrade.scan_id.clone();
        ws.sitemap_path = upgrade.sitemap_path.clone();
        ws
    }

    pub fn is_websocket(&self) -> bool {
        self.protocol == PROTOCOL_WEBSOCKET
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_status)
    }

    /// Offset at which the next packet of the (direction, modified) stream starts.
    pub fn next_offset(&self, direction: Direction, modified: bool) -> i64 {
        self.data_packets
            .iter()
            .rev()
            .find(|p| p.direction == direction && p.modified == modified)
            .map(|p| p.end_offset + 1)
            .unwrap_or_else(|| self.base_offset(direction))
    }

    fn base_offset(&self, direction: Direction) -> i64 {
        match direction {
            Direction::BrowserToServer => 0,
            Direction::ServerToBrowser => self.request_size,
        }
    }

    /// Append `data` to the (direction, modified) stream; returns the packet GUID.
    pub fn append_packet(&mut self, direction: Direction, modified: bool, data: Vec<u8>) -> String {
        let start = self.next_offset(direction, modified);
        let packet = DataPacket::new(direction, modified, start, data);
        let guid = packet.guid.clone();
        self.data_packets.push(packet);
        guid
    }

    /// Concatenated bytes of the (direction, modified) stream.
    pub fn data(&self, direction: Direction, modified: bool) -> Vec<u8> {
        self.data_packets
            .iter()
            .filter(|p| p.direction == direction && p.modified == modified)
            .flat_map(|p| p.data.iter().copied())
            .collect()
    }

    /// Modified bytes for `direction` if any exist, otherwise the original.
    pub fn effective_data(&self, direction: Direction) -> Vec<u8> {
        let modified = self.data(direction, true);
        if modified.is_empty() {
            self.data(direction, false)
        } else {
            modified
        }
    }

    pub fn packet(&self, guid: &str, modified: bool) -> Option<&DataPacket> {
        self.data_packets
            .iter()
            .find(|p| p.guid == guid && p.modified == modified)
    }

    /// Copy status, reason and content metadata from a parsed response.
    pub fn apply_response(&mut self, response: &ParsedResponse, total_len: usize) {
        self.response_status = response.status;
        self.response_status_text = response.reason.clone();
        self.response_content_type = response.content_type();
        self.response_content_length = response.body.len() as i64;
        self.response_size = total_len as i64;
    }
}

/// Lightweight view of a [`Request`] without packet data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub guid: String,
    pub url: String,
    pub protocol: String,
    pub verb: String,
    pub time: DateTime<Utc>,
    pub response_status: u16,
    pub response_size: i64,
    pub response_content_type: String,
    pub response_time_ms: u64,
    pub scan_id: String,
    pub error: String,
    pub payloads: String,
}

impl From<&Request> for RequestSummary {
    fn from(r: &Request) -> Self {
        Self {
            guid: r.guid.clone(),
            url: r.url.clone(),
            protocol: r.protocol.clone(),
            verb: r.verb.clone(),
            time: r.time,
            response_status: r.response_status,
            response_size: r.response_size,
            response_content_type: r.response_content_type.clone(),
            response_time_ms: r.response_time_ms,
            scan_id: r.scan_id.clone(),
            error: r.error.clone(),
            payloads: r.payloads.clone(),
        }
    }
}
