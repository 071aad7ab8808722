//! Per-exchange interception state machine
//!
//! Each request and response leg goes through the same steps: capture the
//! original bytes, give the hooks a chance to rewrite them, optionally hold
//! them for the operator, then re-parse whatever is going to be sent on.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use url::Url;

use super::intercept::{InterceptAction, InterceptHandle, InterceptOutcome, InterceptQueue};
use super::passthrough::Passthrough;
use crate::app::InterceptSettings;
use crate::http::{
    correct_length_headers, dechunk, header_has_token, parse_request, parse_response,
    reframe_with_length, text_response, to_origin_form,
};
use crate::project::{
    read_body, spawn_stream_capture, BodySource, Direction, Project, Request, PROTOCOL_HTTP11,
};
use crate::scripting::Hooks;

/// Body sent in place of a dropped exchange.
pub const DROPPED_BODY: &str = "Request dropped by proxy";

/// What to do with a captured request.
#[derive(Debug)]
pub enum RequestVerdict {
    /// Send `outgoing` upstream
    Forward { request: Request, outgoing: Vec<u8> },
    /// Answer the client directly; nothing goes upstream
    Respond { request: Request, response: Vec<u8> },
    /// Relay without capture
    Passthrough,
}

/// How a response started.
#[derive(Debug)]
pub enum ResponseStart {
    /// Fully read and processed; send `response` to the client
    Buffered { request: Request, response: Vec<u8> },
    /// Too large or open-ended; `first` has been recorded and must be sent
    /// before the rest is relayed and captured in the background
    Streaming { request: Request, first: Vec<u8> },
}

/// Result of relaying a single WebSocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameVerdict {
    Relay(Vec<u8>),
    Drop,
}

/// A recorded frame, either free to go or waiting on the operator.
pub enum FrameCapture {
    Relay(Vec<u8>),
    Held(HeldFrame),
}

pub struct HeldFrame {
    handle: InterceptHandle,
    display: serde_json::Value,
}

impl HeldFrame {
    pub fn into_parts(self) -> (InterceptHandle, serde_json::Value) {
        (self.handle, self.display)
    }
}

pub struct InterceptionEngine {
    settings: RwLock<InterceptSettings>,
    queue: Arc<InterceptQueue>,
    hooks: Arc<dyn Hooks>,
    project: Arc<Project>,
    passthrough: Passthrough,
    stream_threshold: usize,
}

impl InterceptionEngine {
    pub fn new(
        settings: InterceptSettings,
        queue: Arc<InterceptQueue>,
        hooks: Arc<dyn Hooks>,
        project: Arc<Project>,
        passthrough: Passthrough,
        stream_threshold: usize,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            queue,
            hooks,
            project,
            passthrough,
            stream_threshold,
        }
    }

    pub fn settings(&self) -> InterceptSettings {
        *self.settings.read()
    }

    /// Swap interception settings, releasing holds for directions turned off.
    pub fn set_intercept_settings(&self, settings: InterceptSettings) {
        let previous = std::mem::replace(&mut *self.settings.write(), settings);

        if previous.browser_to_server && !settings.browser_to_server {
            self.queue.release_all(Direction::BrowserToServer);
        }
        if previous.server_to_browser && !settings.server_to_browser {
            self.queue.release_all(Direction::ServerToBrowser);
        }
        tracing::info!(
            browser_to_server = settings.browser_to_server,
            server_to_browser = settings.server_to_browser,
            "Intercept settings changed"
        );
    }

    pub fn queue(&self) -> &Arc<InterceptQueue> {
        &self.queue
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn passthrough(&self) -> &Passthrough {
        &self.passthrough
    }

    pub fn stream_threshold(&self) -> usize {
        self.stream_threshold
    }

    /// Request leg: capture, hooks, optional hold, re-parse.
    pub async fn on_request(&self, url: &Url, raw: Vec<u8>) -> RequestVerdict {
        if self.passthrough.matches(url) {
            tracing::debug!(url = %url, "Passthrough");
            return RequestVerdict::Passthrough;
        }

        let verb = parse_request(&raw).map(|p| p.method).unwrap_or_default();
        let mut request = Request::new(url.as_str(), verb, PROTOCOL_HTTP11);
        request.append_packet(Direction::BrowserToServer, false, raw.clone());
        request.request_size = raw.len() as i64;
        self.project.record(&mut request);

        let hold = self.settings.read().browser_to_server;
        let (action, data) = self
            .process(&mut request, Direction::BrowserToServer, &raw, hold)
            .await;

        if action == InterceptAction::Drop {
            tracing::debug!(guid = %request.guid, "Request dropped");
            let response = text_response(403, "Forbidden", DROPPED_BODY);
            self.capture_synthetic_response(&mut request, &response);
            return RequestVerdict::Respond { request, response };
        }
        if action == InterceptAction::ForwardAndInterceptResponse {
            request.intercept_response = true;
        }

        let outgoing = if data == raw {
            data
        } else {
            match parse_request(&data) {
                Ok(parsed) => {
                    // Edits choose the path only; scheme and host stay those of the connection.
                    match parsed.url_on(url.scheme(), &authority(url)) {
                        Ok(new_url) => request.url = new_url.to_string(),
                        Err(e) => tracing::debug!("Keeping original URL: {}", e),
                    }
                    let absolute = parsed.is_absolute_form();
                    request.verb = parsed.method;
                    if absolute {
                        to_origin_form(&data)
                    } else {
                        data
                    }
                }
                Err(e) => {
                    tracing::warn!(guid = %request.guid, "Modified request does not parse: {}", e);
                    request.error = format!("Modified request could not be parsed: {}", e);
                    raw
                }
            }
        };

        request.request_size = outgoing.len() as i64;
        self.project.record(&mut request);
        RequestVerdict::Forward { request, outgoing }
    }

    /// Begin the response leg: read the body from `source` after `head`.
    ///
    /// `wire_chunked` says whether the body still carries chunked framing.
    /// Bodies reaching the stream threshold, and event streams, are not
    /// buffered and skip hooks and holds.
    pub async fn on_response_start<S: BodySource + ?Sized>(
        &self,
        mut request: Request,
        head: Vec<u8>,
        source: &mut S,
        wire_chunked: bool,
    ) -> ResponseStart {
        let parsed_head = parse_response(&head).ok();
        let event_stream = parsed_head.as_ref().is_some_and(|p| p.is_event_stream());

        let capture = read_body(source, head.len(), event_stream, self.stream_threshold).await;
        if let Some(e) = &capture.error {
            request.error = e.to_string();
        }

        if capture.streaming {
            let mut first = head;
            first.extend_from_slice(&capture.body);
            self.begin_stream(&mut request, &first);
            return ResponseStart::Streaming { request, first };
        }

        let declared_chunked = parsed_head
            .as_ref()
            .is_some_and(|p| header_has_token(&p.headers, "transfer-encoding", "chunked"));

        let response = if declared_chunked {
            let body = if wire_chunked {
                match dechunk(&capture.body) {
                    Ok(body) => body,
                    Err(e) => {
                        request.error = format!("Could not decode chunked body: {}", e);
                        capture.body
                    }
                }
            } else {
                capture.body
            };
            let mut message = head;
            message.extend_from_slice(&body);
            reframe_with_length(&message)
        } else {
            let mut message = head;
            message.extend_from_slice(&capture.body);
            message
        };

        let (request, response) = self.on_response(request, response).await;
        ResponseStart::Buffered { request, response }
    }

    /// Response leg for a fully buffered response.
    pub async fn on_response(&self, mut request: Request, raw: Vec<u8>) -> (Request, Vec<u8>) {
        request.append_packet(Direction::ServerToBrowser, false, raw.clone());
        match parse_response(&raw) {
            Ok(parsed) => request.apply_response(&parsed, raw.len()),
            Err(e) => request.error = format!("Could not parse response: {}", e),
        }
        self.project.record(&mut request);

        let hold = self.settings.read().server_to_browser || request.intercept_response;
        let (action, data) = self
            .process(&mut request, Direction::ServerToBrowser, &raw, hold)
            .await;

        if action == InterceptAction::Drop {
            tracing::debug!(guid = %request.guid, "Response dropped");
            let response = text_response(403, "Forbidden", DROPPED_BODY);
            self.project.record(&mut request);
            return (request, response);
        }

        let outgoing = if data == raw {
            data
        } else {
            let corrected = correct_length_headers(&data);
            match parse_response(&corrected) {
                Ok(parsed) => {
                    request.apply_response(&parsed, corrected.len());
                    corrected
                }
                Err(e) => {
                    tracing::warn!(guid = %request.guid, "Modified response does not parse: {}", e);
                    request.error = format!("Modified response could not be parsed: {}", e);
                    raw
                }
            }
        };

        self.project.record(&mut request);
        (request, outgoing)
    }

    /// Record the first part of a streamed response.
    pub fn begin_stream(&self, request: &mut Request, first: &[u8]) {
        request.append_packet(Direction::ServerToBrowser, false, first.to_vec());
        match parse_response(first) {
            Ok(parsed) => request.apply_response(&parsed, first.len()),
            Err(e) => request.error = format!("Could not parse response: {}", e),
        }
        self.project.record(request);
    }

    /// Capture the rest of a streamed response in the background.
    pub fn continue_stream<S>(&self, request: Request, source: S) -> JoinHandle<Request>
    where
        S: BodySource + 'static,
    {
        spawn_stream_capture(request, source, self.project.clone())
    }

    /// Record a WebSocket frame and apply the hold rules for its direction.
    ///
    /// Only text and binary frames can be held; control frames are recorded
    /// and relayed untouched.
    pub async fn on_frame(
        &self,
        ws: &mut Request,
        direction: Direction,
        opcode: &str,
        data: Vec<u8>,
    ) -> FrameVerdict {
        match self.capture_frame(ws, direction, opcode, data) {
            FrameCapture::Relay(data) => FrameVerdict::Relay(data),
            FrameCapture::Held(held) => {
                let (handle, display) = held.into_parts();
                let outcome = handle.wait().await;
                self.finish_frame(ws, display, outcome)
            }
        }
    }

    /// First half of [`on_frame`](Self::on_frame): record the frame and
    /// register a hold if one applies. Does not block.
    pub fn capture_frame(
        &self,
        ws: &mut Request,
        direction: Direction,
        opcode: &str,
        data: Vec<u8>,
    ) -> FrameCapture {
        let display = serde_json::json!({ "opcode": opcode });
        let packet_guid = ws.append_packet(direction, false, data.clone());
        if let Some(packet) = ws.data_packets.last_mut() {
            packet.display_data = Some(display.clone());
        }
        self.project.record(ws);

        let settings = self.settings();
        let hold = match direction {
            Direction::BrowserToServer => settings.browser_to_server,
            Direction::ServerToBrowser => settings.server_to_browser,
        };
        if !hold || !matches!(opcode, "text" | "binary") {
            return FrameCapture::Relay(data);
        }

        let handle = self.queue.add(ws, &packet_guid, direction, &data, false);
        FrameCapture::Held(HeldFrame { handle, display })
    }

    /// Second half of [`on_frame`](Self::on_frame): apply the operator's decision.
    pub fn finish_frame(
        &self,
        ws: &mut Request,
        display: serde_json::Value,
        outcome: InterceptOutcome,
    ) -> FrameVerdict {
        if let Some(mut packet) = outcome.modified_packet {
            packet.display_data = Some(display);
            ws.data_packets.push(packet);
            self.project.record(ws);
        }

        if outcome.action.forwards() {
            FrameVerdict::Relay(outcome.data)
        } else {
            tracing::debug!(guid = %ws.guid, "WebSocket frame dropped");
            FrameVerdict::Drop
        }
    }

    /// Hooks then optional hold for one leg.
    async fn process(
        &self,
        request: &mut Request,
        direction: Direction,
        raw: &[u8],
        hold: bool,
    ) -> (InterceptAction, Vec<u8>) {
        let hook = self.hooks.run_hooks(direction, request, raw);
        let hooked = hook.modified;
        let mut data = hook.wait(raw).await;
        let modified = hooked && data != raw;

        if hold {
            let outcome = self
                .queue
                .add(request, "", direction, &data, modified)
                .wait()
                .await;
            if let Some(packet) = outcome.modified_packet {
                request.data_packets.push(packet);
            }
            return (outcome.action, outcome.data);
        }

        if modified {
            data = correct_length_headers(&data);
            request.append_packet(direction, true, data.clone());
        }
        (InterceptAction::Forward, data)
    }

    /// Record an upstream failure and build the `502` for the client.
    pub fn upstream_failed(&self, mut request: Request, error: &str) -> (Request, Vec<u8>) {
        tracing::debug!(guid = %request.guid, "Upstream failed: {}", error);
        request.error = error.to_string();
        let response = text_response(502, "Bad Gateway", error);
        self.capture_synthetic_response(&mut request, &response);
        (request, response)
    }

    fn capture_synthetic_response(&self, request: &mut Request, response: &[u8]) {
        request.append_packet(Direction::ServerToBrowser, false, response.to_vec());
        if let Ok(parsed) = parse_response(response) {
            request.apply_response(&parsed, response.len());
        }
        self.project.record(request);
    }
}

/// `host[:port]` of `url`, with the port only when it is explicit.
fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}
