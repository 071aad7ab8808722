//! Response body capture, buffered or streamed

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::request::{Direction, Request};
use super::Project;
use crate::error::HttpError;

/// Minimum spacing between intermediate records of a streaming body.
const RECORD_INTERVAL: Duration = Duration::from_millis(250);

/// Incremental source of body bytes.
#[async_trait]
pub trait BodySource: Send {
    /// Next chunk, or `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpError>;
}

#[async_trait]
impl BodySource for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        self.chunk()
            .await
            .map(|c| c.map(|b| b.to_vec()))
            .map_err(|e| HttpError::RequestFailed(e.to_string()))
    }
}

/// Chunks relayed from another task, e.g. a connection forwarding to the client.
#[async_trait]
impl BodySource for mpsc::Receiver<Result<Vec<u8>, HttpError>> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        self.recv().await.transpose()
    }
}

/// Outcome of reading the start of a body.
#[derive(Debug, Default)]
pub struct BodyCapture {
    pub body: Vec<u8>,
    /// The body was not read to the end; the rest must be streamed.
    pub streaming: bool,
    pub error: Option<HttpError>,
}

/// Read a body until it ends or until it qualifies for streaming.
///
/// Event streams qualify after their first chunk; other bodies once
/// `head_len` plus the bytes read reach `threshold`.
pub async fn read_body<S: BodySource + ?Sized>(
    source: &mut S,
    head_len: usize,
    event_stream: bool,
    threshold: usize,
) -> BodyCapture {
    let mut capture = BodyCapture::default();

    loop {
        match source.next_chunk().await {
            Ok(Some(chunk)) => {
                capture.body.extend_from_slice(&chunk);
                if event_stream || head_len + capture.body.len() >= threshold {
                    capture.streaming = true;
                    return capture;
                }
            }
            Ok(None) => return capture,
            Err(e) => {
                capture.error = Some(e);
                return capture;
            }
        }
    }
}

/// Continue capturing a streamed response in the background.
///
/// Each chunk is appended as an unmodified server-to-browser packet.
/// Intermediate snapshots are recorded at most every 250ms, and a final
/// snapshot is recorded when the body ends or fails. The task yields the
/// finished record.
pub fn spawn_stream_capture<S>(
    mut request: Request,
    mut source: S,
    project: Arc<Project>,
) -> JoinHandle<Request>
where
    S: BodySource + 'static,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let mut last_record = Instant::now();

        loop {
            match source.next_chunk().await {
                Ok(Some(chunk)) if chunk.is_empty() => continue,
                Ok(Some(chunk)) => {
                    let len = chunk.len() as i64;
                    request.append_packet(Direction::ServerToBrowser, false, chunk);
                    request.response_size += len;
                    request.response_content_length += len;

                    if last_record.elapsed() >= RECORD_INTERVAL {
                        project.record(&mut request);
                        last_record = Instant::now();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(guid = %request.guid, "Stream capture ended with error: {}", e);
                    request.error = e.to_string();
                    break;
                }
            }
        }

        request.response_time_ms += started.elapsed().as_millis() as u64;
        project.record(&mut request);
        tracing::debug!(
            guid = %request.guid,
            size = request.response_size,
            "Stream capture finished"
        );
        request
    })
}
