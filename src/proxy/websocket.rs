//! WebSocket frame relay after a `101 Switching Protocols`

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::conn::HttpConn;
use super::engine::{FrameCapture, FrameVerdict, InterceptionEngine};
use crate::project::{Direction, Request};

/// Opcode label and payload of a data or control message.
fn frame_parts(message: &Message) -> Option<(&'static str, Vec<u8>)> {
    match message {
        Message::Text(text) => Some(("text", text.as_bytes().to_vec())),
        Message::Binary(data) => Some(("binary", data.clone())),
        Message::Ping(data) => Some(("ping", data.clone())),
        Message::Pong(data) => Some(("pong", data.clone())),
        Message::Close(frame) => {
            let mut data = Vec::new();
            if let Some(frame) = frame {
                data.extend_from_slice(&u16::from(frame.code).to_be_bytes());
                data.extend_from_slice(frame.reason.as_bytes());
            }
            Some(("close", data))
        }
        Message::Frame(_) => None,
    }
}

/// Rebuild an outgoing message of the same kind around `data`.
///
/// Pings and pongs are answered by each side's own stack and are not
/// forwarded.
fn rebuild(original: &Message, data: Vec<u8>) -> Option<Message> {
    match original {
        Message::Text(_) => Some(Message::Text(String::from_utf8_lossy(&data).into_owned())),
        Message::Binary(_) => Some(Message::Binary(data)),
        Message::Close(_) => {
            if data.len() < 2 {
                return Some(Message::Close(None));
            }
            let code = u16::from_be_bytes([data[0], data[1]]);
            Some(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(String::from_utf8_lossy(&data[2..]).into_owned()),
            })))
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

/// The session record, created when the first frame arrives.
struct Session<'a> {
    engine: &'a InterceptionEngine,
    upgrade: Request,
    record: Mutex<Option<Request>>,
}

impl Session<'_> {
    async fn frame(&self, direction: Direction, opcode: &str, data: Vec<u8>) -> FrameVerdict {
        let capture = {
            let mut record = self.record.lock();
            let ws = record.get_or_insert_with(|| {
                tracing::debug!(url = %self.upgrade.url, "WebSocket session started");
                Request::websocket_from(&self.upgrade)
            });
            self.engine.capture_frame(ws, direction, opcode, data)
        };

        match capture {
            FrameCapture::Relay(data) => FrameVerdict::Relay(data),
            FrameCapture::Held(held) => {
                let (handle, display) = held.into_parts();
                let outcome = handle.wait().await;
                let mut record = self.record.lock();
                match record.as_mut() {
                    Some(ws) => self.engine.finish_frame(ws, display, outcome),
                    None => FrameVerdict::Relay(outcome.data),
                }
            }
        }
    }

    fn fail(&self, error: &WsError) {
        let mut record = self.record.lock();
        if let Some(ws) = record.as_mut() {
            if ws.error.is_empty() {
                ws.error = error.to_string();
                self.engine.project().record(ws);
            }
        }
    }
}

/// Pump messages from one side to the other until either ends.
async fn pump<St, Si>(session: &Session<'_>, direction: Direction, mut from: St, mut to: Si)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = from.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(direction = direction.as_str(), "WebSocket read ended: {}", e);
                session.fail(&e);
                break;
            }
        };
        let Some((opcode, data)) = frame_parts(&message) else {
            continue;
        };
        let closing = matches!(message, Message::Close(_));

        if let FrameVerdict::Relay(data) = session.frame(direction, opcode, data).await {
            if let Some(out) = rebuild(&message, data) {
                if let Err(e) = to.send(out).await {
                    tracing::debug!(direction = direction.as_str(), "WebSocket write failed: {}", e);
                    session.fail(&e);
                    break;
                }
            }
        }
        if closing {
            break;
        }
    }
    let _ = to.close().await;
}

/// Relay frames between the browser and the server.
///
/// `upgrade` is the recorded upgrade exchange; the returned record is the
/// WebSocket session, if any frame was seen.
pub async fn relay(
    engine: &InterceptionEngine,
    upgrade: Request,
    client: HttpConn,
    server: HttpConn,
) -> Option<Request> {
    let (client_io, client_leftover) = client.into_inner();
    let (server_io, server_leftover) = server.into_inner();

    let client_ws =
        WebSocketStream::from_partially_read(client_io, client_leftover, Role::Server, None).await;
    let server_ws =
        WebSocketStream::from_partially_read(server_io, server_leftover, Role::Client, None).await;

    let (client_sink, client_stream) = client_ws.split();
    let (server_sink, server_stream) = server_ws.split();

    let session = Session {
        engine,
        upgrade,
        record: Mutex::new(None),
    };

    tokio::select! {
        _ = pump(&session, Direction::BrowserToServer, client_stream, server_sink) => {}
        _ = pump(&session, Direction::ServerToBrowser, server_stream, client_sink) => {}
    }

    // The pump that lost the race may have left a frame on hold; it can no
    // longer be delivered.
    let mut record = session.record.into_inner();
    if let Some(ws) = record.as_mut() {
        engine.queue().discard(&ws.guid);
        engine.project().record(ws);
        tracing::debug!(guid = %ws.guid, frames = ws.data_packets.len(), "WebSocket session ended");
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::InterceptSettings;
    use crate::project::{Broadcaster, History, Project, PROTOCOL_HTTP11};
    use crate::proxy::{InterceptQueue, Passthrough};
    use crate::scripting::NoHooks;
    use std::sync::Arc;

    #[test]
    fn test_close_frame_round_trips_through_bytes() {
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("bye"),
        }));
        let (opcode, data) = frame_parts(&close).unwrap();
        assert_eq!(opcode, "close");
        assert_eq!(&data[..2], &1000u16.to_be_bytes());
        assert_eq!(rebuild(&close, data), Some(close));
        assert_eq!(rebuild(&Message::Ping(vec![1]), vec![1]), None);
    }

    #[tokio::test]
    async fn test_relay_records_frames_in_both_directions() {
        let history = Arc::new(History::default());
        let hub = Arc::new(Broadcaster::default());
        let project = Arc::new(Project::new(history.clone(), hub.clone()));
        let engine = InterceptionEngine::new(
            InterceptSettings::default(),
            Arc::new(InterceptQueue::new(hub)),
            Arc::new(NoHooks),
            project,
            Passthrough::default(),
            1024,
        );

        let (browser_io, proxy_client_io) = tokio::io::duplex(16 * 1024);
        let (proxy_server_io, origin_io) = tokio::io::duplex(16 * 1024);

        // The upgrade handshake is already done; both ends speak frames now.
        let browser = tokio::spawn(async move {
            let mut ws = WebSocketStream::from_raw_socket(browser_io, Role::Client, None).await;
            ws.send(Message::Text("hello".into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            reply
        });
        let origin = tokio::spawn(async move {
            let mut ws = WebSocketStream::from_raw_socket(origin_io, Role::Server, None).await;
            let msg = ws.next().await.unwrap().unwrap();
            ws.send(Message::Binary(msg.into_data())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let upgrade = Request::new("wss://chat.test/socket", "GET", PROTOCOL_HTTP11);
        let ws = relay(
            &engine,
            upgrade,
            HttpConn::new(Box::new(proxy_client_io)),
            HttpConn::new(Box::new(proxy_server_io)),
        )
        .await
        .unwrap();

        assert_eq!(browser.await.unwrap(), Message::Binary(b"hello".to_vec()));
        let _ = origin.await;

        assert!(ws.is_websocket());
        let opcodes: Vec<_> = ws
            .data_packets
            .iter()
            .map(|p| p.display_data.as_ref().unwrap()["opcode"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(&opcodes[..2], &["text".to_string(), "binary".to_string()]);
        assert!(ws.data(Direction::BrowserToServer, false).starts_with(b"hello"));
        assert!(history.get(&ws.guid).is_some());
    }

    #[tokio::test]
    async fn test_held_frame_is_discarded_when_peer_closes() {
        let hub = Arc::new(Broadcaster::default());
        let project = Arc::new(Project::new(Arc::new(History::default()), hub.clone()));
        let queue = Arc::new(InterceptQueue::new(hub));
        let engine = InterceptionEngine::new(
            InterceptSettings {
                browser_to_server: true,
                server_to_browser: false,
            },
            queue.clone(),
            Arc::new(NoHooks),
            project,
            Passthrough::default(),
            1024,
        );

        let (browser_io, proxy_client_io) = tokio::io::duplex(16 * 1024);
        let (proxy_server_io, origin_io) = tokio::io::duplex(16 * 1024);

        let browser = tokio::spawn(async move {
            let mut ws = WebSocketStream::from_raw_socket(browser_io, Role::Client, None).await;
            ws.send(Message::Text("held".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });
        let waiting = queue.clone();
        let origin = tokio::spawn(async move {
            let mut ws = WebSocketStream::from_raw_socket(origin_io, Role::Server, None).await;
            while waiting.is_empty() {
                tokio::task::yield_now().await;
            }
            ws.close(None).await.unwrap();
            let mut got_text = false;
            while let Some(Ok(msg)) = ws.next().await {
                got_text |= msg.is_text();
            }
            got_text
        });

        let upgrade = Request::new("wss://chat.test/socket", "GET", PROTOCOL_HTTP11);
        let ws = relay(
            &engine,
            upgrade,
            HttpConn::new(Box::new(proxy_client_io)),
            HttpConn::new(Box::new(proxy_server_io)),
        )
        .await
        .unwrap();

        assert!(queue.is_empty());
        assert!(!origin.await.unwrap());
        let _ = browser.await;
        assert!(ws.data(Direction::BrowserToServer, false).starts_with(b"held"));
    }
}
