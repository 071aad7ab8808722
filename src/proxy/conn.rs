//! HTTP/1.1 wire I/O over any byte stream

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::error::HttpError;
use crate::http::BodyFraming;
use crate::project::BodySource;

const MAX_HEAD_LEN: usize = 64 * 1024;

/// Any bidirectional stream: plain TCP, TLS, or an in-memory duplex in tests.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// One side of a proxied connection.
pub struct HttpConn {
    reader: BufReader<ReadHalf<BoxIo>>,
    writer: WriteHalf<BoxIo>,
}

impl HttpConn {
    pub fn new(io: BoxIo) -> Self {
        let (read_half, writer) = tokio::io::split(io);
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Read a message head up to and including the blank line.
    ///
    /// Returns `None` if the peer closed the connection before sending
    /// anything. Blank lines before the start line are skipped.
    pub async fn read_head(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        let mut head = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = self
                .reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(io_error)?;

            if n == 0 {
                return if head.is_empty() {
                    Ok(None)
                } else {
                    Err(HttpError::Incomplete)
                };
            }

            let blank = line == b"\r\n" || line == b"\n";
            if blank && head.is_empty() {
                continue;
            }
            head.extend_from_slice(&line);
            if blank {
                return Ok(Some(head));
            }
            if head.len() > MAX_HEAD_LEN {
                return Err(HttpError::Parse("header block too large".into()));
            }
        }
    }

    /// Body bytes as they appear on the wire, chunk framing included.
    pub fn body(&mut self, framing: BodyFraming) -> WireBody<'_> {
        WireBody::new(&mut self.reader, framing)
    }

    /// Read a whole body, refusing anything larger than `max` bytes.
    pub async fn read_full_body(
        &mut self,
        framing: BodyFraming,
        max: usize,
    ) -> Result<Vec<u8>, HttpError> {
        let mut body = Vec::new();
        let mut source = self.body(framing);
        while let Some(chunk) = source.next_chunk().await? {
            body.extend_from_slice(&chunk);
            if body.len() > max {
                return Err(HttpError::BodyTooLarge {
                    size: body.len(),
                    max,
                });
            }
        }
        Ok(body)
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.writer.write_all(data).await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }

    /// Reassemble the stream, returning any bytes already buffered from it.
    pub fn into_inner(self) -> (BoxIo, Vec<u8>) {
        let leftover = self.reader.buffer().to_vec();
        let io = self.reader.into_inner().unsplit(self.writer);
        (io, leftover)
    }
}

fn io_error(e: std::io::Error) -> HttpError {
    HttpError::ConnectionError(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    Done,
    Length(u64),
    UntilClose,
    Chunked(ChunkState),
}

/// Raw body reader following the message's framing.
pub struct WireBody<'a> {
    reader: &'a mut BufReader<ReadHalf<BoxIo>>,
    state: WireState,
}

impl<'a> WireBody<'a> {
    fn new(reader: &'a mut BufReader<ReadHalf<BoxIo>>, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty => WireState::Done,
            BodyFraming::Length(n) => WireState::Length(n),
            BodyFraming::Chunked => WireState::Chunked(ChunkState::Size),
            BodyFraming::UntilClose => WireState::UntilClose,
        };
        Self { reader, state }
    }

    pub fn is_done(&self) -> bool {
        self.state == WireState::Done
    }

    async fn read_exactly_up_to(&mut self, remaining: u64) -> Result<Vec<u8>, HttpError> {
        let buf = self.reader.fill_buf().await.map_err(io_error)?;
        if buf.is_empty() {
            return Err(HttpError::ConnectionError(
                "connection closed before body was complete".into(),
            ));
        }
        let n = buf.len().min(remaining as usize);
        let chunk = buf[..n].to_vec();
        self.reader.consume(n);
        Ok(chunk)
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, HttpError> {
        let mut line = Vec::new();
        self.reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(io_error)?;
        Ok(line)
    }
}

#[async_trait]
impl BodySource for WireBody<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        match self.state {
            WireState::Done => Ok(None),

            WireState::Length(remaining) => {
                let chunk = self.read_exactly_up_to(remaining).await?;
                let left = remaining - chunk.len() as u64;
                self.state = if left == 0 {
                    WireState::Done
                } else {
                    WireState::Length(left)
                };
                Ok(Some(chunk))
            }

            WireState::UntilClose => {
                let buf = self.reader.fill_buf().await.map_err(io_error)?;
                if buf.is_empty() {
                    self.state = WireState::Done;
                    return Ok(None);
                }
                let chunk = buf.to_vec();
                self.reader.consume(chunk.len());
                Ok(Some(chunk))
            }

            WireState::Chunked(ChunkState::Size) => {
                let line = self.read_line().await?;
                if line.is_empty() {
                    return Err(HttpError::Incomplete);
                }
                let text = String::from_utf8_lossy(&line);
                let size_text = text.trim().split(';').next().unwrap_or("").trim();
                let size = u64::from_str_radix(size_text, 16)
                    .map_err(|_| HttpError::Parse(format!("invalid chunk size '{}'", size_text)))?;
                self.state = WireState::Chunked(if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data(size)
                });
                Ok(Some(line))
            }

            WireState::Chunked(ChunkState::Data(remaining)) => {
                let chunk = self.read_exactly_up_to(remaining).await?;
                let left = remaining - chunk.len() as u64;
                self.state = WireState::Chunked(if left == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(left)
                });
                Ok(Some(chunk))
            }

            WireState::Chunked(ChunkState::DataEnd) => {
                let line = self.read_line().await?;
                if line.is_empty() {
                    return Err(HttpError::Incomplete);
                }
                self.state = WireState::Chunked(ChunkState::Size);
                Ok(Some(line))
            }

            WireState::Chunked(ChunkState::Trailers) => {
                let line = self.read_line().await?;
                if line.is_empty() || line == b"\r\n" || line == b"\n" {
                    self.state = WireState::Done;
                }
                if line.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(line))
                }
            }
        }
    }
}
