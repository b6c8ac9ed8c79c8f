//! Message framing over the engine's byte stream.
//!
//! Two wire formats are supported:
//!
//! ```text
//! Lines:          {"jsonrpc":"2.0","method":"get_system_info","params":[],"id":1}\n
//! ContentLength:  Content-Length: 62\r\n\r\n{"jsonrpc":"2.0",...}
//! ```
//!
//! A malformed frame is reported to the reader and skipped; decoding resumes at
//! the next frame boundary. Writes go through a single async mutex so frames
//! from concurrent callers never interleave.

use bytes::{Buf, BufMut, BytesMut};
use dcrpc_core::FrameFormat;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Upper bound for a Content-Length header block.
const MAX_HEADER_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A decoded frame, or the reason it was rejected.
type Decoded = std::result::Result<Value, String>;

/// Codec for both wire formats.
pub struct FrameCodec {
    kind: CodecKind,
}

enum CodecKind {
    Lines(LinesCodec),
    ContentLength(ContentLengthState),
}

struct ContentLengthState {
    max_frame_size: usize,
    body_len: Option<usize>,
    discard: usize,
}

impl FrameCodec {
    pub fn new(format: FrameFormat, max_frame_size: usize) -> Self {
        let kind = match format {
            FrameFormat::Lines => CodecKind::Lines(LinesCodec::new_with_max_length(max_frame_size)),
            FrameFormat::ContentLength => CodecKind::ContentLength(ContentLengthState {
                max_frame_size,
                body_len: None,
                discard: 0,
            }),
        };
        Self { kind }
    }
}

fn parse_body(body: &[u8]) -> Decoded {
    let text = std::str::from_utf8(body).map_err(|_| "frame is not valid UTF-8".to_string())?;
    serde_json::from_str(text).map_err(|e| format!("invalid JSON: {}", e))
}

fn lines_decoded(
    result: std::result::Result<Option<String>, LinesCodecError>,
) -> std::result::Result<Option<Option<Decoded>>, FrameError> {
    match result {
        // Blank separator lines carry nothing; the caller keeps decoding.
        Ok(Some(line)) if line.trim().is_empty() => Ok(Some(None)),
        Ok(Some(line)) => Ok(Some(Some(parse_body(line.as_bytes())))),
        Ok(None) => Ok(None),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Some(Err(
            "frame exceeds maximum size".to_string(),
        )))),
        Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Some(Err("frame is not valid UTF-8".to_string()))))
        }
        Err(LinesCodecError::Io(e)) => Err(FrameError::Io(e)),
    }
}

impl ContentLengthState {
    fn decode(&mut self, buf: &mut BytesMut) -> Option<Decoded> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(buf.len());
                buf.advance(n);
                self.discard -= n;
                if self.discard > 0 {
                    return None;
                }
                continue;
            }

            if let Some(len) = self.body_len {
                if buf.len() < len {
                    buf.reserve(len - buf.len());
                    return None;
                }
                let body = buf.split_to(len);
                self.body_len = None;
                return Some(parse_body(&body));
            }

            let (header_end, lines) = match scan_header(buf) {
                HeaderScan::Incomplete if buf.len() > MAX_HEADER_SIZE => {
                    buf.clear();
                    return Some(Err("header block exceeds maximum size".to_string()));
                }
                HeaderScan::Incomplete => return None,
                HeaderScan::LeadingBlank(n) => {
                    buf.advance(n);
                    continue;
                }
                HeaderScan::Complete { end, lines } => (end, lines),
            };
            buf.advance(header_end);

            let mut content_length = None;
            for line in &lines {
                // Parse Content-Length header (case-insensitive)
                if let Some((key, value)) = line.split_once(':') {
                    if key.trim().eq_ignore_ascii_case("Content-Length") {
                        match value.trim().parse::<usize>() {
                            Ok(len) => content_length = Some(len),
                            Err(_) => {
                                return Some(Err(format!(
                                    "invalid Content-Length value: {}",
                                    value.trim()
                                )))
                            }
                        }
                    }
                }
                // Ignore other headers (e.g., Content-Type)
            }

            let size = match content_length {
                Some(size) => size,
                None => return Some(Err("missing Content-Length header".to_string())),
            };

            if size > self.max_frame_size {
                self.discard = size;
                return Some(Err(format!(
                    "message size {} exceeds maximum {} bytes",
                    size, self.max_frame_size
                )));
            }

            self.body_len = Some(size);
        }
    }
}

enum HeaderScan {
    Incomplete,
    /// Empty lines before any header; skip `n` bytes.
    LeadingBlank(usize),
    Complete { end: usize, lines: Vec<String> },
}

/// Finds the end of a header block terminated by an empty line (CRLF or LF).
fn scan_header(buf: &BytesMut) -> HeaderScan {
    let mut lines = Vec::new();
    let mut pos = 0;

    while let Some(offset) = buf[pos..].iter().position(|b| *b == b'\n') {
        let raw = &buf[pos..pos + offset];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        pos += offset + 1;

        if raw.is_empty() {
            if lines.is_empty() {
                return HeaderScan::LeadingBlank(pos);
            }
            return HeaderScan::Complete { end: pos, lines };
        }
        lines.push(String::from_utf8_lossy(raw).into_owned());
    }

    HeaderScan::Incomplete
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>> {
        match &mut self.kind {
            CodecKind::Lines(lines) => loop {
                match lines_decoded(lines.decode(buf))? {
                    Some(Some(decoded)) => return Ok(Some(decoded)),
                    Some(None) => continue,
                    None => return Ok(None),
                }
            },
            CodecKind::ContentLength(state) => Ok(state.decode(buf)),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>> {
        match &mut self.kind {
            CodecKind::Lines(lines) => loop {
                match lines_decoded(lines.decode_eof(buf))? {
                    Some(Some(decoded)) => return Ok(Some(decoded)),
                    Some(None) => continue,
                    None => return Ok(None),
                }
            },
            CodecKind::ContentLength(state) => match state.decode(buf) {
                Some(decoded) => Ok(Some(decoded)),
                None if buf.is_empty() && state.body_len.is_none() => Ok(None),
                None => {
                    buf.clear();
                    state.body_len = None;
                    state.discard = 0;
                    Ok(Some(Err("truncated frame at end of stream".to_string())))
                }
            },
        }
    }
}

impl<'a> Encoder<&'a Value> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, message: &'a Value, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        match self.kind {
            CodecKind::Lines(_) => {
                dst.reserve(body.len() + 1);
                dst.put_slice(&body);
                dst.put_u8(b'\n');
            }
            CodecKind::ContentLength(_) => {
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                dst.reserve(header.len() + body.len());
                dst.put_slice(header.as_bytes());
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

/// Read half of the framer. Single consumer.
pub struct FrameReader {
    inner: FramedRead<BoxedReader, FrameCodec>,
}

impl FrameReader {
    pub fn new(reader: BoxedReader, format: FrameFormat, max_frame_size: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, FrameCodec::new(format, max_frame_size)),
        }
    }

    /// Waits for the next complete frame.
    ///
    /// # Errors
    ///
    /// - `Malformed` for a frame that does not parse; the next call continues
    ///   with the following frame
    /// - `StreamClosed` once the stream reached end of input
    /// - `Io` for a failure of the underlying stream
    pub async fn read_next(&mut self) -> Result<Value> {
        match self.inner.next().await {
            Some(Ok(Ok(message))) => Ok(message),
            Some(Ok(Err(reason))) => Err(FrameError::Malformed(reason)),
            Some(Err(e)) => Err(e),
            None => Err(FrameError::StreamClosed),
        }
    }
}

/// Write half of the framer. Shared by all callers.
pub struct FrameWriter {
    inner: Mutex<Option<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl FrameWriter {
    pub fn new(writer: BoxedWriter, format: FrameFormat, max_frame_size: usize) -> Self {
        Self {
            inner: Mutex::new(Some(FramedWrite::new(
                writer,
                FrameCodec::new(format, max_frame_size),
            ))),
        }
    }

    /// Serializes and flushes one frame while holding the write lock.
    pub async fn write(&self, message: &Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(framed) => framed.send(message).await,
            None => Err(FrameError::StreamClosed),
        }
    }

    /// Flushes and shuts down the write side. Later writes fail with `StreamClosed`.
    pub async fn close(&self) {
        let framed = self.inner.lock().await.take();
        if let Some(mut framed) = framed {
            if let Err(e) = SinkExt::<&Value>::close(&mut framed).await {
                tracing::debug!("Error while closing writer: {}", e);
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Wraps a read/write pair in the chosen wire format.
pub fn framed<R, W>(
    reader: R,
    writer: W,
    format: FrameFormat,
    max_frame_size: usize,
) -> (FrameReader, FrameWriter)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    (
        FrameReader::new(Box::new(reader), format, max_frame_size),
        FrameWriter::new(Box::new(writer), format, max_frame_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    const MAX: usize = 1024;

    fn reader_for(format: FrameFormat) -> (FrameReader, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        (FrameReader::new(Box::new(ours), format, MAX), theirs)
    }

    async fn next(reader: &mut FrameReader) -> Result<Value> {
        timeout(TEST_TIMEOUT, reader.read_next())
            .await
            .expect("Test timed out")
    }

    #[tokio::test]
    async fn test_lines_write_read_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let writer = FrameWriter::new(Box::new(a), FrameFormat::Lines, MAX);
        let mut reader = FrameReader::new(Box::new(b), FrameFormat::Lines, MAX);

        let message = json!({"jsonrpc": "2.0", "method": "get_system_info", "params": [], "id": 1});
        writer.write(&message).await.unwrap();

        assert_eq!(next(&mut reader).await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_lines_malformed_frame_does_not_stop_stream() {
        let (mut reader, mut peer) = reader_for(FrameFormat::Lines);
        peer.write_all(b"{not json}\n\n\r\n{\"id\":1,\"result\":3}\n")
            .await
            .unwrap();

        assert!(matches!(next(&mut reader).await, Err(FrameError::Malformed(_))));
        assert_eq!(next(&mut reader).await.unwrap(), json!({"id": 1, "result": 3}));
    }

    #[tokio::test]
    async fn test_lines_oversized_frame_is_skipped() {
        let (mut reader, mut peer) = reader_for(FrameFormat::Lines);
        let huge = format!("\"{}\"\n", "x".repeat(MAX * 2));
        peer.write_all(huge.as_bytes()).await.unwrap();
        peer.write_all(b"{\"id\":2,\"result\":true}\n").await.unwrap();

        assert!(matches!(next(&mut reader).await, Err(FrameError::Malformed(_))));
        assert_eq!(next(&mut reader).await.unwrap(), json!({"id": 2, "result": true}));
    }

    #[tokio::test]
    async fn test_lines_invalid_utf8_is_malformed() {
        let (mut reader, mut peer) = reader_for(FrameFormat::Lines);
        peer.write_all(b"\xff\xfe\n{\"method\":\"event\"}\n").await.unwrap();

        assert!(matches!(next(&mut reader).await, Err(FrameError::Malformed(_))));
        assert_eq!(next(&mut reader).await.unwrap(), json!({"method": "event"}));
    }

    #[tokio::test]
    async fn test_lines_final_frame_without_newline() {
        let (mut reader, mut peer) = reader_for(FrameFormat::Lines);
        peer.write_all(b"{\"id\":5,\"result\":null}").await.unwrap();
        drop(peer);

        assert_eq!(next(&mut reader).await.unwrap(), json!({"id": 5, "result": null}));
        assert!(matches!(next(&mut reader).await, Err(FrameError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_returns_stream_closed() {
        let (mut reader, peer) = reader_for(FrameFormat::Lines);
        drop(peer);

        assert!(matches!(next(&mut reader).await, Err(FrameError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_content_length_roundtrip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let writer = FrameWriter::new(Box::new(a), FrameFormat::ContentLength, MAX);
        let mut reader = FrameReader::new(Box::new(b), FrameFormat::ContentLength, MAX);

        let first = json!({"id": 1, "result": "a\nb"});
        let second = json!({"method": "event", "params": [1]});
        writer.write(&first).await.unwrap();
        writer.write(&second).await.unwrap();

        assert_eq!(next(&mut reader).await.unwrap(), first);
        assert_eq!(next(&mut reader).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_content_length_case_insensitive_and_lf() {
        let (mut reader, mut peer) = reader_for(FrameFormat::ContentLength);
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-length: {}\nContent-Type: application/json\n\n{}",
            body.len(),
            body
        );
        peer.write_all(raw.as_bytes()).await.unwrap();

        assert_eq!(next(&mut reader).await.unwrap(), json!({"test": true}));
    }

    #[tokio::test]
    async fn test_content_length_missing_header_then_resume() {
        let (mut reader, mut peer) = reader_for(FrameFormat::ContentLength);
        let body = r#"{"id":3,"result":1}"#;
        let raw = format!(
            "X-Other: 1\r\n\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        peer.write_all(raw.as_bytes()).await.unwrap();

        let err = next(&mut reader).await.unwrap_err();
        assert!(
            err.to_string().contains("missing Content-Length"),
            "unexpected error: {}",
            err
        );
        assert_eq!(next(&mut reader).await.unwrap(), json!({"id": 3, "result": 1}));
    }

    #[tokio::test]
    async fn test_content_length_oversized_body_is_discarded() {
        let (mut reader, mut peer) = reader_for(FrameFormat::ContentLength);
        let big = "y".repeat(MAX + 10);
        let body = r#"{"id":4,"result":"ok"}"#;
        let raw = format!(
            "Content-Length: {}\r\n\r\n{}Content-Length: {}\r\n\r\n{}",
            big.len(),
            big,
            body.len(),
            body
        );
        peer.write_all(raw.as_bytes()).await.unwrap();

        let err = next(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "unexpected error: {}", err);
        assert_eq!(next(&mut reader).await.unwrap(), json!({"id": 4, "result": "ok"}));
    }

    #[tokio::test]
    async fn test_content_length_truncated_at_eof() {
        let (mut reader, mut peer) = reader_for(FrameFormat::ContentLength);
        peer.write_all(b"Content-Length: 50\r\n\r\n{\"id\":").await.unwrap();
        drop(peer);

        assert!(matches!(next(&mut reader).await, Err(FrameError::Malformed(_))));
        assert!(matches!(next(&mut reader).await, Err(FrameError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (a, _b) = tokio::io::duplex(1024);
        let writer = FrameWriter::new(Box::new(a), FrameFormat::Lines, MAX);
        writer.close().await;

        assert!(writer.is_closed().await);
        assert!(matches!(
            writer.write(&json!({"id": 1})).await,
            Err(FrameError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let writer = Arc::new(FrameWriter::new(Box::new(a), FrameFormat::Lines, 64 * 1024));
        let mut reader = FrameReader::new(Box::new(b), FrameFormat::Lines, 64 * 1024);

        let mut handles = Vec::new();
        for task in 0..8u64 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                for seq in 0..25u64 {
                    let padding = "z".repeat(((task * 31 + seq * 7) % 500) as usize);
                    writer
                        .write(&json!({"task": task, "seq": seq, "pad": padding}))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last_seq = vec![None::<u64>; 8];
        for _ in 0..200 {
            let frame = next(&mut reader).await.unwrap();
            let task = frame["task"].as_u64().unwrap() as usize;
            let seq = frame["seq"].as_u64().unwrap();
            if let Some(prev) = last_seq[task] {
                assert!(seq > prev, "frames of one writer must stay ordered");
            }
            last_seq[task] = Some(seq);
        }
    }
}
