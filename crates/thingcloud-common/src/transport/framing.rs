//! Newline-delimited JSON framing.
//!
//! Every frame is a single JSON value followed by `\n`. The decoder is a pure
//! buffer so it can be shared between the socket reader, the worker IPC
//! reader and the control listener (which needs to hand the leftover bytes to
//! whoever takes over the socket).

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CloudError, Result};

/// Upper bound on a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Incremental decoder turning raw bytes into JSON frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    // Prefix of `buf` known to contain no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the decoder with bytes read by a previous owner of the stream.
    pub fn with_buffer(buf: Vec<u8>) -> Self {
        Self { buf, scanned: 0 }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, if any.
    ///
    /// Malformed lines are logged and skipped. An unterminated line longer
    /// than [`MAX_FRAME_SIZE`] is an error.
    pub fn next_frame(&mut self) -> Result<Option<Value>> {
        loop {
            let found = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(pos) = found.map(|offset| self.scanned + offset) else {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_FRAME_SIZE {
                    return Err(CloudError::Protocol(format!(
                        "Frame too large: more than {} bytes without delimiter",
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(None);
            };

            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            let line = trim_line(&line[..line.len() - 1]);
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Value>(line) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed frame ({}): {}",
                        e,
                        String::from_utf8_lossy(line)
                    );
                }
            }
        }
    }

    /// Bytes received but not yet consumed as frames.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Serializes `value` into a single newline-terminated frame.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Reads frames from an async byte stream.
pub struct FramedReader<R> {
    inner: R,
    decoder: FrameDecoder,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer(inner, Vec::new())
    }

    pub fn with_buffer(inner: R, buffered: Vec<u8>) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_buffer(buffered),
            eof: false,
        }
    }

    /// Reads the next frame, or `None` once the stream is at EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Value>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(None);
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                if self.decoder.buffered_len() > 0 {
                    tracing::debug!(
                        "Discarding {} trailing bytes without delimiter",
                        self.decoder.buffered_len()
                    );
                }
                continue;
            }
            self.decoder.push(&chunk[..n]);
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Gives back the underlying stream and any unconsumed bytes.
    pub fn into_parts(mut self) -> (R, Vec<u8>) {
        let buffered = self.decoder.take_buffer();
        (self.inner, buffered)
    }
}

/// Writes frames to an async byte stream.
pub struct FramedWriter<W> {
    inner: W,
    ended: bool,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, ended: false }
    }

    /// Writes one frame. A no-op after [`end`](Self::end).
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        let bytes = encode_frame(value)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write side.
    pub async fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decoder_splits_on_newline() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"a\":1}\n{\"b\":");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"a": 1})));
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(b"2}\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"b": 2})));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_decoder_drops_malformed_lines() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"not json\n\n[1,2]\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!([1, 2])));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_decoder_keeps_leftover() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"control\":\"direct\"}\n{\"rpc\"");
        assert!(decoder.next_frame().unwrap().is_some());
        assert_eq!(decoder.take_buffer(), b"{\"rpc\"".to_vec());
    }

    #[test]
    fn test_encode_frame_appends_delimiter() {
        let bytes = encode_frame(&json!({"x": "y"})).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedWriter::new(a);
        let mut reader = FramedReader::new(b);

        let payload = json!({"text": "line\nbreak", "n": [1, 2.5, null]});
        writer.write_frame(&payload).await.unwrap();
        writer.write_frame(&json!("second")).await.unwrap();
        writer.end().await.unwrap();
        // Ignored once ended.
        writer.write_frame(&json!("third")).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap(), Some(payload));
        assert_eq!(reader.read_frame().await.unwrap(), Some(json!("second")));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[test]
    fn test_decoder_resumes_scan_after_partial_push() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"k\":\"");
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(b"abc");
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(b"\"}\n{\"k\":2}\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"k": "abc"})));
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"k": 2})));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_decodes_large_frame_quickly() {
        let text = "x".repeat(12 * 1024 * 1024);
        let payload = json!({ "text": text });
        let bytes = encode_frame(&payload).unwrap();

        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            a.write_all(&bytes).await.unwrap();
            a.shutdown().await.unwrap();
        });

        let started = std::time::Instant::now();
        let mut reader = FramedReader::new(b);
        let frame = reader.read_frame().await.unwrap().unwrap();
        let elapsed = started.elapsed();
        writer.await.unwrap();

        assert_eq!(frame["text"].as_str().map(str::len), Some(12 * 1024 * 1024));
        assert!(elapsed < std::time::Duration::from_secs(5), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_reader_with_seeded_buffer() {
        let (_a, b) = tokio::io::duplex(4096);
        let mut reader = FramedReader::with_buffer(b, b"{\"seed\":true}\n".to_vec());
        assert_eq!(reader.read_frame().await.unwrap(), Some(json!({"seed": true})));
    }
}
