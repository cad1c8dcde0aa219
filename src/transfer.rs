// Streams one file, or one byte range of it, into a response body.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use warp::http::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use warp::http::{HeaderMap, StatusCode};

use crate::errors::{MirrorError, MirrorErrorType, Result};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Chunks in flight between the reader task and the socket.
const BODY_QUEUE: usize = 2;

/// A single range from a `Range: bytes=...` header, before it is checked
/// against the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=-N`: the last N bytes.
    Suffix(u64),
    /// `bytes=S-`: from S to the end.
    From(u64),
    /// `bytes=S-E`: S to E inclusive.
    Inclusive(u64, u64),
}

fn invalid_range(message: String) -> MirrorError {
    MirrorError::new(MirrorErrorType::InvalidRange, message)
}

fn parse_position(value: &str, header: &str) -> Result<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid_range(format!("Malformed range header {}", header)));
    }
    value
        .parse::<u64>()
        .map_err(|_| invalid_range(format!("Range position out of bounds in {}", header)))
}

impl ByteRange {
    /// Parse a `Range` header value. Only the first range of a multi-range
    /// request is kept.
    pub fn parse(header: &str) -> Result<ByteRange> {
        let (unit, ranges) = header
            .trim()
            .split_once('=')
            .ok_or_else(|| invalid_range(format!("Malformed range header {}", header)))?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(invalid_range(format!("Unsupported range unit {}", unit)));
        }
        let first = ranges.split(',').next().unwrap_or_default().trim();
        let (start, end) = first
            .split_once('-')
            .ok_or_else(|| invalid_range(format!("Malformed range header {}", header)))?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(invalid_range(format!("Empty range in {}", header))),
            (true, false) => Ok(ByteRange::Suffix(parse_position(end, header)?)),
            (false, true) => Ok(ByteRange::From(parse_position(start, header)?)),
            (false, false) => Ok(ByteRange::Inclusive(
                parse_position(start, header)?,
                parse_position(end, header)?,
            )),
        }
    }
}

/// What will actually be sent: `length` bytes starting at `start` of a file of
/// `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub length: u64,
    pub size: u64,
}

impl ResolvedRange {
    pub fn resolve(range: Option<ByteRange>, size: u64) -> Result<ResolvedRange> {
        let (start, length) = match range {
            None => (0, size),
            Some(ByteRange::Suffix(n)) => {
                if n == 0 {
                    return Err(invalid_range("Zero length suffix range".to_string()));
                }
                let length = n.min(size);
                (size - length, length)
            }
            Some(ByteRange::From(start)) => {
                if start >= size {
                    return Err(invalid_range(format!(
                        "Range start {} is beyond the end of a {} byte file",
                        start, size
                    )));
                }
                (start, size - start)
            }
            Some(ByteRange::Inclusive(start, end)) => {
                if size == 0 {
                    return Err(invalid_range("Range requested on an empty file".to_string()));
                }
                let end = end.min(size - 1);
                if start > end {
                    return Err(invalid_range(format!(
                        "Range {}-{} is not satisfiable for a {} byte file",
                        start, end, size
                    )));
                }
                (start, end - start + 1)
            }
        };
        Ok(ResolvedRange {
            start,
            length,
            size,
        })
    }

    pub fn is_partial(&self) -> bool {
        self.length != self.size
    }

    pub fn status(&self) -> StatusCode {
        if self.is_partial() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    /// Last byte included, inclusive. Only meaningful when `length > 0`.
    pub fn end(&self) -> u64 {
        (self.start + self.length).saturating_sub(1)
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end(), self.size)
    }

    pub fn headers(&self, content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(self.length));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if self.is_partial() {
            if let Ok(value) = HeaderValue::from_str(&self.content_range()) {
                headers.insert(CONTENT_RANGE, value);
            }
        }
        headers
    }
}

/// `Content-Range` value sent along with a 416.
pub fn unsatisfiable_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(u64),
    Cancelled(u64),
}

/// An open file positioned at the start of the resolved range.
///
/// The handle is opened by `open` and closed when the transfer is dropped,
/// which also happens on every early return from `send`.
pub struct RangeFileTransfer {
    file: File,
    path: PathBuf,
    range: ResolvedRange,
    buffer_size: usize,
}

impl RangeFileTransfer {
    pub async fn open(
        path: &Path,
        size: u64,
        range: Option<ByteRange>,
        buffer_size: usize,
    ) -> Result<RangeFileTransfer> {
        let range = ResolvedRange::resolve(range, size)?;
        let mut file = File::open(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                MirrorError::not_found(format!("{} is no longer on disk", path.display()))
            }
            _ => MirrorError::from(e),
        })?;
        if range.start > 0 {
            file.seek(SeekFrom::Start(range.start)).await?;
        }
        Ok(RangeFileTransfer {
            file,
            path: path.to_path_buf(),
            range,
            buffer_size: buffer_size.max(1),
        })
    }

    pub fn range(&self) -> &ResolvedRange {
        &self.range
    }

    /// Copy the range into `sink` chunk by chunk, checking `cancel` between chunks.
    ///
    /// Running out of file before the range is exhausted is an error; it is also
    /// pushed into the sink so the connection is torn down instead of ending
    /// with a body that is too short.
    pub async fn send(
        mut self,
        sink: mpsc::Sender<std::io::Result<Bytes>>,
        cancel: CancellationToken,
    ) -> Result<TransferOutcome> {
        let mut remaining = self.range.length;
        let mut sent = 0u64;

        while remaining > 0 {
            if cancel.is_cancelled() {
                return Ok(TransferOutcome::Cancelled(sent));
            }
            let chunk_len = remaining.min(self.buffer_size as u64) as usize;
            let mut chunk = vec![0u8; chunk_len];
            if let Err(e) = self.read_chunk(&mut chunk).await {
                let message = format!(
                    "Transfer of {} failed after {} of {} bytes: {}",
                    self.path.display(),
                    sent,
                    self.range.length,
                    e
                );
                let _ = sink.send(Err(std::io::Error::new(e.kind(), message.clone()))).await;
                return Err(MirrorError::new(MirrorErrorType::IOError, message));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(TransferOutcome::Cancelled(sent)),
                delivered = sink.send(Ok(Bytes::from(chunk))) => {
                    if delivered.is_err() {
                        // The body was dropped: the client went away.
                        return Ok(TransferOutcome::Cancelled(sent));
                    }
                }
            }
            sent += chunk_len as u64;
            remaining -= chunk_len as u64;
        }
        Ok(TransferOutcome::Completed(sent))
    }

    async fn read_chunk(&mut self, chunk: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < chunk.len() {
            let read = self.file.read(&mut chunk[filled..]).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file is shorter than its snapshot size",
                ));
            }
            filled += read;
        }
        Ok(())
    }

    /// Run the transfer on its own task and hand back the body stream.
    pub fn into_stream(self, cancel: CancellationToken) -> ReceiverStream<std::io::Result<Bytes>> {
        let (tx, rx) = mpsc::channel(BODY_QUEUE);
        let path = self.path.clone();
        tokio::spawn(async move {
            match self.send(tx, cancel).await {
                Ok(TransferOutcome::Completed(bytes)) => {
                    tracing::debug!("Sent {} bytes of {}", bytes, path.display())
                }
                Ok(TransferOutcome::Cancelled(bytes)) => tracing::info!(
                    "Transfer of {} stopped after {} bytes",
                    path.display(),
                    bytes
                ),
                Err(e) => tracing::error!("{}", e),
            }
        });
        ReceiverStream::new(rx)
    }
}
