//! Streaming transport for the realtime subscription.
//!
//! Frames arrive as `data: <json>` blocks separated by blank lines; lines
//! starting with `:` are keep-alive comments.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{ACCEPT, HeaderValue};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

const ORGANIZATION_QUERY_PARAM: &str = "organizationId";
const EVENT_STREAM: &str = "text/event-stream";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on bytes buffered while waiting for a frame terminator.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Errors specific to the subscription transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connect(String),
    #[error("HTTP error {status}")]
    Status { status: u16 },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("stream closed by server")]
    Closed,
    #[error("frame exceeds {limit} bytes without a terminator")]
    FrameTooLarge { limit: usize },
}

impl TransportError {
    pub fn connect<E: std::fmt::Display>(err: E) -> Self {
        Self::Connect(err.to_string())
    }

    pub fn stream<E: std::fmt::Display>(err: E) -> Self {
        Self::Stream(err.to_string())
    }
}

/// One decoded SSE block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Comment(String),
}

/// Incremental decoder for an SSE byte stream.
///
/// At most `max_frame_bytes` are held for a frame that has not been
/// terminated yet.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    // Offset from which the next terminator search starts.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Feed a chunk and return the frames it completed.
    ///
    /// Fails once the unterminated remainder grows past the limit; the
    /// buffered bytes are discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, TransportError> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.find_blank_line() {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_frame_bytes {
            self.buffer.clear();
            self.scanned = 0;
            return Err(TransportError::FrameTooLarge {
                limit: self.max_frame_bytes,
            });
        }
        Ok(frames)
    }

    fn find_blank_line(&mut self) -> Option<usize> {
        let found = self.buffer[self.scanned..]
            .windows(2)
            .position(|pair| pair == b"\n\n")
            .map(|offset| self.scanned + offset);
        if found.is_none() {
            // Keep the last byte: it may be the first half of a terminator.
            self.scanned = self.buffer.len().saturating_sub(1);
        }
        found
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut data: Option<String> = None;
    let mut comment = None;

    for line in block.lines() {
        if let Some(text) = line.strip_prefix(':') {
            comment = Some(text.trim_start().to_string());
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "data" => match &mut data {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            other => trace!(field = other, "Ignoring SSE field"),
        }
    }

    data.map(SseFrame::Data).or(comment.map(SseFrame::Comment))
}

/// Stream of decoded frames for one open connection.
pub type FrameStream = BoxStream<'static, Result<SseFrame, TransportError>>;

/// Opens the realtime stream for an organization scope.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self, organization_id: Option<i64>) -> Result<FrameStream, TransportError>;
}

/// HTTP transport reading the server's event stream with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// `endpoint` is the full URL of the streaming route.
    pub fn new(endpoint: Url) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(TransportError::connect)?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint_for(&self, organization_id: Option<i64>) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(organization_id) = organization_id {
            url.query_pairs_mut()
                .append_pair(ORGANIZATION_QUERY_PARAM, &organization_id.to_string());
        }
        url
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(&self, organization_id: Option<i64>) -> Result<FrameStream, TransportError> {
        let url = self.endpoint_for(organization_id);
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, HeaderValue::from_static(EVENT_STREAM))
            .send()
            .await
            .map_err(TransportError::connect)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        debug!(url = %url, "Opened event stream");

        let mut chunks = response.bytes_stream();
        let frames = stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => match decoder.push(&bytes) {
                        Ok(decoded) => {
                            for frame in decoded {
                                yield Ok(frame);
                            }
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    },
                    Err(err) => {
                        yield Err(TransportError::stream(err));
                        return;
                    }
                }
            }
        };
        Ok(frames.boxed())
    }
}
