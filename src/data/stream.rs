use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};
use crate::config::{EnvConfig, StreamConfig};
use crate::data::types::RawTip;

const DATA_PREFIX: &str = "data: ";

/// Longest line the reader buffers before giving up on it.
pub const MAX_LINE_BYTES: usize = 1 << 20;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, StreamError>>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("Upstream closed the stream")]
    Ended,

    #[error("Malformed frame: {0}")]
    Framing(#[source] serde_json::Error),

    #[error("Malformed tip: {0}")]
    MalformedTip(#[source] serde_json::Error),

    #[error("Line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),
}

impl StreamError {
    /// Connection-level errors end the session; the rest only cost one frame
    /// or one tip.
    pub fn is_connection_level(&self) -> bool {
        !matches!(
            self,
            StreamError::Framing(_)
                | StreamError::MalformedTip(_)
                | StreamError::InvalidUtf8(_)
                | StreamError::LineTooLong(_)
        )
    }
}

/// Decodes an SSE body into tips, one `data:` frame at a time.
pub struct TipReader {
    body: ByteStream,
    buf: Vec<u8>,
    // Bytes of `buf` already known to hold no newline.
    scanned: usize,
    // Dropping the rest of an oversized line.
    discarding: bool,
    pending: VecDeque<Result<RawTip, StreamError>>,
    idle_timeout: Option<Duration>,
    frames: u64,
}

impl TipReader {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            buf: Vec::new(),
            scanned: 0,
            discarding: false,
            pending: VecDeque::new(),
            idle_timeout: None,
            frames: 0,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Number of `data:` frames seen on this connection.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let next = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.body.next())
                .await
                .map_err(|_| StreamError::IdleTimeout(limit))?,
            None => self.body.next().await,
        };
        next.transpose()
    }

    /// Next line without its terminator. A trailing partial line is returned
    /// once the body ends; after that the reader reports `Ended`.
    ///
    /// A line longer than [`MAX_LINE_BYTES`] is reported once as
    /// `LineTooLong` and its remaining bytes are dropped up to the next newline.
    async fn next_line(&mut self) -> Result<String, StreamError> {
        loop {
            if let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let end = self.scanned + offset;
                let raw: Vec<u8> = self.buf.drain(..=end).collect();
                self.scanned = 0;
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                return decode_line(raw);
            }
            self.scanned = self.buf.len();

            if self.buf.len() > MAX_LINE_BYTES {
                self.buf.clear();
                self.scanned = 0;
                if !self.discarding {
                    self.discarding = true;
                    return Err(StreamError::LineTooLong(MAX_LINE_BYTES));
                }
            }

            match self.next_chunk().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None if !self.buf.is_empty() && !self.discarding => {
                    let raw = std::mem::take(&mut self.buf);
                    self.scanned = 0;
                    return decode_line(raw);
                }
                None => return Err(StreamError::Ended),
            }
        }
    }

    /// Next tip in stream order.
    ///
    /// Errors for which [`StreamError::is_connection_level`] is false leave
    /// the reader usable; any other error means the connection is gone.
    pub async fn next_tip(&mut self) -> Result<RawTip, StreamError> {
        loop {
            if let Some(tip) = self.pending.pop_front() {
                return tip;
            }

            let line = self.next_line().await?;
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };

            self.frames += 1;
            let tips = parse_frame(payload)?;
            debug!("Frame {} carried {} tips", self.frames, tips.len());
            self.pending.extend(tips);
        }
    }
}

fn decode_line(raw: Vec<u8>) -> Result<String, StreamError> {
    let mut line = String::from_utf8(raw)?;
    while line.ends_with(['\n', '\r']) {
        line.pop();
    }
    Ok(line)
}

/// Parse the payload of one `data:` line. The array itself must be valid;
/// each element is decoded on its own so one bad tip does not sink the rest.
pub fn parse_frame(payload: &str) -> Result<Vec<Result<RawTip, StreamError>>, StreamError> {
    let items: Vec<serde_json::Value> =
        serde_json::from_str(payload).map_err(StreamError::Framing)?;

    Ok(items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(StreamError::MalformedTip))
        .collect())
}

/// Something that can open a fresh tip stream.
#[async_trait]
pub trait TipSource: Send + Sync {
    async fn open(&self) -> Result<TipReader, StreamError>;
}

pub struct HttpTipSource {
    client: Client,
    url: String,
    idle_timeout: Duration,
}

impl HttpTipSource {
    pub fn new(env: &EnvConfig, config: &StreamConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&env.api_key).context("API key is not a valid header value")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .build()
            .context("Failed to build stream client")?;

        Ok(Self {
            client,
            url: stream_url(&env.base_url, &config.path),
            idle_timeout: config.idle_timeout(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn stream_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[async_trait]
impl TipSource for HttpTipSource {
    async fn open(&self) -> Result<TipReader, StreamError> {
        info!("Opening tip stream: {}", self.url);

        // connect_timeout only covers the handshake; a peer that accepts and
        // never answers must still end the session.
        let response = tokio::time::timeout(self.idle_timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| StreamError::IdleTimeout(self.idle_timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        let body = response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(StreamError::from)
            .boxed();

        Ok(TipReader::new(body).with_idle_timeout(self.idle_timeout))
    }
}
