//! Byte streams moving between backends.
//!
//! A source backend hands out a [`Link`] (a readable body plus its size).
//! The transfer layer turns it into a [`FileStream`] and the destination
//! backend drains that stream in [`FileStream::copy_to`], which reports
//! progress and checks cancellation at every buffer boundary.

use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::error::{VfsError, VfsResult};
use super::types::ObjectInfo;

/// Copy buffer size; cancellation is checked once per buffer.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Upper bound on the up-front allocation of `read_all`; sizes come from
/// backends and are not trusted.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Progress callback, called with a percentage in `0.0..=100.0`.
pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Readable and seekable source.
pub trait SeekRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekRead for T {}

/// Stream body: either rewindable or forward-only.
pub enum Body {
    /// Can be rewound (local files, in-memory buffers, spilled temp files).
    Seekable(Box<dyn SeekRead>),
    /// Forward-only (network bodies).
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl Body {
    /// In-memory body.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Body::Seekable(Box::new(std::io::Cursor::new(data.into())))
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Body::Seekable(_))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Seekable(_) => f.write_str("Body::Seekable"),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Body::Seekable(r) => Pin::new(r).poll_read(cx, buf),
            Body::Stream(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Streamable reference to an object, as returned by a driver's `link`.
#[derive(Debug)]
pub struct Link {
    pub body: Body,
    /// Content length, when the backend knows it.
    pub size: Option<u64>,
}

impl Link {
    pub fn new(body: Body, size: Option<u64>) -> Self {
        Self { body, size }
    }
}

/// An object in flight: name, size and body, plus the cancellation handle of
/// the task moving it.
#[derive(Debug)]
pub struct FileStream {
    name: String,
    size: u64,
    modified: SystemTime,
    body: Body,
    cancel: CancellationToken,
}

impl FileStream {
    /// Create a stream with a fresh (never cancelled) token.
    pub fn new(name: impl Into<String>, size: u64, body: Body) -> Self {
        Self {
            name: name.into(),
            size,
            modified: SystemTime::now(),
            body,
            cancel: CancellationToken::new(),
        }
    }

    /// In-memory stream.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(name, size, Body::from_bytes(data))
    }

    /// Build a stream for `obj` from a driver link.
    pub fn from_link(obj: &ObjectInfo, link: Link) -> Self {
        Self {
            name: obj.name.clone(),
            size: link.size.unwrap_or(obj.size),
            modified: obj.modified,
            body: link.body,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this stream to a task's cancellation handle.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_cancel(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn is_seekable(&self) -> bool {
        self.body.is_seekable()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spill a forward-only body into an anonymous temp file so it can be
    /// rewound. Seekable bodies are left alone.
    pub async fn cache_in_temp_file(&mut self) -> VfsResult<()> {
        if self.body.is_seekable() {
            return Ok(());
        }
        let file = tempfile::tempfile()?;
        let mut file = tokio::fs::File::from_std(file);
        let written = tokio::io::copy(&mut self.body, &mut file).await?;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        tracing::debug!(name = %self.name, bytes = written, "spilled stream to temp file");
        self.size = written;
        self.body = Body::Seekable(Box::new(file));
        Ok(())
    }

    /// Rewind to the start. Fails for forward-only bodies.
    pub async fn rewind(&mut self) -> VfsResult<()> {
        match &mut self.body {
            Body::Seekable(r) => {
                r.seek(SeekFrom::Start(0)).await?;
                Ok(())
            }
            Body::Stream(_) => Err(VfsError::not_supported("rewind of a forward-only stream")),
        }
    }

    /// Drain the stream into `writer`, reporting progress after each buffer.
    ///
    /// Returns the number of bytes written.
    pub async fn copy_to<W>(&mut self, writer: &mut W, progress: &ProgressFn<'_>) -> VfsResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut total = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(VfsError::Canceled);
            }
            let n = self.body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
            if self.size > 0 {
                progress((total as f64 / self.size as f64 * 100.0).min(100.0));
            }
        }
        writer.flush().await?;
        progress(100.0);
        Ok(total)
    }

    /// Read the whole stream into memory.
    pub async fn read_all(&mut self, progress: &ProgressFn<'_>) -> VfsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size.min(MAX_PREALLOC) as usize);
        self.copy_to(&mut out, progress).await?;
        Ok(out)
    }
}

/// Progress sink that discards updates.
pub fn no_progress(_: f64) {}
