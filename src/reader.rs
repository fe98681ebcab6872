//! Output-draining workers for a supervised child.
//!
//! One task per stream, reading until end-of-stream. Readers are never
//! cancelled: once the child's process group is gone its pipes close and the
//! read returns EOF. The supervisor only needs a bounded join.
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};

/// Which of the child's output streams a reader drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reader drained before reaching end-of-stream.
#[derive(Debug, Default)]
pub struct Drained {
    /// Bytes read from the stream.
    pub bytes: u64,
    /// The bytes themselves, for readers that capture (empty when forwarding).
    pub captured: Vec<u8>,
}

/// Result of a bounded join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Joined,
    TimedOut,
}

type Joined = Result<io::Result<Drained>, JoinError>;

/// A task draining one stream of the child.
///
/// The result of a successful join is kept, so the owner can still `finish`
/// the reader after the supervisor has joined it.
pub struct ReaderTask {
    stream: Stream,
    handle: Option<JoinHandle<io::Result<Drained>>>,
    result: Option<io::Result<Drained>>,
}

impl ReaderTask {
    /// Copy `reader` into `sink` until end-of-stream.
    pub fn forward<R, W>(stream: Stream, mut reader: R, mut sink: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let bytes = tokio::io::copy(&mut reader, &mut sink).await?;
            sink.flush().await?;
            tracing::debug!(%stream, bytes, "reader reached end of stream");
            Ok(Drained {
                bytes,
                captured: Vec::new(),
            })
        });
        Self::from_handle(stream, handle)
    }

    /// Collect `reader` into memory until end-of-stream.
    pub fn capture<R>(stream: Stream, mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut captured = Vec::new();
            let bytes = reader.read_to_end(&mut captured).await? as u64;
            tracing::debug!(%stream, bytes, "reader reached end of stream");
            Ok(Drained { bytes, captured })
        });
        Self::from_handle(stream, handle)
    }

    fn from_handle(stream: Stream, handle: JoinHandle<io::Result<Drained>>) -> Self {
        Self {
            stream,
            handle: Some(handle),
            result: None,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// True once the task has stopped, whether or not it was joined yet.
    pub fn is_finished(&self) -> bool {
        self.result.is_some() || self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    /// Wait up to `limit` for the reader to finish. A timed-out reader keeps
    /// running and can be joined again later.
    pub async fn join_timeout(&mut self, limit: Duration) -> JoinStatus {
        let Some(handle) = self.handle.as_mut() else {
            return JoinStatus::Joined;
        };

        match tokio::time::timeout(limit, handle).await {
            Ok(joined) => {
                self.handle = None;
                self.result = Some(flatten(joined));
                JoinStatus::Joined
            }
            Err(_) => JoinStatus::TimedOut,
        }
    }

    /// Wait for the reader to finish and hand back what it drained.
    pub async fn finish(mut self) -> io::Result<Drained> {
        if let Some(result) = self.result.take() {
            return result;
        }
        match self.handle.take() {
            Some(handle) => flatten(handle.await),
            None => Err(io::Error::other("reader result already taken")),
        }
    }
}

fn flatten(joined: Joined) -> io::Result<Drained> {
    joined.map_err(io::Error::other)?
}
