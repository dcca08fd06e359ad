use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// One long-lived socket to the pool's endpoint.
///
/// A connection is used by at most one caller at a time. The pool decides when
/// it is re-queued or discarded; callers hand it back through
/// [`ConnectionPool::put`](super::ConnectionPool::put) or
/// [`ConnectionPool::remove`](super::ConnectionPool::remove).
#[derive(Debug)]
pub struct Connection {
    id: u64,
    endpoint: String,
    stream: Option<TcpStream>,
    created_at: Instant,
    last_used_at: Instant,
    pooled: bool,
    broken: bool,
    // Shared with the pool so that closing the pool reaches checked-out sockets.
    closed: Arc<AtomicBool>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(id: u64, endpoint: &str, stream: TcpStream, pooled: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint: endpoint.to_string(),
            stream: Some(stream),
            created_at: now,
            last_used_at: now,
            pooled,
            broken: false,
            closed: Arc::new(AtomicBool::new(false)),
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub(crate) fn with_io_timeouts(
        mut self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether this connection may go back to the idle set after use.
    /// Overflow connections are created with `pooled == false`.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set after an I/O helper failed; the pool will not re-queue it.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.pooled && !self.broken && !self.is_closed()
    }

    /// Record a use and return the new `last_used_at`.
    pub fn touch(&mut self) -> Instant {
        self.last_used_at = Instant::now();
        self.last_used_at
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Stale means idle for at least `idle_timeout`. `None` or a zero
    /// timeout disables staleness.
    pub fn is_stale(&self, idle_timeout: Option<Duration>, now: Instant) -> bool {
        match idle_timeout {
            Some(limit) if !limit.is_zero() => self.idle_for(now) >= limit,
            _ => false,
        }
    }

    /// Shut the socket down gracefully. Safe to call more than once.
    pub async fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        match self.stream.take() {
            Some(mut stream) => {
                trace!(id = self.id, endpoint = %self.endpoint, "closing connection");
                match stream.shutdown().await {
                    // Peer already went away.
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                    other => other,
                }
            }
            None => Ok(()),
        }
    }

    // Abortive close for paths that cannot await (drop, discard under lock).
    pub(crate) fn close_now(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.stream.take();
    }

    /// Raw socket access for the protocol layer.
    pub fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        if self.is_closed() {
            self.stream.take();
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let limit = self.write_timeout;
        let result = match self.stream_mut() {
            Ok(stream) => with_deadline(limit, "write", stream.write_all(buf)).await,
            Err(e) => Err(e),
        };
        self.track(result)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        let limit = self.write_timeout;
        let result = match self.stream_mut() {
            Ok(stream) => with_deadline(limit, "flush", stream.flush()).await,
            Err(e) => Err(e),
        };
        self.track(result)
    }

    /// Read whatever is available. A zero-length read means the peer closed
    /// the socket and marks the connection broken.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.read_timeout;
        let result = match self.stream_mut() {
            Ok(stream) => with_deadline(limit, "read", stream.read(buf)).await,
            Err(e) => Err(e),
        };
        let n = self.track(result)?;
        if n == 0 && !buf.is_empty() {
            self.broken = true;
        }
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let limit = self.read_timeout;
        let result = match self.stream_mut() {
            Ok(stream) => with_deadline(limit, "read", stream.read_exact(buf))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        self.track(result)
    }

    fn track<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

async fn with_deadline<F, T>(limit: Option<Duration>, op: &str, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", op, limit),
            )),
        },
        None => fut.await,
    }
}
