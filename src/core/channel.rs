//! Duplex byte channel handed out by an opened connector
//!
//! A channel wraps the raw read/write halves of a transport. Reads are
//! bounded by a timeout, and `close()` from another task interrupts any
//! in-flight read or write instead of letting it hang.

use super::arbitration::HeldLease;
use super::error::ConnectorError;
use super::transport::TransportKind;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::io::Cursor;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Largest buffer a single read allocates
pub const READ_CHUNK: usize = 64 * 1024;

/// Boxed read half
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Raw I/O halves of a negotiated transport
pub struct ChannelIo {
    /// Console output
    pub reader: BoxReader,
    /// Console input
    pub writer: BoxWriter,
}

impl ChannelIo {
    /// Build from separate halves (e.g. a subprocess pipe pair)
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a duplex stream (socket, serial port)
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Deliver `prefix` before anything else the reader produces.
    ///
    /// Handshakes read ahead; whatever they consumed past their marker goes
    /// back in front of the stream here.
    #[must_use]
    pub fn with_prefix(self, prefix: Vec<u8>) -> Self {
        if prefix.is_empty() {
            return self;
        }
        Self {
            reader: Box::new(Cursor::new(prefix).chain(self.reader)),
            writer: self.writer,
        }
    }
}

impl std::fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIo").finish_non_exhaustive()
    }
}

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Reads that returned data
    pub reads: u64,
    /// Reads that expired without data
    pub read_timeouts: u64,
    /// Write calls
    pub writes: u64,
    /// Time since the channel was opened
    pub uptime: Duration,
}

const ALIVE: u8 = 0;
const CLOSED: u8 = 1;
const LOST: u8 = 2;

type LossHook = Box<dyn Fn(&str) + Send + Sync>;

struct Shared {
    transport: TransportKind,
    resource: String,
    reader: tokio::sync::Mutex<Option<BoxReader>>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    cancel: CancellationToken,
    liveness: AtomicU8,
    reason: Mutex<Option<String>>,
    lease: Mutex<Option<HeldLease>>,
    on_lost: Mutex<Option<LossHook>>,
    stats: RwLock<ChannelStats>,
    opened_at: Instant,
}

/// Console byte channel
///
/// Clones refer to the same channel. The owning caller does the I/O; a
/// clone may be handed to a watchdog task so it can call [`Channel::close`]
/// while a read is pending.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Wrap negotiated I/O. `lease` is checked before every operation.
    pub fn new(
        transport: TransportKind,
        resource: impl Into<String>,
        io: ChannelIo,
        lease: Option<HeldLease>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                resource: resource.into(),
                reader: tokio::sync::Mutex::new(Some(io.reader)),
                writer: tokio::sync::Mutex::new(Some(io.writer)),
                cancel: CancellationToken::new(),
                liveness: AtomicU8::new(ALIVE),
                reason: Mutex::new(None),
                lease: Mutex::new(lease),
                on_lost: Mutex::new(None),
                stats: RwLock::new(ChannelStats::default()),
                opened_at: Instant::now(),
            }),
        }
    }

    /// Transport variant
    pub fn transport(&self) -> TransportKind {
        self.shared.transport
    }

    /// Resource identifier
    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    /// Non-blocking liveness check
    pub fn is_alive(&self) -> bool {
        self.shared.liveness.load(Ordering::Acquire) == ALIVE && self.lease_valid()
    }

    /// Why the channel stopped, once it has
    pub fn close_reason(&self) -> Option<String> {
        self.shared.reason.lock().clone()
    }

    /// Get statistics
    pub fn stats(&self) -> ChannelStats {
        let mut stats = self.shared.stats.read().clone();
        stats.uptime = self.shared.opened_at.elapsed();
        stats
    }

    /// Read up to `max_bytes`.
    ///
    /// Returns an empty buffer when `timeout` expires without data. At most
    /// [`READ_CHUNK`] bytes come back per call, whatever `max_bytes` is.
    pub async fn read(&self, max_bytes: usize, timeout: Duration) -> Result<Bytes, ConnectorError> {
        self.ensure_usable()?;
        if max_bytes == 0 {
            return Ok(Bytes::new());
        }

        let shared = &self.shared;
        let io = async {
            let mut guard = shared.reader.lock().await;
            let Some(reader) = guard.as_mut() else {
                return None;
            };
            let mut buf = vec![0u8; max_bytes.min(READ_CHUNK)];
            let result = reader.read(&mut buf).await;
            Some(result.map(|n| {
                buf.truncate(n);
                buf
            }))
        };

        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => Err(self.closed_error()),
            outcome = tokio::time::timeout(timeout, io) => match outcome {
                Err(_elapsed) => {
                    shared.stats.write().read_timeouts += 1;
                    Ok(Bytes::new())
                }
                Ok(None) => Err(self.closed_error()),
                Ok(Some(Ok(buf))) if buf.is_empty() => {
                    Err(self.mark_lost("remote end closed the stream"))
                }
                Ok(Some(Ok(buf))) => {
                    {
                        let mut stats = shared.stats.write();
                        stats.bytes_read += buf.len() as u64;
                        stats.reads += 1;
                    }
                    Ok(Bytes::from(buf))
                }
                Ok(Some(Err(e))) => Err(self.mark_faulted(e)),
            },
        }
    }

    /// Write some prefix of `data`, returning how much was accepted.
    pub async fn write(&self, data: &[u8]) -> Result<usize, ConnectorError> {
        self.ensure_usable()?;
        if data.is_empty() {
            return Ok(0);
        }

        let shared = &self.shared;
        let io = async {
            let mut guard = shared.writer.lock().await;
            let writer = guard.as_mut()?;
            let result = match writer.write(data).await {
                Ok(n) => writer.flush().await.map(|()| n),
                Err(e) => Err(e),
            };
            Some(result)
        };

        tokio::select! {
            biased;
            () = shared.cancel.cancelled() => Err(self.closed_error()),
            outcome = io => match outcome {
                None => Err(self.closed_error()),
                Some(Ok(0)) => Err(self.mark_lost("transport accepts no more data")),
                Some(Ok(n)) => {
                    let mut stats = shared.stats.write();
                    stats.bytes_written += n as u64;
                    stats.writes += 1;
                    Ok(n)
                }
                Some(Err(e)) => Err(self.mark_faulted(e)),
            },
        }
    }

    /// Write all of `data`, retrying partial writes
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), ConnectorError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Accumulate output until `marker` appears or `timeout` passes.
    ///
    /// Everything read is returned, including bytes past the marker. On
    /// timeout the partial output is returned; check it with
    /// [`find_subsequence`].
    pub async fn read_until(&self, marker: &[u8], timeout: Duration) -> Result<Vec<u8>, ConnectorError> {
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(seen);
            }
            let chunk = self.read(4096, remaining).await?;
            seen.extend_from_slice(&chunk);
            if find_subsequence(&seen, marker).is_some() {
                return Ok(seen);
            }
        }
    }

    /// Close the channel.
    ///
    /// Idempotent and non-blocking. Pending reads and writes on other tasks
    /// return `ChannelClosed`; the lease (if any) is released and the
    /// transport halves are dropped once no operation holds them.
    pub fn close(&self) {
        self.interrupt("closed locally");
        self.release_lease();

        // in-flight operations drop their guards right after the cancel;
        // whatever is still locked goes away with the last clone
        if let Ok(mut reader) = self.shared.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
    }

    /// Stop all I/O without dropping the transport halves, so a driver can
    /// still run its graceful teardown on them.
    pub(crate) fn interrupt(&self, reason: &str) {
        if self
            .shared
            .liveness
            .compare_exchange(ALIVE, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.shared.reason.lock() = Some(reason.to_string());
            tracing::debug!(transport = %self.shared.transport, resource = %self.shared.resource, reason, "channel closed");
        }
        self.shared.cancel.cancel();
    }

    /// Take the transport halves for teardown. Call after [`Self::interrupt`].
    pub(crate) async fn take_io(&self) -> Option<ChannelIo> {
        let reader = self.shared.reader.lock().await.take();
        let writer = self.shared.writer.lock().await.take();
        match (reader, writer) {
            (Some(reader), Some(writer)) => Some(ChannelIo { reader, writer }),
            _ => None,
        }
    }

    /// Install the callback run once when the transport is lost (EOF, I/O
    /// error, preempted lease). Not run for a local `close()`.
    pub(crate) fn set_loss_hook(&self, hook: LossHook) {
        *self.shared.on_lost.lock() = Some(hook);
    }

    pub(crate) fn release_lease(&self) {
        if let Some(lease) = self.shared.lease.lock().take() {
            lease.release();
        }
    }

    fn lease_valid(&self) -> bool {
        self.shared
            .lease
            .lock()
            .as_ref()
            .map_or(true, HeldLease::is_valid)
    }

    fn ensure_usable(&self) -> Result<(), ConnectorError> {
        if self.shared.liveness.load(Ordering::Acquire) != ALIVE {
            return Err(self.closed_error());
        }
        if !self.lease_valid() {
            return Err(self.mark_lost("line taken over by another holder"));
        }
        Ok(())
    }

    fn closed_error(&self) -> ConnectorError {
        ConnectorError::ChannelClosed {
            transport: self.shared.transport,
            resource: self.shared.resource.clone(),
            reason: self
                .close_reason()
                .unwrap_or_else(|| "closed locally".to_string()),
        }
    }

    fn mark_lost(&self, reason: &str) -> ConnectorError {
        self.lose(reason);
        self.closed_error()
    }

    fn mark_faulted(&self, source: std::io::Error) -> ConnectorError {
        self.lose(&source.to_string());
        ConnectorError::io(self.shared.transport, self.shared.resource.clone(), source)
    }

    fn lose(&self, reason: &str) {
        if self
            .shared
            .liveness
            .compare_exchange(ALIVE, LOST, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *self.shared.reason.lock() = Some(reason.to_string());
        self.shared.cancel.cancel();
        tracing::warn!(transport = %self.shared.transport, resource = %self.shared.resource, reason, "channel lost");

        let hook = self.shared.on_lost.lock().take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("transport", &self.shared.transport)
            .field("resource", &self.shared.resource)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Position of the first occurrence of `needle` in `haystack`
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
