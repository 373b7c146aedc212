//! Fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use labconsole_core::core::channel::ChannelIo;
use labconsole_core::core::transport::{AttachOutcome, AttachRequest, LineSettings};
use labconsole_core::{ConnectorError, MuxService, SerialOpener, TransportKind};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{duplex, AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

/// In-memory multiplexer service for one console.
///
/// A forced attach drops the displaced holder's stream, the way a real
/// service disconnects the previous client.
#[derive(Default)]
pub struct FakeMux {
    state: Mutex<FakeMuxState>,
}

#[derive(Default)]
struct FakeMuxState {
    holder: Option<String>,
    console: Option<DuplexStream>,
    requests: Vec<AttachRequest>,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend `holder` attached from elsewhere
    pub fn hold(&self, holder: &str) {
        self.state.lock().holder = Some(holder.to_string());
    }

    /// Forget the current holder
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.holder = None;
        state.console = None;
    }

    pub fn holder(&self) -> Option<String> {
        self.state.lock().holder.clone()
    }

    pub fn requests(&self) -> Vec<AttachRequest> {
        self.state.lock().requests.clone()
    }

    /// Board side of the current attachment
    pub fn take_console(&self) -> Option<DuplexStream> {
        self.state.lock().console.take()
    }
}

#[async_trait]
impl MuxService for FakeMux {
    async fn attach(&self, request: &AttachRequest) -> Result<AttachOutcome, ConnectorError> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if let Some(holder) = &state.holder {
            if !request.force && holder != &request.holder {
                return Ok(AttachOutcome::Busy {
                    holder: holder.clone(),
                });
            }
        }

        let preempted = state
            .holder
            .replace(request.holder.clone())
            .filter(|previous| previous != &request.holder);
        let (near, far) = duplex(4096);
        state.console = Some(far);

        Ok(AttachOutcome::Attached {
            io: ChannelIo::from_stream(near),
            preempted,
        })
    }
}

/// Multiplexer service that never hands a line over
pub enum DeadMux {
    /// Every attach fails with an I/O error
    Refusing,
    /// Every attach hangs without a reply
    Silent,
}

#[async_trait]
impl MuxService for DeadMux {
    async fn attach(&self, request: &AttachRequest) -> Result<AttachOutcome, ConnectorError> {
        match self {
            Self::Refusing => Err(ConnectorError::io_msg(
                TransportKind::Multiplexer,
                format!("{}/{}", request.host, request.device),
                "connection refused",
            )),
            Self::Silent => std::future::pending().await,
        }
    }
}

/// What happened to a journaled serial port, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Journal {
    Configured(LineSettings),
    Read(Vec<u8>),
    Wrote(Vec<u8>),
}

/// Serial opener backed by an in-memory pipe that records every step
#[derive(Default)]
pub struct JournalOpener {
    journal: Arc<Mutex<Vec<Journal>>>,
    board: Mutex<Option<DuplexStream>>,
    fail_with: Option<io::ErrorKind>,
    delay: Option<std::time::Duration>,
}

impl JournalOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(kind: io::ErrorKind) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(kind),
            ..Self::default()
        })
    }

    pub fn slow(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn journal(&self) -> Vec<Journal> {
        self.journal.lock().clone()
    }

    /// Board side of the port
    pub fn take_board(&self) -> Option<DuplexStream> {
        self.board.lock().take()
    }
}

impl SerialOpener for JournalOpener {
    fn open(&self, settings: &LineSettings) -> io::Result<ChannelIo> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(kind) = self.fail_with {
            return Err(io::Error::new(kind, format!("{}: cannot open", settings.port)));
        }

        self.journal.lock().push(Journal::Configured(settings.clone()));
        let (near, far) = duplex(4096);
        *self.board.lock() = Some(far);
        Ok(ChannelIo::from_stream(JournaledStream {
            inner: near,
            journal: self.journal.clone(),
        }))
    }
}

struct JournaledStream {
    inner: DuplexStream,
    journal: Arc<Mutex<Vec<Journal>>>,
}

impl AsyncRead for JournaledStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let data = buf.filled()[before..].to_vec();
            if !data.is_empty() {
                this.journal.lock().push(Journal::Read(data));
            }
        }
        poll
    }
}

impl AsyncWrite for JournaledStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = poll {
            this.journal.lock().push(Journal::Wrote(data[..n].to_vec()));
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
