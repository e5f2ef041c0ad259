//! Listener-side state
//!
//! A `Client` is one HTTP listener being driven by an external worker. The
//! worker calls the sender tick; everything here is plain state plus the
//! byte-sink seam the senders write through.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;

use crate::cache::FileHandle;

bitflags! {
    /// Listener behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientFlags: u32 {
        /// Passed authentication; eligible for fallback routing.
        const AUTHENTICATED = 1 << 0;
        /// Connection may be kept alive after the response.
        const KEEPALIVE = 1 << 1;
        /// Output is FLV-wrapped; throttle ceiling gets a 1% allowance.
        const WANTS_FLV = 1 << 2;
        /// Listener is currently owned by the file-serving core.
        const IN_FSERVE = 1 << 3;
        /// Intro chain holds partially written content that must complete
        /// before any transition.
        const HAS_INTRO_CONTENT = 1 << 4;
        /// Do not emit an access-log line for this request.
        const SKIP_ACCESSLOG = 1 << 5;
    }
}

/// Which sender drives this listener. Transitions happen between ticks,
/// never mid-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SenderState {
    /// Draining the in-memory intro/header chain.
    #[default]
    Intro,
    /// Plain read-and-write streaming of the file body.
    FileStream,
    /// Streaming paced to the handle's target bitrate.
    ThrottledFileStream,
}

/// Clock sample handed in by the driving worker: wall seconds for expiry
/// and pacing, a millisecond counter for scheduling and meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTime {
    pub secs: u64,
    pub millis: u64,
}

impl WorkerTime {
    /// Sample the system clock.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            millis: since_epoch.as_millis() as u64,
        }
    }
}

/// Non-blocking byte sink the senders write through.
///
/// `try_send` writes what the transport will take right now and returns the
/// count; `WouldBlock` means "try again next tick". Implemented for
/// `tokio::net::TcpStream`; tests use an in-memory sink.
pub trait ByteSink: Send {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl ByteSink for tokio::net::TcpStream {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

/// Result of pushing bytes at the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// `n` bytes were accepted (possibly fewer than offered).
    Wrote(usize),
    /// The transport is full; reschedule.
    Blocked,
}

/// Transport-level state of one listener connection.
pub struct Connection {
    pub id: u64,
    pub ip: String,
    /// Shared with the handle's listener set so admin kills reach a live
    /// client without touching worker-owned state.
    pub error: Arc<AtomicBool>,
    /// Wall-clock second the connection was accepted.
    pub con_time: u64,
    /// Total bytes pushed into the sink, headers included.
    pub sent_bytes: u64,
    /// Requested range start within the file body.
    pub start_pos: u64,
    /// Body bytes after which the connection is done (range end).
    pub discon_sent: u64,
    /// The request named no explicit end; serve to end of file.
    pub end_unspecified: bool,
    pub sink: Box<dyn ByteSink>,
}

impl Connection {
    pub fn new(id: u64, ip: impl Into<String>, sink: Box<dyn ByteSink>) -> Self {
        Self {
            id,
            ip: ip.into(),
            error: Arc::new(AtomicBool::new(false)),
            con_time: WorkerTime::now().secs,
            sent_bytes: 0,
            start_pos: 0,
            discon_sent: 0,
            end_unspecified: true,
            sink,
        }
    }

    pub fn error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::Relaxed);
    }
}

/// One listener, driven one sender tick at a time by an external worker.
pub struct Client {
    pub connection: Connection,
    pub flags: ClientFlags,
    /// Mount the listener is accounted under.
    pub mount: Option<String>,
    /// Originating request URL for GET listeners; admin and non-GET
    /// requests leave it unset, which routes departure straight to a
    /// plain detach.
    pub uri: Option<String>,
    /// Authenticated principal, used by duplicate-login policy.
    pub username: Option<String>,
    /// HTTP status already committed for this request; 0 when none.
    pub respcode: u16,
    /// Intro/header refbuf chain drained before the file body.
    intro: VecDeque<Bytes>,
    /// Write position within the front intro refbuf.
    pub pos: usize,
    /// Pending file block not yet fully written.
    pending: Option<Bytes>,
    pending_pos: usize,
    /// Next file read offset.
    pub intro_offset: u64,
    /// Body bytes queued from the file so far (range accounting).
    pub body_queued: u64,
    /// Bytes written since `timer_start`, for pacing.
    pub counter: u64,
    /// Pacing epoch in wall seconds.
    pub timer_start: u64,
    /// Earliest millisecond the worker should tick this client again.
    pub schedule_ms: u64,
    /// Per-client loop delay override in ms; 0 uses the default.
    pub throttle: u64,
    /// Shared handle this listener reads through.
    pub handle: Option<Arc<FileHandle>>,
    pub sender: SenderState,
}

impl Client {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            flags: ClientFlags::empty(),
            mount: None,
            uri: None,
            username: None,
            respcode: 0,
            intro: VecDeque::new(),
            pos: 0,
            pending: None,
            pending_pos: 0,
            intro_offset: 0,
            body_queued: 0,
            counter: 0,
            timer_start: 0,
            schedule_ms: 0,
            throttle: 0,
            handle: None,
            sender: SenderState::Intro,
        }
    }

    /// Queue an intro refbuf (headers, error pages, initial codec frames).
    pub fn push_intro(&mut self, buf: Bytes) {
        self.intro.push_back(buf);
    }

    /// Bytes left in the front intro refbuf.
    pub(crate) fn intro_front_remaining(&self) -> Option<usize> {
        self.intro.front().map(|b| b.len() - self.pos)
    }

    /// Drop the exhausted front refbuf; write position resets.
    pub(crate) fn advance_intro(&mut self) -> bool {
        self.intro.pop_front();
        self.pos = 0;
        !self.intro.is_empty()
    }

    /// Whether any intro content is queued.
    pub fn has_intro(&self) -> bool {
        !self.intro.is_empty()
    }

    /// Whether another refbuf is queued behind the front one.
    pub(crate) fn intro_has_next(&self) -> bool {
        self.intro.len() > 1
    }

    /// Queue a refbuf ahead of everything else (response headers).
    pub(crate) fn push_intro_front(&mut self, buf: Bytes) {
        self.intro.push_front(buf);
        self.pos = 0;
    }

    /// Drop all queued intro content.
    pub(crate) fn clear_intro(&mut self) {
        self.intro.clear();
        self.pos = 0;
    }

    pub(crate) fn pending_remaining(&self) -> usize {
        self.pending
            .as_ref()
            .map(|b| b.len() - self.pending_pos)
            .unwrap_or(0)
    }

    pub(crate) fn set_pending(&mut self, buf: Bytes) {
        self.pending = Some(buf);
        self.pending_pos = 0;
    }

    /// Write as much of the front intro refbuf as the sink accepts.
    pub(crate) fn write_intro_front(&mut self) -> WriteOutcome {
        let Some(front) = self.intro.front() else {
            return WriteOutcome::Wrote(0);
        };
        let slice = front.slice(self.pos..);
        match self.push_bytes(&slice) {
            WriteOutcome::Wrote(n) => {
                self.pos += n;
                WriteOutcome::Wrote(n)
            }
            WriteOutcome::Blocked => WriteOutcome::Blocked,
        }
    }

    /// Write as much of the pending file block as the sink accepts.
    pub(crate) fn write_pending(&mut self) -> WriteOutcome {
        let remaining = self.pending_remaining();
        if remaining == 0 {
            return WriteOutcome::Wrote(0);
        }
        let slice = self.pending.as_ref().unwrap().slice(self.pending_pos..);
        match self.push_bytes(&slice) {
            WriteOutcome::Wrote(n) => {
                self.pending_pos += n;
                if self.pending_remaining() == 0 {
                    self.pending = None;
                    self.pending_pos = 0;
                }
                WriteOutcome::Wrote(n)
            }
            WriteOutcome::Blocked => WriteOutcome::Blocked,
        }
    }

    fn push_bytes(&mut self, buf: &[u8]) -> WriteOutcome {
        match self.connection.sink.try_send(buf) {
            Ok(0) => WriteOutcome::Blocked,
            Ok(n) => {
                self.connection.sent_bytes += n as u64;
                self.counter += n as u64;
                WriteOutcome::Wrote(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::Blocked,
            Err(e) => {
                tracing::debug!(id = self.connection.id, error = %e, "connection write failed");
                self.connection.set_error();
                WriteOutcome::Blocked
            }
        }
    }
}
