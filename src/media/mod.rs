//! Media format handling
//!
//! This module provides:
//! - content-type to format-kind mapping
//! - the format-frame probe run when a handle is opened
//! - block reads from a shared descriptor into a client's pending buffer
//! - response header values for admission

pub mod mpeg;

use bytes::Bytes;

use crate::client::Client;
use crate::file::FileReader;

/// Block size for untimed file streaming.
pub const UNTIMED_BLOCK: usize = 4096;

/// Fallback block size for throttled streaming when the frame length is
/// unknown; also the per-tick allowance unit of the pacing arithmetic.
pub const THROTTLE_BLOCK: usize = 1400;

/// How much of the file head the frame probe examines.
const PROBE_WINDOW: usize = 64 * 1024;

/// Declared format of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatKind {
    /// No format committed; content is streamed as opaque bytes.
    #[default]
    Undefined,
    /// MPEG audio (MP3 and friends)
    Mpeg,
    /// Ogg container
    Ogg,
    /// Raw ADTS AAC
    Aac,
}

impl FormatKind {
    /// Map a content type onto a format kind.
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type.split(';').next().unwrap_or("").trim() {
            "audio/mpeg" | "audio/x-mpeg" => FormatKind::Mpeg,
            "application/ogg" | "audio/ogg" => FormatKind::Ogg,
            "audio/aac" | "audio/aacp" => FormatKind::Aac,
            _ => FormatKind::Undefined,
        }
    }
}

impl std::fmt::Display for FormatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FormatKind::Undefined => "undefined",
            FormatKind::Mpeg => "mpeg",
            FormatKind::Ogg => "ogg",
            FormatKind::Aac => "aac",
        };
        write!(f, "{}", name)
    }
}

/// Per-handle format description, shared read-only by every listener.
#[derive(Debug, Clone)]
pub struct FormatPlugin {
    pub kind: FormatKind,
    pub content_type: String,
}

/// Result of the format-frame probe.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Format actually detected in the file.
    pub kind: FormatKind,
    /// Encoded bitrate in bits per second; 0 when the format does not
    /// expose one cheaply.
    pub bitrate: u32,
    /// Offset of the first codec frame.
    pub offset: u64,
    /// Frame length in bytes when the format is frame-aligned.
    pub frame_len: Option<usize>,
}

/// The open descriptor plus format state shared by all listeners of one
/// handle. Owned behind an `Arc` so an override can hand the descriptor to
/// the replacement cache entry without reopening the file.
#[derive(Debug)]
pub struct MediaSource {
    pub reader: FileReader,
    pub format: FormatPlugin,
    /// Offset of the first codec frame; fallback loops seek back here.
    pub frame_start_pos: u64,
}

/// Scan the head of the file for the first codec frame.
///
/// A probe that finds nothing returns `kind: Undefined`; the opener logs a
/// warning but the open still succeeds (the file is streamed untyped).
pub fn check_frames(reader: &FileReader, declared: FormatKind) -> FrameInfo {
    let mut head = vec![0u8; PROBE_WINDOW.min(reader.size() as usize)];
    let undefined = FrameInfo {
        kind: FormatKind::Undefined,
        bitrate: 0,
        offset: 0,
        frame_len: None,
    };
    match reader.read_at(&mut head, 0) {
        Ok(n) => head.truncate(n),
        Err(_) => return undefined,
    }

    let try_mpeg = |head: &[u8]| {
        mpeg::find_first_frame(head).map(|(offset, header)| FrameInfo {
            kind: FormatKind::Mpeg,
            bitrate: header.bitrate,
            offset: offset as u64,
            frame_len: Some(header.frame_len),
        })
    };
    let try_ogg = |head: &[u8]| {
        head.starts_with(b"OggS").then_some(FrameInfo {
            kind: FormatKind::Ogg,
            bitrate: 0,
            offset: 0,
            frame_len: None,
        })
    };
    let try_aac = |head: &[u8]| {
        head.windows(2)
            .position(|w| w[0] == 0xff && w[1] & 0xf6 == 0xf0)
            .map(|offset| FrameInfo {
                kind: FormatKind::Aac,
                bitrate: 0,
                offset: offset as u64,
                frame_len: None,
            })
    };

    let found = match declared {
        FormatKind::Mpeg => try_mpeg(&head),
        FormatKind::Ogg => try_ogg(&head),
        FormatKind::Aac => try_aac(&head),
        FormatKind::Undefined => try_ogg(&head)
            .or_else(|| try_mpeg(&head))
            .or_else(|| try_aac(&head)),
    };
    found.unwrap_or(undefined)
}

/// Outcome of a block read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRead {
    /// The client's pending buffer holds bytes to write.
    Filled,
    /// End of file (or of the requested range) was reached.
    Eof,
    /// The descriptor failed hard; the listener must be terminated.
    Failed,
}

/// Fill the client's pending buffer with the next block from the file.
///
/// A pending block that has not been fully written yet is left alone.
/// Throttled streams read pacing-unit blocks; untimed streams read larger
/// blocks and stop at the advertised range end.
pub fn file_read(media: &MediaSource, client: &mut Client, throttled: bool) -> FileRead {
    if client.pending_remaining() > 0 {
        return FileRead::Filled;
    }

    let mut block = if throttled {
        THROTTLE_BLOCK
    } else {
        let remaining = client
            .connection
            .discon_sent
            .saturating_sub(client.body_queued);
        if remaining == 0 {
            return FileRead::Eof;
        }
        UNTIMED_BLOCK.min(remaining as usize)
    };

    let offset = client.intro_offset;
    if offset >= media.reader.size() {
        return FileRead::Eof;
    }
    block = block.min((media.reader.size() - offset) as usize);

    let mut buf = vec![0u8; block];
    match media.reader.read_at(&mut buf, offset) {
        Ok(0) => FileRead::Eof,
        Ok(n) => {
            buf.truncate(n);
            client.intro_offset += n as u64;
            client.body_queued += n as u64;
            client.set_pending(Bytes::from(buf));
            FileRead::Filled
        }
        Err(e) => {
            tracing::warn!(error = %e, offset, "file read failed");
            FileRead::Failed
        }
    }
}

/// Build the response header block advertised to an admitted listener.
///
/// The embedder owns real HTTP framing; this mirrors what the format layer
/// contributes so the intro sender has something to drain in tests and in
/// minimal deployments.
pub fn client_headers(content_type: &str, content_length: u64, keep_alive: bool) -> Bytes {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        content_type, content_length, connection
    ))
}
