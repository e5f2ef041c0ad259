//! File-serving and fallback-streaming core for a streaming media server
//!
//! This crate implements the machinery a streaming server needs to satisfy
//! HTTP requests for static assets and for *fallback* streams: per-mount
//! substitute content (silence loops, announcements, pre-recorded material)
//! served at a target bitrate, which whole listener populations can attach
//! to, detach from, or be migrated away from without dropping connections.
//!
//! The load-bearing pieces:
//! - a deduplicated, reference-counted file-handle cache keyed by
//!   (mount, flags), so many listeners share one descriptor and meter
//! - per-handle listener sets with a two-level locking discipline
//!   (cache lock, then per-handle mutex, dropped outer-first)
//! - a bitrate-throttled sender that paces reads so per-listener egress
//!   approximates the configured rate, looping files at the first codec
//!   frame
//! - an atomic override that rebinds every listener of one mount onto
//!   another while new arrivals keep working
//!
//! Request parsing, response framing, authentication and worker scheduling
//! stay outside; the crate exposes typed admission results, a per-tick
//! sender API driven by the embedder's workers, and a router seam for
//! rebinding listeners across mounts.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod media;
pub mod mime;
pub mod rate;
pub mod sender;
pub mod serve;
pub mod stats;

pub use cache::{FInfo, FileHandle, HandleFlags, Presence};
pub use client::{ByteSink, Client, ClientFlags, Connection, SenderState, WorkerTime};
pub use config::{Config, MountConfig};
pub use error::{AdminError, AdmitError};
pub use media::FormatKind;
pub use sender::SendOutcome;
pub use serve::{
    FileServer, KillResponse, ListClients, ListenerInfo, ListenerRouter, NullRouter,
    RouteOutcome,
};
