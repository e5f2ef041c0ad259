//! File handle: the per-(mount, flags) cache entry
//!
//! A handle aggregates the open descriptor, format state, listener set and
//! meters that every listener of one logical file shares. The cache hands
//! out `Arc<FileHandle>`; all mutation goes through the per-handle mutex,
//! taken *after* the cache lock is dropped on the hot path.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::key::{FInfo, HandleFlags, HandleKey};
use crate::media::MediaSource;
use crate::rate::RateCalc;
use crate::stats::StatsRegistry;

/// Idle grace before a listener-less handle is reaped.
pub(crate) const IDLE_EXPIRY_SECS: u64 = 120;

/// Seconds between outgoing-bitrate stats refreshes.
pub(crate) const STATS_REFRESH_SECS: u64 = 5;

/// When a handle may be destroyed by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Never reap (sentinel, freshly opened fallback).
    Never,
    /// Reap once `now` reaches the timestamp and no listeners remain.
    At(u64),
}

impl Expiry {
    pub fn is_due(&self, now: u64) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(t) => now >= *t,
        }
    }
}

/// What a listener looks like from inside a handle. The error flag is
/// shared with the live client so admin kills reach it without touching
/// worker-owned state.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub id: u64,
    pub ip: String,
    pub username: Option<String>,
    pub error: Arc<AtomicBool>,
    pub connected_at: u64,
}

/// Outcome of a listener departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Departure {
    /// Handle stays (possibly now expiring).
    Kept,
    /// Tombstoned handle lost its last listener; destroy it now.
    Destroy,
}

/// Mutable side of a handle, guarded by the per-handle mutex.
#[derive(Debug)]
pub struct HandleState {
    /// Descriptor record. `flags` and `override_to` mutate under the lock
    /// (tombstoning, migration); the rest is fixed after open.
    pub finfo: FInfo,
    /// Descriptor + format, shared by every listener. `None` for the
    /// sentinel and for tombstones that handed their media to a
    /// replacement entry.
    pub media: Option<Arc<MediaSource>>,
    pub refcount: usize,
    pub peak: usize,
    /// Ordered by connection id. `None` for detached ad-hoc handles that
    /// never hold listeners.
    pub listeners: Option<BTreeMap<u64, ListenerEntry>>,
    pub expire: Expiry,
    /// Listener count last pushed to stats; -1 forces a push.
    pub prev_count: i64,
    /// Next outgoing-bitrate stats refresh, in seconds.
    pub stats_update: u64,
    /// Name of the published stats node, when enabled.
    pub stats: Option<String>,
    pub out_bitrate: RateCalc,
}

impl HandleState {
    fn is_sentinel(&self) -> bool {
        self.finfo.mount.is_none()
    }

    fn check_refcount(&self) {
        let Some(listeners) = &self.listeners else {
            return;
        };
        let synthetic = usize::from(self.is_sentinel());
        if self.refcount != listeners.len() + synthetic {
            tracing::error!(
                mount = self.finfo.mount.as_deref().unwrap_or("<none>"),
                refcount = self.refcount,
                listeners = listeners.len(),
                "listener accounting mismatch"
            );
        }
    }

    /// Attach a listener: bump the refcount, track the peak, and bring the
    /// stats node up for the first listener of a rate-limited handle.
    pub(crate) fn add_listener(&mut self, entry: ListenerEntry, stats: &StatsRegistry) {
        if self.listeners.is_none() {
            return;
        }
        if self.refcount == 0 && self.finfo.limit > 0 {
            self.enable_stats(stats);
        }
        let id = entry.id;
        if let Some(listeners) = &mut self.listeners {
            if listeners.insert(id, entry).is_some() {
                // already attached; do not double-count
                tracing::debug!(id, "listener re-attached");
                return;
            }
        }
        self.refcount += 1;
        self.check_refcount();
        if self.refcount > self.peak {
            self.peak = self.refcount;
        }
        if let Some(mount) = self.finfo.mount.as_deref() {
            tracing::debug!(mount, refcount = self.refcount, "listener attached");
        }
    }

    /// Detach a listener. On the last departure: fallback handles drop
    /// their stats, tombstones ask to be destroyed, everything else gets an
    /// idle expiry; the outgoing meter is re-armed so the next listener
    /// population sees a zeroed window.
    pub(crate) fn remove_listener(
        &mut self,
        id: u64,
        now_secs: u64,
        stats: &StatsRegistry,
    ) -> Departure {
        self.refcount = self.refcount.saturating_sub(1);
        if let Some(listeners) = &mut self.listeners {
            listeners.remove(&id);
        }
        self.check_refcount();

        if self.refcount == 0 && !self.is_sentinel() {
            if self.finfo.flags.contains(HandleFlags::FALLBACK) {
                self.disable_stats(stats);
            } else if self.finfo.flags.contains(HandleFlags::DELETE) {
                return Departure::Destroy;
            } else {
                tracing::debug!(
                    mount = self.finfo.mount.as_deref().unwrap_or(""),
                    "setting timeout as no listeners remain"
                );
                self.expire = Expiry::At(now_secs + IDLE_EXPIRY_SECS);
            }
            self.out_bitrate.reset();
        }
        Departure::Kept
    }

    /// Whether the listener set already holds a connection by `username`.
    pub(crate) fn has_user(&self, username: &str) -> bool {
        self.listeners
            .as_ref()
            .map(|l| l.values().any(|e| e.username.as_deref() == Some(username)))
            .unwrap_or(false)
    }

    /// Publish the stats node for this handle. Only rate-limited handles
    /// appear in stats.
    pub(crate) fn enable_stats(&mut self, stats: &StatsRegistry) {
        if self.finfo.limit == 0 {
            return;
        }
        let Some(mount) = self.finfo.mount.clone() else {
            return;
        };
        let fallback = self.finfo.flags.contains(HandleFlags::FALLBACK);
        let name = format!("{}-{}", if fallback { "fallback" } else { "file" }, mount);
        if self.stats.is_none() {
            // force a listener-count push on the next scan
            self.prev_count = -1;
        }
        if fallback {
            stats.set_hidden_counter(&name, "fallback", "file");
        }
        stats.set_hidden_counter(&name, "outgoing_kbitrate", "0");
        self.stats = Some(name);
    }

    /// Drop the stats node, if one is up.
    pub(crate) fn disable_stats(&mut self, stats: &StatsRegistry) {
        if let Some(name) = self.stats.take() {
            stats.remove(&name);
        }
    }

    /// Final teardown: called with the handle already unreachable from the
    /// cache. Nonzero refcounts are logged, not fatal.
    pub(crate) fn destroy(&mut self, stats: &StatsRegistry) {
        if self.refcount > 0 {
            tracing::warn!(
                mount = self.finfo.mount.as_deref().unwrap_or("<none>"),
                refcount = self.refcount,
                "destroying handle with listeners still attached"
            );
        }
        self.disable_stats(stats);
        self.media = None;
    }
}

/// A shared, cache-managed file handle.
#[derive(Debug)]
pub struct FileHandle {
    key: HandleKey,
    state: Arc<Mutex<HandleState>>,
}

impl FileHandle {
    /// Build a handle for insertion. The caller owns locking it before the
    /// cache lock is released.
    pub(crate) fn new(
        finfo: FInfo,
        media: Option<Arc<MediaSource>>,
        expire: Expiry,
    ) -> Arc<Self> {
        let key = HandleKey::new(finfo.mount.clone(), finfo.flags);
        Arc::new(Self {
            key,
            state: Arc::new(Mutex::new(HandleState {
                finfo,
                media,
                refcount: 0,
                peak: 0,
                listeners: Some(BTreeMap::new()),
                expire,
                prev_count: -1,
                stats_update: 0,
                stats: None,
                out_bitrate: RateCalc::default(),
            })),
        })
    }

    /// The non-file sentinel: one synthetic reference, never reaped.
    pub(crate) fn sentinel() -> Arc<Self> {
        let handle = Self::new(FInfo::default(), None, Expiry::Never);
        handle.state.try_lock().unwrap().refcount = 1;
        handle
    }

    /// Detached handle used to push an error response through the sender
    /// plumbing; carries no listener set and self-destructs on release.
    pub(crate) fn adhoc(mount: String) -> Arc<Self> {
        let finfo = FInfo {
            mount: Some(mount),
            flags: HandleFlags::DELETE,
            ..FInfo::default()
        };
        let handle = Self::new(finfo, None, Expiry::Never);
        {
            let mut state = handle.state.try_lock().unwrap();
            state.refcount = 1;
            state.listeners = None;
        }
        handle
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn mount(&self) -> Option<&str> {
        self.key.mount.as_deref()
    }

    /// Take the per-handle lock as an owned guard, so the cache lock can be
    /// dropped while the handle stays pinned.
    pub(crate) async fn lock_owned(&self) -> OwnedMutexGuard<HandleState> {
        Arc::clone(&self.state).lock_owned().await
    }
}
