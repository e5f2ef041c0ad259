//! Handle cache
//!
//! An ordered map of shared file handles under a reader-writer lock. The
//! hot path takes the cache write lock only long enough to find or insert a
//! handle, locks the handle, and drops the cache lock. Any handle observed
//! through the cache can be pinned this way without racing the scanner,
//! because reaping also starts from the cache write lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entry::{Expiry, FileHandle, HandleState, STATS_REFRESH_SECS};
use super::key::{FInfo, HandleFlags, HandleKey};
use crate::config::Config;
use crate::file::FileReader;
use crate::media::{self, FormatKind, FormatPlugin, MediaSource};
use crate::mime::MimeRegistry;
use crate::stats::StatsRegistry;

pub(crate) type HandleMap = BTreeMap<HandleKey, Arc<FileHandle>>;

/// Three-valued presence probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Found,
    Missing,
    /// The cache was write-locked; the answer is indeterminate and the
    /// caller should retry later. Not to be read as `Missing`.
    Busy,
}

/// Ordered handle map plus the permanent sentinel entry.
pub struct HandleCache {
    map: RwLock<HandleMap>,
    sentinel: Arc<FileHandle>,
}

impl HandleCache {
    pub(crate) fn new() -> Self {
        let sentinel = FileHandle::sentinel();
        let mut map = BTreeMap::new();
        map.insert(sentinel.key().clone(), Arc::clone(&sentinel));
        Self {
            map: RwLock::new(map),
            sentinel,
        }
    }

    /// The non-file sentinel handle.
    pub(crate) fn sentinel(&self) -> &Arc<FileHandle> {
        &self.sentinel
    }

    pub(crate) async fn read_map(&self) -> RwLockReadGuard<'_, HandleMap> {
        self.map.read().await
    }

    pub(crate) async fn write_map(&self) -> RwLockWriteGuard<'_, HandleMap> {
        self.map.write().await
    }

    /// Number of entries, sentinel included.
    pub(crate) async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    /// Lookup within an already-locked map. Synthetic `fallback-`/`file-`
    /// prefixes on the probe mount are normalised first. The handle is
    /// returned without its lock taken.
    pub(crate) fn find_in(map: &HandleMap, finfo: &FInfo) -> Option<Arc<FileHandle>> {
        let Some(key) = finfo.probe_key() else {
            tracing::error!("lookup with no mount name");
            return None;
        };
        match map.get(&key) {
            Some(fh) => {
                tracing::debug!(key = %key, "mount found in cache");
                Some(Arc::clone(fh))
            }
            None => {
                tracing::debug!(key = %key, "not found in cache");
                None
            }
        }
    }

    /// Lookup taking the cache read lock.
    pub(crate) async fn find(&self, finfo: &FInfo) -> Option<Arc<FileHandle>> {
        Self::find_in(&*self.map.read().await, finfo)
    }

    /// Find or create a handle, returning it with its per-handle lock held.
    ///
    /// The caller hands over the cache write guard and the config read
    /// guard; both are released before this returns, per the lock-handoff
    /// discipline. `None` means the open failed (missing path, format
    /// conflict) and both locks were released.
    pub(crate) async fn open(
        &self,
        mut map: RwLockWriteGuard<'_, HandleMap>,
        cfg: RwLockReadGuard<'_, Config>,
        mime: &MimeRegistry,
        finfo: &FInfo,
    ) -> Option<(Arc<FileHandle>, OwnedMutexGuard<HandleState>)> {
        let Some(key) = finfo.probe_key() else {
            tracing::error!("open with no mount name");
            return None;
        };
        let fallback = finfo.flags.contains(HandleFlags::FALLBACK);

        if let Some(existing) = map.get(&key) {
            let fh = Arc::clone(existing);
            drop(cfg);
            let state = fh.lock_owned().await;
            drop(map);
            if fallback
                && state.finfo.kind != finfo.kind
                && finfo.kind != FormatKind::Undefined
            {
                tracing::warn!(mount = %key, "format mismatched for existing handle");
                return None;
            }
            return Some((fh, state));
        }

        let mount = key.mount.clone().unwrap_or_default();
        let Some(path) = cfg.resolve_path(&mount, finfo.flags.contains(HandleFlags::USE_ADMIN))
        else {
            drop(cfg);
            drop(map);
            tracing::warn!(mount = %mount, "refusing to resolve mount outside document root");
            return None;
        };
        drop(cfg);

        let content_type = mime.content_type_for(&path.to_string_lossy());
        let mapped = FormatKind::from_content_type(&content_type);
        let mut kind = finfo.kind;
        if kind == FormatKind::Undefined {
            kind = mapped;
        }
        if fallback
            && kind != mapped
            && mapped != FormatKind::Undefined
            && kind != FormatKind::Undefined
        {
            drop(map);
            tracing::warn!(mount = %mount, "format mismatched");
            return None;
        }

        if fallback {
            tracing::info!(mount = %mount, limit = finfo.limit, "lookup of fallback file");
        } else {
            tracing::info!(mount = %mount, "lookup of file");
        }

        let reader = match FileReader::open(&path) {
            Ok(r) => r,
            Err(e) => {
                drop(map);
                tracing::info!(path = %path.display(), error = %e, "failed to open");
                return None;
            }
        };

        let fsize = if finfo.fsize > 0 {
            finfo.fsize
        } else {
            reader.size()
        };

        let mut frame_start_pos = 0;
        if kind != FormatKind::Undefined {
            let info = media::check_frames(&reader, kind);
            if info.kind == FormatKind::Undefined {
                tracing::warn!(mount = %mount, "different type detected");
            } else {
                frame_start_pos = info.offset;
                if finfo.limit > 0 && info.bitrate > 0 {
                    let ratio = finfo.limit as f64 / (info.bitrate as f64 / 8.0);
                    if !(0.9..=1.1).contains(&ratio) {
                        tracing::warn!(
                            mount = %mount,
                            probed_kbps = info.bitrate / 1000,
                            expected_kbps = finfo.limit * 8 / 1000,
                            "bitrate differs from requested limit"
                        );
                    }
                }
            }
        }

        let owned = FInfo {
            mount: Some(mount),
            flags: finfo.flags,
            limit: finfo.limit,
            kind,
            fsize,
            override_to: None,
        };
        let media = MediaSource {
            reader,
            format: FormatPlugin { kind, content_type },
            frame_start_pos,
        };
        let expire = if fallback { Expiry::Never } else { Expiry::At(0) };

        let fh = FileHandle::new(owned, Some(Arc::new(media)), expire);
        let state = fh.lock_owned().await;
        map.insert(key, Arc::clone(&fh));
        drop(map);

        Some((fh, state))
    }

    /// Walk every handle: refresh stats where the listener count or the
    /// refresh deadline moved, reap listener-less handles past expiry.
    ///
    /// `now == 0` signals shutdown: every handle's expiry is forced to zero
    /// so a subsequent pass destroys it.
    pub(crate) async fn scan(&self, now: u64, stats: &StatsRegistry) {
        let mut map = self.map.write().await;
        let keys: Vec<HandleKey> = map.keys().cloned().collect();
        let mut expired = Vec::new();

        for key in keys {
            let Some(fh) = map.get(&key).map(Arc::clone) else {
                continue;
            };
            let mut state = fh.lock_owned().await;

            if now == 0 {
                state.expire = Expiry::At(0);
                continue;
            }

            if state.finfo.limit > 0 {
                if let Some(name) = state.stats.clone() {
                    if state.prev_count != state.refcount as i64 {
                        state.prev_count = state.refcount as i64;
                        stats.set(&name, "listeners", state.refcount);
                        stats.set(&name, "listener_peak", state.peak);
                    }
                    if state.stats_update <= now {
                        state.stats_update = now + STATS_REFRESH_SECS;
                        stats.set_hidden_counter(
                            &name,
                            "outgoing_kbitrate",
                            state.out_bitrate.avg() * 8 / 1024,
                        );
                    }
                }
            }

            if state.refcount == 0 && state.expire.is_due(now) {
                tracing::debug!(key = %key, "timeout of idle handle");
                state.destroy(stats);
                expired.push(key);
            }
        }

        for key in expired {
            map.remove(&key);
        }
    }

    /// Atomically redirect the listeners of a fallback mount to `dest`.
    ///
    /// The existing handle (when it has listeners) is detached from the
    /// cache and tombstoned with the override destination; a fresh entry
    /// with the same descriptor and an empty listener set replaces it so
    /// new arrivals are unaffected. Returns false when no fallback handle
    /// exists for `mount`.
    pub(crate) async fn set_override(
        &self,
        mount: &str,
        dest: &str,
        kind: FormatKind,
        stats: &StatsRegistry,
    ) -> bool {
        let probe = FInfo {
            mount: Some(mount.to_string()),
            flags: HandleFlags::FALLBACK,
            kind,
            ..FInfo::default()
        };

        let mut map = self.map.write().await;
        let Some(fh) = Self::find_in(&map, &probe) else {
            return false;
        };
        let mut state = fh.lock_owned().await;

        if state.refcount > 0 {
            // insert a clean copy; no stats and no listeners carried over
            let key = fh.key().clone();
            map.remove(&key);

            let fresh_finfo = state.finfo.clone();
            let media = state.media.take();
            let fresh = FileHandle::new(fresh_finfo, media, Expiry::Never);
            map.insert(key, fresh);

            // leave the old handle detached; its last listener triggers
            // the delete
            state.finfo.flags.insert(HandleFlags::DELETE);
            state.finfo.flags.remove(HandleFlags::FALLBACK);
            state.finfo.override_to = Some(dest.to_string());
            state.finfo.kind = kind;
        }
        state.disable_stats(stats);
        drop(map);
        drop(state);

        tracing::info!(from = mount, to = dest, "moving listeners");
        true
    }

    /// Presence probe with try-lock semantics: `Busy` when the cache is
    /// write-locked.
    pub(crate) fn contains(&self, name: &str) -> Presence {
        let finfo = FInfo {
            mount: Some(name.to_string()),
            ..FInfo::default()
        };
        match self.map.try_read() {
            Err(_) => Presence::Busy,
            Ok(map) => {
                tracing::debug!(name, "presence probe");
                if Self::find_in(&map, &finfo).is_some() {
                    Presence::Found
                } else {
                    Presence::Missing
                }
            }
        }
    }

    /// One shutdown drain pass: destroy and remove every listener-less
    /// handle, sentinel excluded. Returns how many entries remain besides
    /// the sentinel.
    pub(crate) async fn drain_pass(&self, stats: &StatsRegistry) -> usize {
        let mut map = self.map.write().await;
        let keys: Vec<HandleKey> = map.keys().cloned().collect();
        for key in keys {
            let Some(fh) = map.get(&key).map(Arc::clone) else {
                continue;
            };
            if Arc::ptr_eq(&fh, &self.sentinel) {
                continue;
            }
            let mut state = fh.lock_owned().await;
            if state.refcount == 0 {
                state.destroy(stats);
                map.remove(&key);
            } else {
                tracing::warn!(
                    key = %key,
                    refcount = state.refcount,
                    "waiting for handle to clear"
                );
            }
        }
        map.len().saturating_sub(1)
    }
}
