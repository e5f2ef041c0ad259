//! Cache keys and file descriptor records
//!
//! A handle is keyed by (mount, flags). The map is ordered: a missing mount
//! sorts before any named mount, then keys order by mount string and flag
//! bits, so walks are deterministic.

use bitflags::bitflags;

use crate::media::FormatKind;

bitflags! {
    /// Behaviour flags carried on a handle key and its descriptor record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct HandleFlags: u32 {
        /// Handle serves fallback content for a live mount.
        const FALLBACK = 1 << 0;
        /// Resolve the mount under the admin root.
        const USE_ADMIN = 1 << 1;
        /// Tombstoned; destroy when the last listener leaves.
        const DELETE = 1 << 2;
        /// A previous lookup failed; do not retry for this request.
        const MISSING = 1 << 3;
    }
}

/// Ordered cache key: mount (absent sorts first), then flags.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandleKey {
    pub mount: Option<String>,
    pub flags: HandleFlags,
}

impl HandleKey {
    pub fn new(mount: Option<String>, flags: HandleFlags) -> Self {
        Self { mount, flags }
    }
}

impl std::fmt::Display for HandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({})",
            self.mount.as_deref().unwrap_or("<none>"),
            self.flags.bits()
        )
    }
}

/// Caller-supplied file descriptor record: which mount to serve, how, and
/// at what rate.
#[derive(Debug, Clone, Default)]
pub struct FInfo {
    pub mount: Option<String>,
    pub flags: HandleFlags,
    /// Target bitrate in bytes per second; 0 means untimed.
    pub limit: u64,
    pub kind: FormatKind,
    pub fsize: u64,
    /// Migration target: listeners of this handle are moved here.
    pub override_to: Option<String>,
}

impl FInfo {
    /// Record for an untimed static file.
    pub fn file(mount: impl Into<String>) -> Self {
        Self {
            mount: Some(mount.into()),
            ..Self::default()
        }
    }

    /// Record for fallback content served at `limit` bytes per second.
    pub fn fallback(mount: impl Into<String>, limit: u64) -> Self {
        Self {
            mount: Some(mount.into()),
            flags: HandleFlags::FALLBACK,
            limit,
            ..Self::default()
        }
    }

    /// Probe key for a cache lookup. Synthetic query prefixes are stripped:
    /// `fallback-<mount>` ORs in the fallback flag, `file-<mount>` is the
    /// plain key. Returns `None` when the record names no mount.
    pub fn probe_key(&self) -> Option<HandleKey> {
        let mount = self.mount.as_deref()?;
        let mut flags = self.flags;
        let mount = if let Some(rest) = mount.strip_prefix("fallback-") {
            flags |= HandleFlags::FALLBACK;
            rest
        } else if let Some(rest) = mount.strip_prefix("file-") {
            rest
        } else {
            mount
        };
        Some(HandleKey::new(Some(mount.to_string()), flags))
    }
}
